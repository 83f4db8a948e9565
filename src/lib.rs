//! Reliable delivery of telemetry logs.
//!
//! Logs enqueued on a [`Channel`] are persisted to a [`Storage`], cut into
//! batches and handed to an [`Ingestion`]. Delivery survives restarts,
//! retries transient failures and never hands the same row to two batches.

pub mod channel;
pub mod config;
pub mod device;
pub mod ingestion;
pub mod logging;
pub mod model;
pub mod storage;
pub mod sync;

pub use channel::{Channel, ChannelGroup, ChannelListener, GroupError, SendFailure};
pub use config::{load_config, ChannelConfig, ConfigError, TelemetryConfig};
pub use device::{DeviceInfoProvider, InstallIdProvider, Providers};
pub use ingestion::{Call, CallOutcome, HttpIngestion, Ingestion, IngestionError};
pub use model::{DeviceInfo, Log};
pub use storage::{DuckDbStorage, Storage, StorageError};
pub use sync::{Generation, StateChanged, VersionedLock};
