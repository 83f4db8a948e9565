pub mod log;
pub mod serializer;

pub use log::{DeviceInfo, Log, LogContainer};
pub use serializer::{JsonLogSerializer, LogSerializer, SerializationError};
