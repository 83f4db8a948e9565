pub mod host;

use crate::model::DeviceInfo;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use host::{HostDeviceInfoProvider, StaticDeviceInfoProvider, StaticInstallIdProvider};

/// Source of the device snapshot attached to every log.
#[async_trait]
pub trait DeviceInfoProvider: Send + Sync {
    async fn device_info(&self) -> DeviceInfo;

    /// Fires whenever previously returned snapshots become stale.
    fn subscribe_invalidations(&self) -> broadcast::Receiver<()>;
}

#[async_trait]
pub trait InstallIdProvider: Send + Sync {
    /// `None` when no installation id has been assigned yet.
    async fn install_id(&self) -> Option<Uuid>;
}

/// Collaborators a channel consults while preparing and sending logs.
#[derive(Clone)]
pub struct Providers {
    pub device_info: Arc<dyn DeviceInfoProvider>,
    pub install_id: Arc<dyn InstallIdProvider>,
}

impl Providers {
    pub fn new(
        device_info: Arc<dyn DeviceInfoProvider>,
        install_id: Arc<dyn InstallIdProvider>,
    ) -> Self {
        Self {
            device_info,
            install_id,
        }
    }
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            device_info: Arc::new(HostDeviceInfoProvider::new()),
            install_id: Arc::new(StaticInstallIdProvider::unset()),
        }
    }
}
