use super::{DeviceInfoProvider, InstallIdProvider};
use crate::model::DeviceInfo;
use async_trait::async_trait;
use chrono::Local;
use tokio::sync::broadcast;
use uuid::Uuid;

const SDK_NAME: &str = "telechannel.rust";
const INVALIDATION_CAPACITY: usize = 8;

/// Describes the machine the process is running on.
pub struct HostDeviceInfoProvider {
    app_version: Option<String>,
    invalidations: broadcast::Sender<()>,
}

impl HostDeviceInfoProvider {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self {
            app_version: None,
            invalidations,
        }
    }

    pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = Some(app_version.into());
        self
    }

    /// Tell subscribers that cached snapshots are out of date
    /// (e.g. after a locale or time zone change).
    pub fn invalidate(&self) {
        // No receivers is fine
        let _ = self.invalidations.send(());
    }

    fn snapshot(&self) -> DeviceInfo {
        let host_name = hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(|s| s.to_string()));

        let locale = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .ok()
            .filter(|l| !l.is_empty());

        DeviceInfo {
            sdk_name: SDK_NAME.to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            os_name: std::env::consts::OS.to_string(),
            os_version: None,
            model: Some(std::env::consts::ARCH.to_string()),
            host_name,
            locale,
            time_zone_offset: Local::now().offset().local_minus_utc() / 60,
            app_version: self.app_version.clone(),
        }
    }
}

impl Default for HostDeviceInfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceInfoProvider for HostDeviceInfoProvider {
    async fn device_info(&self) -> DeviceInfo {
        self.snapshot()
    }

    fn subscribe_invalidations(&self) -> broadcast::Receiver<()> {
        self.invalidations.subscribe()
    }
}

/// Always returns the same snapshot until replaced.
pub struct StaticDeviceInfoProvider {
    device: std::sync::RwLock<DeviceInfo>,
    invalidations: broadcast::Sender<()>,
}

impl StaticDeviceInfoProvider {
    pub fn new(device: DeviceInfo) -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self {
            device: std::sync::RwLock::new(device),
            invalidations,
        }
    }

    /// Swap the snapshot and notify subscribers.
    pub fn replace(&self, device: DeviceInfo) {
        *self
            .device
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = device;
        let _ = self.invalidations.send(());
    }
}

#[async_trait]
impl DeviceInfoProvider for StaticDeviceInfoProvider {
    async fn device_info(&self) -> DeviceInfo {
        self.device
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn subscribe_invalidations(&self) -> broadcast::Receiver<()> {
        self.invalidations.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StaticInstallIdProvider(Option<Uuid>);

impl StaticInstallIdProvider {
    pub fn new(install_id: Uuid) -> Self {
        Self(Some(install_id))
    }

    pub fn unset() -> Self {
        Self(None)
    }
}

#[async_trait]
impl InstallIdProvider for StaticInstallIdProvider {
    async fn install_id(&self) -> Option<Uuid> {
        self.0
    }
}
