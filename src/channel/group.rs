use super::channel::Channel;
use super::events::ChannelListener;
use crate::config::types::{ChannelConfig, TelemetryConfig};
use crate::device::Providers;
use crate::ingestion::{HttpIngestion, HttpIngestionError, Ingestion};
use crate::storage::{DuckDbStorage, Storage, StorageError};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// How long shutdown waits for running storage operations.
pub const STORAGE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("ingestion error: {0}")]
    Http(#[from] HttpIngestionError),
}

/// Named channels sharing one storage, one ingestion and one app secret.
pub struct ChannelGroup {
    app_secret: String,
    storage: Arc<dyn Storage>,
    ingestion: Arc<dyn Ingestion>,
    providers: Providers,
    channels: Mutex<HashMap<String, Channel>>,
    listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
    enabled: AtomicBool,
}

impl ChannelGroup {
    pub fn new(
        app_secret: impl Into<String>,
        storage: Arc<dyn Storage>,
        ingestion: Arc<dyn Ingestion>,
        providers: Providers,
    ) -> Self {
        Self {
            app_secret: app_secret.into(),
            storage,
            ingestion,
            providers,
            channels: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Build a group and register every channel named in the config.
    pub async fn from_config(
        config: &TelemetryConfig,
        storage: Arc<dyn Storage>,
        ingestion: Arc<dyn Ingestion>,
        providers: Providers,
    ) -> Self {
        let group = Self::new(config.app_secret.clone(), storage, ingestion, providers);

        let mut names: Vec<&String> = config.channels.keys().collect();
        names.sort();
        for name in names {
            group
                .add_channel(name.clone(), config.channels[name].clone())
                .await;
        }
        group
    }

    /// Open the configured database and HTTP ingestion, then build the group.
    pub async fn open(config: &TelemetryConfig, providers: Providers) -> Result<Self, GroupError> {
        let storage = if config.storage.is_in_memory() {
            DuckDbStorage::in_memory()?
        } else {
            DuckDbStorage::open(&config.storage.path)?
        };
        storage.init_schema().await?;

        let ingestion = HttpIngestion::new(&config.ingestion)?;
        info!(
            storage = %config.storage.path.display(),
            log_url = %config.ingestion.log_url,
            channels = config.channels.len(),
            "Opening channel group"
        );

        Ok(Self::from_config(config, Arc::new(storage), Arc::new(ingestion), providers).await)
    }

    /// Register a channel, or return the existing one with that name.
    pub async fn add_channel(&self, name: impl Into<String>, config: ChannelConfig) -> Channel {
        let name = name.into();
        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(&name) {
            debug!(channel = %name, "Channel already registered");
            return existing.clone();
        }

        let channel = Channel::new(
            name.clone(),
            self.app_secret.clone(),
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.ingestion),
            self.providers.clone(),
        )
        .await;

        for listener in self.listeners() {
            channel.add_listener(listener);
        }
        if !self.is_enabled() {
            channel.set_enabled(false).await;
        }

        debug!(channel = %name, "Channel registered");
        channels.insert(name, channel.clone());
        channel
    }

    pub async fn channel(&self, name: &str) -> Option<Channel> {
        self.channels.lock().await.get(name).cloned()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable every channel. Each channel transitions on its own.
    pub async fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        let channels = self.snapshot().await;
        join_all(channels.iter().map(|channel| channel.set_enabled(enabled))).await;
        info!(enabled, "Channel group state changed");
    }

    pub fn set_log_url(&self, log_url: &str) {
        self.ingestion.set_log_url(log_url);
    }

    /// Listen to every current and future channel.
    pub async fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&listener));
        for channel in self.snapshot().await {
            channel.add_listener(Arc::clone(&listener));
        }
    }

    /// Shut every channel down, then wait for storage writes still running
    /// so the last persisted logs survive the process.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_with_timeout(STORAGE_SHUTDOWN_TIMEOUT).await
    }

    /// Like [`ChannelGroup::shutdown`] with an explicit storage timeout.
    /// Returns false if storage operations were still running at the deadline.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> bool {
        let channels = self.snapshot().await;
        join_all(channels.iter().map(|channel| channel.shutdown())).await;
        let drained = self.storage.shutdown(timeout).await;
        info!(channels = channels.len(), drained, "Channel group shut down");
        drained
    }

    fn listeners(&self) -> Vec<Arc<dyn ChannelListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn snapshot(&self) -> Vec<Channel> {
        self.channels.lock().await.values().cloned().collect()
    }
}
