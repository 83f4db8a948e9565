use super::events::{ChannelListener, SendFailure};
use super::state::ChannelState;
use crate::config::types::ChannelConfig;
use crate::device::Providers;
use crate::ingestion::{CallOutcome, Ingestion, IngestionError};
use crate::model::{DeviceInfo, Log};
use crate::storage::Storage;
use crate::sync::{Generation, VersionedGuard, VersionedLock};
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Rows read per step while announcing a stream that is about to be deleted.
const CLEAR_BATCH_SIZE: usize = 100;
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Batching and delivery state machine for one stream.
///
/// Logs handed to [`Channel::enqueue`] are enriched, persisted and counted.
/// A batch is cut once `max_logs_per_batch` logs are pending or after
/// `batch_interval`, whichever comes first, with at most
/// `max_parallel_batches` batches in flight.
///
/// Every enable/disable transition advances the state generation. Tasks
/// started before a transition (timers, retrievals, network completions)
/// notice the new generation when they next lock the state and back out.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    app_secret: String,
    config: ChannelConfig,
    storage: Arc<dyn Storage>,
    ingestion: Arc<dyn Ingestion>,
    providers: Providers,
    state: VersionedLock<ChannelState>,
    listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
    device_watch: Mutex<Option<JoinHandle<()>>>,
}

enum SuspendMode {
    /// Disabled by the caller: in-flight logs are reported as cancelled and
    /// new logs are rejected. Persisted rows are kept.
    Discard,
    /// Fatal ingestion failure: like `Discard`, and every queued row of the
    /// stream is deleted.
    Flush(IngestionError),
    /// Shutdown: in-flight calls are cancelled quietly and rows are kept.
    Pause,
}

impl SuspendMode {
    fn as_str(&self) -> &'static str {
        match self {
            SuspendMode::Discard => "discard",
            SuspendMode::Flush(_) => "flush",
            SuspendMode::Pause => "pause",
        }
    }
}

impl Channel {
    /// Create the channel and pick up any rows a previous run left behind.
    pub async fn new(
        name: impl Into<String>,
        app_secret: impl Into<String>,
        config: ChannelConfig,
        storage: Arc<dyn Storage>,
        ingestion: Arc<dyn Ingestion>,
        providers: Providers,
    ) -> Self {
        let inner = Arc::new(ChannelInner {
            name: name.into(),
            app_secret: app_secret.into(),
            config,
            storage,
            ingestion,
            providers,
            state: VersionedLock::new(ChannelState::new()),
            listeners: RwLock::new(Vec::new()),
            device_watch: Mutex::new(None),
        });

        inner.ensure_device_watch();

        let persisted = match inner.storage.count(&inner.name).await {
            Ok(count) => count,
            Err(e) => {
                error!(channel = %inner.name, error = %e, "Failed to count persisted logs");
                0
            }
        };

        {
            let (mut state, generation) = inner.state.lock().await;
            state.pending_log_count = persisted;
            inner.check_pending_logs(&mut state, generation);
        }

        if persisted > 0 {
            info!(
                channel = %inner.name,
                count = persisted,
                "Found persisted logs from a previous run"
            );
        }

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.state.lock().await.0.enabled
    }

    /// Persisted logs not yet claimed by a sending batch.
    pub async fn pending_log_count(&self) -> usize {
        self.inner.state.lock().await.0.pending_log_count
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Forget the cached device snapshot; the next log fetches a fresh one.
    pub async fn invalidate_device_cache(&self) {
        self.inner.invalidate_device_cache().await;
    }

    /// Accept a log for delivery. Never fails: storage errors drop the log
    /// and delivery failures are reported through listeners.
    pub async fn enqueue(&self, log: Log) {
        self.inner.enqueue(log).await;
    }

    pub async fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.inner.resume().await;
            return;
        }

        let (state, _) = self.inner.state.lock().await;
        if !state.enabled {
            return;
        }
        self.inner.suspend(state, SuspendMode::Discard).await;
    }

    /// Delete every persisted log of the stream.
    pub async fn clear(&self) {
        if let Err(e) = self.inner.storage.delete_stream(&self.inner.name).await {
            error!(channel = %self.inner.name, error = %e, "Failed to clear logs");
            return;
        }
        let (mut state, _) = self.inner.state.lock().await;
        state.pending_log_count = 0;
        debug!(channel = %self.inner.name, "Cleared logs");
    }

    /// Stop sending. In-flight calls are cancelled and their logs stay
    /// persisted for the next run.
    pub async fn shutdown(&self) {
        let watcher = self
            .inner
            .device_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        let (state, _) = self.inner.state.lock().await;
        if !state.enabled && state.sending_batches.is_empty() {
            debug!(channel = %self.inner.name, "Channel already stopped");
            return;
        }
        self.inner.suspend(state, SuspendMode::Pause).await;
    }
}

impl ChannelInner {
    fn listeners(&self) -> Vec<Arc<dyn ChannelListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn enqueue(self: &Arc<Self>, log: Log) {
        let (state, generation) = self.state.lock().await;
        if state.discard_logs {
            drop(state);
            warn!(channel = %self.name, "Channel is disabled, discarding log");
            let listeners = self.listeners();
            for listener in &listeners {
                listener.on_sending(&self.name, &log);
            }
            for listener in &listeners {
                listener.on_failed_to_send(&self.name, &log, &SendFailure::Cancelled);
            }
            return;
        }
        let cached_device = state.device.clone();
        drop(state);

        let listeners = self.listeners();
        for listener in &listeners {
            listener.on_enqueuing(&self.name, &log);
        }

        let log = self.prepare_log(log, cached_device).await;

        let mut filtered = false;
        for listener in &listeners {
            filtered |= listener.on_filtering(&self.name, &log);
        }
        if filtered {
            debug!(channel = %self.name, log_type = %log.log_type, "Log filtered out");
            return;
        }

        if let Err(e) = self.storage.append(&self.name, &log).await {
            error!(channel = %self.name, error = %e, "Failed to persist log, dropping it");
            return;
        }
        trace!(channel = %self.name, log_type = %log.log_type, "Log persisted");

        match self.state.lock_at(generation).await {
            Ok(mut state) => {
                state.pending_log_count += 1;
                self.check_pending_logs(&mut state, generation);
            }
            // The log is on disk and is counted again on resume
            Err(e) => warn!(
                channel = %self.name,
                error = %e,
                "Channel state changed while enqueuing"
            ),
        }
    }

    async fn prepare_log(&self, mut log: Log, cached: Option<DeviceInfo>) -> Log {
        if log.device.is_none() {
            let device = match cached {
                Some(device) => device,
                None => {
                    let fetched = self.providers.device_info.device_info().await;
                    let (mut state, _) = self.state.lock().await;
                    state.device.get_or_insert(fetched).clone()
                }
            };
            log.device = Some(device);
        }
        if log.timestamp.is_none() {
            log.timestamp = Some(Utc::now());
        }
        log
    }

    /// Start the device invalidation watcher unless one is running.
    /// Returns true if a new watcher was started.
    fn ensure_device_watch(self: &Arc<Self>) -> bool {
        let mut slot = self
            .device_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|watcher| !watcher.is_finished()) {
            return false;
        }
        *slot = Some(spawn_device_watch(self));
        true
    }

    async fn invalidate_device_cache(&self) {
        let (mut state, _) = self.state.lock().await;
        state.device = None;
        debug!(channel = %self.name, "Device info cache invalidated");
    }

    /// Decide whether a batch should go out now, later, or not at all.
    fn check_pending_logs(self: &Arc<Self>, state: &mut ChannelState, generation: Generation) {
        if !state.enabled || state.backing_off {
            return;
        }

        if state.pending_log_count >= self.config.max_logs_per_batch {
            state.batch_scheduled = true;
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.trigger_ingestion(generation).await;
            });
        } else if state.pending_log_count > 0 && !state.batch_scheduled {
            state.batch_scheduled = true;
            let inner = Arc::clone(self);
            let interval = self.config.batch_interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                inner.trigger_ingestion(generation).await;
            });
        }
    }

    async fn trigger_ingestion(self: Arc<Self>, generation: Generation) {
        {
            let mut state = match self.state.lock_at(generation).await {
                Ok(state) => state,
                Err(e) => {
                    debug!(channel = %self.name, error = %e, "Batch attempt abandoned");
                    return;
                }
            };
            if !state.enabled || !state.batch_scheduled {
                return;
            }
            state.batch_scheduled = false;
            if state.backing_off {
                return;
            }
            if state.sending_batches.len() >= self.config.max_parallel_batches {
                debug!(
                    channel = %self.name,
                    in_flight = state.sending_batches.len(),
                    "Too many batches in flight, deferring"
                );
                return;
            }
        }

        let batch = match self
            .storage
            .retrieve_batch(&self.name, self.config.max_logs_per_batch)
            .await
        {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                debug!(channel = %self.name, "No logs to send");
                return;
            }
            Err(e) => {
                error!(channel = %self.name, error = %e, "Failed to retrieve batch");
                return;
            }
        };
        let batch_id = batch.batch_id;

        let install_id = self
            .providers
            .install_id
            .install_id()
            .await
            .unwrap_or_else(Uuid::nil);

        let mut state = match self.state.lock_at(generation).await {
            Ok(state) if state.sending_batches.len() < self.config.max_parallel_batches => state,
            Ok(state) => {
                drop(state);
                debug!(
                    channel = %self.name,
                    batch_id = %batch_id,
                    "Parallel limit reached while retrieving, releasing batch"
                );
                self.release(batch_id).await;
                return;
            }
            Err(e) => {
                warn!(
                    channel = %self.name,
                    batch_id = %batch_id,
                    error = %e,
                    "State changed while retrieving, releasing batch"
                );
                self.release(batch_id).await;
                return;
            }
        };

        let logs = batch.logs;
        state.pending_log_count = state.pending_log_count.saturating_sub(logs.len());
        state.sending_batches.insert(batch_id, logs.clone());
        debug!(channel = %self.name, batch_id = %batch_id, count = logs.len(), "Sending batch");
        self.notify_sending(&logs);

        let call = self.ingestion.send(&self.app_secret, install_id, logs);
        state.calls.insert(batch_id, call.canceller());
        self.check_pending_logs(&mut state, generation);
        drop(state);

        let outcome = call.outcome().await;
        self.handle_sending_result(generation, batch_id, outcome).await;
    }

    async fn handle_sending_result(
        self: &Arc<Self>,
        generation: Generation,
        batch_id: Uuid,
        outcome: CallOutcome,
    ) {
        // Delivered rows are deleted even when the batch went stale, so a
        // resumed channel does not send them again.
        if outcome == CallOutcome::Sent {
            if let Err(e) = self.storage.delete_batch(&self.name, batch_id).await {
                error!(
                    channel = %self.name,
                    batch_id = %batch_id,
                    error = %e,
                    "Failed to delete sent batch"
                );
            }
        }

        let mut state = match self.state.lock_at(generation).await {
            Ok(state) => state,
            Err(_) => {
                // A suspend already reconciled this batch
                let (mut state, _) = self.state.lock().await;
                state.finish_batch(batch_id);
                debug!(
                    channel = %self.name,
                    batch_id = %batch_id,
                    "Ignoring outcome of a stale batch"
                );
                return;
            }
        };
        let Some(logs) = state.finish_batch(batch_id) else {
            return;
        };

        match outcome {
            CallOutcome::Sent => self.handle_success(state, generation, batch_id, logs),
            CallOutcome::Cancelled => self.handle_cancel(state, generation, batch_id, logs).await,
            CallOutcome::Failed(e) if e.is_recoverable() => {
                self.handle_recoverable_failure(state, generation, batch_id, logs, e)
                    .await
            }
            CallOutcome::Failed(e) => self.handle_fatal_failure(state, batch_id, logs, e).await,
        }
    }

    fn handle_success(
        self: &Arc<Self>,
        mut state: VersionedGuard<'_, ChannelState>,
        generation: Generation,
        batch_id: Uuid,
        logs: Vec<Log>,
    ) {
        state.retry_attempts = 0;
        self.check_pending_logs(&mut state, generation);
        drop(state);

        debug!(channel = %self.name, batch_id = %batch_id, count = logs.len(), "Batch sent");
        self.notify_sent(&logs);
    }

    async fn handle_cancel(
        self: &Arc<Self>,
        mut state: VersionedGuard<'_, ChannelState>,
        generation: Generation,
        batch_id: Uuid,
        logs: Vec<Log>,
    ) {
        self.release(batch_id).await;
        state.pending_log_count += logs.len();
        debug!(channel = %self.name, batch_id = %batch_id, "Batch cancelled");
        self.notify_failed(&logs, &SendFailure::Cancelled);
        self.check_pending_logs(&mut state, generation);
    }

    async fn handle_recoverable_failure(
        self: &Arc<Self>,
        mut state: VersionedGuard<'_, ChannelState>,
        generation: Generation,
        batch_id: Uuid,
        logs: Vec<Log>,
        error: IngestionError,
    ) {
        self.release(batch_id).await;
        state.pending_log_count += logs.len();
        state.retry_attempts = state.retry_attempts.saturating_add(1);
        let delay = self.retry_delay(state.retry_attempts);

        warn!(
            channel = %self.name,
            batch_id = %batch_id,
            count = logs.len(),
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Sending failed, will retry"
        );

        if state.backing_off {
            return;
        }
        state.backing_off = true;
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut state) = inner.state.lock_at(generation).await {
                state.backing_off = false;
                inner.check_pending_logs(&mut state, generation);
            }
        });
    }

    async fn handle_fatal_failure(
        self: &Arc<Self>,
        state: VersionedGuard<'_, ChannelState>,
        batch_id: Uuid,
        logs: Vec<Log>,
        error: IngestionError,
    ) {
        error!(
            channel = %self.name,
            batch_id = %batch_id,
            count = logs.len(),
            error = %error,
            "Sending failed permanently, disabling channel"
        );
        self.notify_failed(&logs, &SendFailure::Ingestion(error.clone()));
        self.suspend(state, SuspendMode::Flush(error)).await;
    }

    fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.config
            .retry_backoff
            .saturating_mul(factor)
            .min(MAX_RETRY_BACKOFF)
    }

    async fn release(&self, batch_id: Uuid) {
        if let Err(e) = self.storage.release_batch(&self.name, batch_id).await {
            error!(
                channel = %self.name,
                batch_id = %batch_id,
                error = %e,
                "Failed to release batch"
            );
        }
    }

    async fn suspend(
        self: &Arc<Self>,
        mut state: VersionedGuard<'_, ChannelState>,
        mode: SuspendMode,
    ) {
        state.enabled = false;
        state.batch_scheduled = false;
        state.backing_off = false;
        state.retry_attempts = 0;
        if !matches!(mode, SuspendMode::Pause) {
            state.discard_logs = true;
        }
        let generation = state.invalidate();

        let (unsent, calls) = state.take_in_flight();
        match mode {
            // Claims are kept until the stream is deleted so the announcement
            // skips logs that were already reported.
            SuspendMode::Flush(_) => state.pending_log_count = 0,
            SuspendMode::Discard | SuspendMode::Pause => {
                state.pending_log_count += unsent.len();
                self.storage.clear_pending_state(&self.name);
            }
        }
        drop(state);

        for call in &calls {
            call.cancel();
        }

        info!(
            channel = %self.name,
            generation = %generation,
            mode = mode.as_str(),
            cancelled_calls = calls.len(),
            unsent = unsent.len(),
            "Channel suspended"
        );

        match mode {
            SuspendMode::Discard => self.notify_failed(&unsent, &SendFailure::Cancelled),
            SuspendMode::Flush(error) => {
                self.notify_failed(&unsent, &SendFailure::Ingestion(error));
                self.flush_stream(generation).await;
            }
            SuspendMode::Pause => {}
        }
    }

    async fn resume(self: &Arc<Self>) {
        let generation = {
            let (mut state, _) = self.state.lock().await;
            if state.enabled {
                return;
            }
            state.enabled = true;
            state.discard_logs = false;
            state.batch_scheduled = false;
            state.backing_off = false;
            state.retry_attempts = 0;
            // Invalidations sent while the watcher was stopped are lost
            if self.ensure_device_watch() {
                state.device = None;
            }
            state.invalidate()
        };

        let persisted = match self.storage.count(&self.name).await {
            Ok(count) => count,
            Err(e) => {
                error!(channel = %self.name, error = %e, "Failed to count persisted logs");
                0
            }
        };

        let Ok(mut state) = self.state.lock_at(generation).await else {
            return;
        };
        state.pending_log_count = persisted.saturating_sub(state.sending_log_count());
        info!(
            channel = %self.name,
            generation = %generation,
            pending = state.pending_log_count,
            "Channel resumed"
        );
        self.check_pending_logs(&mut state, generation);
    }

    /// Report and delete every queued row after a fatal failure.
    async fn flush_stream(&self, generation: Generation) {
        let listeners = self.listeners();
        if !listeners.is_empty() {
            self.announce_deleted_logs(&listeners).await;
        }

        if let Err(e) = self.storage.delete_stream(&self.name).await {
            error!(channel = %self.name, error = %e, "Failed to delete logs");
            // Leave the rows retrievable for when the channel is enabled again
            self.storage.clear_pending_state(&self.name);
        }

        if let Ok(mut state) = self.state.lock_at(generation).await {
            state.pending_log_count = 0;
        }
    }

    async fn announce_deleted_logs(&self, listeners: &[Arc<dyn ChannelListener>]) {
        let mut announced = 0;
        loop {
            let batch = match self.storage.retrieve_batch(&self.name, CLEAR_BATCH_SIZE).await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    warn!(channel = %self.name, error = %e, "Failed to read logs being deleted");
                    break;
                }
            };

            for log in &batch.logs {
                for listener in listeners {
                    listener.on_sending(&self.name, log);
                }
                for listener in listeners {
                    listener.on_failed_to_send(&self.name, log, &SendFailure::Cancelled);
                }
            }
            announced += batch.len();

            if batch.len() < CLEAR_BATCH_SIZE {
                break;
            }
        }
        debug!(channel = %self.name, count = announced, "Announced logs being deleted");
    }

    fn notify_sending(&self, logs: &[Log]) {
        let listeners = self.listeners();
        for log in logs {
            for listener in &listeners {
                listener.on_sending(&self.name, log);
            }
        }
    }

    fn notify_sent(&self, logs: &[Log]) {
        let listeners = self.listeners();
        for log in logs {
            for listener in &listeners {
                listener.on_sent(&self.name, log);
            }
        }
    }

    fn notify_failed(&self, logs: &[Log], failure: &SendFailure) {
        let listeners = self.listeners();
        for log in logs {
            for listener in &listeners {
                listener.on_failed_to_send(&self.name, log, failure);
            }
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let watcher = self
            .device_watch
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
    }
}

fn spawn_device_watch(inner: &Arc<ChannelInner>) -> JoinHandle<()> {
    let mut invalidations = inner.providers.device_info.subscribe_invalidations();
    let channel: Weak<ChannelInner> = Arc::downgrade(inner);

    tokio::spawn(async move {
        loop {
            match invalidations.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => {
                    let Some(inner) = channel.upgrade() else {
                        break;
                    };
                    inner.invalidate_device_cache().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
