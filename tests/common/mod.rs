#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use telechannel::channel::{ChannelListener, SendFailure};
use telechannel::config::ChannelConfig;
use telechannel::device::{Providers, StaticDeviceInfoProvider, StaticInstallIdProvider};
use telechannel::ingestion::{Call, Ingestion, IngestionError};
use telechannel::model::{DeviceInfo, Log};
use telechannel::storage::{
    DuckDbStorage, InFlightTasks, RetrievedBatch, Storage, StorageError,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub fn log(n: u64) -> Log {
    Log::new("event", json!({ "n": n }))
}

pub fn number(log: &Log) -> u64 {
    log.payload["n"].as_u64().unwrap()
}

pub fn channel_config(
    max_logs_per_batch: usize,
    batch_interval: Duration,
    max_parallel_batches: usize,
) -> ChannelConfig {
    ChannelConfig {
        max_logs_per_batch,
        batch_interval,
        max_parallel_batches,
        retry_backoff: Duration::from_millis(20),
    }
}

pub async fn memory_storage() -> Arc<DuckDbStorage> {
    let storage = DuckDbStorage::in_memory().unwrap();
    storage.init_schema().await.unwrap();
    Arc::new(storage)
}

pub fn providers() -> Providers {
    Providers::new(
        Arc::new(StaticDeviceInfoProvider::new(DeviceInfo {
            sdk_name: "telechannel.test".to_string(),
            sdk_version: "0.0.0".to_string(),
            os_name: "linux".to_string(),
            os_version: None,
            model: None,
            host_name: None,
            locale: None,
            time_zone_offset: 0,
            app_version: None,
        })),
        Arc::new(StaticInstallIdProvider::new(Uuid::new_v4())),
    )
}

/// Poll `check` every 10ms for up to five seconds.
pub async fn wait_for<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Poll the persisted row count of `stream` until it equals `expected`.
pub async fn wait_for_count(storage: &DuckDbStorage, stream: &str, expected: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if storage.count(stream).await.unwrap() == expected {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Database storage with injectable slowness and faults.
pub struct InstrumentedStorage {
    inner: Arc<DuckDbStorage>,
    delete_delay: Duration,
    fail_stream_deletes: AtomicBool,
    deletes: AtomicUsize,
    clears: AtomicUsize,
    tasks: Arc<InFlightTasks>,
}

impl InstrumentedStorage {
    pub fn new(inner: Arc<DuckDbStorage>) -> Self {
        Self {
            inner,
            delete_delay: Duration::ZERO,
            fail_stream_deletes: AtomicBool::new(false),
            deletes: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            tasks: Arc::new(InFlightTasks::new()),
        }
    }

    /// Each batch delete sleeps for `delay` before reaching the database.
    pub fn with_delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    pub fn failing_stream_deletes(self) -> Self {
        self.fail_stream_deletes.store(true, Ordering::SeqCst);
        self
    }

    pub fn inner(&self) -> &DuckDbStorage {
        &self.inner
    }

    pub fn deletes_started(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn pending_clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for InstrumentedStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.inner.init_schema().await
    }

    async fn append(&self, stream: &str, log: &Log) -> Result<(), StorageError> {
        self.inner.append(stream, log).await
    }

    async fn retrieve_batch(
        &self,
        stream: &str,
        limit: usize,
    ) -> Result<Option<RetrievedBatch>, StorageError> {
        self.inner.retrieve_batch(stream, limit).await
    }

    async fn delete_batch(&self, stream: &str, batch_id: Uuid) -> Result<(), StorageError> {
        let _task = self.tasks.begin();
        self.deletes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delete_delay).await;
        self.inner.delete_batch(stream, batch_id).await
    }

    async fn release_batch(&self, stream: &str, batch_id: Uuid) -> Result<(), StorageError> {
        self.inner.release_batch(stream, batch_id).await
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), StorageError> {
        if self.fail_stream_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Database("disk full".to_string()));
        }
        self.inner.delete_stream(stream).await
    }

    async fn count(&self, stream: &str) -> Result<usize, StorageError> {
        self.inner.count(stream).await
    }

    fn clear_pending_state(&self, stream: &str) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear_pending_state(stream)
    }

    async fn shutdown(&self, timeout: Duration) -> bool {
        self.tasks.wait_idle(timeout).await && self.inner.shutdown(timeout).await
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(IngestionError),
    FailAfter(Duration, IngestionError),
    Hang,
}

/// Ingestion that plays back a script of outcomes, then keeps returning
/// the default step.
pub struct ScriptedIngestion {
    script: Mutex<VecDeque<Step>>,
    default: Step,
    batches: Mutex<Vec<Vec<Log>>>,
    log_url: Mutex<Option<String>>,
}

impl ScriptedIngestion {
    pub fn new(script: Vec<Step>, default: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default,
            batches: Mutex::new(Vec::new()),
            log_url: Mutex::new(None),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(Vec::new(), Step::Succeed)
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|batch| batch.iter().map(number).collect())
            .collect()
    }

    pub fn log_url(&self) -> Option<String> {
        self.log_url.lock().unwrap().clone()
    }
}

impl Ingestion for ScriptedIngestion {
    fn send(&self, _app_secret: &str, _install_id: Uuid, logs: Vec<Log>) -> Call {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        self.batches.lock().unwrap().push(logs);

        let token = CancellationToken::new();
        match step {
            Step::Succeed => Call::spawn(token, async { Ok(()) }),
            Step::Fail(e) => Call::spawn(token, async move { Err(e) }),
            Step::FailAfter(delay, e) => Call::spawn(token, async move {
                tokio::time::sleep(delay).await;
                Err(e)
            }),
            Step::Hang => Call::spawn(token, futures::future::pending()),
        }
    }

    fn set_log_url(&self, log_url: &str) {
        *self.log_url.lock().unwrap() = Some(log_url.to_string());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Enqueuing(u64),
    Sending(u64),
    Sent(u64),
    Failed(u64, SendFailure),
}

/// Records every callback; optionally filters logs by number.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
    filtered: Vec<u64>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn filtering(filtered: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            filtered,
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn enqueued(&self) -> Vec<u64> {
        self.collect(|e| match e {
            Event::Enqueuing(n) => Some(*n),
            _ => None,
        })
    }

    pub fn sending(&self) -> Vec<u64> {
        self.collect(|e| match e {
            Event::Sending(n) => Some(*n),
            _ => None,
        })
    }

    pub fn sent(&self) -> Vec<u64> {
        self.collect(|e| match e {
            Event::Sent(n) => Some(*n),
            _ => None,
        })
    }

    pub fn failed(&self) -> Vec<(u64, SendFailure)> {
        self.collect(|e| match e {
            Event::Failed(n, failure) => Some((*n, failure.clone())),
            _ => None,
        })
    }

    fn collect<T>(&self, pick: impl Fn(&Event) -> Option<T>) -> Vec<T> {
        self.events.lock().unwrap().iter().filter_map(pick).collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl ChannelListener for RecordingListener {
    fn on_enqueuing(&self, _channel: &str, log: &Log) {
        self.record(Event::Enqueuing(number(log)));
    }

    fn on_filtering(&self, _channel: &str, log: &Log) -> bool {
        self.filtered.contains(&number(log))
    }

    fn on_sending(&self, _channel: &str, log: &Log) {
        self.record(Event::Sending(number(log)));
    }

    fn on_sent(&self, _channel: &str, log: &Log) {
        self.record(Event::Sent(number(log)));
    }

    fn on_failed_to_send(&self, _channel: &str, log: &Log, failure: &SendFailure) {
        self.record(Event::Failed(number(log), failure.clone()));
    }
}
