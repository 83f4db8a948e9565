use crate::ingestion::CallCanceller;
use crate::model::{DeviceInfo, Log};
use std::collections::HashMap;
use uuid::Uuid;

/// Mutable channel state. Only ever touched through the channel's
/// `VersionedLock`.
#[derive(Debug)]
pub struct ChannelState {
    pub enabled: bool,
    /// Set while suspended by the user or by a fatal failure; enqueued logs
    /// are rejected instead of persisted.
    pub discard_logs: bool,
    /// Persisted rows for the stream that are not part of a sending batch.
    pub pending_log_count: usize,
    pub batch_scheduled: bool,
    pub backing_off: bool,
    pub retry_attempts: u32,
    pub sending_batches: HashMap<Uuid, Vec<Log>>,
    pub calls: HashMap<Uuid, CallCanceller>,
    pub device: Option<DeviceInfo>,
}

impl ChannelState {
    pub fn new() -> Self {
        Self {
            enabled: true,
            discard_logs: false,
            pending_log_count: 0,
            batch_scheduled: false,
            backing_off: false,
            retry_attempts: 0,
            sending_batches: HashMap::new(),
            calls: HashMap::new(),
            device: None,
        }
    }

    pub fn sending_log_count(&self) -> usize {
        self.sending_batches.values().map(Vec::len).sum()
    }

    /// Remove a finished batch. `None` if it was already reconciled.
    pub fn finish_batch(&mut self, batch_id: Uuid) -> Option<Vec<Log>> {
        self.calls.remove(&batch_id);
        self.sending_batches.remove(&batch_id)
    }

    /// Drain every outstanding batch and its call, leaving nothing in flight.
    pub fn take_in_flight(&mut self) -> (Vec<Log>, Vec<CallCanceller>) {
        let logs = self
            .sending_batches
            .drain()
            .flat_map(|(_, logs)| logs)
            .collect();
        let calls = self.calls.drain().map(|(_, call)| call).collect();
        (logs, calls)
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}
