use crate::ingestion::IngestionError;
use crate::model::Log;
use thiserror::Error;

/// Why a log was reported through `on_failed_to_send`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendFailure {
    /// The log was abandoned: the channel was disabled, the call was
    /// cancelled, or the stream was flushed.
    #[error("sending was cancelled")]
    Cancelled,

    #[error(transparent)]
    Ingestion(#[from] IngestionError),
}

/// Observer of a channel's log lifecycle.
///
/// Callbacks run synchronously on the task that owns the transition, in
/// registration order, sometimes while the channel state is locked. They
/// must not call back into the same channel.
pub trait ChannelListener: Send + Sync {
    fn on_enqueuing(&self, _channel: &str, _log: &Log) {}

    /// Return `true` to drop the log before it is persisted.
    fn on_filtering(&self, _channel: &str, _log: &Log) -> bool {
        false
    }

    fn on_sending(&self, _channel: &str, _log: &Log) {}

    fn on_sent(&self, _channel: &str, _log: &Log) {}

    fn on_failed_to_send(&self, _channel: &str, _log: &Log, _failure: &SendFailure) {}
}
