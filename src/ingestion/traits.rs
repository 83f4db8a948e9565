use super::call::Call;
use crate::model::Log;
use thiserror::Error;
use uuid::Uuid;

/// Classified delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestionError {
    /// Transient; the same batch is expected to succeed later
    #[error("recoverable ingestion failure: {0}")]
    Recoverable(String),

    /// The batch or the credentials will never be accepted as they are
    #[error("fatal ingestion failure: {0}")]
    Fatal(String),
}

impl IngestionError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, IngestionError::Recoverable(_))
    }
}

/// Network delivery of log batches.
///
/// `send` must return promptly; the actual transfer happens on the task
/// owned by the returned [`Call`]. Implementations are called concurrently
/// and are responsible for bounding their own parallelism.
pub trait Ingestion: Send + Sync {
    fn send(&self, app_secret: &str, install_id: Uuid, logs: Vec<Log>) -> Call;

    /// Point future calls at a different endpoint.
    fn set_log_url(&self, _log_url: &str) {}
}
