use crate::model::{Log, SerializationError};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Durable, per-stream log queue with exactly-once batch hand-off.
///
/// Rows handed out by [`Storage::retrieve_batch`] are marked pending and
/// are skipped by every later retrieval until their batch is deleted or
/// released, or until the stream's pending state is cleared.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    async fn append(&self, stream: &str, log: &Log) -> Result<(), StorageError>;

    /// Claim up to `limit` of the oldest unclaimed rows for `stream`.
    /// Returns `None` when no eligible rows exist.
    async fn retrieve_batch(
        &self,
        stream: &str,
        limit: usize,
    ) -> Result<Option<RetrievedBatch>, StorageError>;

    /// Delete the rows of a batch and drop its claim.
    async fn delete_batch(&self, stream: &str, batch_id: Uuid) -> Result<(), StorageError>;

    /// Drop the claim of a batch, leaving its rows available for retrieval.
    async fn release_batch(&self, stream: &str, batch_id: Uuid) -> Result<(), StorageError>;

    /// Delete every row of the stream, claimed or not.
    async fn delete_stream(&self, stream: &str) -> Result<(), StorageError>;

    /// Number of persisted rows for the stream, including claimed ones.
    async fn count(&self, stream: &str) -> Result<usize, StorageError>;

    /// Forget every claim held for the stream without touching rows.
    fn clear_pending_state(&self, stream: &str);

    /// Wait up to `timeout` for running operations to finish. Returns false
    /// if some were still running when the timeout expired.
    async fn shutdown(&self, timeout: Duration) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetrievedBatch {
    pub batch_id: Uuid,
    pub logs: Vec<Log>,
}

impl RetrievedBatch {
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<duckdb::Error> for StorageError {
    fn from(err: duckdb::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}
