use super::log::Log;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("malformed log: {0}")]
    Json(#[from] serde_json::Error),
}

/// Converts logs to and from their persisted text form.
pub trait LogSerializer: Send + Sync {
    fn serialize(&self, log: &Log) -> Result<String, SerializationError>;
    fn deserialize(&self, text: &str) -> Result<Log, SerializationError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLogSerializer;

impl LogSerializer for JsonLogSerializer {
    fn serialize(&self, log: &Log) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(log)?)
    }

    fn deserialize(&self, text: &str) -> Result<Log, SerializationError> {
        Ok(serde_json::from_str(text)?)
    }
}
