use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Snapshot of the device a log was produced on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub sdk_name: String,
    pub sdk_version: String,
    pub os_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    pub time_zone_offset: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// One telemetry record.
///
/// `device` and `timestamp` may be left empty by the caller; the channel
/// fills them in once, before the log is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    #[serde(rename = "type")]
    pub log_type: String,

    /// Stream-specific content, opaque to the pipeline
    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Log {
    pub fn new(log_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            log_type: log_type.into(),
            payload,
            sid: None,
            user_id: None,
            device: None,
            timestamp: None,
        }
    }

    pub fn with_session(mut self, sid: Uuid) -> Self {
        self.sid = Some(sid);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Request body shipped to the ingestion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogContainer {
    pub logs: Vec<Log>,
}
