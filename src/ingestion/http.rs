use super::call::Call;
use super::traits::{Ingestion, IngestionError};
use crate::config::types::IngestionConfig;
use crate::model::{Log, LogContainer};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const APP_SECRET_HEADER: &str = "App-Secret";
pub const INSTALL_ID_HEADER: &str = "Install-ID";
const API_PATH: &str = "/logs?api-version=1.0.0";

#[derive(Debug, Error)]
pub enum HttpIngestionError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid log url: {0}")]
    InvalidUrl(String),
}

/// Ingestion over HTTP POST with JSON bodies.
///
/// At most `max_concurrent_requests` requests are on the wire at once;
/// further calls wait for a permit (and can be cancelled while waiting).
#[derive(Debug)]
pub struct HttpIngestion {
    client: reqwest::Client,
    log_url: RwLock<String>,
    permits: Arc<Semaphore>,
}

impl HttpIngestion {
    pub fn new(config: &IngestionConfig) -> Result<Self, HttpIngestionError> {
        validate_log_url(&config.log_url)?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            log_url: RwLock::new(config.log_url.clone()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
        })
    }

    pub fn log_url(&self) -> String {
        self.log_url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.log_url().trim_end_matches('/'), API_PATH)
    }

    pub fn create_headers(app_secret: &str, install_id: Uuid) -> Vec<(&'static str, String)> {
        vec![
            (APP_SECRET_HEADER, app_secret.to_string()),
            (INSTALL_ID_HEADER, install_id.to_string()),
        ]
    }
}

impl Ingestion for HttpIngestion {
    fn send(&self, app_secret: &str, install_id: Uuid, logs: Vec<Log>) -> Call {
        let client = self.client.clone();
        let url = self.endpoint();
        let headers = Self::create_headers(app_secret, install_id);
        let permits = Arc::clone(&self.permits);

        Call::spawn(CancellationToken::new(), async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| IngestionError::Fatal("ingestion is closed".to_string()))?;

            let count = logs.len();
            let body = serde_json::to_vec(&LogContainer { logs })
                .map_err(|e| IngestionError::Fatal(format!("could not serialize logs: {}", e)))?;

            let mut request = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
            for (name, value) in headers {
                request = request.header(name, value);
            }

            tracing::debug!(url = %url, count, "Sending logs to ingestion");
            let response = request.send().await.map_err(classify_transport_error)?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let message = response.text().await.unwrap_or_default();
            Err(classify_status(status.as_u16(), &message))
        })
    }

    fn set_log_url(&self, log_url: &str) {
        if let Err(e) = validate_log_url(log_url) {
            tracing::error!(error = %e, "Ignoring log url change");
            return;
        }
        let mut current = self.log_url.write().unwrap_or_else(PoisonError::into_inner);
        *current = log_url.to_string();
        tracing::info!(log_url, "Log url changed");
    }
}

pub(crate) fn validate_log_url(log_url: &str) -> Result<(), HttpIngestionError> {
    let url = reqwest::Url::parse(log_url)
        .map_err(|e| HttpIngestionError::InvalidUrl(format!("{}: {}", log_url, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(HttpIngestionError::InvalidUrl(format!(
            "{}: unsupported scheme '{}'",
            log_url, other
        ))),
    }
}

/// Map a non-success HTTP status to a failure class.
///
/// Timeouts, throttling and server errors are worth retrying; anything else
/// (bad credentials, rejected payload) is not.
pub fn classify_status(status: u16, message: &str) -> IngestionError {
    let description = if message.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, message)
    };

    match status {
        408 | 429 | 500..=599 => IngestionError::Recoverable(description),
        _ => IngestionError::Fatal(description),
    }
}

fn classify_transport_error(err: reqwest::Error) -> IngestionError {
    if err.is_builder() {
        IngestionError::Fatal(format!("invalid request: {}", err))
    } else {
        IngestionError::Recoverable(format!("network error: {}", err))
    }
}
