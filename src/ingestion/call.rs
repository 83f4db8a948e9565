use super::traits::IngestionError;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Sent,
    Failed(IngestionError),
    Cancelled,
}

/// Handle to one in-flight delivery.
///
/// The request runs on its own task; awaiting [`Call::outcome`] waits for it
/// to finish, while [`Call::cancel`] (or any [`CallCanceller`]) aborts it.
#[derive(Debug)]
pub struct Call {
    id: Uuid,
    token: CancellationToken,
    handle: JoinHandle<CallOutcome>,
}

impl Call {
    /// Start `request` on a new task. The future is not polled if `token` is
    /// already cancelled, so nothing reaches the network in that case.
    pub fn spawn<F>(token: CancellationToken, request: F) -> Self
    where
        F: Future<Output = Result<(), IngestionError>> + Send + 'static,
    {
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => CallOutcome::Cancelled,
                result = request => match result {
                    Ok(()) => CallOutcome::Sent,
                    Err(e) => CallOutcome::Failed(e),
                },
            }
        });

        Self {
            id: Uuid::new_v4(),
            token,
            handle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn canceller(&self) -> CallCanceller {
        CallCanceller {
            id: self.id,
            token: self.token.clone(),
        }
    }

    pub async fn outcome(self) -> CallOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => CallOutcome::Cancelled,
            Err(e) => CallOutcome::Failed(IngestionError::Fatal(format!(
                "ingestion task panicked: {}",
                e
            ))),
        }
    }
}

/// Cloneable cancel-only view of a [`Call`].
#[derive(Debug, Clone)]
pub struct CallCanceller {
    id: Uuid,
    token: CancellationToken,
}

impl CallCanceller {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
