use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Counts database operations that have started but not finished.
///
/// A [`TaskGuard`] is moved into each blocking task, so the count covers the
/// work itself even when the future that started it is dropped.
#[derive(Debug, Default)]
pub struct InFlightTasks {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlightTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(self: &Arc<Self>) -> TaskGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        TaskGuard {
            tasks: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until no operation is running. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

pub struct TaskGuard {
    tasks: Arc<InFlightTasks>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.tasks.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tasks.idle.notify_waiters();
        }
    }
}
