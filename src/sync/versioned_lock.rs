use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Opaque version of the value guarded by a [`VersionedLock`].
///
/// Every call to [`VersionedGuard::invalidate`] produces a new generation.
/// Work captured under an older generation can detect this when it tries to
/// re-acquire the lock with [`VersionedLock::lock_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Returned by [`VersionedLock::lock_at`] when the generation moved on while
/// the caller was away. The caller should abandon whatever it was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("state changed: expected generation {expected}, found {current}")]
pub struct StateChanged {
    pub expected: Generation,
    pub current: Generation,
}

/// Exclusive async lock paired with a generation counter.
///
/// The counter only advances while the lock is held, so a generation read
/// under the lock is stable for as long as the guard lives.
pub struct VersionedLock<T> {
    value: Mutex<T>,
    generation: AtomicU64,
}

impl<T> VersionedLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            generation: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current generation, read without taking the lock.
    pub fn generation(&self) -> Generation {
        Generation(self.generation.load(Ordering::Acquire))
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.generation() == generation
    }

    /// Wait for exclusive access. Always succeeds and reports the generation
    /// that was live when access was granted.
    pub async fn lock(&self) -> (VersionedGuard<'_, T>, Generation) {
        let guard = self.value.lock().await;
        let generation = self.generation();
        (
            VersionedGuard {
                guard,
                generation: &self.generation,
            },
            generation,
        )
    }

    /// Wait for exclusive access, then verify that `expected` is still the
    /// live generation. On mismatch the lock is released immediately.
    pub async fn lock_at(
        &self,
        expected: Generation,
    ) -> Result<VersionedGuard<'_, T>, StateChanged> {
        let guard = self.value.lock().await;
        let current = self.generation();
        if current != expected {
            drop(guard);
            return Err(StateChanged { expected, current });
        }
        Ok(VersionedGuard {
            guard,
            generation: &self.generation,
        })
    }
}

impl<T: Default> Default for VersionedLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct VersionedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    generation: &'a AtomicU64,
}

impl<T> VersionedGuard<'_, T> {
    pub fn generation(&self) -> Generation {
        Generation(self.generation.load(Ordering::Acquire))
    }

    /// Advance the generation. Anything still holding the previous generation
    /// will fail its next `lock_at`.
    pub fn invalidate(&mut self) -> Generation {
        Generation(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

impl<T> Deref for VersionedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for VersionedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_reports_current_generation() {
        let lock = VersionedLock::new(0u32);
        let (guard, generation) = lock.lock().await;
        assert_eq!(generation, guard.generation());
        assert!(lock.is_current(generation));
    }

    #[tokio::test]
    async fn test_lock_at_matching_generation() {
        let lock = VersionedLock::new(5u32);
        let generation = lock.generation();

        let mut guard = lock.lock_at(generation).await.unwrap();
        *guard += 1;
        drop(guard);

        let (guard, _) = lock.lock().await;
        assert_eq!(*guard, 6);
    }

    #[tokio::test]
    async fn test_invalidate_rejects_stale_generation() {
        let lock = VersionedLock::new(());
        let stale = lock.generation();

        let fresh = {
            let (mut guard, _) = lock.lock().await;
            guard.invalidate()
        };

        assert_ne!(stale, fresh);
        let err = lock.lock_at(stale).await.err().unwrap();
        assert_eq!(err.expected, stale);
        assert_eq!(err.current, fresh);
        assert!(lock.lock_at(fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_lock_at_releases_lock() {
        let lock = VersionedLock::new(());
        let stale = lock.generation();
        {
            let (mut guard, _) = lock.lock().await;
            guard.invalidate();
        }

        assert!(lock.lock_at(stale).await.is_err());
        // Would hang if the rejected attempt kept the mutex.
        let acquired = tokio::time::timeout(Duration::from_secs(1), lock.lock()).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_behind_invalidation_fails() {
        let lock = Arc::new(VersionedLock::new(0u32));
        let stale = lock.generation();

        let (mut guard, _) = lock.lock().await;

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.lock_at(stale).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.invalidate();
        drop(guard);

        let result = waiter.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_exclusive_access() {
        let lock = Arc::new(VersionedLock::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let lock = Arc::clone(&lock);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let (mut guard, _) = lock.lock().await;
                    let value = *guard;
                    tokio::task::yield_now().await;
                    *guard = value + 1;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let (guard, _) = lock.lock().await;
        assert_eq!(*guard, 1600);
    }
}
