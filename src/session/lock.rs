//! Per-session mutual exclusion.
//!
//! Waiters queue behind the current holder and are served strictly in
//! acquisition order via oneshot handover. Guards release on every exit
//! path, including panic unwind.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

#[derive(Default, Debug)]
struct LockState {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

type LockMap = Arc<Mutex<HashMap<String, LockState>>>;

/// Registry of per-session-id async locks.
#[derive(Default, Clone)]
pub struct SessionLocks {
    inner: LockMap,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `id`, waiting behind earlier acquirers.
    ///
    /// Fails only if the registry is cleared while waiting.
    pub async fn acquire(&self, id: &str) -> Result<LockGuard> {
        let pending = {
            let mut map = self.inner.lock();
            let state = map.entry(id.to_string()).or_default();
            if state.held {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            } else {
                state.held = true;
                None
            }
        };

        if let Some(rx) = pending {
            rx.await.map_err(|_| EngineError::locks_cleared(id))?;
        }

        Ok(LockGuard {
            id: id.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Acquire without waiting. `None` when the lock is held.
    pub fn try_acquire(&self, id: &str) -> Option<LockGuard> {
        let mut map = self.inner.lock();
        let state = map.entry(id.to_string()).or_default();
        if state.held {
            return None;
        }
        state.held = true;
        Some(LockGuard {
            id: id.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Run `f` while holding the lock for `id`. The guard drops on every
    /// exit path, including when the future panics.
    pub async fn with_lock<F, Fut, T>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.acquire(id).await?;
        f().await
    }

    /// Diagnostic only: whether the lock for `id` is currently held.
    pub fn is_locked(&self, id: &str) -> bool {
        self.inner.lock().get(id).map(|s| s.held).unwrap_or(false)
    }

    /// Diagnostic only: number of held locks.
    pub fn active_lock_count(&self) -> usize {
        self.inner.lock().values().filter(|s| s.held).count()
    }

    /// Diagnostic only: waiters queued behind the holder of `id`.
    pub fn queued_waiters(&self, id: &str) -> usize {
        self.inner
            .lock()
            .get(id)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }

    /// Force-release every lock and drain all queued waiters.
    ///
    /// Waiters see a `LOCKS_CLEARED` error instead of acquiring. Unsafe
    /// outside shutdown and tests: outstanding guards become no-ops and
    /// critical sections lose exclusion.
    pub fn clear_all(&self) {
        let mut map = self.inner.lock();
        let held: usize = map.values().filter(|s| s.held).count();
        let waiting: usize = map.values().map(|s| s.waiters.len()).sum();
        if held > 0 || waiting > 0 {
            warn!(held, waiting, "force-clearing session locks");
        }
        map.clear();
    }
}

/// Held lock for one session id. Releasing hands the lock to the next
/// queued waiter, if any.
#[derive(Debug)]
pub struct LockGuard {
    id: String,
    inner: LockMap,
}

impl LockGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut map = self.inner.lock();
        let Some(state) = map.get_mut(&self.id) else {
            // Registry was cleared while we held the lock.
            return;
        };

        // Hand over to the first waiter still listening.
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
            debug!(id = %self.id, "skipping cancelled lock waiter");
        }

        state.held = false;
        if state.waiters.is_empty() {
            map.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = SessionLocks::new();

        let guard = locks.acquire("s1").await.unwrap();
        assert!(locks.is_locked("s1"));
        assert_eq!(locks.active_lock_count(), 1);

        drop(guard);
        assert!(!locks.is_locked("s1"));
        assert_eq!(locks.active_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_try_acquire_when_held() {
        let locks = SessionLocks::new();
        let _guard = locks.acquire("s1").await.unwrap();

        assert!(locks.try_acquire("s1").is_none());
        assert!(locks.try_acquire("s2").is_some());
    }

    #[tokio::test]
    async fn test_waiters_served_in_acquisition_order() {
        let locks = SessionLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.acquire("s1").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let task_locks = locks.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = task_locks.acquire("s1").await.unwrap();
                order.lock().push(i);
            }));
            // Wait until this waiter is queued before spawning the next, so
            // acquisition order is deterministic.
            while locks.queued_waiters("s1") < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_with_lock_is_mutually_exclusive() {
        let locks = SessionLocks::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("shared", || async {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let locks = SessionLocks::new();

        let result: Result<()> = locks
            .with_lock("s1", || async { Err(EngineError::internal("boom")) })
            .await;
        assert!(result.is_err());
        assert!(!locks.is_locked("s1"));
    }

    #[tokio::test]
    async fn test_clear_all_fails_pending_waiters() {
        let locks = SessionLocks::new();
        let _held = locks.acquire("s1").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("s1").await })
        };
        while locks.queued_waiters("s1") == 0 {
            tokio::task::yield_now().await;
        }

        locks.clear_all();

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err().code, "LOCKS_CLEARED");
        assert_eq!(locks.active_lock_count(), 0);
    }
}
