//! Per-key single-flight lock for conversions.
//!
//! The first caller for a key becomes the owner and does the work; later
//! callers get a handle that resolves when the owner's guard is dropped,
//! whether the conversion succeeded, failed or was abandoned. Entries exist
//! only while a conversion is in flight.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

type InFlight = Arc<Mutex<HashMap<String, watch::Receiver<()>>>>;

/// Registry of in-flight conversions.
#[derive(Debug, Clone, Default)]
pub struct ConversionLocks {
    inflight: InFlight,
}

/// Outcome of [`ConversionLocks::acquire`].
#[derive(Debug)]
pub enum Acquired {
    /// Caller must convert, then drop the guard.
    Owner(ConversionGuard),
    /// Another caller is converting; wait, then re-check the cache.
    Waiter(WaitHandle),
}

impl ConversionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become owner of `key`, or get a handle on the current owner.
    pub fn acquire(&self, key: &str) -> Acquired {
        let mut inflight = self.inflight.lock();

        if let Some(receiver) = inflight.get(key) {
            trace!(key = %key, "Conversion already in flight, waiting");
            return Acquired::Waiter(WaitHandle {
                receiver: receiver.clone(),
            });
        }

        let (sender, receiver) = watch::channel(());
        inflight.insert(key.to_string(), receiver);
        Acquired::Owner(ConversionGuard {
            key: key.to_string(),
            inflight: self.inflight.clone(),
            _release: sender,
        })
    }

    /// Whether a conversion for `key` is in flight.
    pub fn is_locked(&self, key: &str) -> bool {
        self.inflight.lock().contains_key(key)
    }

    /// Number of conversions in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Held by the owner for the duration of a conversion.
///
/// Dropping it removes the entry and wakes every waiter, so release happens
/// on every exit path including panics and cancelled futures.
#[derive(Debug)]
pub struct ConversionGuard {
    key: String,
    inflight: InFlight,
    _release: watch::Sender<()>,
}

impl ConversionGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ConversionGuard {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.key);
        // Waiters wake when `_release` is dropped right after this.
    }
}

/// Suspends a non-owner until the owner releases.
#[derive(Debug)]
pub struct WaitHandle {
    receiver: watch::Receiver<()>,
}

impl WaitHandle {
    /// Resolves once the owning guard is dropped.
    pub async fn wait(mut self) {
        // The owner never sends; `changed` errors once the sender is gone.
        while self.receiver.changed().await.is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn owner(acquired: Acquired) -> ConversionGuard {
        match acquired {
            Acquired::Owner(guard) => guard,
            Acquired::Waiter(_) => panic!("expected owner"),
        }
    }

    fn waiter(acquired: Acquired) -> WaitHandle {
        match acquired {
            Acquired::Waiter(handle) => handle,
            Acquired::Owner(_) => panic!("expected waiter"),
        }
    }

    #[test]
    fn test_single_owner_per_key() {
        let locks = ConversionLocks::new();
        let guard = owner(locks.acquire("a"));
        assert_eq!(guard.key(), "a");
        let _ = waiter(locks.acquire("a"));
        assert!(locks.is_locked("a"));
    }

    #[test]
    fn test_keys_are_independent() {
        let locks = ConversionLocks::new();
        let _a = owner(locks.acquire("a"));
        let _b = owner(locks.acquire("b"));
        assert_eq!(locks.in_flight(), 2);
    }

    #[test]
    fn test_release_removes_entry() {
        let locks = ConversionLocks::new();
        let guard = owner(locks.acquire("a"));
        drop(guard);
        assert!(!locks.is_locked("a"));
        assert_eq!(locks.in_flight(), 0);
        let _ = owner(locks.acquire("a"));
    }

    #[tokio::test]
    async fn test_waiters_wake_on_release() {
        let locks = ConversionLocks::new();
        let guard = owner(locks.acquire("a"));
        let first = waiter(locks.acquire("a"));
        let second = waiter(locks.acquire("a"));

        let woken = tokio::spawn(async move {
            first.wait().await;
            second.wait().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!woken.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), woken).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_waiter_after_release_returns_immediately() {
        let locks = ConversionLocks::new();
        let guard = owner(locks.acquire("a"));
        let handle = waiter(locks.acquire("a"));
        drop(guard);
        timeout(Duration::from_millis(100), handle.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_owner_releases() {
        let locks = ConversionLocks::new();
        let task_locks = locks.clone();
        let task = tokio::spawn(async move {
            let _guard = owner(task_locks.acquire("a"));
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let handle = waiter(locks.acquire("a"));
        task.abort();

        timeout(Duration::from_secs(1), handle.wait()).await.unwrap();
        assert!(!locks.is_locked("a"));
    }
}
