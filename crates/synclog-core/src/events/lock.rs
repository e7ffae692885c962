//! Soft lock over multi-step event store sections.
//!
//! The lock is re-entrant for the owning thread and never blocks
//! indefinitely: acquisition polls until the configured budget runs out and
//! then fails with [`Error::StoreBusy`].

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutexGuard;

use super::EventStore;
use crate::alerts::{StoreAlertKind, StoreKind};
use crate::error::{Error, Result};

/// Held soft lock; released on drop
pub struct SoftLockGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl fmt::Debug for SoftLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftLockGuard").finish_non_exhaustive()
    }
}

impl EventStore {
    /// Acquire the soft lock within the configured timeout
    pub fn soft_lock(&self) -> Result<SoftLockGuard<'_>> {
        self.soft_lock_with_timeout(self.database().config().soft_lock_timeout)
    }

    /// Acquire the soft lock, polling until `timeout` elapses
    pub fn soft_lock_with_timeout(&self, timeout: Duration) -> Result<SoftLockGuard<'_>> {
        let step = self
            .database()
            .config()
            .soft_lock_poll_interval
            .max(Duration::from_millis(1));
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(guard) = self.soft_lock.try_lock() {
                return Ok(SoftLockGuard { _guard: guard });
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(step.min(deadline - now));
        }

        tracing::warn!(?timeout, "Event store soft lock timed out");
        self.database()
            .alerts()
            .emit(StoreAlertKind::Busy, StoreKind::Events);
        Err(Error::StoreBusy)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc};

    use super::*;
    use crate::alerts::StoreAlerts;
    use crate::config::StoreConfig;

    fn store() -> EventStore {
        let config = StoreConfig::new("unused")
            .with_soft_lock_timeout(Duration::from_millis(100))
            .with_soft_lock_poll_interval(Duration::from_millis(10));
        EventStore::open_in_memory(&config, StoreAlerts::new()).unwrap()
    }

    #[test]
    fn soft_lock_is_reentrant() {
        let store = store();
        let _outer = store.soft_lock().unwrap();
        let _inner = store.soft_lock().unwrap();
    }

    #[test]
    fn contended_soft_lock_reports_busy() {
        let store = Arc::new(store());
        let mut alerts = store.database().alerts().subscribe();
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let _guard = store.soft_lock().unwrap();
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        locked_rx.recv().unwrap();

        let err = store.soft_lock().unwrap_err();
        assert!(matches!(err, Error::StoreBusy));
        assert!(matches!(
            store.soft_lock_with_timeout(Duration::ZERO),
            Err(Error::StoreBusy)
        ));
        assert!(err.is_retryable());
        assert_eq!(alerts.try_recv().unwrap().kind, StoreAlertKind::Busy);

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(store.soft_lock().is_ok());
    }
}
