//! Dynamic-capacity admission for concurrent batch dispatch.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use spillway_core::{Error, Result};
use spillway_pool::ConnectionPool;

/// Live capacity feed for the coordinator
pub trait CapacitySource: Send + Sync + fmt::Debug {
    /// Slots the coordinator may hand out right now
    fn capacity(&self) -> usize;
}

impl CapacitySource for ConnectionPool {
    fn capacity(&self) -> usize {
        self.total_recommended_parallelism()
    }
}

#[derive(Debug)]
struct CoordinatorInner {
    held: AtomicUsize,
    notify: Notify,
}

/// Admission gate whose width follows the pool's recommended parallelism.
///
/// Capacity is consulted live on every admission attempt, so it can grow
/// between acquires. It never shrinks below the slots already held: when
/// the underlying sum drops, the coordinator simply stops issuing new
/// slots until enough are released. A plain semaphore cannot model that,
/// hence the compare-and-swap admission loop over a notify signal.
#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    source: Arc<dyn CapacitySource>,
    inner: Arc<CoordinatorInner>,
}

impl BatchCoordinator {
    /// Create a coordinator fed by `source`
    #[must_use]
    pub fn new(source: Arc<dyn CapacitySource>) -> Self {
        Self {
            source,
            inner: Arc::new(CoordinatorInner {
                held: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Current capacity (at least 1, so progress is always possible)
    pub fn capacity(&self) -> usize {
        self.source.capacity().max(1)
    }

    /// Slots currently held
    pub fn held(&self) -> usize {
        self.inner.held.load(Ordering::Acquire)
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.held())
    }

    fn try_acquire_slot(&self) -> bool {
        loop {
            let capacity = self.capacity();
            let held = self.inner.held.load(Ordering::Acquire);
            if held >= capacity {
                return false;
            }
            if self
                .inner
                .held
                .compare_exchange_weak(held, held + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Acquire a dispatch slot, waiting up to `timeout`.
    ///
    /// The returned permit frees its slot on drop. Exhausting the timeout
    /// yields `CoordinatorExhausted` with the capacity observed at that
    /// moment; cancellation yields `Cancelled`.
    pub async fn acquire(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CoordinatorPermit> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire_slot() {
                return Ok(CoordinatorPermit {
                    inner: Arc::clone(&self.inner),
                });
            }

            // Register for release signals before the re-check so a slot
            // freed in between is not missed.
            let notified = self.inner.notify.notified();
            if self.try_acquire_slot() {
                return Ok(CoordinatorPermit {
                    inner: Arc::clone(&self.inner),
                });
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return Err(Error::CoordinatorExhausted {
                        available: self.available(),
                        capacity: self.capacity(),
                        timeout,
                    });
                }
            }
        }
    }
}

/// A held dispatch slot; freed on drop
#[derive(Debug)]
pub struct CoordinatorPermit {
    inner: Arc<CoordinatorInner>,
}

impl Drop for CoordinatorPermit {
    fn drop(&mut self) {
        self.inner.held.fetch_sub(1, Ordering::AcqRel);
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedCapacity(AtomicUsize);

    impl CapacitySource for FixedCapacity {
        fn capacity(&self) -> usize {
            self.0.load(Ordering::Acquire)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn issues_up_to_capacity() {
        let source = Arc::new(FixedCapacity(AtomicUsize::new(2)));
        let coordinator = BatchCoordinator::new(source);
        let cancel = CancellationToken::new();

        let a = coordinator.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        let _b = coordinator.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(coordinator.held(), 2);

        let err = coordinator
            .acquire(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CoordinatorExhausted { available: 0, capacity: 2, .. }
        ));

        drop(a);
        let _c = coordinator.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(coordinator.held(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_growth_admits_new_work_on_release() {
        let source = Arc::new(FixedCapacity(AtomicUsize::new(1)));
        let coordinator = BatchCoordinator::new(Arc::clone(&source) as Arc<dyn CapacitySource>);
        let cancel = CancellationToken::new();

        let _a = coordinator.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        source.0.store(3, Ordering::Release);

        // Growth is visible to the next admission attempt directly.
        let _b = coordinator.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        let _c = coordinator.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(coordinator.held(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shrink_stops_new_slots_but_keeps_held_ones() {
        let source = Arc::new(FixedCapacity(AtomicUsize::new(2)));
        let coordinator = BatchCoordinator::new(Arc::clone(&source) as Arc<dyn CapacitySource>);
        let cancel = CancellationToken::new();

        let a = coordinator.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        let _b = coordinator.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        source.0.store(1, Ordering::Release);
        let err = coordinator
            .acquire(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CoordinatorExhausted { .. }));

        // One release is not enough while held still equals capacity.
        drop(a);
        assert_eq!(coordinator.held(), 1);
        let err = coordinator
            .acquire(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CoordinatorExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_waiters() {
        let source = Arc::new(FixedCapacity(AtomicUsize::new(1)));
        let coordinator = BatchCoordinator::new(source);
        let cancel = CancellationToken::new();

        let _a = coordinator.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.acquire(Duration::from_secs(60), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
