pub mod conflict;
mod error;
mod journal;
mod locks;
mod mutations;
mod queries;
mod store;

pub use conflict::{check_create, check_update};
pub use error::EngineError;
pub use journal::JournaledStore;
pub use locks::{LockKey, LockSet, ResourceLocks};
pub use store::{BookingStore, InMemoryStore, StoreError};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::limits::MAX_BOOKINGS;
use crate::model::*;
use crate::notify::{Notification, NotifyHub};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Admission gate in front of a [`BookingStore`].
///
/// Every mutation runs parse → window check → resource locks → conflict check
/// → commit, and the commit itself runs detached while holding the locks so
/// that an abandoned request either leaves nothing behind or finishes whole.
pub struct Engine {
    store: Arc<dyn BookingStore>,
    locks: ResourceLocks,
    pub notify: Arc<NotifyHub>,
    lock_timeout: Duration,
    capacity: usize,
    /// Creates that passed the capacity check and have not finished committing.
    creates_in_flight: Arc<AtomicUsize>,
}

/// A reserved place under the bookings cap, released when the create's commit
/// finishes (by then the store count includes it, or the commit failed).
struct CreateSlot(Arc<AtomicUsize>);

impl Drop for CreateSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Engine {
    pub fn new(store: Arc<dyn BookingStore>, notify: Arc<NotifyHub>, lock_timeout: Duration) -> Self {
        Self {
            store,
            locks: ResourceLocks::new(),
            notify,
            lock_timeout,
            capacity: MAX_BOOKINGS,
            creates_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cap the number of stored bookings below the default limit.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Engine over a fresh in-memory store with default settings.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(NotifyHub::new()),
            DEFAULT_LOCK_TIMEOUT,
        )
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Receive notifications for `room_{id}` or `instructor_{id}` channels.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        self.notify.subscribe(channel)
    }

    /// Reserve room for one more booking. Counts in-flight creates as well as
    /// stored bookings, so concurrent creates on unrelated resources cannot
    /// overshoot the cap.
    async fn reserve_slot(&self) -> Result<CreateSlot, EngineError> {
        let in_flight = self.creates_in_flight.fetch_add(1, Ordering::SeqCst);
        let slot = CreateSlot(self.creates_in_flight.clone());
        if self.store.len().await? + in_flight >= self.capacity {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        Ok(slot)
    }

    /// Store write + notify, run on its own task so cancellation of the caller
    /// cannot split them. The lock set and any capacity slot are released only
    /// after both finish.
    async fn commit(
        &self,
        event: Event,
        locks: LockSet,
        slot: Option<CreateSlot>,
    ) -> Result<(), EngineError> {
        let store = self.store.clone();
        let notify = self.notify.clone();
        let task = tokio::spawn(async move {
            let _locks = locks;
            let _slot = slot;
            store.commit(&event).await?;
            notify.publish(&event);
            Ok::<(), StoreError>(())
        });
        let result = match task.await {
            Ok(result) => result.map_err(EngineError::from),
            Err(e) => Err(EngineError::StorageUnavailable(format!("commit task failed: {e}"))),
        };
        self.locks.prune_idle();
        result
    }
}
