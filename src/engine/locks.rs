use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::limits::LOCK_TABLE_PRUNE_THRESHOLD;
use crate::model::*;

use super::EngineError;

/// What a mutation serializes on. Variant order fixes the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Booking(BookingId),
    Room(Weekday, RoomId),
    Instructor(Weekday, InstructorId),
}

impl LockKey {
    /// The keys a booking occupies: its id plus its room and instructor for the day.
    pub fn for_booking(b: &Booking) -> [LockKey; 3] {
        [
            LockKey::Booking(b.id),
            LockKey::Room(b.weekday(), b.room_id),
            LockKey::Instructor(b.weekday(), b.instructor_id),
        ]
    }
}

/// Held locks. Dropping releases every key.
#[derive(Debug)]
pub struct LockSet {
    keys: Vec<LockKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockSet {
    pub fn covers(&self, key: &LockKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

/// Async mutex per resource key, created on first use.
#[derive(Default)]
pub struct ResourceLocks {
    slots: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire all `keys` in sorted order, giving up after `timeout`.
    /// Partially acquired guards are released on timeout.
    pub async fn acquire(
        &self,
        keys: impl IntoIterator<Item = LockKey>,
        timeout: Duration,
    ) -> Result<LockSet, EngineError> {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let started = Instant::now();
        let slots: Vec<Arc<Mutex<()>>> = keys.iter().map(|k| self.slot(*k)).collect();
        let lock_all = async move {
            let mut guards = Vec::with_capacity(slots.len());
            for slot in slots {
                guards.push(slot.lock_owned().await);
            }
            guards
        };
        let guards = tokio::time::timeout(timeout, lock_all).await.map_err(|_| {
            tracing::debug!("lock timeout after {timeout:?} on {keys:?}");
            EngineError::Busy
        })?;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());

        Ok(LockSet {
            keys,
            _guards: guards,
        })
    }

    fn slot(&self, key: LockKey) -> Arc<Mutex<()>> {
        self.slots.entry(key).or_default().value().clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop slots nobody holds or waits on.
    pub fn prune_idle(&self) {
        if self.slots.len() > LOCK_TABLE_PRUNE_THRESHOLD {
            self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
    }

    #[cfg(test)]
    pub fn prune_all_idle(&self) {
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
    }
}
