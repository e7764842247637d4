// Single-slot snapshot cache. Readers clone an `Arc` out of the slot, the
// refresh cycle swaps a new one in; nobody ever sees a half-built batch.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};

use crate::models::VehicleRecord;

pub const FRESHNESS_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub batch: Vec<VehicleRecord>,
    pub fetched_at: DateTime<Utc>,
    pub freshness_window: TimeDelta,
}

impl Snapshot {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at < self.freshness_window
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.fetched_at
    }
}

#[derive(Debug)]
pub struct SnapshotCache {
    slot: RwLock<Option<Arc<Snapshot>>>,
    freshness_window: TimeDelta,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(TimeDelta::seconds(FRESHNESS_WINDOW_SECS))
    }
}

impl SnapshotCache {
    pub fn new(freshness_window: TimeDelta) -> Self {
        SnapshotCache {
            slot: RwLock::new(None),
            freshness_window,
        }
    }

    pub fn read(&self) -> Option<Arc<Snapshot>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.read().is_some_and(|snapshot| snapshot.is_fresh(now))
    }

    /// Publishes a new batch. Retrying with the same batch and timestamp
    /// keeps the existing snapshot.
    pub fn replace(&self, batch: Vec<VehicleRecord>, now: DateTime<Utc>) -> Arc<Snapshot> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = slot.as_ref() {
            if current.fetched_at == now && current.batch == batch {
                return Arc::clone(current);
            }
        }

        let snapshot = Arc::new(Snapshot {
            batch,
            fetched_at: now,
            freshness_window: self.freshness_window,
        });
        *slot = Some(Arc::clone(&snapshot));
        snapshot
    }
}
