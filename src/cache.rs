//! Fast-fail capacity cache: a small TTL'd moka cache that short-circuits
//! obviously-closed events before touching the database. A miss is never
//! treated as authoritative — the coordinator still takes the
//! capacity-row lock for every admit/cancel; this cache only saves a
//! round trip on the common "event already closed" path.

use std::time::Duration;

use moka::future::Cache;
use uuid::Uuid;

use crate::domain::CAPACITY_CLOSED;

#[derive(Clone)]
pub struct CapacityCache {
    inner: Cache<Uuid, i64>,
}

impl CapacityCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(30))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(50_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Cached capacity for `event_id`, if present. `Some(-1)` means the
    /// cache believes the event is closed and callers may fail fast
    /// without a DB round trip; any other value (including a miss) still
    /// requires the authoritative row lock.
    pub async fn get(&self, event_id: Uuid) -> Option<i64> {
        self.inner.get(&event_id).await
    }

    pub async fn set_closed(&self, event_id: Uuid) {
        self.inner.insert(event_id, CAPACITY_CLOSED).await;
    }

    pub async fn set(&self, event_id: Uuid, capacity: i64) {
        self.inner.insert(event_id, capacity).await;
    }

    pub async fn invalidate(&self, event_id: Uuid) {
        self.inner.invalidate(&event_id).await;
    }
}

impl Default for CapacityCache {
    fn default() -> Self {
        Self::new()
    }
}
