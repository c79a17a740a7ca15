//! Capacity-row primitives. The capacity row is event-scoped lock #1 in
//! the fixed lock ordering: every mutation of joins/bans for a
//! given event starts by locking this row.

use chrono::Utc;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{EventCapacity, CAPACITY_CLOSED};

/// Lock the capacity row for `event_id`, if it exists. `None` means the
/// event is unknown to this service.
pub async fn lock(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
) -> Result<Option<EventCapacity>, sqlx::Error> {
    sqlx::query_as::<_, EventCapacity>(
        r#"
        SELECT event_id, capacity, active_count, waitlist_count, created_at, updated_at
        FROM event_capacity
        WHERE event_id = $1
        FOR UPDATE
        "#,
    )
    .bind(event_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Lock the capacity row, creating it closed (`capacity = -1`) if absent.
/// Used by the upstream `event.canceled` hard path, which
/// must be able to apply even if no `event.published` snapshot ever
/// arrived for this event.
pub async fn lock_or_create_closed(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
) -> Result<EventCapacity, sqlx::Error> {
    if let Some(row) = lock(tx, event_id).await? {
        return Ok(row);
    }

    let now = Utc::now();
    sqlx::query_as::<_, EventCapacity>(
        r#"
        INSERT INTO event_capacity (event_id, capacity, active_count, waitlist_count, created_at, updated_at)
        VALUES ($1, $2, 0, 0, $3, $3)
        ON CONFLICT (event_id) DO UPDATE SET updated_at = event_capacity.updated_at
        RETURNING event_id, capacity, active_count, waitlist_count, created_at, updated_at
        "#,
    )
    .bind(event_id)
    .bind(CAPACITY_CLOSED)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Upsert a capacity snapshot from an upstream `event.published`/
/// `event.updated` envelope. Leaves `active_count`/`waitlist_count`
/// untouched on conflict — those are owned by the coordinator, not the
/// upstream producer.
pub async fn upsert_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    capacity: i64,
) -> Result<EventCapacity, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_as::<_, EventCapacity>(
        r#"
        INSERT INTO event_capacity (event_id, capacity, active_count, waitlist_count, created_at, updated_at)
        VALUES ($1, $2, 0, 0, $3, $3)
        ON CONFLICT (event_id) DO UPDATE SET
            capacity = EXCLUDED.capacity,
            updated_at = EXCLUDED.updated_at
        RETURNING event_id, capacity, active_count, waitlist_count, created_at, updated_at
        "#,
    )
    .bind(event_id)
    .bind(capacity)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Apply a signed delta to `active_count`/`waitlist_count`. Callers must
/// already hold the row lock via [`lock`] within the same transaction.
pub async fn adjust_counts(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    active_delta: i64,
    waitlist_delta: i64,
) -> Result<EventCapacity, sqlx::Error> {
    sqlx::query_as::<_, EventCapacity>(
        r#"
        UPDATE event_capacity
        SET active_count = active_count + $2,
            waitlist_count = waitlist_count + $3,
            updated_at = $4
        WHERE event_id = $1
        RETURNING event_id, capacity, active_count, waitlist_count, created_at, updated_at
        "#,
    )
    .bind(event_id)
    .bind(active_delta)
    .bind(waitlist_delta)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await
}

/// Close the event (upstream `event.canceled`) and zero both counters.
pub async fn close_and_zero(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
) -> Result<EventCapacity, sqlx::Error> {
    sqlx::query_as::<_, EventCapacity>(
        r#"
        UPDATE event_capacity
        SET capacity = $2, active_count = 0, waitlist_count = 0, updated_at = $3
        WHERE event_id = $1
        RETURNING event_id, capacity, active_count, waitlist_count, created_at, updated_at
        "#,
    )
    .bind(event_id)
    .bind(CAPACITY_CLOSED)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await
}
