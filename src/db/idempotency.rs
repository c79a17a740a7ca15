//! Client-facing idempotency-key fence. Distinct from the
//! broker-side inbox fence in [`super::inbox`]: this one gates HTTP
//! writes keyed by a caller-supplied `Idempotency-Key` header, scoped to
//! `(user_id, event_id, action)` so the same key reused for a different
//! request is rejected rather than silently replayed.

use chrono::{Duration, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::domain::IdempotentAction;

/// Outcome of a `fence` call against an existing `(key, user_id)` row:
/// the event/action this key was first used for, and the join it
/// ultimately resolved to (set once the owning call reaches `attach_join`).
pub struct FenceRecord {
    pub event_id: Uuid,
    pub action: String,
    pub join_id: Option<Uuid>,
}

/// Default retention for an idempotency key.
pub const DEFAULT_TTL: Duration = Duration::hours(24);

/// Attempt to claim `(key, user_id)` for `event_id`/`action` by inserting
/// first, closing the race on the table's own unique constraint rather
/// than on a read-then-write gap. Returns `None` if this call's insert
/// won the race — it now owns the fence and must call `attach_join` once
/// it has a result. Returns `Some(record)` if the key was already
/// claimed; the caller compares `event_id`/`action` against its own
/// request and, on a match, treats `record.join_id` as the prior result
/// to replay (it is `None` only if the owning call is still in flight in
/// a concurrent transaction, which the caller should treat as a
/// mismatch-shaped retry situation rather than resolve itself).
pub async fn fence(
    tx: &mut Transaction<'_, Postgres>,
    key: &str,
    user_id: &str,
    event_id: Uuid,
    action: IdempotentAction,
) -> Result<Option<FenceRecord>, sqlx::Error> {
    let now = Utc::now();
    let inserted = sqlx::query_as::<_, (Uuid, String, Option<Uuid>)>(
        r#"
        INSERT INTO idempotency_keys (key, user_id, event_id, action, join_id, created_at, expires_at)
        VALUES ($1, $2, $3, $4, NULL, $5, $6)
        ON CONFLICT (key, user_id) DO NOTHING
        RETURNING event_id, action, join_id
        "#,
    )
    .bind(key)
    .bind(user_id)
    .bind(event_id)
    .bind(action.as_str())
    .bind(now)
    .bind(now + DEFAULT_TTL)
    .fetch_optional(&mut **tx)
    .await?;

    if inserted.is_some() {
        return Ok(None);
    }

    let existing = sqlx::query_as::<_, (Uuid, String, Option<Uuid>)>(
        r#"
        SELECT event_id, action, join_id
        FROM idempotency_keys
        WHERE key = $1 AND user_id = $2 AND expires_at > $3
        "#,
    )
    .bind(key)
    .bind(user_id)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(existing.map(|(event_id, action, join_id)| FenceRecord {
        event_id,
        action,
        join_id,
    }))
}

/// Attach the resulting join to a fence row this call just won. Called
/// once, right before commit, by whichever call's `fence` returned `None`.
pub async fn attach_join(
    tx: &mut Transaction<'_, Postgres>,
    key: &str,
    user_id: &str,
    join_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE idempotency_keys SET join_id = $1 WHERE key = $2 AND user_id = $3")
        .bind(join_id)
        .bind(key)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Sweep expired keys. Run on an hourly interval plus once at startup.
pub async fn sweep_expired(pool: &sqlx::PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
