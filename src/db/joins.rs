//! Join-record primitives. Lock ordering: callers must already
//! hold the capacity-row lock before calling [`lock`]/[`lock_waitlist_head`].

use chrono::Utc;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::domain::JoinRecord;

/// Lock the join row for `(event_id, user_id)`, if any.
pub async fn lock(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    user_id: &str,
) -> Result<Option<JoinRecord>, sqlx::Error> {
    sqlx::query_as::<_, JoinRecord>(
        r#"
        SELECT id, event_id, user_id, status, created_at, updated_at,
               activated_at, canceled_at, expired_at, rejected_at,
               canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
        FROM joins
        WHERE event_id = $1 AND user_id = $2
        FOR UPDATE
        "#,
    )
    .bind(event_id)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Fetch a join row by id without locking it, used to replay the result
/// of a prior idempotent call rather than recompute it.
pub async fn find_by_id(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<JoinRecord>, sqlx::Error> {
    sqlx::query_as::<_, JoinRecord>(
        r#"
        SELECT id, event_id, user_id, status, created_at, updated_at,
               activated_at, canceled_at, expired_at, rejected_at,
               canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
        FROM joins
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
}

/// Insert a fresh join row, or reuse an existing terminal row by resetting
/// its lifecycle metadata: a terminal row may be reused on re-join by
/// resetting timestamps and metadata rather than inserting a duplicate.
pub async fn insert_or_reuse(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    user_id: &str,
    status: &str,
) -> Result<JoinRecord, sqlx::Error> {
    let now = Utc::now();
    let activated_at = if status == "active" { Some(now) } else { None };

    sqlx::query_as::<_, JoinRecord>(
        r#"
        INSERT INTO joins (
            id, event_id, user_id, status, created_at, updated_at, activated_at,
            canceled_at, expired_at, rejected_at,
            canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
        )
        VALUES ($1, $2, $3, $4, $5, $5, $6, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL)
        ON CONFLICT (event_id, user_id) DO UPDATE SET
            status = EXCLUDED.status,
            created_at = EXCLUDED.created_at,
            updated_at = EXCLUDED.updated_at,
            activated_at = EXCLUDED.activated_at,
            canceled_at = NULL,
            expired_at = NULL,
            rejected_at = NULL,
            canceled_by = NULL,
            canceled_reason = NULL,
            rejected_by = NULL,
            rejected_reason = NULL,
            expired_reason = NULL
        RETURNING id, event_id, user_id, status, created_at, updated_at,
                  activated_at, canceled_at, expired_at, rejected_at,
                  canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(event_id)
    .bind(user_id)
    .bind(status)
    .bind(now)
    .bind(activated_at)
    .fetch_one(&mut **tx)
    .await
}

/// Non-blocking (`SKIP LOCKED`) fetch of the FIFO waitlist head for an
/// event — used by cancel/kick promotion. Returns `None`
/// when there is no waitlisted row or the only candidates are contended.
pub async fn lock_waitlist_head(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
) -> Result<Option<JoinRecord>, sqlx::Error> {
    sqlx::query_as::<_, JoinRecord>(
        r#"
        SELECT id, event_id, user_id, status, created_at, updated_at,
               activated_at, canceled_at, expired_at, rejected_at,
               canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
        FROM joins
        WHERE event_id = $1 AND status = 'waitlisted'
        ORDER BY created_at ASC, id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        "#,
    )
    .bind(event_id)
    .fetch_optional(&mut **tx)
    .await
}

pub async fn mark_active(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<JoinRecord, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_as::<_, JoinRecord>(
        r#"
        UPDATE joins
        SET status = 'active', activated_at = $2, updated_at = $2
        WHERE id = $1
        RETURNING id, event_id, user_id, status, created_at, updated_at,
                  activated_at, canceled_at, expired_at, rejected_at,
                  canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
        "#,
    )
    .bind(id)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

pub async fn mark_canceled(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    canceled_by: &str,
    reason: Option<&str>,
) -> Result<JoinRecord, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_as::<_, JoinRecord>(
        r#"
        UPDATE joins
        SET status = 'canceled', canceled_at = $2, updated_at = $2,
            canceled_by = $3, canceled_reason = $4
        WHERE id = $1
        RETURNING id, event_id, user_id, status, created_at, updated_at,
                  activated_at, canceled_at, expired_at, rejected_at,
                  canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
        "#,
    )
    .bind(id)
    .bind(now)
    .bind(canceled_by)
    .bind(reason)
    .fetch_one(&mut **tx)
    .await
}

pub async fn mark_rejected(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    actor_id: &str,
    reason: Option<&str>,
) -> Result<JoinRecord, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_as::<_, JoinRecord>(
        r#"
        UPDATE joins
        SET status = 'rejected', rejected_at = $2, updated_at = $2,
            rejected_by = $3, rejected_reason = $4
        WHERE id = $1
        RETURNING id, event_id, user_id, status, created_at, updated_at,
                  activated_at, canceled_at, expired_at, rejected_at,
                  canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
        "#,
    )
    .bind(id)
    .bind(now)
    .bind(actor_id)
    .bind(reason)
    .fetch_one(&mut **tx)
    .await
}

/// Bulk-expire every occupying join row for `event_id` (upstream
/// `event.canceled` hard path). Returns the affected rows so the caller
/// can emit one `email.event_canceled` outbox row per user.
pub async fn bulk_expire(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    reason: &str,
) -> Result<Vec<JoinRecord>, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_as::<_, JoinRecord>(
        r#"
        UPDATE joins
        SET status = 'expired', expired_at = $2, updated_at = $2, expired_reason = $3
        WHERE event_id = $1 AND status IN ('active', 'waitlisted')
        RETURNING id, event_id, user_id, status, created_at, updated_at,
                  activated_at, canceled_at, expired_at, rejected_at,
                  canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
        "#,
    )
    .bind(event_id)
    .bind(now)
    .bind(reason)
    .fetch_all(&mut **tx)
    .await
}
