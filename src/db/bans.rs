//! Event-ban primitives.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::domain::EventBan;

pub async fn find_effective(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    user_id: &str,
) -> Result<Option<EventBan>, sqlx::Error> {
    let ban = sqlx::query_as::<_, EventBan>(
        r#"
        SELECT event_id, user_id, actor_id, reason, expires_at, created_at
        FROM event_bans
        WHERE event_id = $1 AND user_id = $2
        "#,
    )
    .bind(event_id)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(ban.filter(|b| b.is_effective(Utc::now())))
}

pub async fn upsert(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    user_id: &str,
    actor_id: &str,
    reason: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<EventBan, sqlx::Error> {
    sqlx::query_as::<_, EventBan>(
        r#"
        INSERT INTO event_bans (event_id, user_id, actor_id, reason, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (event_id, user_id) DO UPDATE SET
            actor_id = EXCLUDED.actor_id,
            reason = EXCLUDED.reason,
            expires_at = EXCLUDED.expires_at
        RETURNING event_id, user_id, actor_id, reason, expires_at, created_at
        "#,
    )
    .bind(event_id)
    .bind(user_id)
    .bind(actor_id)
    .bind(reason)
    .bind(expires_at)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await
}

pub async fn delete(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    user_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM event_bans WHERE event_id = $1 AND user_id = $2")
        .bind(event_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

    Ok(result.rows_affected() > 0)
}
