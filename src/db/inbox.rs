//! Inbox dedupe fence ("ProcessOnce"): a unique `(message_id,
//! handler_name)` row gates at-most-once handling of an inbound broker
//! message per handler, independent of broker redelivery.

use chrono::Utc;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// Attempt to claim `(message_id, handler_name)`. Returns `true` if this
/// call won the race and the handler body should run; `false` if the
/// message was already processed by this handler.
pub async fn try_claim(
    tx: &mut Transaction<'_, Postgres>,
    message_id: Uuid,
    handler_name: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO inbox (message_id, handler_name, processed_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (message_id, handler_name) DO NOTHING
        "#,
    )
    .bind(message_id)
    .bind(handler_name)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}
