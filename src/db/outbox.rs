//! Transactional outbox primitives. `insert` is called from inside the
//! same transaction as the domain mutation that caused the event;
//! everything else belongs to the relay worker and runs in its own short
//! transactions with a claim-batch/backoff shape.

use chrono::Utc;
use rand::Rng;
use serde_json::Value as JsonValue;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::domain::OutboxRow;

/// Append one outbox row. `message_id` is the dedupe identity carried on
/// the wire envelope; `trace_id` is propagated for cross-service tracing.
pub async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    routing_key: &str,
    payload: JsonValue,
    trace_id: Option<&str>,
) -> Result<OutboxRow, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_as::<_, OutboxRow>(
        r#"
        INSERT INTO outbox (
            id, message_id, trace_id, routing_key, payload, occurred_at,
            status, attempt, next_retry_at, last_error
        )
        VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $6, NULL)
        RETURNING id, message_id, trace_id, routing_key, payload, occurred_at,
                  status, attempt, next_retry_at, last_error
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(Uuid::new_v4())
    .bind(trace_id)
    .bind(routing_key)
    .bind(payload)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Claim up to `batch_size` due rows for publish, reserving them by pushing
/// `next_retry_at` forward so a concurrent relay instance skips them.
/// Delivery is at-least-once: never concurrent-send the same row.
pub async fn claim_batch(
    tx: &mut Transaction<'_, Postgres>,
    batch_size: i64,
    reservation: chrono::Duration,
) -> Result<Vec<OutboxRow>, sqlx::Error> {
    let now = Utc::now();
    let rows = sqlx::query_as::<_, OutboxRow>(
        r#"
        SELECT id, message_id, trace_id, routing_key, payload, occurred_at,
               status, attempt, next_retry_at, last_error
        FROM outbox
        WHERE status = 'pending' AND next_retry_at <= $1
        ORDER BY next_retry_at ASC, occurred_at ASC
        FOR UPDATE SKIP LOCKED
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(batch_size)
    .fetch_all(&mut **tx)
    .await?;

    for row in &rows {
        sqlx::query("UPDATE outbox SET next_retry_at = $2 WHERE id = $1")
            .bind(row.id)
            .bind(now + reservation)
            .execute(&mut **tx)
            .await?;
    }

    Ok(rows)
}

pub async fn mark_sent(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE outbox SET status = 'sent', last_error = NULL WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Record a publish failure: bump `attempt`, compute the next backoff, and
/// dead-letter once `max_attempts` is exceeded.
pub async fn mark_failed(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    attempt: i32,
    max_attempts: i32,
    min_backoff: chrono::Duration,
    max_backoff: chrono::Duration,
    error: &str,
) -> Result<(), sqlx::Error> {
    let next_attempt = attempt + 1;
    if next_attempt >= max_attempts {
        sqlx::query("UPDATE outbox SET status = 'dead', attempt = $2, last_error = $3 WHERE id = $1")
            .bind(id)
            .bind(next_attempt)
            .bind(error)
            .execute(&mut **tx)
            .await?;
        return Ok(());
    }

    let delay = backoff_with_jitter(next_attempt, min_backoff, max_backoff);
    sqlx::query(
        "UPDATE outbox SET attempt = $2, next_retry_at = $3, last_error = $4 WHERE id = $1",
    )
    .bind(id)
    .bind(next_attempt)
    .bind(Utc::now() + delay)
    .bind(error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Exponential backoff with +/-20% jitter, clamped to `[min_backoff,
/// max_backoff]`.
fn backoff_with_jitter(
    attempt: i32,
    min_backoff: chrono::Duration,
    max_backoff: chrono::Duration,
) -> chrono::Duration {
    let base_secs = 2i64.saturating_pow(attempt.max(0) as u32);
    let clamped = base_secs
        .clamp(min_backoff.num_seconds().max(1), max_backoff.num_seconds().max(1));
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = (clamped as f64) * (1.0 + jitter_frac);
    chrono::Duration::seconds(jittered.round() as i64).max(min_backoff)
}

/// Operator hook: reset a dead-lettered row back to `pending` for one more
/// attempt. Automatic requeue is out of scope; this is the manual escape
/// hatch an operator reaches for after fixing whatever caused the
/// dead-letter.
pub async fn requeue_dead(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<OutboxRow>, sqlx::Error> {
    sqlx::query_as::<_, OutboxRow>(
        r#"
        UPDATE outbox
        SET status = 'pending', attempt = 0, next_retry_at = $2, last_error = NULL
        WHERE id = $1 AND status = 'dead'
        RETURNING id, message_id, trace_id, routing_key, payload, occurred_at,
                  status, attempt, next_retry_at, last_error
        "#,
    )
    .bind(id)
    .bind(Utc::now())
    .fetch_optional(&mut **tx)
    .await
}

pub async fn find(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<OutboxRow>, sqlx::Error> {
    sqlx::query_as::<_, OutboxRow>(
        r#"
        SELECT id, message_id, trace_id, routing_key, payload, occurred_at,
               status, attempt, next_retry_at, last_error
        FROM outbox
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_clamped_to_bounds() {
        let min = chrono::Duration::seconds(5);
        let max = chrono::Duration::seconds(1800);
        for attempt in 0..20 {
            let d = backoff_with_jitter(attempt, min, max);
            assert!(d >= min);
            assert!(d <= max + chrono::Duration::seconds((max.num_seconds() as f64 * 0.2) as i64));
        }
    }
}
