//! Reads: keyset-paginated queries over the join/waitlist timelines
//! plus a one-row stats read. Each list query follows the same
//! cursor-bound `SELECT ... WHERE (created_at, id) > (...) ORDER BY ...
//! LIMIT $n` shape, built around one opaque composite cursor type.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::db::DbPool;
use crate::domain::{EventCapacity, JoinRecord};
use crate::error::JoinError;

const MIN_LIMIT: i64 = 1;
const MAX_LIMIT: i64 = 100;
const DEFAULT_LIMIT: i64 = 20;

/// Opaque cursor over the `(created_at, id)` composite key.
/// Valid across in-place status mutations because the key is creation
/// time, never status time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.created_at.to_rfc3339(), self.id);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s)
            .ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let (created_at, id) = raw.split_once('|')?;
        Some(Self {
            created_at: DateTime::parse_from_rfc3339(created_at).ok()?.with_timezone(&Utc),
            id: Uuid::parse_str(id).ok()?,
        })
    }
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(MIN_LIMIT, MAX_LIMIT)
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
}

/// Fetch `limit + 1` rows and split the peek row into `next_cursor`,
/// shared by every list query below.
fn split_peek<T>(mut rows: Vec<T>, limit: i64, cursor_of: impl Fn(&T) -> Cursor) -> Page<T> {
    let next_cursor = if rows.len() as i64 > limit {
        rows.pop();
        rows.last().map(cursor_of)
    } else {
        None
    };
    Page {
        items: rows,
        next_cursor,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListMyJoinsFilter {
    pub statuses: Option<Vec<String>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// `ListMyJoins(user, statuses?, from?, to?, limit, cursor?)`: strict
/// descending `(created_at, id)` order.
pub async fn list_my_joins(
    pool: &DbPool,
    user_id: &str,
    filter: &ListMyJoinsFilter,
    limit: Option<i64>,
    cursor: Option<Cursor>,
) -> Result<Page<JoinRecord>, JoinError> {
    let limit = clamp_limit(limit);

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT id, event_id, user_id, status, created_at, updated_at, \
         activated_at, canceled_at, expired_at, rejected_at, \
         canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason \
         FROM joins WHERE user_id = ",
    );
    qb.push_bind(user_id);

    if let Some(c) = cursor {
        qb.push(" AND (created_at, id) < (")
            .push_bind(c.created_at)
            .push(", ")
            .push_bind(c.id)
            .push(")");
    }
    if let Some(statuses) = &filter.statuses {
        qb.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(from) = filter.from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND created_at <= ").push_bind(to);
    }

    qb.push(" ORDER BY created_at DESC, id DESC LIMIT ").push_bind(limit + 1);

    let rows = qb.build_query_as::<JoinRecord>().fetch_all(pool).await?;

    Ok(split_peek(rows, limit, |r| Cursor {
        created_at: r.created_at,
        id: r.id,
    }))
}

/// `ListParticipants(event, limit, cursor?)`: ascending `(created_at, id)`
/// over `status = 'active'` rows.
pub async fn list_participants(
    pool: &DbPool,
    event_id: Uuid,
    limit: Option<i64>,
    cursor: Option<Cursor>,
) -> Result<Page<JoinRecord>, JoinError> {
    list_by_status_ascending(pool, event_id, "active", limit, cursor).await
}

/// `ListWaitlist(event, limit, cursor?)`: same shape as participants, over
/// `status = 'waitlisted'`.
pub async fn list_waitlist(
    pool: &DbPool,
    event_id: Uuid,
    limit: Option<i64>,
    cursor: Option<Cursor>,
) -> Result<Page<JoinRecord>, JoinError> {
    list_by_status_ascending(pool, event_id, "waitlisted", limit, cursor).await
}

async fn list_by_status_ascending(
    pool: &DbPool,
    event_id: Uuid,
    status: &str,
    limit: Option<i64>,
    cursor: Option<Cursor>,
) -> Result<Page<JoinRecord>, JoinError> {
    let limit = clamp_limit(limit);

    let rows = if let Some(c) = cursor {
        sqlx::query_as::<_, JoinRecord>(
            r#"
            SELECT id, event_id, user_id, status, created_at, updated_at,
                   activated_at, canceled_at, expired_at, rejected_at,
                   canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
            FROM joins
            WHERE event_id = $1 AND status = $2 AND (created_at, id) > ($3, $4)
            ORDER BY created_at ASC, id ASC
            LIMIT $5
            "#,
        )
        .bind(event_id)
        .bind(status)
        .bind(c.created_at)
        .bind(c.id)
        .bind(limit + 1)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, JoinRecord>(
            r#"
            SELECT id, event_id, user_id, status, created_at, updated_at,
                   activated_at, canceled_at, expired_at, rejected_at,
                   canceled_by, canceled_reason, rejected_by, rejected_reason, expired_reason
            FROM joins
            WHERE event_id = $1 AND status = $2
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(event_id)
        .bind(status)
        .bind(limit + 1)
        .fetch_all(pool)
        .await?
    };

    Ok(split_peek(rows, limit, |r| Cursor {
        created_at: r.created_at,
        id: r.id,
    }))
}

/// `GetStats(event)`: one-row capacity snapshot read.
pub async fn get_stats(pool: &DbPool, event_id: Uuid) -> Result<EventCapacity, JoinError> {
    sqlx::query_as::<_, EventCapacity>(
        "SELECT event_id, capacity, active_count, waitlist_count, created_at, updated_at \
         FROM event_capacity WHERE event_id = $1",
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| JoinError::EventNotKnown {
        event_id: event_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor {
            created_at: Utc::now(),
            id: Uuid::new_v4(),
        };
        let encoded = cursor.encode();
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(decoded.id, cursor.id);
        assert_eq!(
            decoded.created_at.timestamp_micros(),
            cursor.created_at.timestamp_micros()
        );
    }

    #[test]
    fn limit_clamped_to_bounds() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), MIN_LIMIT);
        assert_eq!(clamp_limit(Some(1000)), MAX_LIMIT);
        assert_eq!(clamp_limit(Some(50)), 50);
    }
}
