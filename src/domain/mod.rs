//! Domain model: entities, statuses, and the waitlist-cap policy.
//!
//! Kept deliberately free of sqlx/axum so it can be unit-tested in
//! isolation, separating DB row shapes from API view conversions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Sentinel capacity value meaning "event canceled".
pub const CAPACITY_CLOSED: i64 = -1;
/// Sentinel capacity value meaning "unlimited".
pub const CAPACITY_UNLIMITED: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinStatus {
    Active,
    Waitlisted,
    Canceled,
    Expired,
    Rejected,
}

impl JoinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Waitlisted => "waitlisted",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Expired | Self::Rejected)
    }

    pub fn is_occupying(&self) -> bool {
        matches!(self, Self::Active | Self::Waitlisted)
    }
}

impl std::str::FromStr for JoinStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "waitlisted" => Ok(Self::Waitlisted),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown join status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotentAction {
    Join,
    Cancel,
}

impl IdempotentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Cancel => "cancel",
        }
    }
}

/// Per-event capacity snapshot: the sole synchronizing row for
/// admission decisions on a given event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventCapacity {
    pub event_id: Uuid,
    pub capacity: i64,
    pub active_count: i64,
    pub waitlist_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventCapacity {
    pub fn is_closed(&self) -> bool {
        self.capacity == CAPACITY_CLOSED
    }

    pub fn is_unlimited(&self) -> bool {
        self.capacity == CAPACITY_UNLIMITED
    }

    pub fn has_open_slot(&self) -> bool {
        !self.is_unlimited() && self.active_count < self.capacity
    }
}

/// One join record per `(event_id, user_id)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JoinRecord {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub canceled_by: Option<String>,
    pub canceled_reason: Option<String>,
    pub rejected_by: Option<String>,
    pub rejected_reason: Option<String>,
    pub expired_reason: Option<String>,
}

impl JoinRecord {
    pub fn status(&self) -> JoinStatus {
        self.status
            .parse()
            .expect("join status column holds a valid JoinStatus")
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventBan {
    pub event_id: Uuid,
    pub user_id: String,
    pub actor_id: String,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EventBan {
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => exp > now,
            None => true,
        }
    }
}

/// Append-only outbox row: one per committed domain event,
/// written in the same transaction as its cause.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: Uuid,
    pub message_id: Uuid,
    pub trace_id: Option<String>,
    pub routing_key: String,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
    pub status: String,
    pub attempt: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Waitlist cap policy: the only place that decides the
/// waitlist ceiling for a bounded event.
pub struct WaitlistPolicy;

impl WaitlistPolicy {
    pub fn max_for(capacity: i64) -> i64 {
        if capacity <= 0 {
            0
        } else {
            (capacity).clamp(20, 100)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waitlist_cap_zero_for_unbounded_or_closed() {
        assert_eq!(WaitlistPolicy::max_for(0), 0);
        assert_eq!(WaitlistPolicy::max_for(-1), 0);
    }

    #[test]
    fn waitlist_cap_clamped_between_20_and_100() {
        assert_eq!(WaitlistPolicy::max_for(1), 20);
        assert_eq!(WaitlistPolicy::max_for(10), 20);
        assert_eq!(WaitlistPolicy::max_for(20), 20);
        assert_eq!(WaitlistPolicy::max_for(50), 50);
        assert_eq!(WaitlistPolicy::max_for(100), 100);
        assert_eq!(WaitlistPolicy::max_for(500), 100);
    }

    #[test]
    fn join_status_round_trips_through_str() {
        for status in [
            JoinStatus::Active,
            JoinStatus::Waitlisted,
            JoinStatus::Canceled,
            JoinStatus::Expired,
            JoinStatus::Rejected,
        ] {
            let parsed: JoinStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn ban_effective_without_expiry() {
        let ban = EventBan {
            event_id: Uuid::nil(),
            user_id: "u".into(),
            actor_id: "a".into(),
            reason: None,
            expires_at: None,
            created_at: Utc::now(),
        };
        assert!(ban.is_effective(Utc::now()));
    }

    #[test]
    fn ban_not_effective_after_expiry() {
        let now = Utc::now();
        let ban = EventBan {
            event_id: Uuid::nil(),
            user_id: "u".into(),
            actor_id: "a".into(),
            reason: None,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            created_at: now,
        };
        assert!(!ban.is_effective(now));
    }
}
