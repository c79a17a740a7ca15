//! Join coordinator: the transactional heart of the service. Every public
//! method opens one transaction, applies the admission/cancellation/
//! moderation algorithm, appends its outbox row(s), and commits — a broker
//! publish never happens inside this transaction, that's the relay's job
//! (`outbox_relay`).

use chrono::Utc;
use serde_json::json;
use sqlx::{Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::cache::CapacityCache;
use crate::db::{bans, capacity, idempotency, inbox, joins, outbox, DbPool};
use crate::domain::{IdempotentAction, JoinRecord, JoinStatus, WaitlistPolicy};
use crate::error::JoinError;

/// Authorization facts the coordinator needs for moderation calls. Role
/// enforcement itself lives above the coordinator, but the coordinator
/// still needs the owner/role decision to translate it into `Forbidden`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeratorRole {
    Owner,
    Admin,
    Moderator,
    Other,
}

impl ModeratorRole {
    fn is_authorized(self) -> bool {
        matches!(self, Self::Owner | Self::Admin | Self::Moderator)
    }
}

/// Outcome of a join/cancel/kick/ban call: the resulting join state plus
/// whether a waitlist promotion happened alongside it, so callers can log
/// or surface both without re-querying.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub join: JoinRecord,
    pub promoted: Option<JoinRecord>,
}

pub struct JoinCoordinator {
    pool: DbPool,
    cache: CapacityCache,
}

impl JoinCoordinator {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            cache: CapacityCache::new(),
        }
    }

    pub fn with_cache(pool: DbPool, cache: CapacityCache) -> Self {
        Self { pool, cache }
    }

    /// Admit a join request.
    #[instrument(skip(self), fields(%event_id, %user_id))]
    pub async fn admit(
        &self,
        trace_id: Option<&str>,
        idempotency_key: Option<&str>,
        event_id: Uuid,
        user_id: &str,
    ) -> Result<JoinOutcome, JoinError> {
        // Fast-fail sentinel: a miss is never authoritative, only a cached
        // `-1` (closed) short-circuits before the transaction opens at all.
        if let Some(crate::domain::CAPACITY_CLOSED) = self.cache.get(event_id).await {
            return Err(JoinError::EventClosed);
        }

        let mut tx = self.pool.begin().await?;

        if let Some(outcome) = self
            .begin_idempotent(&mut tx, idempotency_key, user_id, event_id, IdempotentAction::Join)
            .await?
        {
            tx.commit().await?;
            return Ok(outcome);
        }

        let cap = capacity::lock(&mut tx, event_id)
            .await?
            .ok_or_else(|| JoinError::EventNotKnown {
                event_id: event_id.to_string(),
            })?;
        if cap.is_closed() {
            self.cache.set_closed(event_id).await;
            return Err(JoinError::EventClosed);
        }

        if let Some(_ban) = bans::find_effective(&mut tx, event_id, user_id).await? {
            return Err(JoinError::Banned {
                event_id: event_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        if let Some(existing) = joins::lock(&mut tx, event_id, user_id).await? {
            if existing.status().is_occupying() {
                return Err(JoinError::AlreadyJoined {
                    event_id: event_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }
        }

        let new_status = if cap.is_unlimited() || cap.active_count < cap.capacity {
            JoinStatus::Active
        } else if cap.waitlist_count < WaitlistPolicy::max_for(cap.capacity) {
            JoinStatus::Waitlisted
        } else {
            return Err(JoinError::EventFull);
        };

        let join = joins::insert_or_reuse(&mut tx, event_id, user_id, new_status.as_str()).await?;

        match new_status {
            JoinStatus::Active => {
                capacity::adjust_counts(&mut tx, event_id, 1, 0).await?;
            }
            JoinStatus::Waitlisted => {
                capacity::adjust_counts(&mut tx, event_id, 0, 1).await?;
            }
            _ => unreachable!("new_status is always Active or Waitlisted here"),
        }

        outbox::insert(
            &mut tx,
            "join.created",
            json!({ "event_id": event_id, "user_id": user_id, "status": new_status.as_str() }),
            trace_id,
        )
        .await?;

        self.finish_idempotent(&mut tx, idempotency_key, user_id, join.id).await?;

        tx.commit().await?;
        match new_status {
            JoinStatus::Active => crate::metrics::record_admitted(),
            JoinStatus::Waitlisted => crate::metrics::record_waitlisted(),
            _ => {}
        }
        Ok(JoinOutcome {
            join,
            promoted: None,
        })
    }

    /// Cancel an existing join, promoting the waitlist head if a slot opens.
    #[instrument(skip(self), fields(%event_id, %user_id))]
    pub async fn cancel(
        &self,
        trace_id: Option<&str>,
        idempotency_key: Option<&str>,
        event_id: Uuid,
        user_id: &str,
    ) -> Result<JoinOutcome, JoinError> {
        let mut tx = self.pool.begin().await?;

        if let Some(outcome) = self
            .begin_idempotent(&mut tx, idempotency_key, user_id, event_id, IdempotentAction::Cancel)
            .await?
        {
            tx.commit().await?;
            return Ok(outcome);
        }

        let cap = capacity::lock(&mut tx, event_id)
            .await?
            .ok_or_else(|| JoinError::EventNotKnown {
                event_id: event_id.to_string(),
            })?;

        let existing = joins::lock(&mut tx, event_id, user_id)
            .await?
            .ok_or_else(|| JoinError::NotJoined {
                event_id: event_id.to_string(),
                user_id: user_id.to_string(),
            })?;

        if existing.status().is_terminal() {
            self.finish_idempotent(&mut tx, idempotency_key, user_id, existing.id).await?;
            tx.commit().await?;
            return Ok(JoinOutcome {
                join: existing,
                promoted: None,
            });
        }

        let prev_status = existing.status();
        let canceled = joins::mark_canceled(&mut tx, existing.id, user_id, None).await?;

        let promoted = self
            .release_slot_and_promote(&mut tx, event_id, &cap, prev_status)
            .await?;

        outbox::insert(
            &mut tx,
            "join.canceled",
            json!({ "event_id": event_id, "user_id": user_id, "status": "canceled" }),
            trace_id,
        )
        .await?;

        if let Some(promoted) = &promoted {
            outbox::insert(
                &mut tx,
                "join.promoted",
                json!({ "event_id": event_id, "user_id": promoted.user_id, "status": "active" }),
                trace_id,
            )
            .await?;
        }

        self.finish_idempotent(&mut tx, idempotency_key, user_id, canceled.id).await?;

        tx.commit().await?;
        crate::metrics::record_canceled();
        if promoted.is_some() {
            crate::metrics::record_promoted();
        }
        Ok(JoinOutcome {
            join: canceled,
            promoted,
        })
    }

    /// Kick a participant off an event.
    #[instrument(skip(self), fields(%event_id, %target_user_id, %actor_id))]
    pub async fn kick(
        &self,
        trace_id: Option<&str>,
        event_id: Uuid,
        actor_id: &str,
        target_user_id: &str,
        role: ModeratorRole,
        reason: Option<&str>,
    ) -> Result<JoinOutcome, JoinError> {
        if !role.is_authorized() {
            return Err(JoinError::Forbidden {
                actor_id: actor_id.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;

        let cap = capacity::lock(&mut tx, event_id)
            .await?
            .ok_or_else(|| JoinError::EventNotKnown {
                event_id: event_id.to_string(),
            })?;

        let target = joins::lock(&mut tx, event_id, target_user_id)
            .await?
            .ok_or_else(|| JoinError::NotJoined {
                event_id: event_id.to_string(),
                user_id: target_user_id.to_string(),
            })?;

        if target.status().is_terminal() {
            tx.commit().await?;
            return Ok(JoinOutcome {
                join: target,
                promoted: None,
            });
        }

        let prev_status = target.status();
        let rejected = joins::mark_rejected(&mut tx, target.id, actor_id, reason).await?;

        let promoted = self
            .release_slot_and_promote(&mut tx, event_id, &cap, prev_status)
            .await?;

        outbox::insert(
            &mut tx,
            "join.kicked",
            json!({ "event_id": event_id, "user_id": target_user_id, "actor_id": actor_id, "reason": reason }),
            trace_id,
        )
        .await?;

        if let Some(promoted) = &promoted {
            outbox::insert(
                &mut tx,
                "join.promoted",
                json!({ "event_id": event_id, "user_id": promoted.user_id, "status": "active" }),
                trace_id,
            )
            .await?;
        }

        tx.commit().await?;
        crate::metrics::record_kicked();
        if promoted.is_some() {
            crate::metrics::record_promoted();
        }
        Ok(JoinOutcome {
            join: rejected,
            promoted,
        })
    }

    /// Ban a user from an event, inlining kick-effect logic if they
    /// currently hold a slot.
    #[instrument(skip(self), fields(%event_id, %target_user_id, %actor_id))]
    pub async fn ban(
        &self,
        trace_id: Option<&str>,
        event_id: Uuid,
        actor_id: &str,
        target_user_id: &str,
        role: ModeratorRole,
        reason: Option<&str>,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<Option<JoinOutcome>, JoinError> {
        if !role.is_authorized() {
            return Err(JoinError::Forbidden {
                actor_id: actor_id.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;

        let cap = capacity::lock(&mut tx, event_id)
            .await?
            .ok_or_else(|| JoinError::EventNotKnown {
                event_id: event_id.to_string(),
            })?;

        bans::upsert(&mut tx, event_id, target_user_id, actor_id, reason, expires_at).await?;

        let outcome = if let Some(existing) = joins::lock(&mut tx, event_id, target_user_id).await?
        {
            if existing.status().is_occupying() {
                let prev_status = existing.status();
                let rejected = joins::mark_rejected(&mut tx, existing.id, actor_id, reason).await?;
                let promoted = self
                    .release_slot_and_promote(&mut tx, event_id, &cap, prev_status)
                    .await?;

                if let Some(promoted) = &promoted {
                    outbox::insert(
                        &mut tx,
                        "join.promoted",
                        json!({ "event_id": event_id, "user_id": promoted.user_id, "status": "active" }),
                        trace_id,
                    )
                    .await?;
                }

                Some(JoinOutcome {
                    join: rejected,
                    promoted,
                })
            } else {
                None
            }
        } else {
            None
        };

        outbox::insert(
            &mut tx,
            "join.banned",
            json!({ "event_id": event_id, "user_id": target_user_id, "actor_id": actor_id, "reason": reason }),
            trace_id,
        )
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    /// Lift a ban. Does not auto-rejoin the user.
    #[instrument(skip(self), fields(%event_id, %target_user_id))]
    pub async fn unban(
        &self,
        trace_id: Option<&str>,
        event_id: Uuid,
        actor_id: &str,
        target_user_id: &str,
        role: ModeratorRole,
    ) -> Result<bool, JoinError> {
        if !role.is_authorized() {
            return Err(JoinError::Forbidden {
                actor_id: actor_id.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;
        let removed = bans::delete(&mut tx, event_id, target_user_id).await?;

        if removed {
            outbox::insert(
                &mut tx,
                "join.unbanned",
                json!({ "event_id": event_id, "user_id": target_user_id, "actor_id": actor_id }),
                trace_id,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Upstream `event.canceled` hard path. Called by the
    /// inbox consumer within its own `ProcessOnce` transaction — takes the
    /// already-open transaction rather than owning its own, since it must
    /// run inside the inbox dedupe fence.
    pub async fn apply_event_canceled(
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        reason: &str,
        trace_id: Option<&str>,
    ) -> Result<Vec<JoinRecord>, sqlx::Error> {
        capacity::lock_or_create_closed(tx, event_id).await?;
        let affected = joins::bulk_expire(tx, event_id, reason).await?;
        capacity::close_and_zero(tx, event_id).await?;

        let occurred_at = Utc::now();
        for row in &affected {
            outbox::insert(
                tx,
                "email.event_canceled",
                json!({
                    "event_id": event_id,
                    "user_id": row.user_id,
                    "prev_status": row.status().as_str(),
                    "reason": reason,
                    "occurred_at": occurred_at,
                    "trace_id": trace_id,
                    "producer": "join-service",
                    "event_action": "canceled",
                }),
                trace_id,
            )
            .await?;
        }

        Ok(affected)
    }

    /// Shared cancel/kick/ban tail: if a slot actually opened (previous
    /// status was `active`, event is bounded, and the waitlist is
    /// non-empty), try a non-blocking promotion of the FIFO head. Never
    /// retried within this transaction if contended.
    async fn release_slot_and_promote(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        cap_before: &crate::domain::EventCapacity,
        prev_status: JoinStatus,
    ) -> Result<Option<JoinRecord>, sqlx::Error> {
        match prev_status {
            JoinStatus::Active => {
                if cap_before.capacity > 0 && cap_before.waitlist_count > 0 {
                    if let Some(head) = joins::lock_waitlist_head(tx, event_id).await? {
                        let promoted = joins::mark_active(tx, head.id).await?;
                        capacity::adjust_counts(tx, event_id, 0, -1).await?;
                        return Ok(Some(promoted));
                    }
                }
                Ok(None)
            }
            JoinStatus::Waitlisted => {
                capacity::adjust_counts(tx, event_id, -1, 0).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Claim the idempotency fence for `key`, if one was supplied. Closes
    /// the race on the table's unique constraint rather than on a
    /// read-then-write gap: the insert itself is the fence, attempted
    /// before any other work in the transaction. Returns `Some(outcome)`
    /// when `key` was already claimed for this exact `(event_id, action)`
    /// — the caller should commit and return it as-is rather than
    /// reprocess the request. Returns `None` when there is no key to
    /// fence on, or this call's insert won the race and now owns the
    /// fence (the caller must call `finish_idempotent` before committing).
    async fn begin_idempotent(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: Option<&str>,
        user_id: &str,
        event_id: Uuid,
        action: IdempotentAction,
    ) -> Result<Option<JoinOutcome>, JoinError> {
        let Some(key) = key else {
            return Ok(None);
        };

        let Some(existing) = idempotency::fence(tx, key, user_id, event_id, action).await? else {
            return Ok(None);
        };

        if existing.event_id != event_id || existing.action != action.as_str() {
            return Err(JoinError::IdempotencyKeyMismatch { key: key.to_string() });
        }

        let join_id = existing
            .join_id
            .ok_or_else(|| JoinError::IdempotencyKeyMismatch { key: key.to_string() })?;
        let join = joins::find_by_id(tx, join_id).await?.ok_or_else(|| JoinError::NotJoined {
            event_id: event_id.to_string(),
            user_id: user_id.to_string(),
        })?;

        Ok(Some(JoinOutcome {
            join,
            promoted: None,
        }))
    }

    /// Attach the resulting join to the fence row this call owns, a
    /// no-op when no key was supplied.
    async fn finish_idempotent(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: Option<&str>,
        user_id: &str,
        join_id: Uuid,
    ) -> Result<(), JoinError> {
        if let Some(key) = key {
            idempotency::attach_join(tx, key, user_id, join_id).await?;
        }
        Ok(())
    }
}

/// Entry point used by the inbox consumer for inbound broker dispatch
/// — kept here rather than in `inbox_consumer` since it shares
/// the coordinator's transaction-scoped primitives.
pub async fn process_once<F, Fut, T>(
    tx_pool: &DbPool,
    message_id: Uuid,
    handler_name: &str,
    f: F,
) -> Result<Option<T>, sqlx::Error>
where
    F: FnOnce(&mut Transaction<'_, Postgres>) -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut tx = tx_pool.begin().await?;
    if !inbox::try_claim(&mut tx, message_id, handler_name).await? {
        tx.commit().await?;
        return Ok(None);
    }
    let result = f(&mut tx).await?;
    tx.commit().await?;
    Ok(Some(result))
}
