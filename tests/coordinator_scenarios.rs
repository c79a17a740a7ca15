//! Integration tests against `TEST_DATABASE_URL` covering the core
//! admission/cancellation/moderation scenarios: FIFO waitlist promotion,
//! concurrent admission under capacity pressure, idempotent re-admission,
//! upstream cancellation fallout, bans, and closed events.

use chrono::Utc;
use join_coordinator::config::DbConfig;
use join_coordinator::coordinator::JoinCoordinator;
use join_coordinator::db::{self, DbPool};
use join_coordinator::domain::{CAPACITY_CLOSED, CAPACITY_UNLIMITED};
use join_coordinator::error::JoinError;
use uuid::Uuid;

async fn setup_test_db() -> DbPool {
    let database_url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/join_coordinator_test".to_string());

    let config = DbConfig {
        database_url,
        ..Default::default()
    };

    db::init_db(&config)
        .await
        .expect("failed to initialize test database")
}

async fn cleanup_test_data(pool: &DbPool) {
    sqlx::query("TRUNCATE TABLE joins, event_capacity, event_bans, outbox, inbox, idempotency_keys CASCADE")
        .execute(pool)
        .await
        .expect("failed to truncate test tables");
}

async fn seed_event(pool: &DbPool, event_id: Uuid, capacity: i64) {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO event_capacity (event_id, capacity, active_count, waitlist_count, created_at, updated_at)
         VALUES ($1, $2, 0, 0, $3, $3)",
    )
    .bind(event_id)
    .bind(capacity)
    .bind(now)
    .execute(pool)
    .await
    .expect("failed to seed event");
}

/// S1: FIFO waitlist promotion on cancel.
#[tokio::test]
async fn cancel_promotes_waitlist_head_in_fifo_order() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let event_id = Uuid::new_v4();
    seed_event(&pool, event_id, 1).await;

    let coordinator = JoinCoordinator::new(pool.clone());

    let first = coordinator.admit(None, None, event_id, "user-a").await.unwrap();
    assert_eq!(first.join.status().as_str(), "active");

    let second = coordinator.admit(None, None, event_id, "user-b").await.unwrap();
    assert_eq!(second.join.status().as_str(), "waitlisted");

    let third = coordinator.admit(None, None, event_id, "user-c").await.unwrap();
    assert_eq!(third.join.status().as_str(), "waitlisted");

    let outcome = coordinator.cancel(None, None, event_id, "user-a").await.unwrap();
    let promoted = outcome.promoted.expect("expected a waitlist promotion");
    assert_eq!(promoted.user_id, "user-b", "earliest waitlisted user must be promoted first");
}

/// S2: no oversell under concurrent admits.
#[tokio::test]
async fn concurrent_admits_never_exceed_capacity() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let event_id = Uuid::new_v4();
    seed_event(&pool, event_id, 5).await;

    let coordinator = std::sync::Arc::new(JoinCoordinator::new(pool.clone()));
    let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(20));

    let mut handles = Vec::new();
    for i in 0..20 {
        let coordinator = coordinator.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            coordinator
                .admit(None, None, event_id, &format!("user-{i}"))
                .await
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles).await;
    let active = results
        .iter()
        .filter(|r| matches!(r, Ok(Ok(outcome)) if outcome.join.status().as_str() == "active"))
        .count();
    assert_eq!(active, 5, "active count must never exceed capacity");
}

/// Replaying an admit with the same idempotency key/user/event returns the
/// original join rather than erroring or creating a second row.
#[tokio::test]
async fn repeated_admit_with_same_idempotency_key_converges() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let event_id = Uuid::new_v4();
    seed_event(&pool, event_id, CAPACITY_UNLIMITED).await;

    let coordinator = JoinCoordinator::new(pool.clone());
    let key = "idem-key-1";

    let first = coordinator
        .admit(None, Some(key), event_id, "user-a")
        .await
        .unwrap();
    let second = coordinator
        .admit(None, Some(key), event_id, "user-a")
        .await;

    assert!(second.is_ok(), "replay with same key/user/event must not error");
    assert_eq!(second.unwrap().join.id, first.join.id);
}

/// S3: cancel then re-join reuses the same terminal row rather than
/// inserting a duplicate, with its lifecycle timestamps reset.
#[tokio::test]
async fn cancel_then_rejoin_reuses_same_row_with_reset_timestamps() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let event_id = Uuid::new_v4();
    seed_event(&pool, event_id, 1).await;

    let coordinator = JoinCoordinator::new(pool.clone());

    let first = coordinator.admit(None, None, event_id, "user-a").await.unwrap();
    assert_eq!(first.join.status().as_str(), "active");

    let canceled = coordinator.cancel(None, None, event_id, "user-a").await.unwrap();
    assert_eq!(canceled.join.status().as_str(), "canceled");

    let rejoined = coordinator.admit(None, None, event_id, "user-a").await.unwrap();
    assert_eq!(rejoined.join.status().as_str(), "active");

    assert_eq!(
        rejoined.join.id, first.join.id,
        "re-join after cancel must reuse the original row's id, not insert a new one"
    );
    assert!(
        rejoined.join.created_at >= first.join.created_at,
        "created_at must be refreshed on reuse"
    );
    assert!(rejoined.join.canceled_at.is_none(), "terminal fields must be cleared on reuse");
    assert!(rejoined.join.canceled_by.is_none());
}

/// S4: upstream event.canceled hard path expires all occupying joins.
#[tokio::test]
async fn upstream_cancel_expires_all_occupying_joins() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let event_id = Uuid::new_v4();
    seed_event(&pool, event_id, 1).await;

    let coordinator = JoinCoordinator::new(pool.clone());
    coordinator.admit(None, None, event_id, "user-a").await.unwrap();
    coordinator.admit(None, None, event_id, "user-b").await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let affected = JoinCoordinator::apply_event_canceled(&mut tx, event_id, "event_canceled", None)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(affected.len(), 2);
    assert!(affected.iter().all(|j| j.status().as_str() == "expired"));

    let stats = sqlx::query_as::<_, join_coordinator::domain::EventCapacity>(
        "SELECT event_id, capacity, active_count, waitlist_count, created_at, updated_at FROM event_capacity WHERE event_id = $1",
    )
    .bind(event_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(stats.capacity, CAPACITY_CLOSED);
    assert_eq!(stats.active_count, 0);
    assert_eq!(stats.waitlist_count, 0);
}

/// S5: a banned user cannot join, even with an otherwise-open slot.
#[tokio::test]
async fn banned_user_cannot_join() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let event_id = Uuid::new_v4();
    seed_event(&pool, event_id, 10).await;

    let coordinator = JoinCoordinator::new(pool.clone());
    coordinator
        .ban(
            None,
            event_id,
            "owner-1",
            "user-a",
            join_coordinator::coordinator::ModeratorRole::Owner,
            Some("spam"),
            None,
        )
        .await
        .unwrap();

    let result = coordinator.admit(None, None, event_id, "user-a").await;
    assert!(matches!(result, Err(JoinError::Banned { .. })));
}

/// S6: lifting a ban does not auto-rejoin the user, but a subsequent
/// admit call for them succeeds once the ban is gone.
#[tokio::test]
async fn unban_allows_subsequent_join() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let event_id = Uuid::new_v4();
    seed_event(&pool, event_id, 10).await;

    let coordinator = JoinCoordinator::new(pool.clone());
    coordinator
        .ban(
            None,
            event_id,
            "owner-1",
            "user-a",
            join_coordinator::coordinator::ModeratorRole::Owner,
            Some("spam"),
            None,
        )
        .await
        .unwrap();

    let blocked = coordinator.admit(None, None, event_id, "user-a").await;
    assert!(matches!(blocked, Err(JoinError::Banned { .. })));

    let removed = coordinator
        .unban(
            None,
            event_id,
            "owner-1",
            "user-a",
            join_coordinator::coordinator::ModeratorRole::Owner,
        )
        .await
        .unwrap();
    assert!(removed, "unban must report that a ban row was removed");

    let rejoined = coordinator.admit(None, None, event_id, "user-a").await;
    assert!(rejoined.is_ok(), "join must succeed once the ban is lifted");
    assert_eq!(rejoined.unwrap().join.status().as_str(), "active");
}

/// S6: closed events reject joins outright.
#[tokio::test]
async fn closed_event_rejects_joins() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let event_id = Uuid::new_v4();
    seed_event(&pool, event_id, CAPACITY_CLOSED).await;

    let coordinator = JoinCoordinator::new(pool.clone());
    let result = coordinator.admit(None, None, event_id, "user-a").await;
    assert!(matches!(result, Err(JoinError::EventClosed)));
}

#[tokio::test]
async fn unknown_event_is_rejected() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let coordinator = JoinCoordinator::new(pool.clone());
    let result = coordinator.admit(None, None, Uuid::new_v4(), "user-a").await;
    assert!(matches!(result, Err(JoinError::EventNotKnown { .. })));
}
