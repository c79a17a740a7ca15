//! Health/readiness/liveness endpoints. Readiness depends on Postgres
//! *and* the AMQP channel the outbox relay publishes on.

use std::sync::Arc;
use std::time::SystemTime;

use axum::{extract::FromRef, extract::State, http::StatusCode, Json};
use lapin::Channel;
use serde::Serialize;
use sqlx::PgPool;

/// Composite state for the health/readiness router: `#[derive(Clone,
/// FromRef)]` over a pool plus one field per subsystem a probe needs to
/// reach.
#[derive(Clone, FromRef)]
pub struct HealthState {
    pub pool: PgPool,
    pub broker_channel: Arc<Channel>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    database: CheckStatus,
    broker: CheckStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    database: bool,
    broker: bool,
}

/// Liveness probe - the process is running.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

pub async fn readiness(
    State(pool): State<PgPool>,
    State(channel): State<Arc<Channel>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let db_ready = check_database(&pool).await;
    let broker_ready = channel.status().connected();

    let ready = db_ready && broker_ready;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            checks: ReadinessChecks {
                database: db_ready,
                broker: broker_ready,
            },
        }),
    )
}

pub async fn health(
    State(pool): State<PgPool>,
    State(channel): State<Arc<Channel>>,
) -> (StatusCode, Json<HealthResponse>) {
    let db_status = if check_database(&pool).await {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };
    let broker_status = if channel.status().connected() {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };

    let overall_healthy =
        matches!(db_status, CheckStatus::Healthy) && matches!(broker_status, CheckStatus::Healthy);
    let status = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    (
        status,
        Json(HealthResponse {
            status: if overall_healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                database: db_status,
                broker: broker_status,
            },
        }),
    )
}

async fn check_database(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}
