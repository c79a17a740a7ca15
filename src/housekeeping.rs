//! Housekeeping: idempotency-fence sweeper. Uses the same
//! `tokio::time::interval` background-task shape as the other workers,
//! adapted to run one sweep immediately at startup and to honor graceful
//! shutdown via `CancellationToken`.

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::HousekeepingConfig;
use crate::db::idempotency;
use crate::db::DbPool;

/// Run the idempotency sweep worker: one pass at startup, then every
/// `sweep_interval` until cancelled. Failures are logged; no retry loop
/// wraps a single sweep.
pub async fn run_idempotency_sweeper(
    pool: DbPool,
    config: HousekeepingConfig,
    cancel_token: CancellationToken,
) {
    info!(sweep_interval = ?config.sweep_interval, "starting idempotency sweeper");

    sweep_once(&pool).await;

    let mut ticker = interval(config.sweep_interval);
    ticker.tick().await; // first tick fires immediately; already swept above

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("idempotency sweeper shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                sweep_once(&pool).await;
            }
        }
    }

    info!("idempotency sweeper stopped");
}

async fn sweep_once(pool: &DbPool) {
    match idempotency::sweep_expired(pool).await {
        Ok(count) if count > 0 => {
            info!(deleted = count, "swept expired idempotency keys");
        }
        Ok(_) => {
            tracing::debug!("no expired idempotency keys to sweep");
        }
        Err(err) => {
            error!(?err, "idempotency sweep failed");
        }
    }
}

