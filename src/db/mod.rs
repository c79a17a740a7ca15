//! Relational store: pool setup plus one submodule per table family.
//! Every mutating helper takes an open `Transaction` — callers (the
//! coordinator, the inbox consumer) own transaction boundaries so that a
//! broker publish never happens while a DB transaction is open.

pub mod bans;
pub mod capacity;
pub mod idempotency;
pub mod inbox;
pub mod joins;
pub mod outbox;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DbConfig;

pub type DbPool = PgPool;

pub async fn init_db(config: &DbConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    Ok(pool)
}

pub async fn health_check(pool: &DbPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
