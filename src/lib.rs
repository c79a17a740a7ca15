pub mod auth;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod health;
pub mod housekeeping;
pub mod inbox_consumer;
pub mod metrics;
pub mod outbox_relay;
pub mod reads;
