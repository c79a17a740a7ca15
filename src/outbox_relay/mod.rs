//! Outbox relay: long-running worker that publishes pending outbox rows
//! to the broker with publisher confirms. Polling-loop shape and
//! graceful-shutdown handling follow the same cancellation-token-driven
//! `start`/`poll_and_publish` split used elsewhere in this codebase (see
//! DESIGN.md for the broker client's grounding).

use std::sync::Arc;
use std::time::Duration;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use rand::Rng;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{BrokerConfig, OutboxRelayConfig};
use crate::db::{outbox, DbPool};

pub struct OutboxRelay {
    pool: DbPool,
    channel: Channel,
    exchange: String,
    config: OutboxRelayConfig,
}

impl OutboxRelay {
    /// Dial the broker, open a channel, declare the topic exchange, and
    /// enable publisher confirms. Runs once at startup.
    pub async fn connect(
        pool: DbPool,
        broker: &BrokerConfig,
        config: OutboxRelayConfig,
    ) -> Result<Self, lapin::Error> {
        let connection =
            Connection::connect(&broker.amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &broker.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(Self {
            pool,
            channel,
            exchange: broker.exchange.clone(),
            config,
        })
    }

    /// Run until `cancel_token` fires, draining the current iteration
    /// before exiting.
    #[instrument(skip(self, cancel_token))]
    pub async fn start(&self, cancel_token: CancellationToken) {
        let initial_jitter = rand::thread_rng().gen_range(0..self.config.poll_interval.as_millis() as u64);
        time::sleep(Duration::from_millis(initial_jitter)).await;

        let mut interval = time::interval(self.config.poll_interval);
        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "starting outbox relay"
        );

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("outbox relay shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.poll_and_publish().await {
                        error!(?err, "outbox relay poll iteration failed");
                    }
                }
            }
        }

        info!("outbox relay stopped");
    }

    #[instrument(skip(self))]
    async fn poll_and_publish(&self) -> Result<(), anyhow::Error> {
        let reservation = chrono::Duration::from_std(self.config.reservation).unwrap_or(chrono::Duration::seconds(15));

        let mut tx = self.pool.begin().await?;
        let claimed = outbox::claim_batch(&mut tx, self.config.batch_size, reservation).await?;
        tx.commit().await?;

        if claimed.is_empty() {
            return Ok(());
        }

        debug!(count = claimed.len(), "claimed outbox rows for publish");

        for row in claimed {
            match self.publish_with_confirm(&row).await {
                Ok(()) => {
                    let mut tx = self.pool.begin().await?;
                    outbox::mark_sent(&mut tx, row.id).await?;
                    tx.commit().await?;
                    crate::metrics::record_outbox_published();
                }
                Err(reason) => {
                    warn!(outbox_id = %row.id, routing_key = %row.routing_key, %reason, "publish failed");
                    let mut tx = self.pool.begin().await?;
                    outbox::mark_failed(
                        &mut tx,
                        row.id,
                        row.attempt,
                        self.config.max_attempts,
                        chrono::Duration::from_std(self.config.min_backoff).unwrap_or(chrono::Duration::seconds(5)),
                        chrono::Duration::from_std(self.config.max_backoff).unwrap_or(chrono::Duration::seconds(1800)),
                        &reason,
                    )
                    .await?;
                    tx.commit().await?;
                    crate::metrics::record_outbox_publish_failed();
                }
            }
        }

        Ok(())
    }

    /// Publish one row with persistent delivery and mandatory routing;
    /// await the confirm/return within `confirm_timeout`.
    async fn publish_with_confirm(&self, row: &crate::domain::OutboxRow) -> Result<(), String> {
        let body = serde_json::to_vec(&row.payload).map_err(|e| e.to_string())?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_message_id(row.message_id.to_string().into());
        let properties = match &row.trace_id {
            Some(trace_id) => properties.with_correlation_id(trace_id.clone().into()),
            None => properties,
        };

        let publish = self.channel.basic_publish(
            &self.exchange,
            &row.routing_key,
            BasicPublishOptions {
                mandatory: true,
                ..Default::default()
            },
            &body,
            properties,
        );

        let confirm_wait = time::timeout(self.config.confirm_timeout, publish)
            .await
            .map_err(|_| "confirm/return timeout".to_string())?
            .map_err(|e| e.to_string())?;

        let confirmation = time::timeout(self.config.confirm_timeout, confirm_wait)
            .await
            .map_err(|_| "confirm/return timeout".to_string())?
            .map_err(|e| e.to_string())?;

        match confirmation {
            Confirmation::Ack(returned) => match returned {
                Some(_) => Err("message returned: no route".to_string()),
                None => Ok(()),
            },
            Confirmation::Nack(_) => Err("broker nacked publish".to_string()),
            Confirmation::NotRequested => Ok(()),
        }
    }
}

/// Spawn the relay as a background task, returning a handle the caller can
/// join on shutdown.
pub fn spawn(relay: Arc<OutboxRelay>, cancel_token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { relay.start(cancel_token).await })
}
