//! Inbox consumer: subscribes to upstream event snapshots and applies
//! them through the `ProcessOnce` dedupe fence. Worker shape (prefetch,
//! manual ack, consume loop) follows the same background-task pattern
//! used elsewhere, generalized from a timer to a broker stream.

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::coordinator::{self, JoinCoordinator};
use crate::db::capacity;
use crate::db::DbPool;

const HANDLER_NAME: &str = "event_snapshots";
const SUPPORTED_ENVELOPE_VERSION: i32 = 1;

/// Outer broker envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    version: i32,
    #[allow(dead_code)]
    producer: String,
    trace_id: Option<String>,
    message_id: Option<Uuid>,
    #[allow(dead_code)]
    occurred_at: chrono::DateTime<chrono::Utc>,
    payload: JsonValue,
}

pub struct InboxConsumer {
    pool: DbPool,
    channel: Channel,
    exchange: String,
    routing_keys: Vec<String>,
    prefetch: u16,
}

impl InboxConsumer {
    pub async fn connect(
        pool: DbPool,
        broker: &crate::config::BrokerConfig,
    ) -> Result<Self, lapin::Error> {
        let connection =
            Connection::connect(&broker.amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .basic_qos(broker.prefetch, lapin::options::BasicQosOptions::default())
            .await?;

        let queue = channel
            .queue_declare(
                "join-coordinator.event-snapshots",
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for key in &broker.consumed_routing_keys {
            channel
                .queue_bind(
                    queue.name().as_str(),
                    &broker.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        Ok(Self {
            pool,
            channel,
            exchange: broker.exchange.clone(),
            routing_keys: broker.consumed_routing_keys.clone(),
            prefetch: broker.prefetch,
        })
    }

    #[instrument(skip(self, cancel_token), fields(exchange = %self.exchange, prefetch = self.prefetch))]
    pub async fn start(&self, cancel_token: CancellationToken) -> Result<(), lapin::Error> {
        let mut consumer = self
            .channel
            .basic_consume(
                "join-coordinator.event-snapshots",
                "join-coordinator",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(routing_keys = ?self.routing_keys, "inbox consumer subscribed");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("inbox consumer shutdown requested");
                    break;
                }
                next = consumer.next() => {
                    match next {
                        Some(Ok(delivery)) => self.handle_delivery(delivery).await,
                        Some(Err(err)) => error!(?err, "broker delivery error"),
                        None => {
                            warn!("inbox consumer stream ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key.to_string();

        let envelope: Envelope = match serde_json::from_slice(&delivery.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(?err, "dropping malformed envelope (poison message)");
                let _ = delivery.ack(BasicAckOptions::default()).await;
                return;
            }
        };

        if envelope.version != SUPPORTED_ENVELOPE_VERSION {
            debug!(version = envelope.version, "dropping unsupported envelope version");
            let _ = delivery.ack(BasicAckOptions::default()).await;
            return;
        }

        let message_id = effective_message_id(&envelope, &delivery, &routing_key);

        match coordinator::process_once(&self.pool, message_id, HANDLER_NAME, |tx| {
            apply_snapshot(tx, &routing_key, envelope.payload.clone(), envelope.trace_id.clone())
        })
        .await
        {
            Ok(Some(Ok(()))) => {
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            Ok(None) => {
                crate::metrics::record_inbox_duplicate();
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            Ok(Some(Err(validation_err))) => {
                // Validation failures are poison, not transient:
                // the inbox row already committed, so ack and drop.
                warn!(%validation_err, routing_key, "snapshot validation failed, dropping");
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            Err(err) => {
                error!(?err, routing_key, "infrastructure error applying snapshot, requeuing");
                let _ = delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await;
            }
        }
    }
}

/// Resolve the dedupe identity for a delivery: envelope field, then a
/// delivery header, then a content hash.
fn effective_message_id(envelope: &Envelope, delivery: &Delivery, routing_key: &str) -> Uuid {
    if let Some(id) = envelope.message_id {
        return id;
    }

    if let Some(header_id) = delivery
        .properties
        .message_id()
        .as_ref()
        .and_then(|id| Uuid::parse_str(id.as_str()).ok())
    {
        return header_id;
    }

    let mut hasher = Sha256::new();
    hasher.update(routing_key.as_bytes());
    hasher.update(&delivery.data);
    let digest = hasher.finalize();
    // Deterministic pseudo-UUID from the content hash, folded into a
    // UUIDv5-shaped value so the inbox table's `message_id` column stays
    // a single type regardless of which fallback produced it.
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("hash:{digest:x}").as_bytes())
}

/// Validation error surfaced from `fn`: commit-then-drop,
/// distinct from an infrastructure error which should nack-with-requeue.
#[derive(Debug, thiserror::Error)]
enum SnapshotError {
    #[error("missing or invalid event_id")]
    MissingEventId,
    #[error("missing or invalid capacity")]
    InvalidCapacity,
}

async fn apply_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    routing_key: &str,
    payload: JsonValue,
    trace_id: Option<String>,
) -> Result<Result<(), SnapshotError>, sqlx::Error> {
    match routing_key {
        "event.published" | "event.updated" => {
            let event_id = match payload.get("event_id").and_then(JsonValue::as_str).and_then(|s| Uuid::parse_str(s).ok()) {
                Some(id) => id,
                None => return Ok(Err(SnapshotError::MissingEventId)),
            };
            let capacity_value = match payload.get("capacity").and_then(JsonValue::as_i64) {
                Some(c) => c,
                None => return Ok(Err(SnapshotError::InvalidCapacity)),
            };

            capacity::upsert_snapshot(tx, event_id, capacity_value).await?;
            Ok(Ok(()))
        }
        "event.canceled" => {
            let event_id = payload
                .get("event_id")
                .or_else(|| payload.get("id"))
                .and_then(JsonValue::as_str)
                .and_then(|s| Uuid::parse_str(s).ok());

            let Some(event_id) = event_id else {
                return Ok(Err(SnapshotError::MissingEventId));
            };

            let reason = payload
                .get("reason")
                .and_then(JsonValue::as_str)
                .unwrap_or("event_canceled");

            JoinCoordinator::apply_event_canceled(tx, event_id, reason, trace_id.as_deref()).await?;
            Ok(Ok(()))
        }
        other => {
            debug!(routing_key = other, "unknown routing key, no mutation");
            Ok(Ok(()))
        }
    }
}
