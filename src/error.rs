//! Closed error set for the join coordinator.
//!
//! Coordinator and read-path functions return `JoinError` kinds only; the
//! HTTP boundary (`handlers.rs`) is the only place that knows about status
//! codes. Infrastructure failures (pool exhaustion, broker disconnects)
//! are represented by `Store`/`Broker` and mapped to 500 — they are the
//! only variants a caller should retry.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("event is at capacity")]
    EventFull,

    #[error("event is closed")]
    EventClosed,

    #[error("event {event_id} is not known to this service")]
    EventNotKnown { event_id: String },

    #[error("event {event_id} not found")]
    EventNotFound { event_id: String },

    #[error("user {user_id} already has a join for event {event_id}")]
    AlreadyJoined { event_id: String, user_id: String },

    #[error("user {user_id} has no join for event {event_id}")]
    NotJoined { event_id: String, user_id: String },

    #[error("user {user_id} is banned from event {event_id}")]
    Banned { event_id: String, user_id: String },

    #[error("actor {actor_id} is not authorized for this action")]
    Forbidden { actor_id: String },

    #[error("idempotency key {key} was previously used for a different request")]
    IdempotencyKeyMismatch { key: String },

    #[error("cache miss")]
    CacheMiss,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(String),
}

impl JoinError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EventFull => StatusCode::CONFLICT,
            Self::EventClosed => StatusCode::GONE,
            Self::AlreadyJoined { .. } => StatusCode::CONFLICT,
            Self::NotJoined { .. } => StatusCode::NOT_FOUND,
            Self::Banned { .. } => StatusCode::FORBIDDEN,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::EventNotKnown { .. } | Self::EventNotFound { .. } => StatusCode::NOT_FOUND,
            Self::IdempotencyKeyMismatch { .. } => StatusCode::CONFLICT,
            Self::CacheMiss => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(_) | Self::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_name(&self) -> &'static str {
        match self {
            Self::EventFull => "EventFull",
            Self::EventClosed => "EventClosed",
            Self::EventNotKnown { .. } => "EventNotKnown",
            Self::EventNotFound { .. } => "EventNotFound",
            Self::AlreadyJoined { .. } => "AlreadyJoined",
            Self::NotJoined { .. } => "NotJoined",
            Self::Banned { .. } => "Banned",
            Self::Forbidden { .. } => "Forbidden",
            Self::IdempotencyKeyMismatch { .. } => "IdempotencyKeyMismatch",
            Self::CacheMiss => "CacheMiss",
            Self::Store(_) => "InternalError",
            Self::Broker(_) => "InternalError",
        }
    }
}

impl IntoResponse for JoinError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_name = self.error_name();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, error_name, "join coordinator error");
        } else {
            tracing::debug!(error = %self, error_name, "join coordinator rejection");
        }
        (
            status,
            Json(json!({ "error": error_name, "message": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_expected_http_codes() {
        assert_eq!(JoinError::EventFull.status_code(), StatusCode::CONFLICT);
        assert_eq!(JoinError::EventClosed.status_code(), StatusCode::GONE);
        assert_eq!(
            JoinError::AlreadyJoined {
                event_id: "e".into(),
                user_id: "u".into()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            JoinError::NotJoined {
                event_id: "e".into(),
                user_id: "u".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            JoinError::Banned {
                event_id: "e".into(),
                user_id: "u".into()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            JoinError::Forbidden {
                actor_id: "a".into()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            JoinError::EventNotKnown {
                event_id: "e".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            JoinError::IdempotencyKeyMismatch { key: "k".into() }.status_code(),
            StatusCode::CONFLICT
        );
    }
}
