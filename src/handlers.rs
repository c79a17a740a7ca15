//! Thin axum wiring over the coordinator/reads modules. These handlers
//! are minimal pass-throughs, not a full REST surface: one plain
//! `#[derive(Deserialize)]` body struct and one `#[derive(Serialize)]`
//! response struct per route.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::{JoinCoordinator, ModeratorRole};
use crate::error::JoinError;
use crate::reads::{self, Cursor, ListMyJoinsFilter};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: std::sync::Arc<JoinCoordinator>,
    pub pool: crate::db::DbPool,
}

fn trace_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Trace-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub join_id: Uuid,
    pub status: String,
    pub promoted_user_id: Option<String>,
}

pub async fn admit(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, JoinError> {
    let outcome = state
        .coordinator
        .admit(
            trace_id(&headers).as_deref(),
            idempotency_key(&headers).as_deref(),
            event_id,
            &body.user_id,
        )
        .await?;

    Ok(Json(JoinResponse {
        join_id: outcome.join.id,
        status: outcome.join.status().as_str().to_string(),
        promoted_user_id: outcome.promoted.map(|p| p.user_id),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<CancelRequest>,
) -> Result<Json<JoinResponse>, JoinError> {
    let outcome = state
        .coordinator
        .cancel(
            trace_id(&headers).as_deref(),
            idempotency_key(&headers).as_deref(),
            event_id,
            &body.user_id,
        )
        .await?;

    Ok(Json(JoinResponse {
        join_id: outcome.join.id,
        status: outcome.join.status().as_str().to_string(),
        promoted_user_id: outcome.promoted.map(|p| p.user_id),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListJoinsResponse {
    pub items: Vec<JoinView>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JoinView {
    pub join_id: Uuid,
    pub event_id: Uuid,
    pub user_id: String,
    pub status: String,
}

impl From<crate::domain::JoinRecord> for JoinView {
    fn from(r: crate::domain::JoinRecord) -> Self {
        Self {
            join_id: r.id,
            event_id: r.event_id,
            user_id: r.user_id.clone(),
            status: r.status().as_str().to_string(),
        }
    }
}

pub async fn list_my_joins(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListJoinsResponse>, JoinError> {
    let cursor = query.cursor.as_deref().and_then(Cursor::decode);
    let page = reads::list_my_joins(
        &state.pool,
        &user_id,
        &ListMyJoinsFilter::default(),
        query.limit,
        cursor,
    )
    .await?;

    Ok(Json(ListJoinsResponse {
        items: page.items.into_iter().map(JoinView::from).collect(),
        next_cursor: page.next_cursor.map(|c| c.encode()),
    }))
}

pub async fn list_participants(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListJoinsResponse>, JoinError> {
    let cursor = query.cursor.as_deref().and_then(Cursor::decode);
    let page = reads::list_participants(&state.pool, event_id, query.limit, cursor).await?;

    Ok(Json(ListJoinsResponse {
        items: page.items.into_iter().map(JoinView::from).collect(),
        next_cursor: page.next_cursor.map(|c| c.encode()),
    }))
}

pub async fn list_waitlist(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListJoinsResponse>, JoinError> {
    let cursor = query.cursor.as_deref().and_then(Cursor::decode);
    let page = reads::list_waitlist(&state.pool, event_id, query.limit, cursor).await?;

    Ok(Json(ListJoinsResponse {
        items: page.items.into_iter().map(JoinView::from).collect(),
        next_cursor: page.next_cursor.map(|c| c.encode()),
    }))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub event_id: Uuid,
    pub capacity: i64,
    pub active_count: i64,
    pub waitlist_count: i64,
}

pub async fn get_stats(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<StatsResponse>, JoinError> {
    let stats = reads::get_stats(&state.pool, event_id).await?;
    Ok(Json(StatsResponse {
        event_id: stats.event_id,
        capacity: stats.capacity,
        active_count: stats.active_count,
        waitlist_count: stats.waitlist_count,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ModerationRequest {
    pub actor_id: String,
    pub target_user_id: String,
    pub role: ModerationRole,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationRole {
    Admin,
    Moderator,
    Owner,
    Member,
}

impl From<ModerationRole> for ModeratorRole {
    fn from(r: ModerationRole) -> Self {
        match r {
            ModerationRole::Admin => ModeratorRole::Admin,
            ModerationRole::Moderator => ModeratorRole::Moderator,
            ModerationRole::Owner => ModeratorRole::Owner,
            ModerationRole::Member => ModeratorRole::Other,
        }
    }
}

pub async fn kick(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ModerationRequest>,
) -> Result<Json<JoinResponse>, JoinError> {
    let outcome = state
        .coordinator
        .kick(
            trace_id(&headers).as_deref(),
            event_id,
            &body.actor_id,
            &body.target_user_id,
            body.role.into(),
            body.reason.as_deref(),
        )
        .await?;

    Ok(Json(JoinResponse {
        join_id: outcome.join.id,
        status: outcome.join.status().as_str().to_string(),
        promoted_user_id: outcome.promoted.map(|p| p.user_id),
    }))
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub actor_id: String,
    pub target_user_id: String,
    pub role: ModerationRole,
    pub reason: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn ban(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<BanRequest>,
) -> Result<Json<Option<JoinResponse>>, JoinError> {
    let outcome = state
        .coordinator
        .ban(
            trace_id(&headers).as_deref(),
            event_id,
            &body.actor_id,
            &body.target_user_id,
            body.role.into(),
            body.reason.as_deref(),
            body.expires_at,
        )
        .await?;

    Ok(Json(outcome.map(|o| JoinResponse {
        join_id: o.join.id,
        status: o.join.status().as_str().to_string(),
        promoted_user_id: o.promoted.map(|p| p.user_id),
    })))
}

#[derive(Debug, Deserialize)]
pub struct UnbanRequest {
    pub actor_id: String,
    pub target_user_id: String,
    pub role: ModerationRole,
}

pub async fn unban(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<UnbanRequest>,
) -> Result<Json<bool>, JoinError> {
    let removed = state
        .coordinator
        .unban(
            trace_id(&headers).as_deref(),
            event_id,
            &body.actor_id,
            &body.target_user_id,
            body.role.into(),
        )
        .await?;

    Ok(Json(removed))
}
