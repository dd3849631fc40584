//! Read-only hub introspection for operators.

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Serialize;
use uuid::Uuid;

use super::auth::AuthUser;
use crate::services::hub::HubStats;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct OnlineUsers {
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct OnlineStatus {
    pub user_id: Uuid,
    pub online: bool,
    pub connections: usize,
}

/// `GET /api/ws/stats` — connection, account and room counts.
pub async fn stats(State(state): State<AppState>, _auth: AuthUser) -> Json<HubStats> {
    Json(state.hub.stats().await)
}

/// `GET /api/ws/online` — every account with at least one live connection.
pub async fn online(State(state): State<AppState>, _auth: AuthUser) -> Json<OnlineUsers> {
    let user_ids = state.hub.online_accounts().await;
    Json(OnlineUsers { count: user_ids.len(), user_ids })
}

/// `GET /api/ws/online/{user_id}`
pub async fn online_status(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Json<OnlineStatus> {
    let connections = state.hub.account_connections(user_id).await;
    Json(OnlineStatus { user_id, online: connections > 0, connections })
}

#[derive(Debug, Serialize)]
pub struct RoomConnections {
    pub room_id: Uuid,
    pub connections: usize,
}

/// `GET /api/ws/rooms/{room_id}` — local connections joined to a room.
pub async fn room_connections(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(room_id): Path<Uuid>,
) -> Json<RoomConnections> {
    let connections = state.hub.room_size(room_id).await;
    Json(RoomConnections { room_id, connections })
}

#[cfg(test)]
#[path = "admin_test.rs"]
mod tests;
