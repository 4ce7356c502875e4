//! HTTP API endpoints.
//!
//! Clients fetch race metadata here before opening the socket, so the first
//! render has names and challenge counts even before the first `race:state`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::state::AppState;
use crate::types::{RaceInfo, RaceStateSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceDetails {
    pub race: RaceInfo,
    /// Present only while a room is running for this race
    pub live: Option<RaceStateSnapshot>,
}

/// Race metadata plus the live snapshot, if any.
///
/// GET /api/races/{id}
///
/// Never creates a room.
pub async fn get_race(
    State(state): State<Arc<AppState>>,
    Path(race_id): Path<String>,
) -> Response {
    let race = match state.store.load_race(&race_id).await {
        Ok(Some(race)) => race,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, format!("Race {} not found", race_id)).into_response()
        }
        Err(e) => {
            tracing::error!(race_id = %race_id, "Failed to load race: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load race").into_response();
        }
    };

    let live = match state.registry.get(&race_id).await {
        Some(room) => room.snapshot().await.ok(),
        None => None,
    };

    Json(RaceDetails { race, live }).into_response()
}
