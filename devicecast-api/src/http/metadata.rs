//! Metadata broadcast control endpoints
//!
//! - `POST /api/metadata/broadcast/start` - Broadcast metadata of a device
//! - `POST /api/metadata/broadcast/stop` - Stop broadcasting
//! - `GET /api/metadata/broadcast/status` - Current broadcast state

use axum::{
    extract::{rejection::JsonRejection, State},
    response::Json,
};
use serde::{Deserialize, Serialize};

use crate::http::{AppResult, AppState};
use devicecast_core::{BroadcastState, DeviceId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBroadcastRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStatusResponse {
    pub success: bool,
    #[serde(flatten)]
    pub state: BroadcastState,
    /// Connected WebSocket subscribers
    pub subscribers: usize,
}

impl BroadcastStatusResponse {
    fn from_state(state: &AppState, success: bool) -> Self {
        Self {
            success,
            state: state.broadcaster.state(),
            subscribers: state.events.subscriber_count(),
        }
    }
}

/// Path: `POST /api/metadata/broadcast/start`
pub async fn start_broadcast(
    State(state): State<AppState>,
    payload: Result<Json<StartBroadcastRequest>, JsonRejection>,
) -> AppResult<Json<BroadcastStatusResponse>> {
    let Json(req) = payload?;
    state.broadcaster.start(DeviceId::from(req.device_id)).await;
    Ok(Json(BroadcastStatusResponse::from_state(&state, true)))
}

/// Path: `POST /api/metadata/broadcast/stop`
pub async fn stop_broadcast(State(state): State<AppState>) -> Json<BroadcastStatusResponse> {
    let stopped = state.broadcaster.stop().await;
    Json(BroadcastStatusResponse::from_state(&state, stopped))
}

/// Path: `GET /api/metadata/broadcast/status`
pub async fn broadcast_status(State(state): State<AppState>) -> Json<BroadcastStatusResponse> {
    Json(BroadcastStatusResponse::from_state(&state, true))
}
