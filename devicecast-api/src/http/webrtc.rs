//! WebRTC HTTP REST API endpoints
//!
//! - `POST /api/webrtc/offer` - Create a session and return its offer
//! - `POST /api/webrtc/answer` - Apply the client's answer
//! - `POST /api/webrtc/ice-candidates` - Apply a client ICE candidate
//! - `GET /api/webrtc/sessions` - List sessions
//! - `GET /api/webrtc/sessions/{session_id}` - Session status
//! - `GET /api/webrtc/sessions/{session_id}/ice-candidates` - Drain server candidates
//! - `DELETE /api/webrtc/sessions/{session_id}` - Close a session

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

use crate::http::{AppError, AppResult, AppState};
use devicecast_core::{
    DeviceId, IceCandidate, SdpType, SessionDescription, SessionId, SessionSnapshot,
    SessionSummary, StreamType,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferRequest {
    pub device_id: String,
    pub stream_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferResponse {
    pub session_id: String,
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub session_id: String,
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateRequest {
    pub session_id: String,
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Create a streaming session
///
/// Path: `POST /api/webrtc/offer`
///
/// # Request
/// ```json
/// { "device_id": "844212070924", "stream_types": ["color", "depth"] }
/// ```
pub async fn create_offer(
    State(state): State<AppState>,
    payload: Result<Json<OfferRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(req) = payload?;
    let stream_types = req.stream_types.into_iter().map(StreamType::from).collect();

    let created = state
        .session_manager
        .create_offer(DeviceId::from(req.device_id), stream_types)
        .await?;

    Ok(Json(OfferResponse {
        session_id: created.session_id.to_string(),
        sdp: created.offer.sdp,
        sdp_type: created.offer.sdp_type.to_string(),
    }))
}

/// Unknown sessions are reported before a bad description type.
///
/// Path: `POST /api/webrtc/answer`
pub async fn process_answer(
    State(state): State<AppState>,
    payload: Result<Json<AnswerRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(req) = payload?;
    let session_id = SessionId::from(req.session_id);

    let sdp_type = match req.sdp_type.parse::<SdpType>() {
        Ok(sdp_type) => sdp_type,
        Err(e) => {
            if !state.session_manager.contains(&session_id).await {
                return Err(AppError::from(devicecast_core::Error::session_not_found(
                    &session_id,
                )));
            }
            return Err(e.into());
        }
    };

    let success = state
        .session_manager
        .process_answer(
            &session_id,
            SessionDescription {
                sdp_type,
                sdp: req.sdp,
            },
        )
        .await?;

    Ok(Json(SuccessResponse { success }))
}

/// Path: `POST /api/webrtc/ice-candidates`
pub async fn add_ice_candidate(
    State(state): State<AppState>,
    payload: Result<Json<IceCandidateRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(req) = payload?;
    let success = state
        .session_manager
        .add_ice_candidate(
            &SessionId::from(req.session_id),
            IceCandidate {
                candidate: req.candidate,
                sdp_mid: req.sdp_mid,
                sdp_mline_index: req.sdp_mline_index,
            },
        )
        .await?;

    Ok(Json(SuccessResponse { success }))
}

/// Path: `GET /api/webrtc/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.session_manager.list_sessions().await)
}

/// Path: `GET /api/webrtc/sessions/{session_id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<SessionSnapshot>> {
    let snapshot = state
        .session_manager
        .get_session(&SessionId::from(session_id))
        .await?;
    Ok(Json(snapshot))
}

/// Locally gathered candidates not yet handed to the client
///
/// Path: `GET /api/webrtc/sessions/{session_id}/ice-candidates`
pub async fn get_ice_candidates(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Vec<IceCandidate>>> {
    let candidates = state
        .session_manager
        .get_ice_candidates(&SessionId::from(session_id))
        .await?;
    Ok(Json(candidates))
}

/// Close a session. Unknown sessions report `success: false`.
///
/// Path: `DELETE /api/webrtc/sessions/{session_id}`
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<SuccessResponse> {
    let success = state
        .session_manager
        .close_session(&SessionId::from(session_id))
        .await;
    Json(SuccessResponse { success })
}
