// Module: http
// HTTP/JSON REST API and the metadata WebSocket

pub mod error;
pub mod metadata;
pub mod webrtc;
pub mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use devicecast_core::{BroadcastPublisher, MetadataBroadcaster, SessionManager};

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub broadcaster: Arc<MetadataBroadcaster>,
    /// Fan-out the broadcaster publishes into; WebSocket clients subscribe here
    pub events: BroadcastPublisher,
}

impl AppState {
    pub fn new(
        session_manager: Arc<SessionManager>,
        broadcaster: Arc<MetadataBroadcaster>,
        events: BroadcastPublisher,
    ) -> Self {
        Self {
            session_manager,
            broadcaster,
            events,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // WebRTC sessions
        .route("/api/webrtc/offer", post(webrtc::create_offer))
        .route("/api/webrtc/answer", post(webrtc::process_answer))
        .route("/api/webrtc/ice-candidates", post(webrtc::add_ice_candidate))
        .route("/api/webrtc/sessions", get(webrtc::list_sessions))
        .route(
            "/api/webrtc/sessions/{session_id}",
            get(webrtc::get_session).delete(webrtc::close_session),
        )
        .route(
            "/api/webrtc/sessions/{session_id}/ice-candidates",
            get(webrtc::get_ice_candidates),
        )
        // Metadata broadcast
        .route(
            "/api/metadata/broadcast/start",
            post(metadata::start_broadcast),
        )
        .route("/api/metadata/broadcast/stop", post(metadata::stop_broadcast))
        .route(
            "/api/metadata/broadcast/status",
            get(metadata::broadcast_status),
        )
        .route("/ws/metadata", get(websocket::metadata_socket))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        // Apply state to all routes (must be last)
        .with_state(state)
}
