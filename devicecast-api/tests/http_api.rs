//! Router tests driven through `tower::ServiceExt::oneshot`

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use devicecast_api::{create_router, AppState};
use devicecast_core::config::{BroadcastConfig, TrackConfig, WebRtcConfig};
use devicecast_core::test_helpers::{test_candidate, FakeFrameSource, FakeTransportEngine};
use devicecast_core::{
    BroadcastPublisher, FrameSource, MetadataBroadcaster, SessionManager, TransportEngine,
};

struct TestApp {
    router: Router,
    engine: Arc<FakeTransportEngine>,
}

fn app() -> TestApp {
    let source = Arc::new(FakeFrameSource::new());
    source.set_streaming("camA", &["depth", "color"]);
    let engine = Arc::new(FakeTransportEngine::new());
    engine.set_local_candidates(vec![test_candidate(1)]);

    let events = BroadcastPublisher::new(16);
    let session_manager = Arc::new(SessionManager::new(
        Arc::clone(&source) as Arc<dyn FrameSource>,
        Arc::clone(&engine) as Arc<dyn TransportEngine>,
        &WebRtcConfig::default(),
        TrackConfig::default(),
    ));
    let broadcaster = Arc::new(MetadataBroadcaster::new(
        source,
        Arc::new(events.clone()),
        BroadcastConfig::default(),
    ));

    TestApp {
        router: create_router(AppState::new(session_manager, broadcaster, events)),
        engine,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_session(router: &Router) -> String {
    let (status, body) = send(
        router,
        "POST",
        "/api/webrtc/offer",
        Some(json!({"device_id": "camA", "stream_types": ["depth", "color"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_offer_answer_status_close_flow() {
    let app = app();

    let (status, offer) = send(
        &app.router,
        "POST",
        "/api/webrtc/offer",
        Some(json!({"device_id": "camA", "stream_types": ["depth", "color"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(offer["type"], "offer");
    assert!(offer["sdp"].as_str().unwrap().starts_with("v=0"));
    let session_id = offer["session_id"].as_str().unwrap().to_string();

    let uri = format!("/api/webrtc/sessions/{session_id}");
    let (status, session) = send(&app.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["connected"], false);
    assert_eq!(session["streaming"], true);
    assert_eq!(session["device_id"], "camA");
    assert_eq!(session["stream_types"], json!(["depth", "color"]));

    let (status, answered) = send(
        &app.router,
        "POST",
        "/api/webrtc/answer",
        Some(json!({"session_id": session_id, "sdp": "v=0\r\n", "type": "answer"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answered["success"], true);

    let (_, session) = send(&app.router, "GET", &uri, None).await;
    assert_eq!(session["connected"], true);

    let (status, closed) = send(&app.router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(closed["success"], true);

    let (status, error) = send(&app.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["status"], 404);

    let (status, closed_again) = send(&app.router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(closed_again["success"], false);
}

#[tokio::test]
async fn test_inactive_stream_is_bad_request() {
    let app = app();

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/webrtc/offer",
        Some(json!({"device_id": "camA", "stream_types": ["infrared-1"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("infrared-1"));
    assert_eq!(app.engine.connect_count(), 0);
}

#[tokio::test]
async fn test_unknown_device_maps_upstream_status() {
    let app = app();

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/webrtc/offer",
        Some(json!({"device_id": "camZ", "stream_types": ["depth"]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_answer_errors() {
    let app = app();
    let session_id = create_session(&app.router).await;

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/webrtc/answer",
        Some(json!({"session_id": "missing", "sdp": "v=0\r\n", "type": "answer"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/webrtc/answer",
        Some(json!({"session_id": "missing", "sdp": "v=0\r\n", "type": "bogus"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/webrtc/answer",
        Some(json!({"session_id": session_id, "sdp": "v=0\r\n", "type": "bogus"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/webrtc/answer",
        Some(json!({"session_id": session_id, "sdp": "garbage", "type": "answer"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Malformed"));
}

#[tokio::test]
async fn test_ice_candidate_round() {
    let app = app();
    let session_id = create_session(&app.router).await;

    let candidate = test_candidate(3);
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/webrtc/ice-candidates",
        Some(json!({
            "session_id": session_id,
            "candidate": candidate.candidate,
            "sdp_mid": "0",
            "sdp_mline_index": 0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(app.engine.transports()[0].remote_candidates(), vec![candidate]);

    let uri = format!("/api/webrtc/sessions/{session_id}/ice-candidates");
    let (status, local) = send(&app.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(local.as_array().unwrap().len(), 1);
    assert_eq!(local[0]["candidate"], test_candidate(1).candidate);

    let (_, drained) = send(&app.router, "GET", &uri, None).await;
    assert!(drained.as_array().unwrap().is_empty());

    let (status, _) = send(
        &app.router,
        "GET",
        "/api/webrtc/sessions/missing/ice-candidates",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_sessions() {
    let app = app();
    create_session(&app.router).await;
    create_session(&app.router).await;

    let (status, body) = send(&app.router, "GET", "/api/webrtc/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_broadcast_control() {
    let app = app();

    let (status, body) = send(&app.router, "GET", "/api/metadata/broadcast/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "idle");

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/metadata/broadcast/start",
        Some(json!({"device_id": "camA"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["state"], "broadcasting");
    assert_eq!(body["device_id"], "camA");

    let (_, body) = send(&app.router, "POST", "/api/metadata/broadcast/stop", None).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["state"], "stopped");

    let (_, body) = send(&app.router, "POST", "/api/metadata/broadcast/stop", None).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_malformed_json_uses_error_body() {
    let app = app();

    let request = Request::builder()
        .method("POST")
        .uri("/api/webrtc/offer")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], 400);
    assert!(body["error"].is_string());

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/webrtc/offer",
        Some(json!({"device_id": "camA"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], 422);
    assert_eq!(app.engine.connect_count(), 0);
}
