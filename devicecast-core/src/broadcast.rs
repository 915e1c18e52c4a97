//! Metadata broadcast service
//!
//! Samples per-stream metadata of one target device at a fixed period and
//! publishes it as `metadata_update` events. Independent of WebRTC sessions.
//!
//! Only one loop runs at a time. Starting a new target stops the previous loop
//! first, and every publish happens under a shared gate after re-checking the
//! loop's cancellation, so ticks of two devices never interleave.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::BroadcastConfig;
use crate::frame::{FrameSource, StreamMetadata};
use crate::publisher::Publisher;
use crate::types::DeviceId;

/// Event name of metadata ticks
pub const METADATA_EVENT: &str = "metadata_update";

/// Broadcast service state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BroadcastState {
    Idle,
    Broadcasting { device_id: DeviceId },
    Stopped,
}

struct RunningLoop {
    device_id: DeviceId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything a loop needs, cloned into its task
#[derive(Clone)]
struct LoopContext {
    source: Arc<dyn FrameSource>,
    publisher: Arc<dyn Publisher>,
    publish_gate: Arc<Mutex<()>>,
    config: BroadcastConfig,
}

pub struct MetadataBroadcaster {
    ctx: LoopContext,
    /// Held across start/stop so control operations never overlap
    running: Mutex<Option<RunningLoop>>,
    state: parking_lot::Mutex<BroadcastState>,
}

impl MetadataBroadcaster {
    pub fn new(
        source: Arc<dyn FrameSource>,
        publisher: Arc<dyn Publisher>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            ctx: LoopContext {
                source,
                publisher,
                publish_gate: Arc::new(Mutex::new(())),
                config,
            },
            running: Mutex::new(None),
            state: parking_lot::Mutex::new(BroadcastState::Idle),
        }
    }

    #[must_use]
    pub fn state(&self) -> BroadcastState {
        self.state.lock().clone()
    }

    /// Start broadcasting `device_id`, replacing any running loop
    pub async fn start(&self, device_id: DeviceId) {
        let mut running = self.running.lock().await;

        if let Some(previous) = running.take() {
            info!(
                previous_device_id = %previous.device_id,
                device_id = %device_id,
                "Switching metadata broadcast target"
            );
            self.join(previous).await;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.ctx.clone(),
            device_id.clone(),
            cancel.clone(),
        ));

        *running = Some(RunningLoop {
            device_id: device_id.clone(),
            cancel,
            handle,
        });
        *self.state.lock() = BroadcastState::Broadcasting {
            device_id: device_id.clone(),
        };

        info!(
            device_id = %device_id,
            period_ms = self.ctx.config.period_ms,
            "Metadata broadcast started"
        );
    }

    /// Stop the running loop. Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return false;
        };

        let device_id = current.device_id.clone();
        self.join(current).await;
        *self.state.lock() = BroadcastState::Stopped;

        info!(device_id = %device_id, "Metadata broadcast stopped");
        true
    }

    /// Cancel a loop and wait a bounded time for it to exit
    async fn join(&self, running: RunningLoop) {
        running.cancel.cancel();

        let timeout = self.ctx.config.stop_timeout();
        match tokio::time::timeout(timeout, running.handle).await {
            Ok(Ok(())) => debug!(device_id = %running.device_id, "Broadcast loop exited"),
            Ok(Err(e)) => warn!(
                device_id = %running.device_id,
                error = %e,
                "Broadcast loop terminated abnormally"
            ),
            Err(_) => warn!(
                device_id = %running.device_id,
                timeout_ms = self.ctx.config.stop_timeout_ms,
                "Broadcast loop did not exit in time, proceeding"
            ),
        }
    }
}

async fn run_loop(ctx: LoopContext, device_id: DeviceId, cancel: CancellationToken) {
    let period = ctx.config.period();
    let mut ticks: u64 = 0;

    while !cancel.is_cancelled() {
        let started = Instant::now();

        let source = Arc::clone(&ctx.source);
        let device = device_id.clone();
        let sampled = tokio::select! {
            () = cancel.cancelled() => break,
            sampled = tokio::task::spawn_blocking(move || collect_metadata(source.as_ref(), &device)) => sampled,
        };

        let (is_streaming, streams) = match sampled {
            Ok(sampled) => sampled,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Metadata sampling task failed");
                (false, Map::new())
            }
        };
        let payload = json!({
            "device_id": device_id,
            "is_streaming": is_streaming,
            "timestamp_server": server_timestamp(),
            "metadata_streams": streams,
        });

        {
            let _gate = ctx.publish_gate.lock().await;
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = ctx.publisher.publish(METADATA_EVENT, payload).await {
                warn!(device_id = %device_id, error = %e, "Failed to publish metadata");
            }
        }
        ticks += 1;

        // Work that overran the period starts the next tick immediately
        let remaining = period.saturating_sub(started.elapsed());
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(remaining) => {}
        }
    }

    debug!(device_id = %device_id, ticks, "Broadcast loop finished");
}

fn server_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Status plus per-stream metadata of one device. Blocking.
///
/// A failing stream yields an error marker for that stream only. A device that
/// is not streaming, or whose status cannot be read, yields an empty map.
pub fn collect_metadata(source: &dyn FrameSource, device_id: &DeviceId) -> (bool, Map<String, Value>) {
    let status = match source.get_stream_status(device_id) {
        Ok(status) if status.is_streaming => status,
        Ok(_) => return (false, Map::new()),
        Err(e) => {
            trace!(device_id = %device_id, error = %e, "Stream status unavailable");
            return (false, Map::new());
        }
    };

    let mut streams = Map::new();
    for stream_type in &status.active_streams {
        let value = match source.get_latest_metadata(device_id, stream_type) {
            Ok(Some(metadata)) => metadata_to_json(&metadata),
            Ok(None) => Value::Null,
            Err(e) => json!({
                "error": e.detail,
                "status_code": e.status_code,
            }),
        };
        streams.insert(stream_type.to_string(), value);
    }

    (true, streams)
}

/// Text-safe JSON form of stream metadata
#[must_use]
pub fn metadata_to_json(metadata: &StreamMetadata) -> Value {
    let mut value = json!({
        "timestamp": metadata.timestamp,
        "frame_number": metadata.frame_number,
        "width": metadata.width,
        "height": metadata.height,
    });

    if let Some(motion) = &metadata.motion_data {
        value["motion_data"] = json!({ "x": motion.x, "y": motion.y, "z": motion.z });
    }
    if let Some(cloud) = &metadata.point_cloud {
        value["point_cloud"] = json!({
            "vertex_count": cloud.vertices.len(),
            "vertices": encode_f32_packed(&cloud.vertices),
            "texture_coordinates": encode_f32_packed(&cloud.texture_coordinates),
        });
    }

    value
}

/// Pack fixed-width f32 tuples little-endian and base64 encode them
#[must_use]
pub fn encode_f32_packed<const N: usize>(values: &[[f32; N]]) -> String {
    let mut buf = Vec::with_capacity(values.len() * N * 4);
    for value in values {
        for component in value {
            buf.extend_from_slice(&component.to_le_bytes());
        }
    }
    BASE64.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameSourceError, MotionData, PointCloud};
    use crate::test_helpers::{FakeFrameSource, RecordingPublisher};
    use std::time::Duration;

    fn metadata(frame_number: u64) -> StreamMetadata {
        StreamMetadata {
            timestamp: 1_700_000_000_000.0,
            frame_number,
            width: 640,
            height: 480,
            motion_data: None,
            point_cloud: None,
        }
    }

    fn broadcaster(
        source: Arc<FakeFrameSource>,
        publisher: Arc<RecordingPublisher>,
    ) -> MetadataBroadcaster {
        MetadataBroadcaster::new(
            source,
            publisher,
            BroadcastConfig {
                period_ms: 5,
                stop_timeout_ms: 500,
                channel_capacity: 16,
            },
        )
    }

    #[test]
    fn test_failing_stream_does_not_suppress_others() {
        let source = FakeFrameSource::new();
        source.set_streaming("camA", &["depth", "gyro", "color"]);
        source.set_metadata("camA", "depth", metadata(7));
        source.set_metadata_error("camA", "gyro", FrameSourceError::new(503, "IMU stalled"));

        let (is_streaming, streams) = collect_metadata(&source, &DeviceId::from("camA"));

        assert!(is_streaming);
        assert_eq!(streams.len(), 3);
        assert_eq!(streams["depth"]["frame_number"], 7);
        assert_eq!(streams["gyro"]["error"], "IMU stalled");
        assert_eq!(streams["gyro"]["status_code"], 503);
        assert!(streams["color"].is_null());
    }

    #[test]
    fn test_not_streaming_yields_empty_map() {
        let source = FakeFrameSource::new();
        let (is_streaming, streams) = collect_metadata(&source, &DeviceId::from("ghost"));
        assert!(!is_streaming);
        assert!(streams.is_empty());
    }

    #[test]
    fn test_point_cloud_encoded_as_base64() {
        let mut meta = metadata(1);
        meta.point_cloud = Some(PointCloud {
            vertices: vec![[1.0, 2.0, 3.0]],
            texture_coordinates: vec![],
        });
        meta.motion_data = Some(MotionData {
            x: 0.5,
            y: 0.0,
            z: -9.75,
        });

        let value = metadata_to_json(&meta);
        assert_eq!(value["motion_data"]["z"], -9.75);
        assert_eq!(value["point_cloud"]["vertex_count"], 1);
        assert_eq!(value["point_cloud"]["texture_coordinates"], "");

        let encoded = value["point_cloud"]["vertices"].as_str().unwrap();
        let raw = BASE64.decode(encoded).unwrap();
        assert_eq!(raw.len(), 12);
        assert_eq!(f32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]), 2.0);
    }

    #[tokio::test]
    async fn test_start_publishes_and_stop_halts() {
        let source = Arc::new(FakeFrameSource::new());
        source.set_streaming("camA", &["depth"]);
        source.set_metadata("camA", "depth", metadata(1));
        let publisher = Arc::new(RecordingPublisher::new());
        let broadcaster = broadcaster(source, Arc::clone(&publisher));

        assert_eq!(broadcaster.state(), BroadcastState::Idle);
        broadcaster.start(DeviceId::from("camA")).await;
        assert_eq!(
            broadcaster.state(),
            BroadcastState::Broadcasting {
                device_id: DeviceId::from("camA")
            }
        );

        assert!(publisher.wait_for(3, Duration::from_secs(2)).await);
        assert!(broadcaster.stop().await);
        assert_eq!(broadcaster.state(), BroadcastState::Stopped);

        let published = publisher.len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(publisher.len(), published);

        let event = &publisher.events()[0];
        assert_eq!(event.event, METADATA_EVENT);
        assert_eq!(event.data["device_id"], "camA");
        assert_eq!(event.data["is_streaming"], true);
        assert!(event.data["timestamp_server"].as_f64().unwrap() > 0.0);
        assert_eq!(event.data["metadata_streams"]["depth"]["width"], 640);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let broadcaster = broadcaster(
            Arc::new(FakeFrameSource::new()),
            Arc::new(RecordingPublisher::new()),
        );
        assert!(!broadcaster.stop().await);
        assert_eq!(broadcaster.state(), BroadcastState::Idle);

        broadcaster.start(DeviceId::from("camA")).await;
        assert!(broadcaster.stop().await);
        assert!(!broadcaster.stop().await);
        assert_eq!(broadcaster.state(), BroadcastState::Stopped);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_loop() {
        let source = Arc::new(FakeFrameSource::new());
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.set_failing(true);
        let broadcaster = broadcaster(source, Arc::clone(&publisher));

        broadcaster.start(DeviceId::from("camA")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(publisher.attempts() > 1);

        publisher.set_failing(false);
        assert!(publisher.wait_for(1, Duration::from_secs(2)).await);
        broadcaster.stop().await;
    }
}
