//! Test helpers and fixtures for devicecast-core tests
//!
//! In-memory stand-ins for the external collaborators: a scriptable frame
//! source, a transport engine that records what the manager asks of it, and a
//! publisher that keeps every event.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::frame::{Frame, FrameSource, FrameSourceError, StreamMetadata, StreamStatus};
use crate::publisher::{PublishedEvent, Publisher};
use crate::track::{MediaTrackAdapter, VideoFrame};
use crate::transport::{
    CandidateBuffer, EncoderFactory, FrameEncoder, PeerTransport, TransportEngine,
};
use crate::types::{DeviceId, IceCandidate, IceServer, SessionDescription, StreamType};
use crate::{Error, Result};

/// Create a test ICE candidate
pub fn test_candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

type StreamKey = (DeviceId, StreamType);

#[derive(Default)]
struct FakeSourceState {
    devices: HashMap<DeviceId, StreamStatus>,
    frames: HashMap<StreamKey, Frame>,
    metadata: HashMap<StreamKey, std::result::Result<StreamMetadata, FrameSourceError>>,
    frame_delay: Option<Duration>,
}

/// Scriptable frame source
#[derive(Default)]
pub struct FakeFrameSource {
    state: Mutex<FakeSourceState>,
    status_calls: AtomicUsize,
}

impl FakeFrameSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `device` as streaming exactly `streams`
    pub fn set_streaming(&self, device: &str, streams: &[&str]) {
        let status = StreamStatus {
            is_streaming: true,
            active_streams: streams.iter().map(|s| StreamType::from(*s)).collect(),
        };
        self.state.lock().devices.insert(DeviceId::from(device), status);
    }

    /// Keep `device` known but not streaming
    pub fn stop_streaming(&self, device: &str) {
        self.state.lock().devices.insert(
            DeviceId::from(device),
            StreamStatus {
                is_streaming: false,
                active_streams: BTreeSet::new(),
            },
        );
    }

    pub fn set_frame(&self, device: &str, stream: &str, frame: Frame) {
        self.state
            .lock()
            .frames
            .insert((DeviceId::from(device), StreamType::from(stream)), frame);
    }

    /// Make every frame fetch block for `delay`
    pub fn set_frame_delay(&self, delay: Duration) {
        self.state.lock().frame_delay = Some(delay);
    }

    pub fn set_metadata(&self, device: &str, stream: &str, metadata: StreamMetadata) {
        self.state
            .lock()
            .metadata
            .insert((DeviceId::from(device), StreamType::from(stream)), Ok(metadata));
    }

    pub fn set_metadata_error(&self, device: &str, stream: &str, error: FrameSourceError) {
        self.state
            .lock()
            .metadata
            .insert((DeviceId::from(device), StreamType::from(stream)), Err(error));
    }

    #[must_use]
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::Relaxed)
    }

    fn check_active(
        &self,
        device_id: &DeviceId,
        stream_type: &StreamType,
    ) -> std::result::Result<(), FrameSourceError> {
        let state = self.state.lock();
        let status = state.devices.get(device_id).ok_or_else(|| {
            FrameSourceError::new(404, format!("Device {device_id} not found"))
        })?;
        if status.is_active(stream_type) {
            Ok(())
        } else {
            Err(FrameSourceError::new(
                400,
                format!("Stream {stream_type} not active for device {device_id}"),
            ))
        }
    }
}

impl FrameSource for FakeFrameSource {
    fn get_stream_status(
        &self,
        device_id: &DeviceId,
    ) -> std::result::Result<StreamStatus, FrameSourceError> {
        self.status_calls.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| FrameSourceError::new(404, format!("Device {device_id} not found")))
    }

    fn get_latest_frame(
        &self,
        device_id: &DeviceId,
        stream_type: &StreamType,
    ) -> std::result::Result<Frame, FrameSourceError> {
        let delay = self.state.lock().frame_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        self.check_active(device_id, stream_type)?;
        self.state
            .lock()
            .frames
            .get(&(device_id.clone(), stream_type.clone()))
            .cloned()
            .ok_or_else(|| FrameSourceError::new(503, "No frames available"))
    }

    fn get_latest_metadata(
        &self,
        device_id: &DeviceId,
        stream_type: &StreamType,
    ) -> std::result::Result<Option<StreamMetadata>, FrameSourceError> {
        self.check_active(device_id, stream_type)?;
        match self
            .state
            .lock()
            .metadata
            .get(&(device_id.clone(), stream_type.clone()))
        {
            Some(Ok(metadata)) => Ok(Some(metadata.clone())),
            Some(Err(e)) => Err(e.clone()),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
struct FakeEngineFlags {
    fail_offer: AtomicBool,
    fail_close: AtomicBool,
    fail_stats: AtomicBool,
    close_delay: Mutex<Duration>,
    answer_gate: Mutex<Option<Arc<Notify>>>,
}

/// Transport engine that records every connection it hands out
#[derive(Default)]
pub struct FakeTransportEngine {
    flags: Arc<FakeEngineFlags>,
    local_candidates: Mutex<Vec<IceCandidate>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates every new connection "gathers" immediately
    pub fn set_local_candidates(&self, candidates: Vec<IceCandidate>) {
        *self.local_candidates.lock() = candidates;
    }

    pub fn fail_offer(&self, fail: bool) {
        self.flags.fail_offer.store(fail, Ordering::Relaxed);
    }

    pub fn fail_close(&self, fail: bool) {
        self.flags.fail_close.store(fail, Ordering::Relaxed);
    }

    pub fn fail_stats(&self, fail: bool) {
        self.flags.fail_stats.store(fail, Ordering::Relaxed);
    }

    /// Make every `close` take `delay`
    pub fn set_close_delay(&self, delay: Duration) {
        *self.flags.close_delay.lock() = delay;
    }

    /// Park every `set_remote_description` until the returned gate is notified
    pub fn hold_answers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.flags.answer_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    #[must_use]
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.transports.lock().len()
    }
}

#[async_trait]
impl TransportEngine for FakeTransportEngine {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        candidates: Arc<CandidateBuffer>,
    ) -> Result<Arc<dyn PeerTransport>> {
        for candidate in self.local_candidates.lock().iter() {
            candidates.push(candidate.clone());
        }

        let transport = Arc::new(FakeTransport {
            flags: Arc::clone(&self.flags),
            ice_servers: ice_servers.to_vec(),
            tracks: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            answers_started: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Recording peer connection
pub struct FakeTransport {
    flags: Arc<FakeEngineFlags>,
    ice_servers: Vec<IceServer>,
    tracks: Mutex<Vec<Arc<MediaTrackAdapter>>>,
    remote: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    answers_started: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeTransport {
    #[must_use]
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.clone()
    }

    #[must_use]
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.lock().iter().map(|t| t.id().to_string()).collect()
    }

    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    #[must_use]
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    /// `set_remote_description` calls entered so far, parked ones included
    #[must_use]
    pub fn answers_started(&self) -> usize {
        self.answers_started.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: Arc<MediaTrackAdapter>) -> Result<()> {
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.flags.fail_offer.load(Ordering::Relaxed) {
            return Err(Error::Negotiation("Offer generation failed".to_string()));
        }

        let mut sdp = String::from("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        for (mid, track) in self.tracks.lock().iter().enumerate() {
            sdp.push_str(&format!(
                "m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{mid}\r\na=msid:{} {}\r\n",
                track.device_id(),
                track.stream_type()
            ));
        }
        Ok(SessionDescription::offer(sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.answers_started.fetch_add(1, Ordering::Relaxed);
        let gate = self.flags.answer_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if !description.sdp.starts_with("v=0") {
            return Err(Error::Negotiation(
                "Malformed session description".to_string(),
            ));
        }
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !candidate.candidate.is_empty() && !candidate.candidate.starts_with("candidate:") {
            return Err(Error::Negotiation(format!(
                "Unparseable ICE candidate: {}",
                candidate.candidate
            )));
        }
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<serde_json::Value> {
        if self.flags.fail_stats.load(Ordering::Relaxed) {
            return Err(Error::Internal("Stats unavailable".to_string()));
        }
        Ok(serde_json::json!({
            "tracks": self.tracks.lock().len(),
            "remote_candidates": self.remote_candidates.lock().len(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::Relaxed);
        let delay = *self.flags.close_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.flags.fail_close.load(Ordering::Relaxed) {
            return Err(Error::Internal("Transport already torn down".to_string()));
        }
        Ok(())
    }
}

/// Encoder factory that forwards raw frame bytes as the payload
pub struct PassthroughEncoderFactory;

struct PassthroughEncoder;

impl FrameEncoder for PassthroughEncoder {
    fn encode(&mut self, frame: &VideoFrame) -> Result<Bytes> {
        Ok(frame.frame.data.clone())
    }
}

impl EncoderFactory for PassthroughEncoderFactory {
    fn codec(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        }
    }

    fn create(&self, _track: &MediaTrackAdapter) -> Result<Box<dyn FrameEncoder>> {
        Ok(Box::new(PassthroughEncoder))
    }
}

/// Publisher that keeps every event in memory
pub struct RecordingPublisher {
    events: Mutex<Vec<PublishedEvent>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
    held: watch::Sender<bool>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            held: watch::channel(false).0,
        }
    }
}

impl RecordingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish while set
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Park publish calls until [`Self::release`]
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    /// Let parked and future publish calls through
    pub fn release(&self) {
        self.held.send_replace(false);
    }

    #[must_use]
    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Publish calls, including rejected ones
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Wait until at least `count` events were recorded
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.len() >= count
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::Internal("Publish channel closed".to_string()));
        }
        self.events.lock().push(PublishedEvent {
            event: event.to_string(),
            data: payload,
        });
        Ok(())
    }
}
