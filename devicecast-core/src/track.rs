//! Media track adapter
//!
//! Turns the transport's "give me the next frame" pulls into frame source
//! fetches. The adapter:
//! - converts pixel layout to what the encoder expects
//! - stamps every frame with a strictly increasing 90 kHz presentation timestamp
//! - never fails: a source failure or timeout yields a blank placeholder frame

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::TrackConfig;
use crate::frame::{Frame, FrameSource, FrameSourceError, PixelLayout};
use crate::types::{DeviceId, StreamType};

/// RTP video clock rate
pub const VIDEO_CLOCK_RATE: u64 = 90_000;

/// Frame handed to the transport
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub frame: Frame,
    /// Presentation timestamp in `VIDEO_CLOCK_RATE` units since the track started
    pub pts: u64,
    /// True when the frame is a synthesized stand-in for a failed fetch
    pub placeholder: bool,
}

impl VideoFrame {
    /// Presentation time as a wall-clock offset from the track start
    #[must_use]
    pub fn presentation_time(&self) -> Duration {
        Duration::from_micros(self.pts * 1_000_000 / VIDEO_CLOCK_RATE)
    }
}

/// Per-track monotonic clock anchored at construction
struct TrackClock {
    anchor: Instant,
    last_pts: Mutex<Option<u64>>,
}

impl TrackClock {
    fn new() -> Self {
        Self {
            anchor: Instant::now(),
            last_pts: Mutex::new(None),
        }
    }

    fn next_pts(&self) -> u64 {
        let elapsed = self.anchor.elapsed();
        let ticks = (elapsed.as_micros() * u128::from(VIDEO_CLOCK_RATE) / 1_000_000) as u64;

        let mut last = self.last_pts.lock();
        let pts = match *last {
            Some(prev) if ticks <= prev => prev + 1,
            _ => ticks,
        };
        *last = Some(pts);
        pts
    }
}

/// Track statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStats {
    pub track_id: String,
    pub stream_type: StreamType,
    pub frames_delivered: u64,
    pub placeholder_frames: u64,
    pub degraded: bool,
}

/// Pull source for one (device, stream) pair
pub struct MediaTrackAdapter {
    id: String,
    device_id: DeviceId,
    stream_type: StreamType,
    source: Arc<dyn FrameSource>,
    required_layout: PixelLayout,
    fallback_width: u32,
    fallback_height: u32,
    pull_timeout: Duration,
    clock: TrackClock,
    /// Set while a blocking fetch is outstanding, so a wedged source cannot
    /// pile up blocking tasks
    in_flight: Arc<AtomicBool>,
    degraded: AtomicBool,
    frames_delivered: AtomicU64,
    placeholder_frames: AtomicU64,
}

impl MediaTrackAdapter {
    pub fn new(
        source: Arc<dyn FrameSource>,
        device_id: DeviceId,
        stream_type: StreamType,
        config: &TrackConfig,
    ) -> Self {
        let id = format!("{device_id}-{stream_type}");
        Self {
            id,
            device_id,
            stream_type,
            source,
            required_layout: config.required_layout,
            fallback_width: config.fallback_width,
            fallback_height: config.fallback_height,
            pull_timeout: config.pull_timeout(),
            clock: TrackClock::new(),
            in_flight: Arc::new(AtomicBool::new(false)),
            degraded: AtomicBool::new(false),
            frames_delivered: AtomicU64::new(0),
            placeholder_frames: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    #[must_use]
    pub const fn stream_type(&self) -> &StreamType {
        &self.stream_type
    }

    #[must_use]
    pub const fn required_layout(&self) -> PixelLayout {
        self.required_layout
    }

    /// Produce the next frame. Never fails.
    pub async fn recv(&self) -> VideoFrame {
        let (frame, placeholder) = match self.fetch().await {
            Ok(frame) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!(track_id = %self.id, "Frame source recovered");
                }
                (frame, false)
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(
                        track_id = %self.id,
                        status_code = e.status_code,
                        error = %e.detail,
                        "Frame fetch failed, sending placeholder frames"
                    );
                }
                self.placeholder_frames.fetch_add(1, Ordering::Relaxed);
                (self.placeholder(), true)
            }
        };

        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
        VideoFrame {
            frame,
            pts: self.clock.next_pts(),
            placeholder,
        }
    }

    async fn fetch(&self) -> Result<Frame, FrameSourceError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(FrameSourceError::new(503, "Previous frame fetch still pending"));
        }

        let source = Arc::clone(&self.source);
        let device_id = self.device_id.clone();
        let stream_type = self.stream_type.clone();
        let layout = self.required_layout;
        let in_flight = Arc::clone(&self.in_flight);

        let task = tokio::task::spawn_blocking(move || {
            let result = source
                .get_latest_frame(&device_id, &stream_type)
                .and_then(|frame| frame.into_layout(layout));
            in_flight.store(false, Ordering::Release);
            result
        });

        match tokio::time::timeout(self.pull_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.in_flight.store(false, Ordering::Release);
                Err(FrameSourceError::new(500, format!("Frame fetch task failed: {e}")))
            }
            // The blocking task keeps running and clears `in_flight` when it returns
            Err(_) => Err(FrameSourceError::new(
                504,
                format!("Frame fetch exceeded {:?}", self.pull_timeout),
            )),
        }
    }

    fn placeholder(&self) -> Frame {
        Frame::blank(self.fallback_width, self.fallback_height, self.required_layout)
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_stats(&self) -> TrackStats {
        TrackStats {
            track_id: self.id.clone(),
            stream_type: self.stream_type.clone(),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            placeholder_frames: self.placeholder_frames.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
        }
    }
}
