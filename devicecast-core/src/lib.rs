//! `DeviceCast` streaming core
//!
//! Exposes a capture device's live frames over WebRTC and its per-stream
//! telemetry over a publish channel.
//!
//! ## Architecture
//!
//! - **`SessionManager`**: Owns every session and drives offer/answer/ICE negotiation
//! - **`MediaTrackAdapter`**: Per (device, stream) pull source with placeholder fallback
//! - **`MetadataBroadcaster`**: Background loop publishing metadata of one device
//! - **`FrameSource`**: Device driver boundary, implemented outside this crate
//! - **`TransportEngine`**: Peer connection boundary, with a webrtc-rs backend
//!
//! ## Usage
//!
//! ```rust,ignore
//! use devicecast_core::{Config, SessionManager, WebRtcEngine};
//!
//! let config = Config::load(Some("config.toml"))?;
//! let engine = Arc::new(WebRtcEngine::new(encoders, &config.track)?);
//! let manager = Arc::new(SessionManager::new(source, engine, &config.webrtc, config.track.clone()));
//!
//! let created = manager
//!     .create_offer(DeviceId::from("camA"), vec![StreamType::from("color")])
//!     .await?;
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod manager;
pub mod publisher;
pub mod session;
pub mod track;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use broadcast::{BroadcastState, MetadataBroadcaster, METADATA_EVENT};
pub use config::Config;
pub use error::{Error, Result};
pub use frame::{
    Frame, FrameSource, FrameSourceError, MotionData, PixelLayout, PointCloud, StreamMetadata,
    StreamStatus,
};
pub use manager::{CreatedOffer, SessionManager};
pub use publisher::{BroadcastPublisher, PublishedEvent, Publisher};
pub use session::{SessionSnapshot, SessionSummary};
pub use track::{MediaTrackAdapter, TrackStats, VideoFrame};
pub use transport::{
    CandidateBuffer, EncoderFactory, FrameEncoder, PeerTransport, TransportEngine, WebRtcEngine,
};
pub use types::{
    DeviceId, IceCandidate, IceServer, SdpType, SessionDescription, SessionId, StreamType,
};
