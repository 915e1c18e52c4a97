//! Session record and its read-only snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::track::{MediaTrackAdapter, TrackStats};
use crate::transport::{CandidateBuffer, PeerTransport};
use crate::types::{DeviceId, SessionId, StreamType};

/// One streaming session, owned by the session manager
pub(crate) struct SessionRecord {
    pub(crate) device_id: DeviceId,
    pub(crate) stream_types: Vec<StreamType>,
    pub(crate) connected: bool,
    /// Set once a close claimed the record; it is invisible to lookups from then on
    pub(crate) closing: bool,
    pub(crate) created_at: DateTime<Utc>,
    /// Monotonic creation time, used for TTL checks
    pub(crate) created: Instant,
    pub(crate) connection: Arc<dyn PeerTransport>,
    /// Serializes answer and candidate application for this session
    pub(crate) negotiation: Arc<tokio::sync::Mutex<()>>,
    pub(crate) candidates: Arc<CandidateBuffer>,
    pub(crate) tracks: Vec<Arc<MediaTrackAdapter>>,
}

impl SessionRecord {
    pub(crate) fn is_expired(&self, ttl: Duration) -> bool {
        self.created.elapsed() >= ttl
    }

    pub(crate) fn summary(&self, session_id: &SessionId) -> SessionSummary {
        SessionSummary {
            session_id: session_id.clone(),
            device_id: self.device_id.clone(),
            stream_types: self.stream_types.clone(),
            connected: self.connected,
            created_at: self.created_at,
        }
    }
}

/// Lightweight listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub stream_types: Vec<StreamType>,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time status of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub connected: bool,
    /// Whether the device still streams every requested stream
    pub streaming: bool,
    pub stream_types: Vec<StreamType>,
    pub created_at: DateTime<Utc>,
    /// Transport statistics; absent when the transport could not produce them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
    pub tracks: Vec<TrackStats>,
}
