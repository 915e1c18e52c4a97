//! Transport engine seam
//!
//! SDP generation, ICE connectivity and media encoding belong to the transport
//! engine. The session manager only talks to it through these traits, which
//! keeps the manager independent of the concrete WebRTC stack.

pub mod rtc;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::track::MediaTrackAdapter;
use crate::types::{IceCandidate, IceServer, SessionDescription};
use crate::Result;

pub use self::rtc::{EncoderFactory, FrameEncoder, WebRtcEngine};

/// Locally gathered ICE candidates waiting to be drained by the client
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    candidates: Mutex<Vec<IceCandidate>>,
}

impl CandidateBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, candidate: IceCandidate) {
        self.candidates.lock().push(candidate);
    }

    /// Take every buffered candidate, in gathering order
    pub fn drain(&self) -> Vec<IceCandidate> {
        std::mem::take(&mut *self.candidates.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.lock().is_empty()
    }
}

/// Factory for peer connections
#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Build a connection using `ice_servers`. Candidates the engine gathers
    /// locally are appended to `candidates`.
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        candidates: Arc<CandidateBuffer>,
    ) -> Result<Arc<dyn PeerTransport>>;
}

/// One externally owned peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach an outbound video track fed by `track`
    async fn add_track(&self, track: Arc<MediaTrackAdapter>) -> Result<()>;

    /// Generate and apply the local offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Transport statistics as a JSON document
    async fn stats(&self) -> Result<serde_json::Value>;

    /// Tear the connection down and stop every track pump
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_buffer_drains_in_order() {
        let buffer = CandidateBuffer::new();
        for i in 0..3 {
            buffer.push(IceCandidate {
                candidate: format!("candidate:{i}"),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            });
        }
        assert_eq!(buffer.len(), 3);

        let drained = buffer.drain();
        let order: Vec<_> = drained.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(order, vec!["candidate:0", "candidate:1", "candidate:2"]);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }
}
