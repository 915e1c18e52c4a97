//! Session manager - owns every streaming session
//!
//! This module provides:
//! - Offer creation validated against the device's stream status
//! - Answer and ICE candidate application, ordered per session
//! - Best-effort status snapshots
//! - Infallible close and TTL based reclamation
//!
//! Closing claims a record under the store lock, closes its connection with
//! the lock released, then removes the record. A slow transport teardown
//! never blocks other sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{TrackConfig, WebRtcConfig};
use crate::frame::{FrameSource, StreamStatus};
use crate::session::{SessionRecord, SessionSnapshot, SessionSummary};
use crate::track::MediaTrackAdapter;
use crate::transport::{CandidateBuffer, PeerTransport, TransportEngine};
use crate::types::{
    DeviceId, IceCandidate, IceServer, SdpType, SessionDescription, SessionId, StreamType,
};
use crate::{Error, Result};

/// Result of a successful offer creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedOffer {
    pub session_id: SessionId,
    pub offer: SessionDescription,
}

/// Session manager
pub struct SessionManager {
    source: Arc<dyn FrameSource>,
    engine: Arc<dyn TransportEngine>,
    /// Fixed at construction
    ice_servers: Arc<[IceServer]>,
    track_config: TrackConfig,
    session_ttl: Duration,
    sweep_interval: Option<Duration>,
    /// Single lock guarding every insert, mutation and removal
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl SessionManager {
    pub fn new(
        source: Arc<dyn FrameSource>,
        engine: Arc<dyn TransportEngine>,
        webrtc: &WebRtcConfig,
        track_config: TrackConfig,
    ) -> Self {
        info!(
            ice_servers = webrtc.ice_servers.len(),
            session_ttl_seconds = webrtc.session_ttl_seconds,
            sweep_interval_seconds = webrtc.sweep_interval_seconds,
            "Session manager initialized"
        );

        Self {
            source,
            engine,
            ice_servers: webrtc.ice_servers.clone().into(),
            track_config,
            session_ttl: webrtc.session_ttl(),
            sweep_interval: webrtc.sweep_interval(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    async fn stream_status(&self, device_id: &DeviceId) -> Result<StreamStatus> {
        let source = Arc::clone(&self.source);
        let device_id = device_id.clone();
        let status =
            tokio::task::spawn_blocking(move || source.get_stream_status(&device_id)).await??;
        Ok(status)
    }

    /// Create a session streaming `stream_types` of `device_id` and return its offer
    pub async fn create_offer(
        &self,
        device_id: DeviceId,
        stream_types: Vec<StreamType>,
    ) -> Result<CreatedOffer> {
        let mut requested: Vec<StreamType> = Vec::with_capacity(stream_types.len());
        for stream_type in stream_types {
            if !requested.contains(&stream_type) {
                requested.push(stream_type);
            }
        }
        if requested.is_empty() {
            return Err(Error::InvalidRequest(
                "At least one stream type is required".to_string(),
            ));
        }

        let status = self.stream_status(&device_id).await?;
        if !status.is_streaming {
            return Err(Error::InvalidRequest(format!(
                "Device {device_id} is not streaming"
            )));
        }
        if let Some(inactive) = requested.iter().find(|s| !status.is_active(s)) {
            return Err(Error::InvalidRequest(format!(
                "Stream type {inactive} is not active on device {device_id}"
            )));
        }

        let session_id = SessionId::generate();
        let candidates = Arc::new(CandidateBuffer::new());
        let connection = self
            .engine
            .connect(&self.ice_servers, Arc::clone(&candidates))
            .await?;

        let tracks: Vec<Arc<MediaTrackAdapter>> = requested
            .iter()
            .map(|stream_type| {
                Arc::new(MediaTrackAdapter::new(
                    Arc::clone(&self.source),
                    device_id.clone(),
                    stream_type.clone(),
                    &self.track_config,
                ))
            })
            .collect();

        let offer = match Self::negotiate_offer(connection.as_ref(), &tracks).await {
            Ok(offer) => offer,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Failed to close abandoned connection");
                }
                return Err(e);
            }
        };

        let record = SessionRecord {
            device_id: device_id.clone(),
            stream_types: requested,
            connected: false,
            closing: false,
            created_at: Utc::now(),
            created: Instant::now(),
            connection,
            negotiation: Arc::new(tokio::sync::Mutex::new(())),
            candidates,
            tracks,
        };

        let total = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.clone(), record);
            sessions.len()
        };

        info!(
            session_id = %session_id,
            device_id = %device_id,
            total_sessions = total,
            "Session created"
        );

        self.sweep_expired().await;

        Ok(CreatedOffer { session_id, offer })
    }

    async fn negotiate_offer(
        connection: &dyn PeerTransport,
        tracks: &[Arc<MediaTrackAdapter>],
    ) -> Result<SessionDescription> {
        for track in tracks {
            connection.add_track(Arc::clone(track)).await?;
        }
        connection.create_offer().await
    }

    /// Connection and negotiation lock of a session, cloned out of the map
    async fn negotiation_handles(
        &self,
        session_id: &SessionId,
    ) -> Result<(Arc<dyn PeerTransport>, Arc<tokio::sync::Mutex<()>>)> {
        let sessions = self.sessions.read().await;
        let record = live_record(&sessions, session_id)?;
        Ok((
            Arc::clone(&record.connection),
            Arc::clone(&record.negotiation),
        ))
    }

    /// Apply the remote answer
    pub async fn process_answer(
        &self,
        session_id: &SessionId,
        description: SessionDescription,
    ) -> Result<bool> {
        let (connection, negotiation) = self.negotiation_handles(session_id).await?;

        if !matches!(description.sdp_type, SdpType::Answer | SdpType::Pranswer) {
            return Err(Error::InvalidRequest(format!(
                "Expected an answer, got {}",
                description.sdp_type
            )));
        }
        let is_final = description.sdp_type == SdpType::Answer;

        let _guard = negotiation.lock().await;
        connection.set_remote_description(description).await?;

        let mut sessions = self.sessions.write().await;
        // Closed while the answer was being applied
        let record = sessions
            .get_mut(session_id)
            .filter(|record| !record.closing)
            .ok_or_else(|| Error::session_not_found(session_id))?;
        if is_final && !record.connected {
            record.connected = true;
            info!(session_id = %session_id, device_id = %record.device_id, "Session answered");
        }

        Ok(true)
    }

    /// Feed a remote ICE candidate to the session's connection
    pub async fn add_ice_candidate(
        &self,
        session_id: &SessionId,
        candidate: IceCandidate,
    ) -> Result<bool> {
        let (connection, negotiation) = self.negotiation_handles(session_id).await?;

        let _guard = negotiation.lock().await;
        connection.add_ice_candidate(candidate).await?;

        debug!(session_id = %session_id, "Remote ICE candidate applied");
        Ok(true)
    }

    /// Drain the locally gathered candidates buffered for a session
    pub async fn get_ice_candidates(&self, session_id: &SessionId) -> Result<Vec<IceCandidate>> {
        let sessions = self.sessions.read().await;
        Ok(live_record(&sessions, session_id)?.candidates.drain())
    }

    /// Status snapshot of a session
    pub async fn get_session(&self, session_id: &SessionId) -> Result<SessionSnapshot> {
        let (device_id, stream_types, connected, created_at, connection, tracks) = {
            let sessions = self.sessions.read().await;
            let record = live_record(&sessions, session_id)?;
            (
                record.device_id.clone(),
                record.stream_types.clone(),
                record.connected,
                record.created_at,
                Arc::clone(&record.connection),
                record.tracks.clone(),
            )
        };

        let streaming = match self.stream_status(&device_id).await {
            Ok(status) => stream_types.iter().all(|s| status.is_active(s)),
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Stream status unavailable");
                false
            }
        };

        let stats = match connection.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Transport stats unavailable");
                None
            }
        };

        Ok(SessionSnapshot {
            session_id: session_id.clone(),
            device_id,
            connected,
            streaming,
            stream_types,
            created_at,
            stats,
            tracks: tracks.iter().map(|t| t.get_stats()).collect(),
        })
    }

    /// Close a session. Returns false when the session is unknown or
    /// already being closed.
    pub async fn close_session(&self, session_id: &SessionId) -> bool {
        let connection = {
            let mut sessions = self.sessions.write().await;
            let Some(record) = sessions.get_mut(session_id).filter(|r| !r.closing) else {
                debug!(session_id = %session_id, "Close requested for unknown session");
                return false;
            };
            record.closing = true;
            Arc::clone(&record.connection)
        };

        close_connection(session_id, connection.as_ref()).await;

        let remaining = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id);
            sessions.len()
        };

        info!(
            session_id = %session_id,
            remaining_sessions = remaining,
            "Session closed"
        );
        true
    }

    /// Close and remove every session older than the TTL. Returns how many were reclaimed.
    pub async fn sweep_expired(&self) -> usize {
        let ttl = self.session_ttl;
        let claimed = self.claim(|record| record.is_expired(ttl)).await;
        for (session_id, _) in &claimed {
            info!(session_id = %session_id, "Reclaiming expired session");
        }
        self.release(claimed).await
    }

    /// Close every session, for shutdown
    pub async fn close_all(&self) -> usize {
        let claimed = self.claim(|_| true).await;
        let closed = self.release(claimed).await;

        if closed > 0 {
            info!(closed, "Closed all sessions");
        }
        closed
    }

    /// Mark matching sessions as closing and hand out their connections.
    /// Sessions already being closed are skipped.
    async fn claim(
        &self,
        matches: impl Fn(&SessionRecord) -> bool,
    ) -> Vec<(SessionId, Arc<dyn PeerTransport>)> {
        let mut sessions = self.sessions.write().await;
        sessions
            .iter_mut()
            .filter(|(_, record)| !record.closing && matches(record))
            .map(|(session_id, record)| {
                record.closing = true;
                (session_id.clone(), Arc::clone(&record.connection))
            })
            .collect()
    }

    /// Close claimed connections outside the store lock, then drop their records
    async fn release(&self, claimed: Vec<(SessionId, Arc<dyn PeerTransport>)>) -> usize {
        if claimed.is_empty() {
            return 0;
        }

        join_all(
            claimed
                .iter()
                .map(|(session_id, connection)| close_connection(session_id, connection.as_ref())),
        )
        .await;

        let mut sessions = self.sessions.write().await;
        for (session_id, _) in &claimed {
            sessions.remove(session_id);
        }
        claimed.len()
    }

    /// Whether `session_id` names a live session
    pub async fn contains(&self, session_id: &SessionId) -> bool {
        live_record(&*self.sessions.read().await, session_id).is_ok()
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, record)| !record.closing)
            .map(|(id, record)| record.summary(id))
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|record| !record.closing)
            .count()
    }

    /// Spawn the periodic sweep. Returns `None` when the sweep interval is disabled.
    pub fn spawn_reclaimer(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.sweep_interval?;
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Session reclaimer stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reclaimed = manager.sweep_expired().await;
                        if reclaimed > 0 {
                            debug!(reclaimed, "Periodic sweep finished");
                        }
                    }
                }
            }
        }))
    }
}

fn live_record<'a>(
    sessions: &'a HashMap<SessionId, SessionRecord>,
    session_id: &SessionId,
) -> Result<&'a SessionRecord> {
    sessions
        .get(session_id)
        .filter(|record| !record.closing)
        .ok_or_else(|| Error::session_not_found(session_id))
}

async fn close_connection(session_id: &SessionId, connection: &dyn PeerTransport) {
    if let Err(e) = connection.close().await {
        warn!(session_id = %session_id, error = %e, "Error while closing connection, ignoring");
    }
}
