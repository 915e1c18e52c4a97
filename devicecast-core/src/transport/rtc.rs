//! webrtc-rs backed transport engine
//!
//! Each session gets one `RTCPeerConnection`. Every attached media track gets a
//! `TrackLocalStaticSample` plus a pump task that pulls the adapter at the
//! configured frame rate, encodes through the injected encoder, and writes the
//! resulting samples. Codec implementations live outside this crate.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{CandidateBuffer, PeerTransport, TransportEngine};
use crate::config::TrackConfig;
use crate::track::{MediaTrackAdapter, VideoFrame, VIDEO_CLOCK_RATE};
use crate::types::{IceCandidate, IceServer, SdpType, SessionDescription};
use crate::{Error, Result};

/// Encodes raw frames of one track into codec payloads
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &VideoFrame) -> Result<Bytes>;
}

/// Creates one encoder per track and advertises the codec it produces
pub trait EncoderFactory: Send + Sync {
    fn codec(&self) -> RTCRtpCodecCapability;

    fn create(&self, track: &MediaTrackAdapter) -> Result<Box<dyn FrameEncoder>>;
}

/// Transport engine built on webrtc-rs
pub struct WebRtcEngine {
    api: API,
    encoders: Arc<dyn EncoderFactory>,
    frame_interval: Duration,
}

impl WebRtcEngine {
    pub fn new(encoders: Arc<dyn EncoderFactory>, track_config: &TrackConfig) -> Result<Self> {
        Ok(Self {
            api: build_api()?,
            encoders,
            frame_interval: track_config.frame_interval(),
        })
    }
}

/// webrtc-rs API with the default codecs and interceptors registered
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_config(ice_servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        candidates: Arc<CandidateBuffer>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_config(ice_servers)).await?);

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates = Arc::clone(&candidates);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => candidates.push(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate"),
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!(state = %state, "Peer connection state changed");
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcTransport {
            pc,
            encoders: Arc::clone(&self.encoders),
            frame_interval: self.frame_interval,
            cancel: CancellationToken::new(),
        }))
    }
}

/// One webrtc-rs peer connection and its track pumps
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    encoders: Arc<dyn EncoderFactory>,
    frame_interval: Duration,
    /// Cancelled on close; stops every pump and RTCP reader
    cancel: CancellationToken,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: Arc<MediaTrackAdapter>) -> Result<()> {
        let encoder = self.encoders.create(&track)?;
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            self.encoders.codec(),
            track.stream_type().to_string(),
            format!("devicecast-{}", track.device_id()),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for interceptors (NACK, reports) to work
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    result = sender.read(&mut buf) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(pump(
            track,
            rtc_track,
            encoder,
            self.frame_interval,
            self.cancel.clone(),
        ));

        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("Local description missing after offer".to_string()))?;

        Ok(SessionDescription::offer(local.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Rollback => {
                return Err(Error::Negotiation(
                    "Rollback descriptions are not supported".to_string(),
                ))
            }
        };
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<serde_json::Value> {
        let report = self.pc.get_stats().await;
        Ok(serde_json::to_value(&report)?)
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.pc.close().await?;
        Ok(())
    }
}

/// Pull frames from `track` at `interval` and write them to `rtc_track`
async fn pump(
    track: Arc<MediaTrackAdapter>,
    rtc_track: Arc<TrackLocalStaticSample>,
    mut encoder: Box<dyn FrameEncoder>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_pts: Option<u64> = None;

    debug!(track_id = %track.id(), "Track pump started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = track.recv() => frame,
        };

        let duration = last_pts.map_or(interval, |prev| {
            Duration::from_micros((frame.pts - prev) * 1_000_000 / VIDEO_CLOCK_RATE)
        });
        last_pts = Some(frame.pts);

        let encoded = tokio::task::spawn_blocking(move || {
            let result = encoder.encode(&frame);
            (encoder, result)
        })
        .await;

        let data = match encoded {
            Ok((returned, result)) => {
                encoder = returned;
                match result {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(track_id = %track.id(), error = %e, "Failed to encode frame");
                        continue;
                    }
                }
            }
            Err(e) => {
                error!(track_id = %track.id(), error = %e, "Encoder task panicked, stopping track");
                break;
            }
        };

        if let Err(e) = rtc_track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
        {
            debug!(track_id = %track.id(), error = %e, "Failed to write sample");
        }
    }

    debug!(track_id = %track.id(), "Track pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeFrameSource, PassthroughEncoderFactory};
    use crate::types::{DeviceId, StreamType};

    fn engine() -> WebRtcEngine {
        WebRtcEngine::new(Arc::new(PassthroughEncoderFactory), &TrackConfig::default()).unwrap()
    }

    async fn transport_with_track(engine: &WebRtcEngine) -> Arc<dyn PeerTransport> {
        let source = Arc::new(FakeFrameSource::new());
        let transport = engine
            .connect(&[], Arc::new(CandidateBuffer::new()))
            .await
            .unwrap();
        let track = Arc::new(MediaTrackAdapter::new(
            source,
            DeviceId::from("camA"),
            StreamType::from("color"),
            &TrackConfig::default(),
        ));
        transport.add_track(track).await.unwrap();
        transport
    }

    #[test]
    fn test_rtc_config_maps_credentials() {
        let config = rtc_config(&[
            IceServer::stun("stun:stun.example.com:3478"),
            IceServer {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: Some("user".to_string()),
                credential: Some("secret".to_string()),
            },
        ]);

        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers[0].username.is_empty());
        assert_eq!(config.ice_servers[1].username, "user");
        assert_eq!(config.ice_servers[1].credential, "secret");
    }

    #[tokio::test]
    async fn test_offer_contains_video_section() {
        let engine = engine();
        let transport = transport_with_track(&engine).await;

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_answer_is_negotiation_error() {
        let engine = engine();
        let transport = transport_with_track(&engine).await;
        transport.create_offer().await.unwrap();

        let err = transport
            .set_remote_description(SessionDescription::answer("not an sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_loopback_answer_accepted() {
        let engine = engine();
        let transport = transport_with_track(&engine).await;
        let offer = transport.create_offer().await.unwrap();

        // Remote peer answering with the same stack
        let remote = build_api()
            .unwrap()
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        remote
            .set_remote_description(RTCSessionDescription::offer(offer.sdp).unwrap())
            .await
            .unwrap();
        let answer = remote.create_answer(None).await.unwrap();
        remote.set_local_description(answer).await.unwrap();
        let answer = remote.local_description().await.unwrap();

        transport
            .set_remote_description(SessionDescription::answer(answer.sdp))
            .await
            .unwrap();

        let stats = transport.stats().await.unwrap();
        assert!(stats.is_object());

        transport.close().await.unwrap();
        remote.close().await.unwrap();
    }
}
