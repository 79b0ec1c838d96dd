//! Media engine backed by the `webrtc` crate
//!
//! Each remote participant gets its own `RTCPeerConnection` built from one
//! shared API (default codecs and interceptors). Local tracks are Opus and
//! VP8 static-sample tracks fed by the application through
//! [`WebRtcLocalTrack::write_sample`]; samples written while the track is
//! disabled are dropped, which is how mute takes effect without
//! renegotiation.

use super::engine::{
    EngineEvent, IceConnectionState, LocalTrack, MediaCapture, MediaEngine, PeerConnectionHandle,
    RemoteTrack, TrackKind,
};
use super::local::LocalMedia;
use crate::config::{CaptureConstraints, IceServerConfig};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

type SinkSlot = Arc<Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>>;

fn forward(slot: &SinkSlot, event: EngineEvent) {
    if let Some(sink) = slot.lock().as_ref() {
        let _ = sink.send(event);
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            return serde_json::from_value(serde_json::json!({"type": "rollback", "sdp": ""}))
                .map_err(|e| Error::SdpError(format!("Failed to build rollback: {}", e)));
        }
    };
    parsed.map_err(|e| Error::SdpError(format!("Failed to parse description: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(Error::SdpError(format!(
                "Unexpected description type {}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

/// Peer connection backed by `RTCPeerConnection`
pub struct WebRtcConnection {
    remote_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    sink: SinkSlot,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl WebRtcConnection {
    fn install_callbacks(&self) {
        let slot = Arc::clone(&self.sink);
        let peer_id = self.remote_id.clone();
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let slot = Arc::clone(&slot);
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete for peer {}", peer_id);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => forward(
                        &slot,
                        EngineEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                    ),
                    Err(e) => warn!("Failed to convert ICE candidate for {}: {}", peer_id, e),
                }
            })
        }));

        let slot = Arc::clone(&self.sink);
        let peer_id = self.remote_id.clone();
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let slot = Arc::clone(&slot);
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    debug!("Peer {} ICE state: {}", peer_id, state);
                    if let Some(state) = ice_state(state) {
                        forward(&slot, EngineEvent::IceStateChanged(state));
                    }
                })
            }));

        let slot = Arc::clone(&self.sink);
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    forward(
                        &slot,
                        EngineEvent::RemoteTrack(RemoteTrack {
                            track_id: track.id(),
                            stream_id: track.stream_id(),
                            kind,
                            handle: Some(track as Arc<dyn Any + Send + Sync>),
                        }),
                    );
                })
            }));
    }

    /// Underlying `RTCPeerConnection`
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

#[async_trait]
impl PeerConnectionHandle for WebRtcConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.peer_connection.create_offer(options).await.map_err(|e| {
            if ice_restart {
                Error::IceRestartFailed(format!("Failed to create restart offer: {}", e))
            } else {
                Error::SdpError(format!("Failed to create offer: {}", e))
            }
        })?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc_description(SessionDescription::rollback())?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to roll back: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>, _stream_id: &str) -> Result<()> {
        let local = track
            .as_any()
            .downcast_ref::<WebRtcLocalTrack>()
            .ok_or_else(|| {
                Error::MediaTrackError(format!("track {} is not a webrtc track", track.id()))
            })?;
        let sender = self
            .peer_connection
            .add_track(local.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {}", e)))?;
        self.senders.lock().push(sender);
        debug!("{} track {} added for peer {}", local.kind(), local.id(), self.remote_id);
        Ok(())
    }

    fn set_event_sink(&self, sink: Option<mpsc::UnboundedSender<EngineEvent>>) {
        *self.sink.lock() = sink;
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.remote_id);
        self.sink.lock().take();
        self.senders.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {}", e)))
    }
}

/// [`MediaEngine`] over the `webrtc` crate
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    /// Build the shared API with default codecs and interceptors
    pub fn new() -> Result<Self> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnectionError(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| {
                Error::PeerConnectionError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    #[instrument(skip(self, ice_servers), fields(peer_id = %remote_id))]
    async fn create_connection(
        &self,
        remote_id: &str,
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn PeerConnectionHandle>> {
        let rtc_config = RTCConfiguration {
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
        };

        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| {
                    Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
                })?,
        );

        let connection = WebRtcConnection {
            remote_id: remote_id.to_string(),
            peer_connection,
            sink: Arc::new(Mutex::new(None)),
            senders: Mutex::new(Vec::new()),
        };
        connection.install_callbacks();
        info!("Created peer connection for peer {}", remote_id);

        Ok(Arc::new(connection))
    }
}

/// Static-sample local track
pub struct WebRtcLocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcLocalTrack {
    /// Opus track, 48 kHz stereo
    pub fn audio(stream_id: &str) -> Self {
        Self::new(
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            stream_id,
        )
    }

    /// VP8 track, 90 kHz clock
    pub fn video(stream_id: &str) -> Self {
        Self::new(
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            stream_id,
        )
    }

    fn new(kind: TrackKind, codec: RTCRtpCodecCapability, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Underlying static-sample track
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Send one encoded sample; dropped while disabled or stopped
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to write RTP sample: {}", e)))
    }
}

impl LocalTrack for WebRtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`MediaCapture`] producing application-fed static-sample tracks
#[derive(Debug, Default, Clone)]
pub struct WebRtcCapture;

#[async_trait]
impl MediaCapture for WebRtcCapture {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalMedia> {
        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(WebRtcLocalTrack::audio(&stream_id)));
        }
        if constraints.video {
            tracks.push(Arc::new(WebRtcLocalTrack::video(&stream_id)));
        }
        if tracks.is_empty() {
            return Err(Error::MediaAcquisition(
                "no audio or video requested".to_string(),
            ));
        }
        Ok(LocalMedia::new(stream_id, tracks))
    }
}
