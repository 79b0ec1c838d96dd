//! Deterministic in-process media engine
//!
//! `SimEngine` follows the offer/answer signaling-state rules of a real
//! engine (candidates need a remote description, an offer cannot be applied
//! while holding a local offer, rollback only undoes a local offer) but
//! moves no media. Descriptions list the sender's tracks as
//! `a=track:{kind} {track_id} {stream_id}` lines so the other side can
//! announce inbound tracks once connected.
//!
//! Faults are shared between the engine and its connections and can be
//! changed at any time.

use super::engine::{
    EngineEvent, IceConnectionState, LocalTrack, MediaCapture, MediaEngine, PeerConnectionHandle,
    RemoteTrack, TrackKind,
};
use super::local::LocalMedia;
use crate::config::{CaptureConstraints, FacingMode, IceServerConfig};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Injected engine failures, keyed by remote participant id
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// `create_connection` fails
    pub fail_connect_to: HashSet<String>,
    /// ICE checks end in `Failed` instead of `Connected`
    pub fail_ice_with: HashSet<String>,
    /// `set_remote_description` fails
    pub fail_remote_description_from: HashSet<String>,
    /// `create_offer(ice_restart = true)` fails
    pub fail_restart_with: HashSet<String>,
    /// `rollback` fails on every connection
    pub fail_rollback: bool,
    /// `create_connection` takes this long before returning
    pub delay_connect_to: HashMap<String, Duration>,
    /// `create_answer` takes this long on every connection
    pub answer_delay: Option<Duration>,
    /// `close` takes this long on every connection
    pub close_delay: Option<Duration>,
}

/// Signaling state of a simulated connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimSignalingState {
    /// No offer pending
    Stable,
    /// Local offer applied, waiting for an answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet applied
    HaveRemoteOffer,
    /// Closed
    Closed,
}

struct ConnState {
    signaling: SimSignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    ice: IceConnectionState,
    candidates: Vec<IceCandidate>,
    tracks: Vec<(Arc<dyn LocalTrack>, String)>,
    remote_tracks_announced: bool,
    offers: u32,
    restarts: u32,
    sink: Option<mpsc::UnboundedSender<EngineEvent>>,
}

/// Simulated peer connection
pub struct SimConnection {
    remote_id: String,
    connection_id: u32,
    faults: Arc<Mutex<SimFaults>>,
    candidates_per_description: u32,
    next_candidate: AtomicU32,
    state: Mutex<ConnState>,
}

impl SimConnection {
    fn new(
        remote_id: &str,
        connection_id: u32,
        faults: Arc<Mutex<SimFaults>>,
        candidates_per_description: u32,
    ) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            connection_id,
            faults,
            candidates_per_description,
            next_candidate: AtomicU32::new(0),
            state: Mutex::new(ConnState {
                signaling: SimSignalingState::Stable,
                local: None,
                remote: None,
                stable_local: None,
                ice: IceConnectionState::New,
                candidates: Vec::new(),
                tracks: Vec::new(),
                remote_tracks_announced: false,
                offers: 0,
                restarts: 0,
                sink: None,
            }),
        }
    }

    /// Remote participant this connection leads to
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Current signaling state
    pub fn signaling_state(&self) -> SimSignalingState {
        self.state.lock().signaling
    }

    /// Current ICE state
    pub fn ice_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    /// Remote candidates applied so far, in application order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Ids of local tracks added to this connection
    pub fn track_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .tracks
            .iter()
            .map(|(t, _)| t.id().to_string())
            .collect()
    }

    /// Offers created, and how many of them were ICE restarts
    pub fn offer_counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.offers, state.restarts)
    }

    /// Whether an event sink is installed
    pub fn has_event_sink(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SimSignalingState::Closed
    }

    /// Report an ICE state change as if the network changed
    pub fn emit_ice_state(&self, ice: IceConnectionState) {
        let sink = {
            let mut state = self.state.lock();
            state.ice = ice;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            let _ = sink.send(EngineEvent::IceStateChanged(ice));
        }
    }

    fn ensure_open(state: &ConnState) -> Result<()> {
        if state.signaling == SimSignalingState::Closed {
            return Err(Error::PeerConnectionError("connection is closed".to_string()));
        }
        Ok(())
    }

    fn describe(&self, kind: SdpKind, generation: u32, state: &ConnState) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=sim {} {} IN IP4 127.0.0.1\r\ns=-\r\n",
            self.connection_id, generation
        );
        for (track, stream_id) in &state.tracks {
            sdp.push_str(&format!(
                "a=track:{} {} {}\r\n",
                track.kind(),
                track.id(),
                stream_id
            ));
        }
        SessionDescription { kind, sdp }
    }

    fn gathered_candidates(&self) -> Vec<EngineEvent> {
        (0..self.candidates_per_description)
            .map(|_| {
                let n = self.next_candidate.fetch_add(1, Ordering::SeqCst);
                let mut candidate = IceCandidate::new(format!(
                    "candidate:{} 1 udp {} 10.0.{}.{} {} typ host",
                    n,
                    2_130_706_431u32.saturating_sub(n),
                    self.connection_id % 256,
                    n % 256 + 1,
                    50_000 + n
                ));
                candidate.sdp_mid = Some("0".to_string());
                candidate.sdp_mline_index = Some(0);
                EngineEvent::LocalCandidate(candidate)
            })
            .collect()
    }

    /// ICE checks after both descriptions settle
    fn connectivity_checks(&self, state: &mut ConnState) -> Vec<EngineEvent> {
        if state.signaling != SimSignalingState::Stable
            || state.local.is_none()
            || state.remote.is_none()
        {
            return Vec::new();
        }

        let mut events = vec![EngineEvent::IceStateChanged(IceConnectionState::Checking)];
        if self.faults.lock().fail_ice_with.contains(&self.remote_id) {
            state.ice = IceConnectionState::Failed;
            events.push(EngineEvent::IceStateChanged(IceConnectionState::Failed));
            return events;
        }

        state.ice = IceConnectionState::Connected;
        events.push(EngineEvent::IceStateChanged(IceConnectionState::Connected));
        if !state.remote_tracks_announced {
            state.remote_tracks_announced = true;
            let remote_sdp = state.remote.as_ref().map(|d| d.sdp.as_str()).unwrap_or("");
            events.extend(parse_tracks(remote_sdp).into_iter().map(EngineEvent::RemoteTrack));
        }
        events
    }

    fn dispatch(&self, sink: Option<mpsc::UnboundedSender<EngineEvent>>, events: Vec<EngineEvent>) {
        let Some(sink) = sink else {
            return;
        };
        for event in events {
            let _ = sink.send(event);
        }
    }
}

fn parse_tracks(sdp: &str) -> Vec<RemoteTrack> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("a=track:"))
        .filter_map(|rest| {
            let mut parts = rest.split_whitespace();
            let kind = match parts.next()? {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                _ => return None,
            };
            Some(RemoteTrack {
                kind,
                track_id: parts.next()?.to_string(),
                stream_id: parts.next()?.to_string(),
                handle: None,
            })
        })
        .collect()
}

#[async_trait]
impl PeerConnectionHandle for SimConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if ice_restart && self.faults.lock().fail_restart_with.contains(&self.remote_id) {
            return Err(Error::IceRestartFailed(format!(
                "simulated restart failure towards {}",
                self.remote_id
            )));
        }
        state.offers += 1;
        if ice_restart {
            state.restarts += 1;
        }
        let generation = state.offers;
        Ok(self.describe(SdpKind::Offer, generation, &state))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let delay = self.faults.lock().answer_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SimSignalingState::HaveRemoteOffer {
            return Err(Error::SdpError(
                "create_answer needs a remote offer".to_string(),
            ));
        }
        Ok(self.describe(SdpKind::Answer, state.offers, &state))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let (sink, events) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SimSignalingState::Stable) => {
                    state.signaling = SimSignalingState::HaveLocalOffer;
                }
                (SdpKind::Answer, SimSignalingState::HaveRemoteOffer) => {
                    state.signaling = SimSignalingState::Stable;
                }
                (kind, signaling) => {
                    return Err(Error::SdpError(format!(
                        "cannot apply local {:?} in {:?}",
                        kind, signaling
                    )));
                }
            }
            state.local = Some(description);
            let mut events = self.gathered_candidates();
            if state.signaling == SimSignalingState::Stable {
                state.stable_local = state.local.clone();
                events.extend(self.connectivity_checks(&mut state));
            }
            (state.sink.clone(), events)
        };
        self.dispatch(sink, events);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let (sink, events) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if self
                .faults
                .lock()
                .fail_remote_description_from
                .contains(&self.remote_id)
            {
                return Err(Error::SdpError(format!(
                    "simulated failure applying description from {}",
                    self.remote_id
                )));
            }
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SimSignalingState::Stable) => {
                    state.signaling = SimSignalingState::HaveRemoteOffer;
                }
                (SdpKind::Answer, SimSignalingState::HaveLocalOffer) => {
                    state.signaling = SimSignalingState::Stable;
                }
                (kind, signaling) => {
                    return Err(Error::SdpError(format!(
                        "cannot apply remote {:?} in {:?}",
                        kind, signaling
                    )));
                }
            }
            state.remote = Some(description);
            let events = self.connectivity_checks(&mut state);
            (state.sink.clone(), events)
        };
        self.dispatch(sink, events);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if self.faults.lock().fail_rollback {
            return Err(Error::SdpError("simulated rollback failure".to_string()));
        }
        if state.signaling != SimSignalingState::HaveLocalOffer {
            return Err(Error::SdpError(format!(
                "nothing to roll back in {:?}",
                state.signaling
            )));
        }
        state.signaling = SimSignalingState::Stable;
        state.local = state.stable_local.clone();
        debug!("Rolled back local offer towards {}", self.remote_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.remote.is_none() {
            return Err(Error::IceCandidateError(format!(
                "candidate before remote description: {}",
                candidate.candidate
            )));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>, stream_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.tracks.push((track, stream_id.to_string()));
        Ok(())
    }

    fn set_event_sink(&self, sink: Option<mpsc::UnboundedSender<EngineEvent>>) {
        self.state.lock().sink = sink;
    }

    async fn close(&self) -> Result<()> {
        let delay = self.faults.lock().close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.signaling = SimSignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        state.sink = None;
        Ok(())
    }
}

/// Simulated [`MediaEngine`] for one participant
pub struct SimEngine {
    faults: Arc<Mutex<SimFaults>>,
    connections: Mutex<HashMap<String, Arc<SimConnection>>>,
    next_connection: AtomicU32,
    candidates_per_description: u32,
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEngine {
    /// Engine gathering two candidates per applied local description
    pub fn new() -> Self {
        Self {
            faults: Arc::new(Mutex::new(SimFaults::default())),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU32::new(1),
            candidates_per_description: 2,
        }
    }

    /// Change the number of candidates gathered per local description
    pub fn with_candidates_per_description(mut self, count: u32) -> Self {
        self.candidates_per_description = count;
        self
    }

    /// Replace the injected faults
    pub fn set_faults(&self, faults: SimFaults) {
        *self.faults.lock() = faults;
    }

    /// Edit the injected faults in place
    pub fn update_faults(&self, edit: impl FnOnce(&mut SimFaults)) {
        edit(&mut self.faults.lock());
    }

    /// Most recent connection created towards `remote_id`
    pub fn connection(&self, remote_id: &str) -> Option<Arc<SimConnection>> {
        self.connections.lock().get(remote_id).cloned()
    }

    /// Number of connections created so far
    pub fn connections_created(&self) -> u32 {
        self.next_connection.load(Ordering::SeqCst) - 1
    }
}

#[async_trait]
impl MediaEngine for SimEngine {
    async fn create_connection(
        &self,
        remote_id: &str,
        _ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn PeerConnectionHandle>> {
        if self.faults.lock().fail_connect_to.contains(remote_id) {
            return Err(Error::PeerConnectionError(format!(
                "simulated connection failure towards {}",
                remote_id
            )));
        }
        let delay = self.faults.lock().delay_connect_to.get(remote_id).copied();
        if let Some(delay) = delay {
            debug!("Delaying connection towards {} by {:?}", remote_id, delay);
            tokio::time::sleep(delay).await;
        }

        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(SimConnection::new(
            remote_id,
            id,
            Arc::clone(&self.faults),
            self.candidates_per_description,
        ));
        self.connections
            .lock()
            .insert(remote_id.to_string(), Arc::clone(&connection));
        debug!("Created simulated connection {} towards {}", id, remote_id);
        Ok(connection)
    }
}

/// Simulated capture track
pub struct SimTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    facing: Mutex<FacingMode>,
    can_switch: bool,
}

impl SimTrack {
    /// New enabled track
    pub fn new(kind: TrackKind, facing: FacingMode, can_switch: bool) -> Self {
        Self {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            facing: Mutex::new(facing),
            can_switch,
        }
    }

    /// Current camera
    pub fn facing_mode(&self) -> FacingMode {
        *self.facing.lock()
    }
}

impl LocalTrack for SimTrack {
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

    fn switch_camera(&self) -> Result<FacingMode> {
        if self.kind != TrackKind::Video || !self.can_switch {
            return Err(Error::Unsupported(format!(
                "track {} cannot switch camera",
                self.id
            )));
        }
        let mut facing = self.facing.lock();
        *facing = facing.flipped();
        Ok(*facing)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Simulated [`MediaCapture`]
#[derive(Debug, Clone)]
pub struct SimCapture {
    fail: bool,
    can_switch: bool,
}

impl Default for SimCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCapture {
    /// Capture that succeeds with switchable cameras
    pub fn new() -> Self {
        Self {
            fail: false,
            can_switch: true,
        }
    }

    /// Capture that always fails (no permission, no device)
    pub fn failing() -> Self {
        Self {
            fail: true,
            can_switch: true,
        }
    }

    /// Capture whose video track cannot switch cameras
    pub fn without_camera_switch() -> Self {
        Self {
            fail: false,
            can_switch: false,
        }
    }
}

#[async_trait]
impl MediaCapture for SimCapture {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalMedia> {
        if self.fail {
            return Err(Error::MediaAcquisition(
                "simulated capture failure".to_string(),
            ));
        }

        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(SimTrack::new(
                TrackKind::Audio,
                constraints.facing_mode,
                false,
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(SimTrack::new(
                TrackKind::Video,
                constraints.facing_mode,
                self.can_switch,
            )));
        }
        Ok(LocalMedia::new(
            format!("stream-{}", uuid::Uuid::new_v4()),
            tracks,
        ))
    }
}
