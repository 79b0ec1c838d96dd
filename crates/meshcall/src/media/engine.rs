//! Media engine collaborator contracts
//!
//! The session never touches codecs, packetization or NAT traversal. It
//! drives an engine through these traits: capture local tracks, open one
//! connection per remote participant, and exchange descriptions and
//! candidates. Engine callbacks arrive as [`EngineEvent`]s on a channel the
//! owning PeerLink installs with [`PeerConnectionHandle::set_event_sink`].

use super::local::LocalMedia;
use crate::config::{CaptureConstraints, FacingMode, IceServerConfig};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// One locally captured track
pub trait LocalTrack: Send + Sync {
    /// Track id
    fn id(&self) -> &str;

    /// Media kind
    fn kind(&self) -> TrackKind;

    /// Enable or disable the track without renegotiation
    fn set_enabled(&self, enabled: bool);

    /// Whether the track currently produces media
    fn is_enabled(&self) -> bool;

    /// Stop capture and release the device; idempotent
    fn stop(&self);

    /// Whether [`LocalTrack::stop`] has run
    fn is_stopped(&self) -> bool;

    /// Flip between front and rear camera, returning the new facing mode
    ///
    /// # Errors
    ///
    /// `Error::Unsupported` if the track cannot switch cameras.
    fn switch_camera(&self) -> Result<FacingMode> {
        Err(Error::Unsupported(format!(
            "{} track {} cannot switch camera",
            self.kind(),
            self.id()
        )))
    }

    /// Downcast hook for engines that need their concrete track type
    fn as_any(&self) -> &dyn Any;
}

/// Acquires local media
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Capture tracks matching `constraints`
    ///
    /// # Errors
    ///
    /// `Error::MediaAcquisition` if the devices cannot be opened.
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalMedia>;
}

/// ICE connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    /// Gathering not started
    New,
    /// Connectivity checks running
    Checking,
    /// A working candidate pair exists
    Connected,
    /// All checks done
    Completed,
    /// Connectivity lost, may recover on its own
    Disconnected,
    /// Connectivity lost, needs an ICE restart
    Failed,
    /// Connection closed
    Closed,
}

impl IceConnectionState {
    /// Connected or Completed
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

/// Inbound track from a remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track id as announced by the remote side
    pub track_id: String,
    /// Remote media stream id
    pub stream_id: String,
    /// Media kind
    pub kind: TrackKind,
    /// Engine-specific handle for the UI layer to render
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

/// Callback from the engine for one connection
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A local candidate was gathered and should be sent to the remote side
    LocalCandidate(IceCandidate),
    /// ICE connection state changed
    IceStateChanged(IceConnectionState),
    /// Remote media arrived
    RemoteTrack(RemoteTrack),
}

/// One peer connection owned by exactly one PeerLink
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    /// Create an offer; `ice_restart` requests fresh ICE credentials
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard the pending local offer
    async fn rollback(&self) -> Result<()>;

    /// Apply one remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send a local track on this connection
    async fn add_track(&self, track: Arc<dyn LocalTrack>, stream_id: &str) -> Result<()>;

    /// Route engine callbacks to `sink`; `None` clears every callback
    fn set_event_sink(&self, sink: Option<mpsc::UnboundedSender<EngineEvent>>);

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Creates peer connections
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Open a connection to `remote_id`
    async fn create_connection(
        &self,
        remote_id: &str,
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn PeerConnectionHandle>>;
}
