//! Media engine seam
//!
//! The session depends only on the traits in [`engine`]. Two engines ship
//! with the crate: [`webrtc`] over the `webrtc` crate and [`sim`], a
//! deterministic in-process engine for tests and the demo binary.

pub mod engine;
pub mod local;
pub mod sim;
pub mod webrtc;

pub use engine::{
    EngineEvent, IceConnectionState, LocalTrack, MediaCapture, MediaEngine, PeerConnectionHandle,
    RemoteTrack, TrackKind,
};
pub use local::LocalMedia;
pub use sim::{SimCapture, SimConnection, SimEngine, SimFaults, SimSignalingState, SimTrack};
pub use self::webrtc::{WebRtcCapture, WebRtcConnection, WebRtcEngine, WebRtcLocalTrack};
