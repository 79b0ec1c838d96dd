//! Mesh call sessions over a realtime key-value relay
//!
//! This crate joins a participant to a small multi-party call in which every
//! pair of participants holds one direct peer connection. Participants find
//! each other through a roster kept on a realtime relay and exchange offers,
//! answers and ICE candidates through per-receiver inboxes on the same relay.
//!
//! # Features
//!
//! - **Mesh negotiation**: one PeerLink per remote participant, glare
//!   resolved by id comparison so exactly one side offers
//! - **Candidate buffering**: early ICE candidates are held until the remote
//!   description is applied, then applied in arrival order
//! - **Consume-once signaling**: inbound envelopes are delivered in key order
//!   and deleted after delivery
//! - **ICE recovery**: failures are counted per peer; the offerer restarts ICE
//!   and the session reports degraded, recovered and failed peers
//! - **Single-path teardown**: leave, backgrounding and fatal errors share one
//!   idempotent release sequence
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  UI layer                                                 │
//! │  ↓ join / toggle_mute / switch_camera / leave             │
//! │  CallSession                                              │
//! │  ├─ RosterClient (participants subtree)                  │
//! │  ├─ SignalingTransport (inbox subtree, ordered writer)   │
//! │  ├─ Lifecycle (closing flag, one-shot teardown)          │
//! │  └─ PeerLink × N (task per remote participant)           │
//! │      ├─ NegotiationState + tie-break                      │
//! │      └─ CandidateBuffer                                   │
//! │     ↓                                                     │
//! │  Relay (MemoryRelay, ...)     MediaEngine (WebRtc, Sim)  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use meshcall::CallConfig;
//!
//! let config = CallConfig {
//!     max_peers: 4,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use meshcall::{CallConfig, CallSession, MemoryRelay, SessionDeps, SimCapture, SimEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> meshcall::Result<()> {
//! let deps = SessionDeps {
//!     relay: Arc::new(MemoryRelay::new()),
//!     engine: Arc::new(SimEngine::new()),
//!     capture: Arc::new(SimCapture::new()),
//! };
//! let (session, mut events) =
//!     CallSession::join(CallConfig::default(), deps, "standup", "a1", "Alice").await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! session.leave().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod roster;
pub mod session;
pub mod signaling;

pub use config::{CallConfig, CaptureConstraints, FacingMode, IceServerConfig};
pub use error::{Error, ErrorCategory, Result};
pub use media::{
    LocalMedia, MediaCapture, MediaEngine, RemoteTrack, SimCapture, SimEngine, TrackKind,
    WebRtcCapture, WebRtcEngine,
};
pub use peer::{NegotiationState, PeerLink};
pub use roster::{Roster, RosterEntry};
pub use session::{
    AppState, CallSession, CameraSwitch, SessionDeps, SessionEvent, TeardownReason,
    TeardownReport,
};
pub use signaling::{MemoryRelay, Relay, SignalingTransport};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
