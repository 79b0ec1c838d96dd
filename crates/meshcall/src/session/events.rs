//! Events a session reports to the UI layer

use super::lifecycle::TeardownReport;
use crate::config::FacingMode;
use crate::media::RemoteTrack;
use crate::roster::Roster;
use std::fmt;

/// Notification from a running session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Inbound media from a remote participant became available
    RemoteMedia {
        /// Remote participant
        peer_id: String,
        /// The arriving track
        track: RemoteTrack,
    },

    /// The mirrored roster changed
    RosterChanged(Roster),

    /// Repeated connectivity failures with one participant
    PeerDegraded {
        /// Remote participant
        peer_id: String,
        /// Consecutive ICE failures so far
        consecutive_failures: u32,
    },

    /// Connectivity with a degraded participant came back
    PeerRecovered {
        /// Remote participant
        peer_id: String,
    },

    /// Connectivity with one participant cannot be restored
    PeerFailed {
        /// Remote participant
        peer_id: String,
        /// Why restart was impossible
        reason: String,
    },

    /// A participant left the roster and its PeerLink was closed
    ParticipantLeft {
        /// Remote participant
        peer_id: String,
    },

    /// The session was torn down; always the last event
    Ended {
        /// Trigger site
        reason: TeardownReason,
        /// What each release step did
        report: TeardownReport,
    },
}

/// Which trigger site started teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    /// Explicit leave
    Leave,
    /// The app left the foreground
    Backgrounded,
    /// Unrecoverable error
    Fatal(String),
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownReason::Leave => write!(f, "leave"),
            TeardownReason::Backgrounded => write!(f, "backgrounded"),
            TeardownReason::Fatal(reason) => write!(f, "fatal: {}", reason),
        }
    }
}

/// Application foreground state as reported by the host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// In the foreground
    Active,
    /// Transitioning (e.g. a system dialog on top)
    Inactive,
    /// In the background
    Background,
}

/// Result of a camera switch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraSwitch {
    /// Camera switched; now facing this way
    Switched(FacingMode),
    /// The engine or track cannot switch cameras
    Unsupported,
}
