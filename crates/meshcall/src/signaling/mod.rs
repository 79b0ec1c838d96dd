//! Signaling over a realtime relay
//!
//! - [`protocol`]: envelope and payload types, ordering keys
//! - [`relay`]: the relay collaborator contract
//! - [`memory`]: in-process relay
//! - [`transport`]: the adapter PeerLinks and the session talk to

pub mod memory;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use memory::{MemoryRelay, RelayFaults, RelayOp};
pub use protocol::{
    EnvelopeKey, IceCandidate, SdpKind, SessionDescription, SignalPayload, SignalingEnvelope,
};
pub use relay::{Relay, RelayPath, RelaySubscription, Snapshot, SubscriptionId};
pub use transport::{SignalSink, SignalingTransport, TransportEvent};
