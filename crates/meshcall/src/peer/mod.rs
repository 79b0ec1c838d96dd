//! Per-participant negotiation
//!
//! One [`PeerLink`] per remote participant: offer/answer state machine,
//! glare tie-break, candidate buffering and ICE restart.

pub mod candidates;
pub mod link;
pub mod state;

pub use candidates::{CandidateBuffer, FlushReport};
pub use link::{PeerContext, PeerLink};
pub use state::{is_offerer, NegotiationState};
