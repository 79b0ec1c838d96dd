//! Negotiation state of one PeerLink

use std::fmt;

/// Offer/answer lifecycle of one PeerLink
///
/// `New -> HaveLocalOffer | HaveRemoteOffer -> Stable -> Closed`, with
/// `Failed` reachable from any non-terminal state when connectivity cannot
/// be restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Created, nothing exchanged yet
    New,
    /// Local offer applied and sent, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet sent
    HaveRemoteOffer,
    /// Offer/answer complete
    Stable,
    /// Connectivity lost and ICE restart impossible
    Failed,
    /// Torn down (terminal)
    Closed,
}

impl NegotiationState {
    /// Closed is the only terminal state
    pub fn is_terminal(self) -> bool {
        self == NegotiationState::Closed
    }

    /// Negotiation has started or finished
    pub fn is_past_new(self) -> bool {
        self != NegotiationState::New
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::New => "new",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::Stable => "stable",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Glare tie-break: the side whose id compares strictly smaller offers
///
/// Ids are compared as plain strings and must be stable across sessions.
pub fn is_offerer(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}
