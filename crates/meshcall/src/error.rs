//! Error types for the call-session orchestrator

/// Result type alias using the meshcall Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a call session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Relay write/delete/subscribe failure
    #[error("Relay error: {0}")]
    RelayError(String),

    /// Signaling transport failure (subscription lost, adapter misuse)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer not found in the session
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Session description could not be created or applied
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate could not be applied
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Connectivity could not be restored (ICE restart impossible)
    #[error("ICE restart failed: {0}")]
    IceRestartFailed(String),

    /// Underlying peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Local media could not be acquired
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Local media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Signaling payload that does not parse into a known message
    #[error("Malformed signaling payload: {0}")]
    MalformedPayload(String),

    /// Operation on a session that has been torn down
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Operation the media engine does not support
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure classes the session reacts to differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Relay write/subscribe failures: logged, never retried
    Transport,
    /// Description or rollback failures: confined to one PeerLink
    Negotiation,
    /// ICE failures: recovered locally through ICE restart
    Connectivity,
    /// Local media acquisition: fatal to `join`
    Resource,
    /// Undecodable signaling: dropped with a log entry
    Malformed,
    /// Caller misuse (bad config, closed session, unsupported operation)
    Usage,
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::RelayError(_) | Error::SignalingError(_) => ErrorCategory::Transport,
            Error::SdpError(_)
            | Error::IceCandidateError(_)
            | Error::PeerConnectionError(_)
            | Error::PeerNotFound(_) => ErrorCategory::Negotiation,
            Error::IceRestartFailed(_) => ErrorCategory::Connectivity,
            Error::MediaAcquisition(_) | Error::MediaTrackError(_) => ErrorCategory::Resource,
            Error::MalformedPayload(_) | Error::SerializationError(_) => ErrorCategory::Malformed,
            Error::InvalidConfig(_)
            | Error::SessionClosed(_)
            | Error::Unsupported(_)
            | Error::Other(_) => ErrorCategory::Usage,
        }
    }

    /// Whether this error ends the session it occurred in
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Resource
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            Error::RelayError("x".into()).category(),
            ErrorCategory::Transport
        );
        assert_eq!(Error::SdpError("x".into()).category(), ErrorCategory::Negotiation);
        assert_eq!(
            Error::IceRestartFailed("x".into()).category(),
            ErrorCategory::Connectivity
        );
        assert_eq!(
            Error::MalformedPayload("x".into()).category(),
            ErrorCategory::Malformed
        );
    }

    #[test]
    fn test_only_resource_errors_are_fatal() {
        assert!(Error::MediaAcquisition("no camera".into()).is_fatal());
        assert!(!Error::RelayError("offline".into()).is_fatal());
        assert!(!Error::SdpError("bad".into()).is_fatal());
        assert!(!Error::MalformedPayload("bad".into()).is_fatal());
    }

    #[test]
    fn test_peer_not_found_is_negotiation() {
        let err = Error::PeerNotFound("b1 has left the meeting".to_string());
        assert_eq!(err.category(), ErrorCategory::Negotiation);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(parse);
        assert!(matches!(err, Error::SerializationError(_)));
    }
}
