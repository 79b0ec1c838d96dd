//! Configuration types for call sessions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN/TURN servers handed to the media engine (at least one required)
    pub ice_servers: Vec<IceServerConfig>,

    /// Local capture constraints
    pub capture: CaptureConstraints,

    /// Maximum remote peers in the mesh (default: 8, range 1-16)
    pub max_peers: u32,

    /// Delay between successive `initiate` calls triggered by one roster
    /// update, in milliseconds (default: 500, 0 disables)
    pub initiate_stagger_ms: u64,

    /// Consecutive ICE failures on one peer before it is reported as
    /// degraded (default: 2)
    pub degraded_after_failures: u32,

    /// Consecutive ICE restarts attempted on one peer before restart is
    /// considered impossible and the peer is reported failed (default: 3)
    pub max_ice_restarts: u32,

    /// How long teardown waits for each peer to acknowledge close, in
    /// milliseconds (default: 2000)
    pub close_timeout_ms: u64,

    /// Write the meeting record before joining (default: false)
    pub create_meeting: bool,
}

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (stun:, turn: or turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Unauthenticated STUN server
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Camera facing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    User,
    /// Rear camera
    Environment,
}

impl FacingMode {
    /// The other camera
    pub fn flipped(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

/// Local media capture constraints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Capture a microphone track (default: true)
    pub audio: bool,

    /// Capture a camera track (default: true)
    pub video: bool,

    /// Initial camera (default: user)
    pub facing_mode: FacingMode,

    /// Ideal video width (default: 1280)
    pub ideal_width: u32,

    /// Ideal video height (default: 720)
    pub ideal_height: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            facing_mode: FacingMode::User,
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: [
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
                "stun:stun2.l.google.com:19302",
                "stun:stun3.l.google.com:19302",
                "stun:stun4.l.google.com:19302",
            ]
            .into_iter()
            .map(IceServerConfig::stun)
            .collect(),
            capture: CaptureConstraints::default(),
            max_peers: 8,
            initiate_stagger_ms: 500,
            degraded_after_failures: 2,
            max_ice_restarts: 3,
            close_timeout_ms: 2000,
            create_meeting: false,
        }
    }
}

impl CallConfig {
    /// Stagger between initiations as a Duration
    pub fn initiate_stagger(&self) -> Duration {
        Duration::from_millis(self.initiate_stagger_ms)
    }

    /// Close acknowledgement timeout as a Duration
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `ice_servers` is empty or an entry has no URL
    /// - an ICE URL does not start with stun:, turn: or turns:
    /// - `max_peers` is not in range 1-16
    /// - `degraded_after_failures` is 0
    /// - `max_ice_restarts` is greater than 10
    /// - neither audio nor video capture is requested
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.ice_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one ICE server is required".to_string(),
            ));
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::InvalidConfig(
                    "ICE server entry without URLs".to_string(),
                ));
            }
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:"))
                {
                    return Err(Error::InvalidConfig(format!(
                        "ICE server URL must start with stun:, turn: or turns:, got {}",
                        url
                    )));
                }
            }
        }

        if self.max_peers == 0 || self.max_peers > 16 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-16, got {}",
                self.max_peers
            )));
        }

        if self.degraded_after_failures == 0 {
            return Err(Error::InvalidConfig(
                "degraded_after_failures must be at least 1".to_string(),
            ));
        }

        if self.max_ice_restarts > 10 {
            return Err(Error::InvalidConfig(format!(
                "max_ice_restarts must be at most 10, got {}",
                self.max_ice_restarts
            )));
        }

        if !self.capture.audio && !self.capture.video {
            return Err(Error::InvalidConfig(
                "capture must request audio, video or both".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ice_servers.len(), 5);
    }

    #[test]
    fn test_empty_ice_servers_fails() {
        let mut config = CallConfig::default();
        config.ice_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_ice_url_fails() {
        let mut config = CallConfig::default();
        config.ice_servers = vec![IceServerConfig::stun("http://example.com")];
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_max_peers_fails() {
        let mut config = CallConfig::default();
        config.max_peers = 0;
        assert!(config.validate().is_err());

        config.max_peers = 17;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capture_requires_a_track() {
        let mut config = CallConfig::default();
        config.capture.audio = false;
        config.capture.video = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_facing_mode_flip() {
        assert_eq!(FacingMode::User.flipped(), FacingMode::Environment);
        assert_eq!(FacingMode::Environment.flipped(), FacingMode::User);
    }

    #[test]
    fn test_config_serialization() {
        let config = CallConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: CallConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.ice_servers, deserialized.ice_servers);
        assert!(json.contains("\"facing_mode\":\"user\""));
    }
}
