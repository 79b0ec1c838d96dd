//! Signaling message types exchanged through the relay
//!
//! Every relay entry under `signaling/{receiver}/{sender}/{key}` is a
//! [`RelayRecord`] whose `data` field decodes into exactly one
//! [`SignalPayload`] variant. Anything else is rejected at this boundary.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Answer
    Answer,
    /// Rollback of a pending local offer
    Rollback,
}

/// Opaque session description, carried as `{ type, sdp }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub kind: SdpKind,

    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Rollback marker (empty body)
    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

/// Opaque connection-setup fragment, carried in RTCIceCandidateInit shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only a candidate line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Validated signaling payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Session offer
    Offer {
        /// Offer description
        sdp: SessionDescription,
    },
    /// Session answer
    Answer {
        /// Answer description
        sdp: SessionDescription,
    },
    /// Trickled ICE candidate
    IceCandidate {
        /// Candidate fragment
        candidate: IceCandidate,
    },
}

impl SignalPayload {
    /// Wire name of the payload kind
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Ordering key of one envelope: creation millis plus a per-sender sequence
///
/// Rendered as `"{millis:013}-{seq:06}"` so lexical order of the relay path
/// segment matches creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvelopeKey {
    /// Wall-clock milliseconds at creation
    pub timestamp_ms: i64,
    /// Tie-breaker for envelopes created in the same millisecond
    pub seq: u32,
}

impl fmt::Display for EnvelopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:013}-{:06}", self.timestamp_ms, self.seq)
    }
}

impl FromStr for EnvelopeKey {
    type Err = Error;

    /// Accepts `"{millis}-{seq}"` and bare `"{millis}"` keys
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::MalformedPayload(format!("invalid envelope key: {}", s));
        match s.split_once('-') {
            Some((ts, seq)) => Ok(Self {
                timestamp_ms: ts.parse().map_err(|_| bad())?,
                seq: seq.parse().map_err(|_| bad())?,
            }),
            None => Ok(Self {
                timestamp_ms: s.parse().map_err(|_| bad())?,
                seq: 0,
            }),
        }
    }
}

/// Produces strictly increasing envelope keys for one sender
#[derive(Debug, Default)]
pub struct KeyGenerator {
    last: Mutex<Option<EnvelopeKey>>,
}

impl KeyGenerator {
    /// Create a new generator
    pub fn new() -> Self {
        Self::default()
    }

    /// Next key, never smaller than or equal to the previous one
    pub fn next_key(&self) -> EnvelopeKey {
        let now = chrono::Utc::now().timestamp_millis();
        let mut last = self.last.lock();
        let key = match *last {
            Some(prev) if now <= prev.timestamp_ms => EnvelopeKey {
                timestamp_ms: prev.timestamp_ms,
                seq: prev.seq + 1,
            },
            _ => EnvelopeKey {
                timestamp_ms: now,
                seq: 0,
            },
        };
        *last = Some(key);
        key
    }
}

/// One signaling message addressed from `sender_id` to `receiver_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    /// Sending participant
    pub sender_id: String,
    /// Receiving participant
    pub receiver_id: String,
    /// Ordering key (relay path segment)
    pub key: EnvelopeKey,
    /// Validated payload
    pub payload: SignalPayload,
}

impl SignalingEnvelope {
    /// Serialize into the record stored at the envelope's relay path
    pub fn to_record(&self) -> Result<serde_json::Value> {
        let record = RelayRecord {
            timestamp: self.key.timestamp_ms,
            data: serde_json::to_value(&self.payload)?,
        };
        Ok(serde_json::to_value(record)?)
    }

    /// Parse a relay record found at `signaling/{receiver}/{sender}/{key}`
    ///
    /// # Errors
    ///
    /// `Error::MalformedPayload` if the key does not parse, the record has
    /// no `data`, or `data` is not one of the known payload kinds.
    pub fn from_record(
        sender_id: &str,
        receiver_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<Self> {
        let key = key.parse::<EnvelopeKey>()?;
        let record: RelayRecord = serde_json::from_value(value.clone())
            .map_err(|e| Error::MalformedPayload(format!("record from {}: {}", sender_id, e)))?;
        let payload: SignalPayload = serde_json::from_value(record.data)
            .map_err(|e| Error::MalformedPayload(format!("payload from {}: {}", sender_id, e)))?;

        Ok(Self {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            key,
            payload,
        })
    }
}

/// Relay record wrapping a payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    /// Creation millis
    #[serde(default)]
    pub timestamp: i64,
    /// Encoded [`SignalPayload`]
    pub data: serde_json::Value,
}
