//! Relay collaborator contract
//!
//! The relay is a realtime key-value tree with per-path write, delete and
//! value subscriptions. It carries signaling and roster data only, never
//! media.

use crate::Result;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Subscription handle issued by a relay
pub type SubscriptionId = u64;

/// Subtree value at a subscribed path; `None` when the subtree is empty
pub type Snapshot = Option<serde_json::Value>;

/// Slash-separated path into the relay tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RelayPath(Vec<String>);

impl RelayPath {
    /// Root of the tree
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path from a `a/b/c` string (empty segments are skipped)
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Append one segment
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Last segment, if any
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// True if `self` equals `other` or is an ancestor of it
    pub fn is_prefix_of(&self, other: &RelayPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// `meetings/{meeting_id}`
    pub fn meeting(meeting_id: &str) -> Self {
        Self::root().child("meetings").child(meeting_id)
    }

    /// `meetings/{meeting_id}/participants`
    pub fn participants(meeting_id: &str) -> Self {
        Self::meeting(meeting_id).child("participants")
    }

    /// `meetings/{meeting_id}/participants/{participant_id}`
    pub fn participant(meeting_id: &str, participant_id: &str) -> Self {
        Self::participants(meeting_id).child(participant_id)
    }

    /// `meetings/{meeting_id}/signaling/{receiver_id}`
    pub fn inbox(meeting_id: &str, receiver_id: &str) -> Self {
        Self::meeting(meeting_id)
            .child("signaling")
            .child(receiver_id)
    }

    /// `meetings/{meeting_id}/signaling/{receiver_id}/{sender_id}/{key}`
    pub fn envelope(meeting_id: &str, receiver_id: &str, sender_id: &str, key: &str) -> Self {
        Self::inbox(meeting_id, receiver_id)
            .child(sender_id)
            .child(key)
    }
}

impl fmt::Display for RelayPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Live value subscription
pub struct RelaySubscription {
    /// Handle to pass to [`Relay::unsubscribe`]
    pub id: SubscriptionId,
    /// Snapshots of the subscribed subtree: one immediately, then one per change
    pub snapshots: mpsc::UnboundedReceiver<Snapshot>,
}

/// Realtime key-value store used as the signaling relay
#[async_trait]
pub trait Relay: Send + Sync {
    /// Replace the value at `path`
    async fn write(&self, path: &RelayPath, value: serde_json::Value) -> Result<()>;

    /// Remove the value at `path` (no-op if absent)
    async fn delete(&self, path: &RelayPath) -> Result<()>;

    /// Subscribe to the subtree at `path`
    async fn subscribe(&self, path: &RelayPath) -> Result<RelaySubscription>;

    /// Stop a subscription; unknown ids are ignored
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}
