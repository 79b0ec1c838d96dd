//! Participant roster mirrored from the relay
//!
//! Each participant owns one entry at `meetings/{meeting}/participants/{id}`.
//! The session writes only its own entry; everything else is read-only.

use crate::signaling::{Relay, RelayPath, RelaySubscription, Snapshot, SubscriptionId};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Presence metadata for one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Join time in wall-clock millis
    pub joined_at: i64,
    /// Name shown to other participants
    pub display_name: String,
    /// Whether the participant's audio is muted
    #[serde(default)]
    pub is_muted: bool,
}

impl RosterEntry {
    /// Entry for a participant joining now
    pub fn joining(display_name: impl Into<String>) -> Self {
        Self {
            joined_at: chrono::Utc::now().timestamp_millis(),
            display_name: display_name.into(),
            is_muted: false,
        }
    }
}

/// Participant id to entry, ordered by id
pub type Roster = BTreeMap<String, RosterEntry>;

/// Parse a participants snapshot, skipping entries that do not decode
pub fn parse_roster(snapshot: &Snapshot) -> Roster {
    let Some(Value::Object(entries)) = snapshot else {
        return Roster::new();
    };

    entries
        .iter()
        .filter_map(|(id, value)| {
            match serde_json::from_value::<RosterEntry>(value.clone()) {
                Ok(entry) => Some((id.clone(), entry)),
                Err(e) => {
                    warn!(peer_id = %id, "Skipping malformed roster entry: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Live roster subscription
pub struct RosterSubscription {
    inner: RelaySubscription,
}

impl RosterSubscription {
    /// Relay subscription id
    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    /// Next roster snapshot; `None` once the relay closes the stream
    pub async fn next(&mut self) -> Option<Roster> {
        self.inner
            .snapshots
            .recv()
            .await
            .map(|snapshot| parse_roster(&snapshot))
    }
}

/// Reads the meeting roster and maintains the local participant's entry
pub struct RosterClient {
    relay: Arc<dyn Relay>,
    meeting_id: String,
    local_id: String,
    entry: Mutex<Option<RosterEntry>>,
}

impl RosterClient {
    /// Create a client for `local_id` in `meeting_id`
    pub fn new(relay: Arc<dyn Relay>, meeting_id: &str, local_id: &str) -> Self {
        Self {
            relay,
            meeting_id: meeting_id.to_string(),
            local_id: local_id.to_string(),
            entry: Mutex::new(None),
        }
    }

    /// Write the meeting record (`createdAt`)
    pub async fn create_meeting(&self) -> Result<()> {
        let path = RelayPath::meeting(&self.meeting_id).child("createdAt");
        self.relay
            .write(&path, Value::from(chrono::Utc::now().timestamp_millis()))
            .await?;
        info!(meeting_id = %self.meeting_id, "Meeting created");
        Ok(())
    }

    /// Write the local participant's entry
    ///
    /// The entry is kept even when the write fails so a later mute update
    /// republishes it with the same display name.
    pub async fn join(&self, entry: RosterEntry) -> Result<()> {
        *self.entry.lock() = Some(entry.clone());
        self.write_entry(&entry).await?;
        info!(meeting_id = %self.meeting_id, "{} joined the roster", self.local_id);
        Ok(())
    }

    /// Rewrite the local entry with a new mute flag
    ///
    /// # Errors
    ///
    /// `Error::PeerNotFound` before `join` or after `leave`.
    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        let entry = {
            let mut current = self.entry.lock();
            let Some(entry) = current.as_mut() else {
                return Err(Error::PeerNotFound(format!(
                    "{} has no roster entry",
                    self.local_id
                )));
            };
            entry.is_muted = muted;
            entry.clone()
        };
        debug!(meeting_id = %self.meeting_id, "Writing mute flag {}", muted);
        self.write_entry(&entry).await
    }

    /// Remove the local participant's entry
    pub async fn leave(&self) -> Result<()> {
        self.relay
            .delete(&RelayPath::participant(&self.meeting_id, &self.local_id))
            .await?;
        self.entry.lock().take();
        info!(meeting_id = %self.meeting_id, "{} left the roster", self.local_id);
        Ok(())
    }

    /// Subscribe to the participants subtree
    pub async fn subscribe(&self) -> Result<RosterSubscription> {
        let inner = self
            .relay
            .subscribe(&RelayPath::participants(&self.meeting_id))
            .await?;
        Ok(RosterSubscription { inner })
    }

    /// Release a roster subscription
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.relay.unsubscribe(id).await
    }

    async fn write_entry(&self, entry: &RosterEntry) -> Result<()> {
        let path = RelayPath::participant(&self.meeting_id, &self.local_id);
        self.relay.write(&path, serde_json::to_value(entry)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{MemoryRelay, RelayFaults};
    use serde_json::json;

    #[test]
    fn test_entry_wire_format() {
        let entry = RosterEntry {
            joined_at: 1,
            display_name: "Dr. A".to_string(),
            is_muted: true,
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"joinedAt": 1, "displayName": "Dr. A", "isMuted": true})
        );
    }

    #[test]
    fn test_parse_skips_malformed() {
        let snapshot = Some(json!({
            "a1": {"joinedAt": 1, "displayName": "A", "isMuted": false},
            "b1": "garbage",
            "c1": {"joinedAt": 2, "displayName": "C"}
        }));
        let roster = parse_roster(&snapshot);
        assert_eq!(roster.keys().collect::<Vec<_>>(), vec!["a1", "c1"]);
        assert!(!roster["c1"].is_muted);
        assert!(parse_roster(&None).is_empty());
    }

    #[tokio::test]
    async fn test_join_mute_leave() {
        let relay = Arc::new(MemoryRelay::new());
        let client = RosterClient::new(relay.clone(), "M1", "a1");
        let mut sub = client.subscribe().await.unwrap();
        assert!(sub.next().await.unwrap().is_empty());

        client.join(RosterEntry::joining("A")).await.unwrap();
        let roster = sub.next().await.unwrap();
        assert_eq!(roster["a1"].display_name, "A");

        client.set_muted(true).await.unwrap();
        assert!(sub.next().await.unwrap()["a1"].is_muted);

        client.leave().await.unwrap();
        assert!(sub.next().await.unwrap().is_empty());
        client.unsubscribe(sub.id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_mute_after_failed_join_keeps_display_name() {
        let relay = Arc::new(MemoryRelay::new());
        let client = RosterClient::new(relay.clone(), "M1", "a1");
        relay.set_faults(RelayFaults {
            fail_writes: true,
            ..Default::default()
        });
        assert!(client.join(RosterEntry::joining("Alice")).await.is_err());

        relay.set_faults(RelayFaults::default());
        client.set_muted(true).await.unwrap();
        let entry = relay.snapshot(&RelayPath::participant("M1", "a1")).unwrap();
        assert_eq!(entry["displayName"], "Alice");
        assert_eq!(entry["isMuted"], true);
    }

    #[tokio::test]
    async fn test_mute_without_entry_is_refused() {
        let relay = Arc::new(MemoryRelay::new());
        let client = RosterClient::new(relay.clone(), "M1", "a1");
        assert!(matches!(
            client.set_muted(true).await,
            Err(Error::PeerNotFound(_))
        ));
        assert!(relay.snapshot(&RelayPath::participant("M1", "a1")).is_none());
    }

    #[tokio::test]
    async fn test_create_meeting_writes_created_at() {
        let relay = Arc::new(MemoryRelay::new());
        let client = RosterClient::new(relay.clone(), "M1", "a1");
        client.create_meeting().await.unwrap();
        let created = relay.snapshot(&RelayPath::meeting("M1").child("createdAt"));
        assert!(created.unwrap().as_i64().unwrap() > 0);
    }
}
