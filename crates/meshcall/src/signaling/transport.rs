//! Signaling transport adapter
//!
//! Maps outbound payloads onto relay writes under
//! `meetings/{meeting}/signaling/{receiver}/{sender}/{key}` and relay
//! snapshots of the local inbox onto delivered [`SignalingEnvelope`]s.
//!
//! Outbound writes go through a single writer task so `send` never waits on
//! the relay and one sender's envelopes land in key order. Inbound entries
//! are delivered per sender in ascending key order and deleted right after
//! delivery (consume-once).

use super::protocol::{KeyGenerator, SignalPayload, SignalingEnvelope};
use super::relay::{Relay, RelayPath, Snapshot, SubscriptionId};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outbound half of the transport, as seen by a PeerLink
pub trait SignalSink: Send + Sync {
    /// Queue `payload` for delivery to `receiver_id`; never blocks
    fn send(&self, receiver_id: &str, payload: SignalPayload);
}

/// What the inbound pump hands to the session
#[derive(Debug)]
pub enum TransportEvent {
    /// One validated envelope addressed to the local participant
    Envelope(SignalingEnvelope),
    /// The relay closed the subscription while it was still wanted
    SubscriptionLost,
}

enum WriterCommand {
    Write(RelayPath, Value),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct InboundState {
    subscription: Option<SubscriptionId>,
    pump: Option<JoinHandle<()>>,
}

/// Adapter between the session and the relay's signaling subtree
pub struct SignalingTransport {
    relay: Arc<dyn Relay>,
    meeting_id: String,
    local_id: String,
    keys: KeyGenerator,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    inbound: Mutex<InboundState>,
    unsubscribed: Arc<AtomicBool>,
}

impl SignalingTransport {
    /// Create a transport for `local_id` in `meeting_id`
    ///
    /// Spawns the outbound writer task, so it must be called inside a Tokio
    /// runtime.
    pub fn new(relay: Arc<dyn Relay>, meeting_id: &str, local_id: &str) -> Arc<Self> {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&relay), writer_rx));

        Arc::new(Self {
            relay,
            meeting_id: meeting_id.to_string(),
            local_id: local_id.to_string(),
            keys: KeyGenerator::new(),
            writer_tx,
            inbound: Mutex::new(InboundState::default()),
            unsubscribed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Local participant id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Meeting id
    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    /// Start delivering envelopes addressed to the local participant
    ///
    /// # Errors
    ///
    /// Returns `Error::SignalingError` if already subscribed, or the relay's
    /// error if the subscription cannot be opened.
    pub async fn subscribe(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        if self.inbound.lock().subscription.is_some() {
            return Err(Error::SignalingError(
                "signaling transport already subscribed".to_string(),
            ));
        }

        let inbox = RelayPath::inbox(&self.meeting_id, &self.local_id);
        let mut subscription = self.relay.subscribe(&inbox).await?;
        info!(
            meeting_id = %self.meeting_id,
            "Signaling subscription open for {}", self.local_id
        );

        let relay = Arc::clone(&self.relay);
        let unsubscribed = Arc::clone(&self.unsubscribed);
        let pump = tokio::spawn(async move {
            let mut delivered: HashSet<(String, String)> = HashSet::new();
            while let Some(snapshot) = subscription.snapshots.recv().await {
                drain_snapshot(&*relay, &inbox, snapshot, &mut delivered, &events).await;
            }
            if !unsubscribed.load(Ordering::SeqCst) {
                warn!("Signaling subscription at {} closed by relay", inbox);
                let _ = events.send(TransportEvent::SubscriptionLost);
            }
        });

        let mut inbound = self.inbound.lock();
        inbound.subscription = Some(subscription.id);
        inbound.pump = Some(pump);
        Ok(())
    }

    /// Stop delivery and release the relay subscription
    ///
    /// Idempotent: a second call finds nothing to release and returns `Ok`.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.unsubscribed.store(true, Ordering::SeqCst);
        let (subscription, pump) = {
            let mut inbound = self.inbound.lock();
            (inbound.subscription.take(), inbound.pump.take())
        };

        if let Some(pump) = pump {
            pump.abort();
        }
        match subscription {
            Some(id) => {
                debug!("Releasing signaling subscription {}", id);
                self.relay.unsubscribe(id).await
            }
            None => Ok(()),
        }
    }

    /// Wait until every envelope queued so far has been written (or failed)
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer_tx.send(WriterCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn enqueue(&self, receiver_id: &str, payload: SignalPayload) -> Result<()> {
        let envelope = SignalingEnvelope {
            sender_id: self.local_id.clone(),
            receiver_id: receiver_id.to_string(),
            key: self.keys.next_key(),
            payload,
        };
        let path = RelayPath::envelope(
            &self.meeting_id,
            receiver_id,
            &self.local_id,
            &envelope.key.to_string(),
        );
        let record = envelope.to_record()?;

        debug!(
            peer_id = %receiver_id,
            kind = envelope.payload.kind(),
            "Sending signaling envelope {}", envelope.key
        );
        self.writer_tx
            .send(WriterCommand::Write(path, record))
            .map_err(|_| Error::SignalingError("signaling writer stopped".to_string()))
    }
}

impl SignalSink for SignalingTransport {
    fn send(&self, receiver_id: &str, payload: SignalPayload) {
        let kind = payload.kind();
        if let Err(e) = self.enqueue(receiver_id, payload) {
            error!(peer_id = %receiver_id, kind, "Failed to queue signaling envelope: {}", e);
        }
    }
}

async fn run_writer(relay: Arc<dyn Relay>, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Write(path, value) => {
                if let Err(e) = relay.write(&path, value).await {
                    error!("Signaling write to {} failed: {}", path, e);
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Deliver every not-yet-delivered entry in `snapshot`, then delete it
async fn drain_snapshot(
    relay: &dyn Relay,
    inbox: &RelayPath,
    snapshot: Snapshot,
    delivered: &mut HashSet<(String, String)>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let receiver_id = inbox.last().unwrap_or_default().to_string();
    let senders = match snapshot {
        None => {
            delivered.clear();
            return;
        }
        Some(Value::Object(senders)) => senders,
        Some(other) => {
            warn!("Signaling inbox {} holds a non-object: {}", inbox, other);
            delete_logged(relay, inbox).await;
            return;
        }
    };

    let mut present = HashSet::new();
    for (sender_id, entries) in senders {
        let sender_path = inbox.child(sender_id.as_str());
        let Value::Object(entries) = entries else {
            warn!(peer_id = %sender_id, "Dropping non-object signaling subtree");
            delete_logged(relay, &sender_path).await;
            continue;
        };

        let mut batch = Vec::with_capacity(entries.len());
        for (key, record) in entries {
            present.insert((sender_id.clone(), key.clone()));
            if delivered.contains(&(sender_id.clone(), key.clone())) {
                continue;
            }
            match SignalingEnvelope::from_record(&sender_id, &receiver_id, &key, &record) {
                Ok(envelope) => batch.push((key, envelope)),
                Err(e) => {
                    warn!(peer_id = %sender_id, "Dropping signaling entry {}: {}", key, e);
                    delivered.insert((sender_id.clone(), key.clone()));
                    delete_logged(relay, &sender_path.child(key)).await;
                }
            }
        }

        batch.sort_by_key(|(_, envelope)| envelope.key);
        for (key, envelope) in batch {
            debug!(
                peer_id = %sender_id,
                kind = envelope.payload.kind(),
                "Delivering signaling envelope {}", key
            );
            if events.send(TransportEvent::Envelope(envelope)).is_err() {
                return;
            }
            delivered.insert((sender_id.clone(), key.clone()));
            delete_logged(relay, &sender_path.child(key)).await;
        }
    }

    delivered.retain(|entry| present.contains(entry));
}

async fn delete_logged(relay: &dyn Relay, path: &RelayPath) {
    if let Err(e) = relay.delete(path).await {
        error!("Failed to delete consumed signaling entry {}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::memory::{MemoryRelay, RelayFaults};
    use crate::signaling::protocol::{IceCandidate, SessionDescription};
    use serde_json::json;
    use std::time::Duration;

    fn candidate(n: u32) -> SignalPayload {
        SignalPayload::IceCandidate {
            candidate: IceCandidate::new(format!("candidate:{}", n)),
        }
    }

    async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> SignalingEnvelope {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(TransportEvent::Envelope(envelope))) => envelope,
            other => panic!("expected envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_writes_under_receiver_and_sender() {
        let relay = Arc::new(MemoryRelay::new());
        let transport = SignalingTransport::new(relay.clone(), "M1", "a1");

        transport.send(
            "b1",
            SignalPayload::Offer {
                sdp: SessionDescription::offer("v=0"),
            },
        );
        transport.flush().await;

        let writes = relay.writes_under(&RelayPath::inbox("M1", "b1").child("a1"));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1["data"]["kind"], "offer");
        assert!(writes[0].1["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_delivers_in_key_order_and_consumes() {
        let relay = Arc::new(MemoryRelay::new());
        let inbox = RelayPath::inbox("M1", "b1").child("a1");
        // Written out of order
        for (key, n) in [("0000000000002-000000", 2), ("0000000000001-000001", 1), ("0000000000001-000000", 0)] {
            let record = json!({"timestamp": 1, "data": serde_json::to_value(candidate(n)).unwrap()});
            relay.write(&inbox.child(key), record).await.unwrap();
        }

        let transport = SignalingTransport::new(relay.clone(), "M1", "b1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.subscribe(tx).await.unwrap();

        for n in 0..3 {
            let envelope = next_envelope(&mut rx).await;
            assert_eq!(envelope.sender_id, "a1");
            assert_eq!(envelope.payload, candidate(n));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(relay.snapshot(&RelayPath::inbox("M1", "b1")), None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_redelivery_when_delete_fails() {
        let relay = Arc::new(MemoryRelay::new());
        relay.set_faults(RelayFaults {
            fail_deletes: true,
            ..Default::default()
        });

        let sender = SignalingTransport::new(relay.clone(), "M1", "a1");
        let receiver = SignalingTransport::new(relay.clone(), "M1", "b1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.subscribe(tx).await.unwrap();

        sender.send("b1", candidate(1));
        sender.flush().await;
        assert_eq!(next_envelope(&mut rx).await.payload, candidate(1));

        // A second write re-sends the whole inbox snapshot
        sender.send("b1", candidate(2));
        sender.flush().await;
        assert_eq!(next_envelope(&mut rx).await.payload, candidate(2));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_deleted_not_delivered() {
        let relay = Arc::new(MemoryRelay::new());
        let inbox = RelayPath::inbox("M1", "b1").child("a1");
        relay
            .write(&inbox.child("1"), json!({"timestamp": 1, "data": {"kind": "bye"}}))
            .await
            .unwrap();

        let transport = SignalingTransport::new(relay.clone(), "M1", "b1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.subscribe(tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(relay.deletes_under(&inbox), vec![inbox.child("1")]);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice() {
        let relay = Arc::new(MemoryRelay::new());
        let transport = SignalingTransport::new(relay.clone(), "M1", "b1");
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.subscribe(tx).await.unwrap();
        assert_eq!(relay.subscriber_count(), 1);

        transport.unsubscribe().await.unwrap();
        transport.unsubscribe().await.unwrap();
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lost_subscription_is_reported() {
        let relay = Arc::new(MemoryRelay::new());
        let transport = SignalingTransport::new(relay.clone(), "M1", "b1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.subscribe(tx).await.unwrap();

        relay.disconnect_all();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(TransportEvent::SubscriptionLost)));
    }
}
