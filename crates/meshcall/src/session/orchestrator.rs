//! Call session: owns local media, the roster mirror and one PeerLink per
//! remote participant
//!
//! Two dispatcher tasks feed the session: roster snapshots and inbound
//! signaling envelopes. Neither does per-peer work inline. Roster changes
//! spawn one task per joined or departed participant, and envelopes are
//! handed to a per-sender route task that creates the sender's PeerLink on
//! demand and delivers that sender's envelopes in order. Negotiation itself
//! runs inside each PeerLink's task, so a slow connection setup with one
//! participant never holds up another.

use super::events::{AppState, CameraSwitch, SessionEvent, TeardownReason};
use super::lifecycle::{Lifecycle, TeardownReport, TeardownSteps};
use crate::config::CallConfig;
use crate::media::{LocalMedia, MediaCapture, MediaEngine};
use crate::peer::{NegotiationState, PeerContext, PeerLink};
use crate::roster::{Roster, RosterClient, RosterEntry, RosterSubscription};
use crate::signaling::{
    Relay, SignalSink, SignalingEnvelope, SignalingTransport, SubscriptionId, TransportEvent,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Collaborators a session is built from
#[derive(Clone)]
pub struct SessionDeps {
    /// Realtime relay carrying roster and signaling
    pub relay: Arc<dyn Relay>,
    /// Peer connection factory
    pub engine: Arc<dyn MediaEngine>,
    /// Local camera/microphone
    pub capture: Arc<dyn MediaCapture>,
}

type PeerSlot = Arc<OnceCell<PeerLink>>;

/// A joined call
///
/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: CallConfig,
    meeting_id: String,
    local_id: String,
    engine: Arc<dyn MediaEngine>,
    transport: Arc<SignalingTransport>,
    roster: RosterClient,
    roster_subscription: Mutex<Option<SubscriptionId>>,
    media: LocalMedia,
    peers: Mutex<HashMap<String, PeerSlot>>,
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<SignalingEnvelope>>>,
    departed: Mutex<HashSet<String>>,
    participants: Mutex<Roster>,
    peer_ctx: Arc<PeerContext>,
    events: mpsc::UnboundedSender<SessionEvent>,
    lifecycle: Lifecycle,
    mute_lock: tokio::sync::Mutex<()>,
    muted: AtomicBool,
    app_state: Mutex<AppState>,
}

impl CallSession {
    /// Join `meeting_id` as `local_id`
    ///
    /// Acquires local media, writes the local roster entry, then starts
    /// listening for signaling and roster changes. PeerLink creation is
    /// started for every participant already present; each runs on its own
    /// task, so a stalled connection does not hold up the join.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfig` for a bad configuration or empty ids, and
    /// `Error::MediaAcquisition` when local media cannot be captured (no
    /// PeerLinks are created in that case). Relay failures while joining
    /// are logged and do not fail the join.
    #[instrument(skip_all, fields(meeting_id = %meeting_id, local_id = %local_id))]
    pub async fn join(
        config: CallConfig,
        deps: SessionDeps,
        meeting_id: &str,
        local_id: &str,
        display_name: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;
        if meeting_id.is_empty() || local_id.is_empty() {
            return Err(Error::InvalidConfig(
                "meeting_id and local_id must not be empty".to_string(),
            ));
        }

        let media = deps
            .capture
            .acquire(&config.capture)
            .await
            .map_err(|e| match e {
                Error::MediaAcquisition(_) => e,
                other => Error::MediaAcquisition(other.to_string()),
            })?;
        info!("Local media acquired ({} tracks)", media.tracks().len());

        let roster = RosterClient::new(Arc::clone(&deps.relay), meeting_id, local_id);
        if config.create_meeting {
            if let Err(e) = roster.create_meeting().await {
                warn!("Could not create meeting record: {}", e);
            }
        }
        if let Err(e) = roster.join(RosterEntry::joining(display_name)).await {
            warn!("Could not write roster entry: {}", e);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let lifecycle = Lifecycle::new(events_tx.clone());
        let transport = SignalingTransport::new(Arc::clone(&deps.relay), meeting_id, local_id);
        let signals: Arc<dyn SignalSink> = transport.clone();
        let peer_ctx = Arc::new(PeerContext {
            local_id: local_id.to_string(),
            signals,
            events: events_tx.clone(),
            closing: lifecycle.closing_flag(),
            degraded_after_failures: config.degraded_after_failures,
            max_ice_restarts: config.max_ice_restarts,
        });

        let inner = Arc::new(SessionInner {
            config,
            meeting_id: meeting_id.to_string(),
            local_id: local_id.to_string(),
            engine: deps.engine,
            transport,
            roster,
            roster_subscription: Mutex::new(None),
            media,
            peers: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            departed: Mutex::new(HashSet::new()),
            participants: Mutex::new(Roster::new()),
            peer_ctx,
            events: events_tx,
            lifecycle,
            mute_lock: tokio::sync::Mutex::new(()),
            muted: AtomicBool::new(false),
            app_state: Mutex::new(AppState::Active),
        });

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        match inner.transport.subscribe(signal_tx).await {
            Ok(()) => spawn_signaling_dispatcher(&inner, signal_rx),
            Err(e) => error!("Signaling subscription failed: {}", e),
        }

        match inner.roster.subscribe().await {
            Ok(mut subscription) => {
                *inner.roster_subscription.lock() = Some(subscription.id());
                if let Some(initial) = subscription.next().await {
                    inner.on_roster(initial);
                }
                spawn_roster_dispatcher(&inner, subscription);
            }
            Err(e) => error!("Roster subscription failed: {}", e),
        }

        info!("Joined meeting");
        Ok((Self { inner }, events_rx))
    }

    /// Local participant id
    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Meeting id
    pub fn meeting_id(&self) -> &str {
        &self.inner.meeting_id
    }

    /// PeerLink for `remote_id`, creating it if needed
    ///
    /// At most one PeerLink exists per remote participant; concurrent
    /// callers for the same id share one creation.
    ///
    /// # Errors
    ///
    /// `Error::SessionClosed` once teardown has started, or
    /// `Error::PeerConnectionError` when the mesh is full or the engine
    /// cannot create a connection.
    pub async fn ensure_peer_link(&self, remote_id: &str) -> Result<PeerLink> {
        self.inner.ensure_peer_link(remote_id).await
    }

    /// Ask the PeerLink for `remote_id` to start negotiating
    ///
    /// A no-op unless this side wins the tie-break and the link is still New.
    pub async fn initiate(&self, remote_id: &str) -> Result<()> {
        self.inner.initiate(remote_id).await
    }

    /// Route one inbound envelope to its sender's PeerLink
    pub async fn handle_envelope(&self, envelope: SignalingEnvelope) -> Result<()> {
        self.inner.handle_envelope(envelope).await
    }

    /// Mute or unmute the local microphone and publish the flag
    ///
    /// # Errors
    ///
    /// `Error::SessionClosed` after teardown. A failed roster write is
    /// logged; the local track state still changes.
    #[instrument(skip(self), fields(local_id = %self.inner.local_id))]
    pub async fn toggle_mute(&self, muted: bool) -> Result<()> {
        let inner = &self.inner;
        if inner.lifecycle.is_closing() {
            return Err(Error::SessionClosed("cannot mute".to_string()));
        }

        let _guard = inner.mute_lock.lock().await;
        inner.media.set_audio_enabled(!muted);
        inner.muted.store(muted, Ordering::SeqCst);
        info!("Microphone {}", if muted { "muted" } else { "unmuted" });

        if let Err(e) = inner.roster.set_muted(muted).await {
            warn!("Mute flag not published: {}", e);
        }
        Ok(())
    }

    /// Current local mute flag
    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    /// Flip the local camera between front and back
    ///
    /// # Errors
    ///
    /// `Error::SessionClosed` after teardown.
    pub fn switch_camera(&self) -> Result<CameraSwitch> {
        if self.inner.lifecycle.is_closing() {
            return Err(Error::SessionClosed("cannot switch camera".to_string()));
        }
        match self.inner.media.switch_camera() {
            Ok(facing) => {
                info!("Camera switched to {:?}", facing);
                Ok(CameraSwitch::Switched(facing))
            }
            Err(e) => {
                debug!("Camera switch unavailable: {}", e);
                Ok(CameraSwitch::Unsupported)
            }
        }
    }

    /// Leave the call
    pub async fn leave(&self) -> TeardownReport {
        self.inner.teardown(TeardownReason::Leave).await
    }

    /// Report a host application state change
    ///
    /// Leaving the foreground tears the session down; returns the teardown
    /// report when that happens.
    pub async fn handle_app_state(&self, next: AppState) -> Option<TeardownReport> {
        let previous = std::mem::replace(&mut *self.inner.app_state.lock(), next);
        if previous == AppState::Active && next != AppState::Active {
            info!("App left the foreground ({:?})", next);
            return Some(self.inner.teardown(TeardownReason::Backgrounded).await);
        }
        None
    }

    /// Tear down after an unrecoverable error
    pub async fn fail(&self, reason: impl Into<String>) -> TeardownReport {
        self.inner.teardown(TeardownReason::Fatal(reason.into())).await
    }

    /// Tear down for `reason`; idempotent, every trigger ends up here
    pub async fn teardown(&self, reason: TeardownReason) -> TeardownReport {
        self.inner.teardown(reason).await
    }

    /// True once teardown has finished
    pub fn is_torn_down(&self) -> bool {
        self.inner.lifecycle.is_torn_down()
    }

    /// Negotiation state of the PeerLink for `remote_id`
    pub fn peer_state(&self, remote_id: &str) -> Option<NegotiationState> {
        self.peer_link(remote_id).map(|link| link.state())
    }

    /// Existing PeerLink for `remote_id`
    pub fn peer_link(&self, remote_id: &str) -> Option<PeerLink> {
        self.inner
            .peers
            .lock()
            .get(remote_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Remote participants with a live PeerLink, sorted
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .peers
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Last roster snapshot, local entry included
    pub fn participants(&self) -> Roster {
        self.inner.participants.lock().clone()
    }

    /// Local media
    pub fn media(&self) -> &LocalMedia {
        &self.inner.media
    }
}

impl SessionInner {
    async fn teardown(self: &Arc<Self>, reason: TeardownReason) -> TeardownReport {
        let steps: Arc<dyn TeardownSteps> = self.clone();
        self.lifecycle.teardown(reason, steps).await
    }

    fn spawn_fail(self: &Arc<Self>, reason: &str) {
        let inner = Arc::clone(self);
        let reason = TeardownReason::Fatal(reason.to_string());
        tokio::spawn(async move {
            inner.teardown(reason).await;
        });
    }

    async fn ensure_peer_link(&self, remote_id: &str) -> Result<PeerLink> {
        if self.lifecycle.is_closing() {
            return Err(Error::SessionClosed(format!("no PeerLink for {}", remote_id)));
        }
        if remote_id == self.local_id {
            return Err(Error::PeerConnectionError(
                "cannot link to the local participant".to_string(),
            ));
        }

        let slot = {
            let mut peers = self.peers.lock();
            if let Some(slot) = peers.get(remote_id).cloned() {
                slot
            } else {
                if peers.len() >= self.config.max_peers as usize {
                    error!("Mesh full, refusing {}", remote_id);
                    return Err(Error::PeerConnectionError(format!(
                        "Maximum peer limit reached ({})",
                        self.config.max_peers
                    )));
                }
                let slot = PeerSlot::default();
                peers.insert(remote_id.to_string(), Arc::clone(&slot));
                slot
            }
        };

        let link = match slot
            .get_or_try_init(|| self.create_link(remote_id))
            .await
        {
            Ok(link) => link.clone(),
            Err(e) => {
                self.forget(remote_id, &slot);
                return Err(e);
            }
        };

        // Teardown or departure may have raced the creation
        if self.lifecycle.is_closing() || !self.is_registered(remote_id, &slot) {
            self.forget(remote_id, &slot);
            let _ = link.close(self.config.close_timeout()).await;
            return Err(Error::SessionClosed(format!(
                "PeerLink for {} created after it was released",
                remote_id
            )));
        }
        Ok(link)
    }

    async fn create_link(&self, remote_id: &str) -> Result<PeerLink> {
        let connection = self
            .engine
            .create_connection(remote_id, &self.config.ice_servers)
            .await?;
        let link =
            PeerLink::spawn(Arc::clone(&self.peer_ctx), remote_id, connection, &self.media).await?;
        info!("PeerLink for {} ready", remote_id);
        Ok(link)
    }

    fn is_registered(&self, remote_id: &str, slot: &PeerSlot) -> bool {
        self.peers
            .lock()
            .get(remote_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drop `slot` from the peer map if it is still the registered one
    fn forget(&self, remote_id: &str, slot: &PeerSlot) {
        let mut peers = self.peers.lock();
        if peers
            .get(remote_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            peers.remove(remote_id);
        }
    }

    async fn initiate(&self, remote_id: &str) -> Result<()> {
        let link = self.ensure_peer_link(remote_id).await?;
        link.initiate();
        Ok(())
    }

    async fn handle_envelope(&self, envelope: SignalingEnvelope) -> Result<()> {
        if envelope.receiver_id != self.local_id {
            return Err(Error::SignalingError(format!(
                "envelope addressed to {}",
                envelope.receiver_id
            )));
        }
        if self.departed.lock().contains(&envelope.sender_id) {
            return Err(Error::PeerNotFound(format!(
                "{} has left the meeting",
                envelope.sender_id
            )));
        }
        debug!(
            "{} from {} ({})",
            envelope.payload.kind(),
            envelope.sender_id,
            envelope.key
        );
        let link = self.ensure_peer_link(&envelope.sender_id).await?;
        link.deliver(envelope.payload);
        Ok(())
    }

    /// Hand `envelope` to its sender's route task, spawning it on first use
    fn route_envelope(self: &Arc<Self>, envelope: SignalingEnvelope) {
        if self.departed.lock().contains(&envelope.sender_id) {
            debug!(
                "Ignoring {} from departed {}",
                envelope.payload.kind(),
                envelope.sender_id
            );
            return;
        }
        let mut routes = self.routes.lock();
        let route = routes
            .entry(envelope.sender_id.clone())
            .or_insert_with(|| spawn_sender_route(self, &envelope.sender_id));
        if let Err(mpsc::error::SendError(envelope)) = route.send(envelope) {
            warn!("Route for {} closed, envelope dropped", envelope.sender_id);
        }
    }

    fn on_roster(self: &Arc<Self>, roster: Roster) {
        let (joined, left) = {
            let mut current = self.participants.lock();
            let joined: Vec<String> = roster
                .keys()
                .filter(|id| **id != self.local_id && !current.contains_key(*id))
                .cloned()
                .collect();
            let left: Vec<String> = current
                .keys()
                .filter(|id| **id != self.local_id && !roster.contains_key(*id))
                .cloned()
                .collect();
            *current = roster.clone();
            (joined, left)
        };
        debug!(
            "Roster: {} participants, {} joined, {} left",
            roster.len(),
            joined.len(),
            left.len()
        );
        let _ = self.events.send(SessionEvent::RosterChanged(roster));

        if !joined.is_empty() {
            let mut departed = self.departed.lock();
            for remote_id in &joined {
                departed.remove(remote_id);
            }
        }
        for remote_id in left {
            let slot = self.unregister(&remote_id);
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.close_departed(&remote_id, slot).await });
        }
        if !joined.is_empty() {
            self.spawn_initiations(joined);
        }
    }

    /// Create a PeerLink for each id on its own task, then initiate
    /// `initiate_stagger` apart
    fn spawn_initiations(self: &Arc<Self>, remote_ids: Vec<String>) {
        let stagger = self.config.initiate_stagger();
        for (index, remote_id) in remote_ids.into_iter().enumerate() {
            let session = Arc::downgrade(self);
            let delay = stagger * index as u32;
            let span = info_span!("initiate", local_id = %self.local_id, remote_id = %remote_id);
            tokio::spawn(
                async move {
                    let Some(inner) = session.upgrade() else {
                        return;
                    };
                    if let Err(e) = inner.ensure_peer_link(&remote_id).await {
                        warn!("No PeerLink for {}: {}", remote_id, e);
                        return;
                    }
                    drop(inner);

                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let Some(inner) = session.upgrade() else {
                        return;
                    };
                    if inner.lifecycle.is_closing() {
                        return;
                    }
                    if let Err(e) = inner.initiate(&remote_id).await {
                        warn!("Could not initiate with {}: {}", remote_id, e);
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Forget a departed participant's route and PeerLink slot
    ///
    /// Envelopes from the departed id are refused until it rejoins.
    fn unregister(&self, remote_id: &str) -> Option<PeerSlot> {
        self.departed.lock().insert(remote_id.to_string());
        self.routes.lock().remove(remote_id);
        self.peers.lock().remove(remote_id)
    }

    async fn close_departed(&self, remote_id: &str, slot: Option<PeerSlot>) {
        if let Some(link) = slot.as_ref().and_then(|slot| slot.get()) {
            if let Err(e) = link.close(self.config.close_timeout()).await {
                warn!("Closing PeerLink for {}: {}", remote_id, e);
            }
        }
        info!("{} left the meeting", remote_id);
        let _ = self.events.send(SessionEvent::ParticipantLeft {
            peer_id: remote_id.to_string(),
        });
    }
}

#[async_trait]
impl TeardownSteps for SessionInner {
    async fn unsubscribe(&self) -> Result<()> {
        let signaling = self.transport.unsubscribe().await;
        self.routes.lock().clear();
        let subscription = self.roster_subscription.lock().take();
        let roster = match subscription {
            Some(id) => self.roster.unsubscribe(id).await,
            None => Ok(()),
        };
        signaling.and(roster)
    }

    async fn close_peers(&self) -> Result<usize> {
        let slots: Vec<(String, PeerSlot)> = self.peers.lock().drain().collect();
        let links: Vec<PeerLink> = slots
            .iter()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();

        let timeout = self.config.close_timeout();
        let results = futures::future::join_all(links.iter().map(|link| link.close(timeout))).await;
        let stuck: Vec<&str> = links
            .iter()
            .zip(&results)
            .filter(|(_, result)| result.is_err())
            .map(|(link, _)| link.remote_id())
            .collect();
        if !stuck.is_empty() {
            return Err(Error::PeerConnectionError(format!(
                "no close acknowledgement from {}",
                stuck.join(", ")
            )));
        }
        Ok(links.len())
    }

    async fn stop_media(&self) -> Result<()> {
        if self.media.stop_all() {
            debug!("Local tracks stopped");
        }
        Ok(())
    }

    async fn leave_roster(&self) -> Result<()> {
        self.roster.leave().await
    }
}

fn spawn_signaling_dispatcher(
    inner: &Arc<SessionInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let session = Arc::downgrade(inner);
    let span = info_span!("signaling_dispatch", local_id = %inner.local_id);
    tokio::spawn(
        async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = session.upgrade() else {
                    return;
                };
                match event {
                    TransportEvent::Envelope(envelope) => inner.route_envelope(envelope),
                    TransportEvent::SubscriptionLost => {
                        if !inner.lifecycle.is_closing() {
                            inner.spawn_fail("signaling subscription lost");
                        }
                        return;
                    }
                }
            }
        }
        .instrument(span),
    );
}

/// Serialized inbound handling for one sender
///
/// Ends once the session is gone, closing, or the route is dropped.
fn spawn_sender_route(
    inner: &Arc<SessionInner>,
    sender_id: &str,
) -> mpsc::UnboundedSender<SignalingEnvelope> {
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
    let session = Arc::downgrade(inner);
    let span = info_span!("sender_route", local_id = %inner.local_id, sender_id = %sender_id);
    tokio::spawn(
        async move {
            while let Some(envelope) = rx.recv().await {
                let Some(inner) = session.upgrade() else {
                    return;
                };
                if inner.lifecycle.is_closing() {
                    return;
                }
                if let Err(e) = inner.handle_envelope(envelope).await {
                    warn!("Envelope dropped: {}", e);
                }
            }
        }
        .instrument(span),
    );
    tx
}

fn spawn_roster_dispatcher(inner: &Arc<SessionInner>, mut subscription: RosterSubscription) {
    let session: Weak<SessionInner> = Arc::downgrade(inner);
    let span = info_span!("roster_dispatch", local_id = %inner.local_id);
    tokio::spawn(
        async move {
            while let Some(roster) = subscription.next().await {
                let Some(inner) = session.upgrade() else {
                    return;
                };
                if inner.lifecycle.is_closing() {
                    return;
                }
                inner.on_roster(roster);
            }
            if let Some(inner) = session.upgrade() {
                if !inner.lifecycle.is_closing() {
                    warn!("Roster subscription closed by relay");
                    inner.spawn_fail("roster subscription lost");
                }
            }
        }
        .instrument(span),
    );
}
