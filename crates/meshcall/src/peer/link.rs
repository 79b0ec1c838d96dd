//! PeerLink: negotiation with one remote participant
//!
//! Each PeerLink is a task owning one peer connection, its negotiation
//! state and its candidate buffer. Commands from the session (initiate,
//! deliver an envelope, close) and callbacks from the engine (local
//! candidate, ICE state, inbound track) are both queued into that task, so
//! all state transitions for one peer are serialized while different peers
//! proceed independently.
//!
//! The [`PeerLink`] handle is cheap to clone; the negotiation state is
//! published through a `watch` channel.

use super::candidates::CandidateBuffer;
use super::state::{is_offerer, NegotiationState};
use crate::media::{EngineEvent, IceConnectionState, LocalMedia, PeerConnectionHandle};
use crate::session::SessionEvent;
use crate::signaling::{SessionDescription, SignalPayload, SignalSink};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Settings and channels shared by every PeerLink of one session
pub struct PeerContext {
    /// Local participant id (glare tie-break)
    pub local_id: String,
    /// Outbound signaling
    pub signals: Arc<dyn SignalSink>,
    /// Session event channel
    pub events: mpsc::UnboundedSender<SessionEvent>,
    /// Set once session teardown begins
    pub closing: Arc<AtomicBool>,
    /// Consecutive ICE failures before `PeerDegraded`
    pub degraded_after_failures: u32,
    /// Consecutive ICE restarts before giving up
    pub max_ice_restarts: u32,
}

impl PeerContext {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

enum Command {
    Initiate,
    Deliver(SignalPayload),
    Close(oneshot::Sender<()>),
}

/// Handle to one remote participant's negotiation task
#[derive(Clone)]
pub struct PeerLink {
    remote_id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<NegotiationState>,
}

impl PeerLink {
    /// Attach local tracks to `connection`, route its callbacks and start the task
    ///
    /// # Arguments
    ///
    /// * `ctx` - Session-wide context
    /// * `remote_id` - Remote participant id
    /// * `connection` - Connection exclusively owned by this PeerLink
    /// * `media` - Local media whose tracks are sent to the remote side
    ///
    /// # Errors
    ///
    /// The engine's error if a track cannot be added; the connection is
    /// closed before returning.
    pub async fn spawn(
        ctx: Arc<PeerContext>,
        remote_id: &str,
        connection: Arc<dyn PeerConnectionHandle>,
        media: &LocalMedia,
    ) -> Result<Self> {
        for track in media.tracks() {
            if let Err(e) = connection
                .add_track(Arc::clone(track), media.stream_id())
                .await
            {
                let _ = connection.close().await;
                return Err(e);
            }
        }

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        connection.set_event_sink(Some(engine_tx));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::New);

        let actor = PeerActor {
            ctx,
            remote_id: remote_id.to_string(),
            connection,
            state: state_tx,
            candidates: CandidateBuffer::new(),
            ice_failures: 0,
            restarts: 0,
            degraded: false,
        };
        let span = info_span!("peer_link", peer_id = %remote_id);
        tokio::spawn(actor.run(command_rx, engine_rx).instrument(span));

        debug!("PeerLink for {} created", remote_id);
        Ok(Self {
            remote_id: remote_id.to_string(),
            commands: command_tx,
            state: state_rx,
        })
    }

    /// Remote participant id
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Current negotiation state
    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Start negotiation if this side is the offerer and nothing has happened yet
    pub fn initiate(&self) {
        self.send(Command::Initiate);
    }

    /// Hand a received payload to the negotiation task
    pub fn deliver(&self, payload: SignalPayload) {
        self.send(Command::Deliver(payload));
    }

    /// Wait until the state equals `target`
    ///
    /// # Errors
    ///
    /// `Error::PeerConnectionError` on timeout or if the task ends first.
    pub async fn wait_for_state(&self, target: NegotiationState, timeout: Duration) -> Result<()> {
        let mut rx = self.state.clone();
        let wait = async move {
            loop {
                let current = *rx.borrow_and_update();
                if current == target {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    let last = *rx.borrow();
                    return if last == target {
                        Ok(())
                    } else {
                        Err(Error::PeerConnectionError(format!(
                            "peer {} stopped in {}",
                            self.remote_id, last
                        )))
                    };
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            Error::PeerConnectionError(format!(
                "timed out waiting for peer {} to reach {}",
                self.remote_id, target
            ))
        })?
    }

    /// Close the connection and stop the task, waiting up to `timeout` for it to finish
    ///
    /// # Errors
    ///
    /// `Error::PeerConnectionError` if the task does not acknowledge in time.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Close(ack_tx)).is_err() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::PeerConnectionError(format!(
                "peer {} did not acknowledge close",
                self.remote_id
            ))),
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("PeerLink for {} already stopped", self.remote_id);
        }
    }
}

struct PeerActor {
    ctx: Arc<PeerContext>,
    remote_id: String,
    connection: Arc<dyn PeerConnectionHandle>,
    state: watch::Sender<NegotiationState>,
    candidates: CandidateBuffer,
    ice_failures: u32,
    restarts: u32,
    degraded: bool,
}

impl PeerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Initiate) => self.initiate().await,
                    Some(Command::Deliver(payload)) => self.deliver(payload).await,
                    Some(Command::Close(ack)) => {
                        self.close().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => break,
                },
                Some(event) = engine_events.recv() => self.on_engine_event(event).await,
            }
        }

        // Every handle dropped without an explicit close
        self.close().await;
    }

    fn current(&self) -> NegotiationState {
        *self.state.borrow()
    }

    fn set_state(&self, next: NegotiationState) {
        let previous = self.current();
        if previous == next || previous.is_terminal() {
            return;
        }
        self.state.send_replace(next);
        debug!("Negotiation with {}: {} -> {}", self.remote_id, previous, next);
    }

    fn halted(&self) -> bool {
        if self.ctx.is_closing() || self.current().is_terminal() {
            debug!("Ignoring work for {}: session closing", self.remote_id);
            return true;
        }
        false
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event);
    }

    async fn initiate(&mut self) {
        if self.halted() {
            return;
        }
        let state = self.current();
        if state.is_past_new() {
            debug!("initiate ignored for {} in {}", self.remote_id, state);
            return;
        }
        if !is_offerer(&self.ctx.local_id, &self.remote_id) {
            debug!("Waiting for {} to offer", self.remote_id);
            return;
        }
        if let Err(e) = self.send_offer(false).await {
            error!("Failed to offer to {}: {}", self.remote_id, e);
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<()> {
        let offer = self.connection.create_offer(ice_restart).await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.candidates.begin_round();
        self.set_state(NegotiationState::HaveLocalOffer);
        self.ctx
            .signals
            .send(&self.remote_id, SignalPayload::Offer { sdp: offer });
        info!(
            "Sent {}offer to {}",
            if ice_restart { "ICE restart " } else { "" },
            self.remote_id
        );
        Ok(())
    }

    async fn deliver(&mut self, payload: SignalPayload) {
        if self.halted() {
            return;
        }
        match payload {
            SignalPayload::Offer { sdp } => self.on_offer(sdp).await,
            SignalPayload::Answer { sdp } => self.on_answer(sdp).await,
            SignalPayload::IceCandidate { candidate } => {
                if let Err(e) = self
                    .candidates
                    .enqueue(self.connection.as_ref(), candidate)
                    .await
                {
                    warn!("Candidate from {} rejected: {}", self.remote_id, e);
                }
            }
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) {
        if self.current() == NegotiationState::HaveLocalOffer {
            warn!(
                "Offer from {} while holding a local offer, rolling back",
                self.remote_id
            );
            match self.connection.rollback().await {
                Ok(()) => self.set_state(NegotiationState::New),
                Err(e) => warn!("Rollback towards {} failed, continuing: {}", self.remote_id, e),
            }
        }

        if let Err(e) = self.connection.set_remote_description(offer).await {
            error!("Failed to apply offer from {}: {}", self.remote_id, e);
            return;
        }
        self.set_state(NegotiationState::HaveRemoteOffer);

        let answer = match self.create_local_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                error!("Failed to answer {}: {}", self.remote_id, e);
                return;
            }
        };
        self.ctx
            .signals
            .send(&self.remote_id, SignalPayload::Answer { sdp: answer });
        self.set_state(NegotiationState::Stable);

        let report = self.candidates.flush(self.connection.as_ref()).await;
        debug!(
            "Flushed {} buffered candidates from {} ({} rejected)",
            report.applied, self.remote_id, report.rejected
        );
    }

    async fn create_local_answer(&self) -> Result<SessionDescription> {
        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        let state = self.current();
        if state != NegotiationState::HaveLocalOffer {
            warn!("Unexpected answer from {} in {}", self.remote_id, state);
            return;
        }
        if let Err(e) = self.connection.set_remote_description(answer).await {
            error!("Failed to apply answer from {}: {}", self.remote_id, e);
            return;
        }
        self.set_state(NegotiationState::Stable);

        let report = self.candidates.flush(self.connection.as_ref()).await;
        debug!(
            "Flushed {} buffered candidates from {} ({} rejected)",
            report.applied, self.remote_id, report.rejected
        );
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        if self.halted() {
            return;
        }
        match event {
            EngineEvent::LocalCandidate(candidate) => self
                .ctx
                .signals
                .send(&self.remote_id, SignalPayload::IceCandidate { candidate }),
            EngineEvent::RemoteTrack(track) => {
                info!("Remote {} track from {}", track.kind, self.remote_id);
                self.emit(SessionEvent::RemoteMedia {
                    peer_id: self.remote_id.clone(),
                    track,
                });
            }
            EngineEvent::IceStateChanged(ice) => self.on_ice_state(ice).await,
        }
    }

    async fn on_ice_state(&mut self, ice: IceConnectionState) {
        debug!("ICE with {} is {:?}", self.remote_id, ice);
        if ice.is_connected() {
            self.ice_failures = 0;
            self.restarts = 0;
            if self.current() == NegotiationState::Failed {
                self.set_state(NegotiationState::Stable);
            }
            if std::mem::take(&mut self.degraded) {
                info!("Connectivity with {} recovered", self.remote_id);
                self.emit(SessionEvent::PeerRecovered {
                    peer_id: self.remote_id.clone(),
                });
            }
            return;
        }
        if ice != IceConnectionState::Failed {
            return;
        }

        self.ice_failures += 1;
        warn!(
            "ICE with {} failed ({} in a row)",
            self.remote_id, self.ice_failures
        );
        if self.ice_failures >= self.ctx.degraded_after_failures && !self.degraded {
            self.degraded = true;
            self.emit(SessionEvent::PeerDegraded {
                peer_id: self.remote_id.clone(),
                consecutive_failures: self.ice_failures,
            });
        }

        if !is_offerer(&self.ctx.local_id, &self.remote_id) {
            debug!("Waiting for {} to restart ICE", self.remote_id);
            return;
        }
        match self.current() {
            NegotiationState::Failed => return,
            NegotiationState::HaveLocalOffer => {
                debug!("ICE restart towards {} already in flight", self.remote_id);
                return;
            }
            _ => {}
        }
        if self.restarts >= self.ctx.max_ice_restarts {
            let reason = format!("{} ICE restarts without reconnecting", self.restarts);
            self.give_up(reason);
            return;
        }

        self.restarts += 1;
        info!(
            "Restarting ICE with {} (attempt {})",
            self.remote_id, self.restarts
        );
        if let Err(e) = self.send_offer(true).await {
            self.give_up(e.to_string());
        }
    }

    fn give_up(&mut self, reason: String) {
        error!("Connectivity with {} lost: {}", self.remote_id, reason);
        self.set_state(NegotiationState::Failed);
        self.emit(SessionEvent::PeerFailed {
            peer_id: self.remote_id.clone(),
            reason,
        });
    }

    async fn close(&mut self) {
        self.connection.set_event_sink(None);
        if let Err(e) = self.connection.close().await {
            warn!("Closing connection to {} failed: {}", self.remote_id, e);
        }
        let dropped = self.candidates.discard();
        if dropped > 0 {
            debug!("Discarded {} buffered candidates from {}", dropped, self.remote_id);
        }
        self.set_state(NegotiationState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConstraints;
    use crate::media::{MediaCapture, MediaEngine, SimCapture, SimEngine};
    use crate::signaling::IceCandidate;
    use parking_lot::Mutex;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, SignalPayload)>>,
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<&'static str> {
            self.sent.lock().iter().map(|(_, p)| p.kind()).collect()
        }

        fn last_of(&self, kind: &str) -> Option<SessionDescription> {
            self.sent
                .lock()
                .iter()
                .rev()
                .find_map(|(_, payload)| match payload {
                    SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp }
                        if payload.kind() == kind =>
                    {
                        Some(sdp.clone())
                    }
                    _ => None,
                })
        }
    }

    impl SignalSink for RecordingSink {
        fn send(&self, receiver_id: &str, payload: SignalPayload) {
            self.sent.lock().push((receiver_id.to_string(), payload));
        }
    }

    struct Fixture {
        link: PeerLink,
        sink: Arc<RecordingSink>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        engine: SimEngine,
        closing: Arc<AtomicBool>,
    }

    async fn fixture(local: &str, remote: &str, degraded_after: u32, max_restarts: u32) -> Fixture {
        let sink = Arc::new(RecordingSink::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(PeerContext {
            local_id: local.to_string(),
            signals: sink.clone(),
            events: events_tx,
            closing: closing.clone(),
            degraded_after_failures: degraded_after,
            max_ice_restarts: max_restarts,
        });
        let engine = SimEngine::new();
        let connection = engine.create_connection(remote, &[]).await.unwrap();
        let media = SimCapture::new()
            .acquire(&CaptureConstraints::default())
            .await
            .unwrap();
        let link = PeerLink::spawn(ctx, remote, connection, &media).await.unwrap();
        Fixture {
            link,
            sink,
            events,
            engine,
            closing,
        }
    }

    async fn remote_offer() -> SessionDescription {
        SimEngine::new()
            .create_connection("local", &[])
            .await
            .unwrap()
            .create_offer(false)
            .await
            .unwrap()
    }

    async fn wait_event(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        matches: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Drive an offerer link to Stable against a simulated remote
    async fn negotiate_as_offerer(f: &Fixture) {
        f.link.initiate();
        f.link
            .wait_for_state(NegotiationState::HaveLocalOffer, WAIT)
            .await
            .unwrap();
        let offer = f.sink.last_of("offer").unwrap();
        let remote = SimEngine::new().create_connection("a1", &[]).await.unwrap();
        remote.set_remote_description(offer).await.unwrap();
        let answer = remote.create_answer().await.unwrap();
        remote.set_local_description(answer.clone()).await.unwrap();
        f.link.deliver(SignalPayload::Answer { sdp: answer });
        f.link
            .wait_for_state(NegotiationState::Stable, WAIT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_only_smaller_id_offers() {
        let offerer = fixture("a1", "b1", 2, 3).await;
        offerer.link.initiate();
        offerer
            .link
            .wait_for_state(NegotiationState::HaveLocalOffer, WAIT)
            .await
            .unwrap();

        let answerer = fixture("b1", "a1", 2, 3).await;
        answerer.link.initiate();
        answerer.link.close(WAIT).await.unwrap();
        assert!(answerer.sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_initiate_past_new_is_noop() {
        let f = fixture("a1", "b1", 2, 3).await;
        f.link.initiate();
        f.link.initiate();
        f.link
            .wait_for_state(NegotiationState::HaveLocalOffer, WAIT)
            .await
            .unwrap();
        f.link.initiate();
        f.link.close(WAIT).await.unwrap();

        let offers = f.sink.kinds().into_iter().filter(|k| *k == "offer").count();
        assert_eq!(offers, 1);
        assert_eq!(f.engine.connection("b1").unwrap().offer_counts(), (1, 0));
    }

    #[tokio::test]
    async fn test_offer_in_have_local_offer_ends_stable() {
        let f = fixture("a1", "b1", 2, 3).await;
        f.link.initiate();
        f.link
            .wait_for_state(NegotiationState::HaveLocalOffer, WAIT)
            .await
            .unwrap();

        f.link.deliver(SignalPayload::Offer {
            sdp: remote_offer().await,
        });
        f.link
            .wait_for_state(NegotiationState::Stable, WAIT)
            .await
            .unwrap();
        assert!(f.sink.last_of("answer").is_some());
    }

    #[tokio::test]
    async fn test_rollback_failure_is_not_fatal_to_the_link() {
        let f = fixture("a1", "b1", 2, 3).await;
        f.engine.update_faults(|faults| faults.fail_rollback = true);
        f.link.initiate();
        f.link
            .wait_for_state(NegotiationState::HaveLocalOffer, WAIT)
            .await
            .unwrap();

        f.link.deliver(SignalPayload::Offer {
            sdp: remote_offer().await,
        });
        f.link.close(WAIT).await.unwrap();
        assert!(f.sink.last_of("answer").is_none());
    }

    #[tokio::test]
    async fn test_early_candidates_flush_in_order() {
        let f = fixture("b1", "a1", 2, 3).await;
        for n in 0..4 {
            f.link.deliver(SignalPayload::IceCandidate {
                candidate: IceCandidate::new(format!("candidate:{}", n)),
            });
        }
        f.link.deliver(SignalPayload::Offer {
            sdp: remote_offer().await,
        });
        f.link
            .wait_for_state(NegotiationState::Stable, WAIT)
            .await
            .unwrap();
        f.link.close(WAIT).await.unwrap();

        let applied: Vec<_> = f
            .engine
            .connection("a1")
            .unwrap()
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(
            applied,
            vec!["candidate:0", "candidate:1", "candidate:2", "candidate:3"]
        );
    }

    #[tokio::test]
    async fn test_unexpected_answer_is_ignored() {
        let f = fixture("b1", "a1", 2, 3).await;
        f.link.deliver(SignalPayload::Answer {
            sdp: SessionDescription::answer("v=0"),
        });
        f.link.close(WAIT).await.unwrap();
        assert!(f.sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_local_candidates_follow_the_offer() {
        let f = fixture("a1", "b1", 2, 3).await;
        negotiate_as_offerer(&f).await;
        f.link.close(WAIT).await.unwrap();

        let kinds = f.sink.kinds();
        assert_eq!(kinds[0], "offer");
        assert!(kinds[1..].iter().all(|k| *k == "ice-candidate"));
        assert!(kinds.len() > 1);
    }

    #[tokio::test]
    async fn test_restart_failure_reports_peer_failed() {
        let mut f = fixture("a1", "b1", 1, 3).await;
        negotiate_as_offerer(&f).await;

        f.engine.update_faults(|faults| {
            faults.fail_restart_with.insert("b1".to_string());
        });
        f.engine
            .connection("b1")
            .unwrap()
            .emit_ice_state(IceConnectionState::Failed);

        wait_event(&mut f.events, |e| matches!(e, SessionEvent::PeerDegraded { .. })).await;
        let failed =
            wait_event(&mut f.events, |e| matches!(e, SessionEvent::PeerFailed { .. })).await;
        assert!(matches!(failed, SessionEvent::PeerFailed { peer_id, .. } if peer_id == "b1"));
        f.link
            .wait_for_state(NegotiationState::Failed, WAIT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion_fails_peer() {
        let mut f = fixture("a1", "b1", 2, 0).await;
        negotiate_as_offerer(&f).await;

        f.engine
            .connection("b1")
            .unwrap()
            .emit_ice_state(IceConnectionState::Failed);
        wait_event(&mut f.events, |e| matches!(e, SessionEvent::PeerFailed { .. })).await;
        assert_eq!(f.engine.connection("b1").unwrap().offer_counts(), (1, 0));
    }

    #[tokio::test]
    async fn test_ice_restart_offer_is_sent() {
        let f = fixture("a1", "b1", 2, 3).await;
        negotiate_as_offerer(&f).await;

        f.engine
            .connection("b1")
            .unwrap()
            .emit_ice_state(IceConnectionState::Failed);
        f.link
            .wait_for_state(NegotiationState::HaveLocalOffer, WAIT)
            .await
            .unwrap();
        assert_eq!(f.engine.connection("b1").unwrap().offer_counts(), (2, 1));
    }

    #[tokio::test]
    async fn test_answerer_waits_and_recovers() {
        let mut f = fixture("b1", "a1", 2, 3).await;
        f.link.deliver(SignalPayload::Offer {
            sdp: remote_offer().await,
        });
        f.link
            .wait_for_state(NegotiationState::Stable, WAIT)
            .await
            .unwrap();

        let conn = f.engine.connection("a1").unwrap();
        conn.emit_ice_state(IceConnectionState::Failed);
        conn.emit_ice_state(IceConnectionState::Failed);
        let degraded =
            wait_event(&mut f.events, |e| matches!(e, SessionEvent::PeerDegraded { .. })).await;
        assert!(matches!(
            degraded,
            SessionEvent::PeerDegraded { consecutive_failures: 2, .. }
        ));

        conn.emit_ice_state(IceConnectionState::Connected);
        wait_event(&mut f.events, |e| matches!(e, SessionEvent::PeerRecovered { .. })).await;
        assert_eq!(f.link.state(), NegotiationState::Stable);
        assert_eq!(conn.offer_counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let f = fixture("a1", "b1", 2, 3).await;
        f.link.close(WAIT).await.unwrap();
        assert_eq!(f.link.state(), NegotiationState::Closed);

        let conn = f.engine.connection("b1").unwrap();
        assert!(conn.is_closed());
        assert!(!conn.has_event_sink());

        // Closing again is harmless
        f.link.close(WAIT).await.unwrap();
        f.link.initiate();
        assert!(f.sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_closing_session_ignores_work() {
        let f = fixture("a1", "b1", 2, 3).await;
        f.closing.store(true, Ordering::SeqCst);
        f.link.initiate();
        f.link.close(WAIT).await.unwrap();
        assert!(f.sink.kinds().is_empty());
        assert_eq!(f.link.state(), NegotiationState::Closed);
    }
}
