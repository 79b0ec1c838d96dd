//! Mesh call test harness
//!
//! Runs several participants in one process over a shared
//! [`MemoryRelay`], each with its own simulated media engine, and records
//! every session event for later assertions.
//!
//! Basic usage pattern:
//!
//! 1. Create a `MeshHarness`
//! 2. Join participants with `join` / `join_concurrently`
//! 3. Wait for negotiation with `wait_stable` or `wait_for_event`
//! 4. Inspect engines, relay and recorded events
//! 5. Call `shutdown` to leave everyone

#![allow(dead_code)]

use meshcall::{
    CallConfig, CallSession, IceServerConfig, MemoryRelay, NegotiationState, SessionDeps,
    SessionEvent, SimCapture, SimEngine,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long waits last before a test fails
pub const WAIT: Duration = Duration::from_secs(5);

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Join failed: {0}")]
    Join(#[from] meshcall::Error),

    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,meshcall=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration used for harness participants
pub fn test_config() -> CallConfig {
    CallConfig {
        ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
        initiate_stagger_ms: 10,
        close_timeout_ms: 500,
        ..Default::default()
    }
}

/// One joined participant
pub struct Participant {
    pub session: CallSession,
    pub engine: Arc<SimEngine>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Participant {
    /// Every event recorded so far
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `predicate`
    pub fn count_events(&self, predicate: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

/// Several participants sharing one relay and meeting
pub struct MeshHarness {
    pub relay: Arc<MemoryRelay>,
    pub meeting_id: String,
    participants: HashMap<String, Participant>,
}

impl MeshHarness {
    pub fn new(meeting_id: &str) -> Self {
        Self {
            relay: Arc::new(MemoryRelay::new()),
            meeting_id: meeting_id.to_string(),
            participants: HashMap::new(),
        }
    }

    /// Join `id` with default config, engine and capture
    pub async fn join(&mut self, id: &str) -> HarnessResult<()> {
        self.join_with(id, test_config(), SimEngine::new(), SimCapture::new())
            .await
    }

    /// Join `id` with explicit collaborators
    pub async fn join_with(
        &mut self,
        id: &str,
        config: CallConfig,
        engine: SimEngine,
        capture: SimCapture,
    ) -> HarnessResult<()> {
        let participant =
            join_participant(&self.relay, &self.meeting_id, id, config, engine, capture).await?;
        self.participants.insert(id.to_string(), participant);
        Ok(())
    }

    /// Join every id at the same time
    pub async fn join_concurrently(&mut self, ids: &[&str]) -> HarnessResult<()> {
        let joins = ids.iter().map(|id| {
            join_participant(
                &self.relay,
                &self.meeting_id,
                id,
                test_config(),
                SimEngine::new(),
                SimCapture::new(),
            )
        });
        let joined = futures::future::join_all(joins).await;
        for (id, participant) in ids.iter().zip(joined) {
            self.participants.insert(id.to_string(), participant?);
        }
        Ok(())
    }

    pub fn participant(&self, id: &str) -> &Participant {
        self.participants
            .get(id)
            .unwrap_or_else(|| panic!("participant {} never joined", id))
    }

    pub fn session(&self, id: &str) -> &CallSession {
        &self.participant(id).session
    }

    pub fn engine(&self, id: &str) -> &SimEngine {
        &self.participant(id).engine
    }

    /// Wait until both sides of `a`-`b` are Stable
    pub async fn wait_stable(&self, a: &str, b: &str) -> HarnessResult<()> {
        let (left, right) = (self.session(a), self.session(b));
        wait_until(&format!("{} <-> {} stable", a, b), || {
            left.peer_state(b) == Some(NegotiationState::Stable)
                && right.peer_state(a) == Some(NegotiationState::Stable)
        })
        .await
    }

    /// Wait until `id` has recorded an event matching `predicate`
    pub async fn wait_for_event(
        &self,
        id: &str,
        what: &str,
        predicate: impl Fn(&SessionEvent) -> bool,
    ) -> HarnessResult<SessionEvent> {
        let participant = self.participant(id);
        let found = || participant.events.lock().iter().find(|e| predicate(e)).cloned();
        wait_until(what, || found().is_some()).await?;
        found().ok_or_else(|| HarnessError::Timeout(what.to_string()))
    }

    /// Leave every participant
    pub async fn shutdown(&self) {
        for participant in self.participants.values() {
            participant.session.leave().await;
        }
    }
}

async fn join_participant(
    relay: &Arc<MemoryRelay>,
    meeting_id: &str,
    id: &str,
    config: CallConfig,
    engine: SimEngine,
    capture: SimCapture,
) -> HarnessResult<Participant> {
    let engine = Arc::new(engine);
    let deps = SessionDeps {
        relay: relay.clone(),
        engine: engine.clone(),
        capture: Arc::new(capture),
    };
    let (session, events) =
        CallSession::join(config, deps, meeting_id, id, &format!("Participant {}", id)).await?;

    let recorded = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(record_events(events, recorded.clone()));
    Ok(Participant {
        session,
        engine,
        events: recorded,
    })
}

async fn record_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    recorded: Arc<Mutex<Vec<SessionEvent>>>,
) {
    while let Some(event) = events.recv().await {
        recorded.lock().push(event);
    }
}

/// Poll `condition` until it holds or [`WAIT`] elapses
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) -> HarnessResult<()> {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT, poll)
        .await
        .map_err(|_| HarnessError::Timeout(what.to_string()))
}

/// Run `future` with the harness timeout
pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> HarnessResult<T> {
    tokio::time::timeout(WAIT, future)
        .await
        .map_err(|_| HarnessError::Timeout(what.to_string()))
}
