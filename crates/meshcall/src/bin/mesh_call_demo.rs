//! In-process mesh call demo
//!
//! Joins several participants to one meeting over an in-memory relay with
//! simulated media engines, waits for every pair to negotiate, then leaves.
//!
//! # Usage
//!
//! ```bash
//! # Three participants, default stagger
//! cargo run --bin mesh_call_demo -- --participants a1,b1,c1
//!
//! # JSON logs with negotiation detail
//! RUST_LOG=meshcall=debug cargo run --bin mesh_call_demo -- --json
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use meshcall::{
    CallConfig, CallSession, IceServerConfig, MemoryRelay, NegotiationState, SessionDeps,
    SessionEvent, SimCapture, SimEngine,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh call demo
///
/// Runs a complete join, negotiate and leave cycle for N participants in one
/// process.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Participant ids (comma-separated)
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "a1,b1,c1",
        env = "MESHCALL_PARTICIPANTS"
    )]
    participants: Vec<String>,

    /// Meeting id
    #[arg(short, long, default_value = "demo-meeting", env = "MESHCALL_MEETING")]
    meeting: String,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    stun_servers: Vec<String>,

    /// Delay between initiations triggered by one roster update, in milliseconds
    #[arg(long, default_value_t = 500, env = "MESHCALL_INITIATE_STAGGER_MS")]
    stagger_ms: u64,

    /// Maximum remote peers per participant
    #[arg(long, default_value_t = 8, env = "MESHCALL_MAX_PEERS")]
    max_peers: u32,

    /// Seconds to wait for the mesh to become stable
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    if args.participants.len() < 2 {
        bail!("need at least two participants");
    }

    let relay = Arc::new(MemoryRelay::new());
    let mut sessions = Vec::with_capacity(args.participants.len());

    for (index, participant) in args.participants.iter().enumerate() {
        let config = CallConfig {
            ice_servers: args
                .stun_servers
                .iter()
                .map(|url| IceServerConfig::stun(url.clone()))
                .collect(),
            max_peers: args.max_peers,
            initiate_stagger_ms: args.stagger_ms,
            create_meeting: index == 0,
            ..Default::default()
        };
        let deps = SessionDeps {
            relay: relay.clone(),
            engine: Arc::new(SimEngine::new()),
            capture: Arc::new(SimCapture::new()),
        };

        let (session, events) = CallSession::join(
            config,
            deps,
            &args.meeting,
            participant,
            &format!("Participant {}", participant),
        )
        .await
        .with_context(|| format!("{} failed to join", participant))?;

        tokio::spawn(log_events(participant.clone(), events));
        sessions.push(session);
    }

    let started = Instant::now();
    wait_for_mesh(&sessions, Duration::from_secs(args.timeout_secs)).await?;
    info!(
        "Mesh of {} participants stable after {:?}",
        sessions.len(),
        started.elapsed()
    );

    for session in &sessions {
        let peers: Vec<String> = session
            .peer_ids()
            .into_iter()
            .map(|peer| {
                let state = session
                    .peer_state(&peer)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "missing".to_string());
                format!("{} ({})", peer, state)
            })
            .collect();
        println!("{} -> {}", session.local_id(), peers.join(", "));
    }

    sessions[0].toggle_mute(true).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Some(entry) = sessions[1].participants().get(sessions[0].local_id()) {
        println!(
            "{} sees {} muted={}",
            sessions[1].local_id(),
            sessions[0].local_id(),
            entry.is_muted
        );
    }

    for session in &sessions {
        let report = session.leave().await;
        if report.is_clean() {
            info!("{} left ({} peers closed)", session.local_id(), report.peers_closed);
        } else {
            warn!("{} left with errors: {:?}", session.local_id(), report);
        }
    }

    Ok(())
}

async fn wait_for_mesh(sessions: &[CallSession], timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    let expected = sessions.len() - 1;
    loop {
        let stable = sessions.iter().all(|session| {
            let peers = session.peer_ids();
            peers.len() == expected
                && peers
                    .iter()
                    .all(|peer| session.peer_state(peer) == Some(NegotiationState::Stable))
        });
        if stable {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("mesh not stable after {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn log_events(participant: String, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::RemoteMedia { peer_id, track } => {
                info!(participant = %participant, "Receiving {} from {}", track.kind, peer_id)
            }
            SessionEvent::RosterChanged(roster) => {
                info!(participant = %participant, "Roster now has {} entries", roster.len())
            }
            SessionEvent::PeerDegraded {
                peer_id,
                consecutive_failures,
            } => warn!(
                participant = %participant,
                "{} degraded after {} failures", peer_id, consecutive_failures
            ),
            SessionEvent::PeerRecovered { peer_id } => {
                info!(participant = %participant, "{} recovered", peer_id)
            }
            SessionEvent::PeerFailed { peer_id, reason } => {
                warn!(participant = %participant, "{} failed: {}", peer_id, reason)
            }
            SessionEvent::ParticipantLeft { peer_id } => {
                info!(participant = %participant, "{} left", peer_id)
            }
            SessionEvent::Ended { reason, .. } => {
                info!(participant = %participant, "Session ended ({})", reason);
                return;
            }
        }
    }
}

fn init_tracing(json: bool) {
    // RUST_LOG wins over the default
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
