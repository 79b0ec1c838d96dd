//! Single-path, idempotent session teardown
//!
//! Leave, app backgrounding and fatal errors all funnel into
//! [`Lifecycle::teardown`]. The first call sets the closing flag that every
//! PeerLink checks before doing work, then spawns the release steps once;
//! every caller awaits that one run and receives the same report.
//! The steps run on their own task, so a caller dropped partway (timeout,
//! `select!`, cancelled UI task) does not stop the release. Every step runs
//! even if an earlier one fails or panics.

use super::events::{SessionEvent, TeardownReason};
use crate::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Resources a session releases at teardown, one method per step
#[async_trait]
pub trait TeardownSteps: Send + Sync {
    /// Step 1: stop signaling and roster delivery
    async fn unsubscribe(&self) -> Result<()>;

    /// Step 2: close every PeerLink; returns how many were closed
    async fn close_peers(&self) -> Result<usize>;

    /// Step 3: stop and release local tracks
    async fn stop_media(&self) -> Result<()>;

    /// Step 4: remove the local roster entry
    async fn leave_roster(&self) -> Result<()>;
}

/// Result of one release step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Finished without error
    Completed,
    /// Returned an error or panicked (message)
    Failed(String),
}

impl StepOutcome {
    /// True for `Completed`
    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed)
    }
}

/// What teardown did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Step 1
    pub unsubscribe: StepOutcome,
    /// Step 2
    pub close_peers: StepOutcome,
    /// PeerLinks closed in step 2
    pub peers_closed: usize,
    /// Step 3
    pub stop_media: StepOutcome,
    /// Step 4
    pub leave_roster: StepOutcome,
}

impl TeardownReport {
    fn aborted(reason: &str) -> Self {
        let failed = StepOutcome::Failed(reason.to_string());
        Self {
            unsubscribe: failed.clone(),
            close_peers: failed.clone(),
            peers_closed: 0,
            stop_media: failed.clone(),
            leave_roster: failed,
        }
    }

    /// Every step completed
    pub fn is_clean(&self) -> bool {
        self.unsubscribe.is_completed()
            && self.close_peers.is_completed()
            && self.stop_media.is_completed()
            && self.leave_roster.is_completed()
    }
}

async fn guarded<T>(step: &str, work: impl Future<Output = Result<T>>) -> (StepOutcome, Option<T>) {
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(value)) => (StepOutcome::Completed, Some(value)),
        Ok(Err(e)) => {
            warn!("Teardown step {} failed: {}", step, e);
            (StepOutcome::Failed(e.to_string()), None)
        }
        Err(_) => {
            warn!("Teardown step {} panicked", step);
            (StepOutcome::Failed(format!("{} panicked", step)), None)
        }
    }
}

type ReleaseHandle = Shared<BoxFuture<'static, TeardownReport>>;

/// Teardown guard for one session
pub struct Lifecycle {
    closing: Arc<AtomicBool>,
    progress: Arc<Progress>,
    release: Mutex<Option<ReleaseHandle>>,
}

struct Progress {
    torn_down: AtomicBool,
    runs: AtomicU32,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Lifecycle {
    /// Guard that reports `Ended` on `events`
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            closing: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Progress {
                torn_down: AtomicBool::new(false),
                runs: AtomicU32::new(0),
                events,
            }),
            release: Mutex::new(None),
        }
    }

    /// Flag shared with PeerLinks; set as soon as teardown starts
    pub fn closing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closing)
    }

    /// Teardown has started
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Teardown has finished
    pub fn is_torn_down(&self) -> bool {
        self.progress.torn_down.load(Ordering::SeqCst)
    }

    /// How many times the release steps have run (0 or 1)
    pub fn runs(&self) -> u32 {
        self.progress.runs.load(Ordering::SeqCst)
    }

    /// Run the release steps once; later and concurrent calls get the same report
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn teardown(
        &self,
        reason: TeardownReason,
        steps: Arc<dyn TeardownSteps>,
    ) -> TeardownReport {
        self.closing.store(true, Ordering::SeqCst);
        let release = self
            .release
            .lock()
            .get_or_insert_with(|| spawn_release(Arc::clone(&self.progress), reason, steps))
            .clone();
        release.await
    }
}

fn spawn_release(
    progress: Arc<Progress>,
    reason: TeardownReason,
    steps: Arc<dyn TeardownSteps>,
) -> ReleaseHandle {
    let task = tokio::spawn(progress.release(reason, steps));
    async move {
        task.await.unwrap_or_else(|e| {
            warn!("Teardown task did not finish: {}", e);
            TeardownReport::aborted(&e.to_string())
        })
    }
    .boxed()
    .shared()
}

impl Progress {
    async fn release(
        self: Arc<Self>,
        reason: TeardownReason,
        steps: Arc<dyn TeardownSteps>,
    ) -> TeardownReport {
        self.runs.fetch_add(1, Ordering::SeqCst);
        info!("Tearing down session ({})", reason);

        let (unsubscribe, _) = guarded("unsubscribe", steps.unsubscribe()).await;
        let (close_peers, closed) = guarded("close_peers", steps.close_peers()).await;
        let (stop_media, _) = guarded("stop_media", steps.stop_media()).await;
        let (leave_roster, _) = guarded("leave_roster", steps.leave_roster()).await;

        let report = TeardownReport {
            unsubscribe,
            close_peers,
            peers_closed: closed.unwrap_or_default(),
            stop_media,
            leave_roster,
        };

        // Step 5
        self.torn_down.store(true, Ordering::SeqCst);
        info!(
            "Session torn down ({}), {} peers closed, clean={}",
            reason,
            report.peers_closed,
            report.is_clean()
        );
        let _ = self.events.send(SessionEvent::Ended {
            reason,
            report: report.clone(),
        });
        report
    }
}
