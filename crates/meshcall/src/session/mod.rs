//! Call session orchestration and lifecycle
//!
//! - [`orchestrator`]: [`CallSession`], the entry point for a joined call
//! - [`lifecycle`]: idempotent teardown shared by every exit path
//! - [`events`]: what a session reports back to the UI layer

pub mod events;
pub mod lifecycle;
pub mod orchestrator;

pub use events::{AppState, CameraSwitch, SessionEvent, TeardownReason};
pub use lifecycle::{Lifecycle, StepOutcome, TeardownReport, TeardownSteps};
pub use orchestrator::{CallSession, SessionDeps};
