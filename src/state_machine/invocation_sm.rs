//! Test-invocation state machine.
//!
//! Tracks one test through the runner:
//! ```text
//! Idle → Built → Pushed → Executed → Passed
//!   │       │        │         │
//!   └───────┴────────┴─────────┴──► Failed(stage)
//! ```
//! Any failure is terminal. Later stages are never entered once a stage has
//! failed, and `Passed` is only reachable through `Executed`.

use serde::{Deserialize, Serialize};
use statig::prelude::*;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the invocation state machine.
#[derive(Debug, Clone)]
pub enum InvocationEvent {
    /// The current stage completed.
    Advance,
    /// The current stage failed.
    Fail,
}

/// The step of a test run that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Build,
    Push,
    Execute,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Build => write!(f, "build"),
            Stage::Push => write!(f, "push"),
            Stage::Execute => write!(f, "execute"),
        }
    }
}

/// Snapshot of where an invocation stands, for callers outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Idle,
    Built,
    Pushed,
    Executed,
    Passed,
    Failed(Stage),
}

impl InvocationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationStatus::Passed | InvocationStatus::Failed(_))
    }
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage: the artifact the invocation is about.
pub struct InvocationMachine {
    pub artifact: String,
}

impl InvocationMachine {
    pub fn new(artifact: &str) -> Self {
        Self {
            artifact: artifact.to_string(),
        }
    }

    /// Map the machine's internal state to an [`InvocationStatus`].
    pub fn status(state: &State) -> InvocationStatus {
        match state {
            State::Idle {} => InvocationStatus::Idle,
            State::Built {} => InvocationStatus::Built,
            State::Pushed {} => InvocationStatus::Pushed,
            State::Executed {} => InvocationStatus::Executed,
            State::Passed {} => InvocationStatus::Passed,
            State::Failed { stage } => InvocationStatus::Failed(*stage),
        }
    }

    fn fail(&self, stage: Stage) -> Outcome<State> {
        warn!(target: "invocation", artifact = %self.artifact, %stage, "Test failed");
        Transition(State::failed(stage))
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::idle()",
    state(derive(Debug, Clone, PartialEq))
)]
impl InvocationMachine {
    /// Nothing attempted yet; the next step is the host build.
    #[state]
    fn idle(&mut self, event: &InvocationEvent) -> Outcome<State> {
        match event {
            InvocationEvent::Advance => {
                debug!(target: "invocation", artifact = %self.artifact, "Built");
                Transition(State::built())
            }
            InvocationEvent::Fail => self.fail(Stage::Build),
        }
    }

    /// Artifact exists on the host; the next step is the push.
    #[state]
    fn built(&mut self, event: &InvocationEvent) -> Outcome<State> {
        match event {
            InvocationEvent::Advance => {
                debug!(target: "invocation", artifact = %self.artifact, "Pushed");
                Transition(State::pushed())
            }
            InvocationEvent::Fail => self.fail(Stage::Push),
        }
    }

    /// Artifact is in the guest; the next step is running it.
    #[state]
    fn pushed(&mut self, event: &InvocationEvent) -> Outcome<State> {
        match event {
            InvocationEvent::Advance => {
                debug!(target: "invocation", artifact = %self.artifact, "Executed");
                Transition(State::executed())
            }
            InvocationEvent::Fail => self.fail(Stage::Execute),
        }
    }

    /// The test ran to completion; its exit status decides the verdict.
    #[state]
    fn executed(&mut self, event: &InvocationEvent) -> Outcome<State> {
        match event {
            InvocationEvent::Advance => {
                info!(target: "invocation", artifact = %self.artifact, "Test passed");
                Transition(State::passed())
            }
            InvocationEvent::Fail => self.fail(Stage::Execute),
        }
    }

    #[state]
    fn passed(&mut self, event: &InvocationEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn failed(&mut self, event: &InvocationEvent, stage: &Stage) -> Outcome<State> {
        let _ = (event, stage);
        Handled
    }
}
