//! Phase state machine.
//!
//! The runtime owns no transition logic of its own: every phase change goes
//! through [`transition`], which is pure and total over the legal edges.
//! Budget trips, cancellation and fatal errors are legal from every
//! non-terminal phase; terminal phases accept nothing.

use serde::{Deserialize, Serialize};

use crate::agent::budget::BudgetDimension;
use crate::error::AgentError;

/// Runtime phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Planning,
    Acting,
    Observing,
    Reflecting,
    Completed,
    Failed,
    BudgetExceeded,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::Failed | Phase::BudgetExceeded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planning => "PLANNING",
            Phase::Acting => "ACTING",
            Phase::Observing => "OBSERVING",
            Phase::Reflecting => "REFLECTING",
            Phase::Completed => "COMPLETED",
            Phase::Failed => "FAILED",
            Phase::BudgetExceeded => "BUDGET_EXCEEDED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened in the current phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    /// The planner produced a valid plan.
    PlanReady,
    /// The planner output could not be turned into a valid plan.
    PlanRejected,
    /// A tool batch finished (successfully or not).
    BatchFinished,
    /// Tool outcomes were recorded into memory and subgoal state.
    ObservationsRecorded,
    /// Reflection found more work to do.
    ReflectContinue,
    /// Reflection found every subgoal done.
    ReflectComplete,
    BudgetTripped(BudgetDimension),
    Cancelled,
    /// Unrecoverable error.
    Fatal,
}

impl std::fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionEvent::PlanReady => write!(f, "plan_ready"),
            TransitionEvent::PlanRejected => write!(f, "plan_rejected"),
            TransitionEvent::BatchFinished => write!(f, "batch_finished"),
            TransitionEvent::ObservationsRecorded => write!(f, "observations_recorded"),
            TransitionEvent::ReflectContinue => write!(f, "reflect_continue"),
            TransitionEvent::ReflectComplete => write!(f, "reflect_complete"),
            TransitionEvent::BudgetTripped(d) => write!(f, "budget_tripped({d})"),
            TransitionEvent::Cancelled => write!(f, "cancelled"),
            TransitionEvent::Fatal => write!(f, "fatal"),
        }
    }
}

/// Compute the next phase, or reject an illegal edge.
pub fn transition(from: Phase, event: &TransitionEvent) -> Result<Phase, AgentError> {
    use Phase::*;
    use TransitionEvent as E;

    let next = match (from, event) {
        (p, _) if p.is_terminal() => None,
        (_, E::BudgetTripped(_)) => Some(BudgetExceeded),
        (_, E::Cancelled | E::Fatal) => Some(Failed),
        (Planning, E::PlanReady) => Some(Acting),
        (Planning, E::PlanRejected) => Some(Failed),
        (Acting, E::BatchFinished) => Some(Observing),
        (Observing, E::ObservationsRecorded) => Some(Reflecting),
        (Reflecting, E::ReflectContinue) => Some(Acting),
        (Reflecting, E::ReflectComplete) => Some(Completed),
        _ => None,
    };

    next.ok_or_else(|| AgentError::InvalidTransition {
        from,
        event: event.clone(),
    })
}
