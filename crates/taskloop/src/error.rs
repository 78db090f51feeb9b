//! Error taxonomy for the runtime and its collaborators.
//!
//! | Type | Raised by | Reaches the caller as |
//! |------|-----------|-----------------------|
//! | [`GatewayError`] | completion backends, retry loop | `error` update after retries are exhausted |
//! | [`RegistryError`] | [`ToolRegistry::register`](crate::tools::ToolRegistry::register) | `Err` at setup time |
//! | [`StateError`] | snapshot encode/decode, [`StateStore`](crate::agent::session::StateStore) | `Err` from persistence calls |
//! | [`AgentError`] | the runtime | proximate cause of a terminal update |
//!
//! Tool failures never surface as Rust errors: they are folded into a
//! failed [`ToolResult`](crate::tools::ToolResult) tagged with a
//! [`ToolErrorKind`](crate::tools::ToolErrorKind).

use crate::agent::budget::BudgetDimension;
use crate::agent::machine::{Phase, TransitionEvent};
use crate::api::retry;

/// Failure of a single completion-service call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Rate limiting, 5xx, timeouts, dropped connections. Retried.
    #[error("transient completion error: {0}")]
    Transient(String),

    /// Authentication, bad request and other non-retryable failures.
    #[error("completion error: {0}")]
    Permanent(String),

    /// The service answered but the body could not be understood.
    #[error("malformed completion response: {0}")]
    Malformed(String),

    /// Transient failures persisted past the retry ceiling.
    #[error("completion failed after {attempts} attempt(s): {message}")]
    Exhausted { attempts: u32, message: String },

    #[error("completion cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Classify an error message produced by the HTTP layer.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if retry::is_permanent_error(&message) {
            GatewayError::Permanent(message)
        } else if retry::is_transient_error(&message) {
            GatewayError::Transient(message)
        } else {
            GatewayError::Permanent(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Tool registration failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl From<StateError> for AgentError {
    fn from(e: StateError) -> Self {
        AgentError::Persistence(e.to_string())
    }
}

/// Snapshot persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported state snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u64, expected: u32 },
}

/// Run-level error taxonomy. Every terminal update that is not a success
/// carries one of these as its proximate cause.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    /// Malformed tool arguments or unparseable planner/reflection output.
    #[error("validation error: {0}")]
    Validation(String),

    /// A tool ran and failed.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The completion gateway gave up after retrying transient failures.
    #[error("completion service unavailable: {0}")]
    GatewayTransient(String),

    /// Non-retryable completion failure (auth, bad request, malformed body).
    #[error("completion service error: {0}")]
    Gateway(String),

    #[error("budget exceeded: {dimension}")]
    BudgetExceeded { dimension: BudgetDimension },

    #[error("cancelled")]
    Cancelled,

    /// The planner produced no usable plan.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// One or more subgoals ended failed and nothing is left to run.
    #[error("{0}")]
    SubgoalsFailed(String),

    /// Reflection asked to stop the task.
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: Phase, event: TransitionEvent },

    #[error("state persistence failed: {0}")]
    Persistence(String),
}

impl From<GatewayError> for AgentError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Cancelled => AgentError::Cancelled,
            GatewayError::Transient(m) => AgentError::GatewayTransient(m),
            GatewayError::Exhausted { .. } => AgentError::GatewayTransient(e.to_string()),
            GatewayError::Permanent(m) => AgentError::Gateway(m),
            GatewayError::Malformed(m) => AgentError::Gateway(format!("malformed response: {m}")),
        }
    }
}

impl AgentError {
    /// Short machine-readable tag used in update payloads and debug snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "validation",
            AgentError::ToolExecution { .. } => "tool_execution",
            AgentError::GatewayTransient(_) => "gateway_transient",
            AgentError::Gateway(_) => "gateway",
            AgentError::BudgetExceeded { .. } => "budget_exceeded",
            AgentError::Cancelled => "cancelled",
            AgentError::InvalidPlan(_) => "invalid_plan",
            AgentError::SubgoalsFailed(_) => "subgoals_failed",
            AgentError::Aborted(_) => "aborted",
            AgentError::InvalidTransition { .. } => "invalid_transition",
            AgentError::Persistence(_) => "persistence",
        }
    }
}
