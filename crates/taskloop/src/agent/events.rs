//! Progress updates emitted by the runtime.
//!
//! Every run produces an ordered sequence of [`AgentUpdate`]s: the caller
//! pulls them from [`AgentRun`](super::runtime::AgentRun), and any number of
//! [`UpdateObserver`]s see each update as it is emitted.
//!
//! | Observer | Use case |
//! |----------|----------|
//! | [`LoggingObserver`] | Structured logging via `tracing` |
//! | [`FnObserver`] | Quick closures for simple callbacks |
//! | Custom `impl UpdateObserver` | Dashboards, metrics, persistence |
//!
//! The final update of every run is exactly one of `completed`, `error`,
//! `budget_exceeded` or `cancelled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// Update type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    PhaseChanged,
    /// Raw streamed completion text, for display only.
    Text,
    ToolStarted,
    ToolFinished,
    CostUpdate,
    Completed,
    Error,
    BudgetExceeded,
    Cancelled,
}

impl UpdateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateKind::PhaseChanged => "phase_changed",
            UpdateKind::Text => "text",
            UpdateKind::ToolStarted => "tool_started",
            UpdateKind::ToolFinished => "tool_finished",
            UpdateKind::CostUpdate => "cost_update",
            UpdateKind::Completed => "completed",
            UpdateKind::Error => "error",
            UpdateKind::BudgetExceeded => "budget_exceeded",
            UpdateKind::Cancelled => "cancelled",
        }
    }

    /// Whether this kind ends a run.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            UpdateKind::Completed
                | UpdateKind::Error
                | UpdateKind::BudgetExceeded
                | UpdateKind::Cancelled
        )
    }
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress event: `{type, message, payload, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub message: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentUpdate {
    pub fn new(kind: UpdateKind, message: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            message: message.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind.is_final()
    }
}

// ── Observers ──────────────────────────────────────────────────────

/// Side-channel consumer of updates, called synchronously as each update
/// is emitted.
pub trait UpdateObserver: Send + Sync {
    fn on_update(&self, update: &AgentUpdate);
}

/// An observer backed by a closure.
///
/// # Example
///
/// ```ignore
/// let observer = FnObserver::new(|update| {
///     if update.kind == UpdateKind::Text {
///         print!("{}", update.message);
///     }
/// });
/// ```
pub struct FnObserver<F>(F)
where
    F: Fn(&AgentUpdate) + Send + Sync;

impl<F> FnObserver<F>
where
    F: Fn(&AgentUpdate) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> UpdateObserver for FnObserver<F>
where
    F: Fn(&AgentUpdate) + Send + Sync,
{
    fn on_update(&self, update: &AgentUpdate) {
        (self.0)(update)
    }
}

/// An observer that logs updates via `tracing`.
pub struct LoggingObserver;

impl UpdateObserver for LoggingObserver {
    fn on_update(&self, update: &AgentUpdate) {
        match update.kind {
            UpdateKind::PhaseChanged => {
                info!(
                    "Phase transition: {} -> {}",
                    update.payload["from"].as_str().unwrap_or("?"),
                    update.payload["to"].as_str().unwrap_or("?")
                );
            }
            UpdateKind::Text => {
                let preview: String = update.message.chars().take(80).collect();
                trace!("Stream text delta: {preview}");
            }
            UpdateKind::ToolStarted => {
                debug!("Executing tool: {}", update.payload["tool"].as_str().unwrap_or("?"));
            }
            UpdateKind::ToolFinished => {
                debug!("{}", update.message);
            }
            UpdateKind::CostUpdate => {
                debug!(
                    "Cost: call ${:.6}, total ${:.4}, tokens {}",
                    update.payload["call_cost_usd"].as_f64().unwrap_or(0.0),
                    update.payload["total_cost_usd"].as_f64().unwrap_or(0.0),
                    update.payload["total_tokens"].as_u64().unwrap_or(0)
                );
            }
            UpdateKind::Completed => info!("Task completed: {}", update.message),
            UpdateKind::Error => warn!("Task failed: {}", update.message),
            UpdateKind::BudgetExceeded => info!("Budget exceeded: {}", update.message),
            UpdateKind::Cancelled => info!("Task cancelled: {}", update.message),
        }
    }
}
