//! Task, subgoal and the serializable agent state.
//!
//! [`AgentState`] is everything needed to audit or resume a run. The
//! runtime owns it exclusively; all subgoal status changes go through the
//! `mark_*` methods so the completed and failed id lists never drift from
//! the subgoal records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::budget::{Budget, UsageSnapshot};
use crate::agent::machine::Phase;
use crate::agent::memory::WorkingMemory;
use crate::api::pricing::{CompletionUsage, CostTracker};
use crate::error::StateError;
use crate::tools::{ToolInvocation, ToolResult};

/// Current snapshot format version.
pub const STATE_VERSION: u32 = 1;

// ── Task ───────────────────────────────────────────────────────────

/// Immutable run input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    /// Directory the workspace tools are rooted at. The runtime never reads
    /// it; hosts build the [`ToolRegistry`](crate::tools::ToolRegistry)
    /// from the same path, as `Settings::task` and `workspace_tools` do.
    pub workspace: String,
    pub budget: Budget,
}

impl Task {
    pub fn new(description: impl Into<String>, workspace: impl Into<String>) -> Self {
        let uuid: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(16)
            .collect();
        Self {
            id: format!("task_{uuid}"),
            description: description.into(),
            workspace: workspace.into(),
            budget: Budget::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }
}

// ── Subgoal ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubgoalStatus {
    Pending,
    Active,
    Done,
    Failed,
}

impl SubgoalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubgoalStatus::Pending => "pending",
            SubgoalStatus::Active => "active",
            SubgoalStatus::Done => "done",
            SubgoalStatus::Failed => "failed",
        }
    }
}

/// One unit of the plan. Never deleted once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subgoal {
    /// `subgoal_{n}`, 1-based.
    pub id: String,
    pub description: String,
    pub status: SubgoalStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub suggested_tools: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Subgoal {
    pub fn new(number: usize, description: impl Into<String>) -> Self {
        Self {
            id: format!("subgoal_{number}"),
            description: description.into(),
            status: SubgoalStatus::Pending,
            depends_on: Vec::new(),
            suggested_tools: Vec::new(),
            attempts: 0,
            result: None,
            error: None,
        }
    }

    /// Pending or active.
    pub fn is_open(&self) -> bool {
        matches!(self.status, SubgoalStatus::Pending | SubgoalStatus::Active)
    }
}

// ── StepResult ─────────────────────────────────────────────────────

/// Record of one ACT batch and its outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub iteration: u32,
    pub subgoal_id: String,
    pub invocations: Vec<ToolInvocation>,
    pub results: Vec<ToolResult>,
    #[serde(default)]
    pub reasoning: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| r.success)
    }
}

/// Why and how a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Termination {
    pub phase: Phase,
    pub reason: String,
    /// [`AgentError::kind`](crate::error::AgentError::kind) of the proximate
    /// cause, when there is one.
    #[serde(default)]
    pub error_kind: Option<String>,
}

/// Subgoal counts by status bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SubgoalCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Pending plus active.
    pub pending: usize,
}

// ── AgentState ─────────────────────────────────────────────────────

/// Full serializable run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub task: Task,
    pub phase: Phase,
    pub subgoals: Vec<Subgoal>,
    pub completed_subgoals: Vec<String>,
    pub failed_subgoals: Vec<String>,
    #[serde(default)]
    pub current_subgoal: Option<String>,
    pub step_results: Vec<StepResult>,
    pub memory: WorkingMemory,
    pub usage: CostTracker,
    pub llm_calls: u32,
    pub tool_calls: u32,
    /// ACT batches started.
    pub iterations: u32,
    pub validation_failures: u32,
    pub elapsed_secs: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub termination: Option<Termination>,
    #[serde(default)]
    pub final_output: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(task: Task, memory_capacity: usize) -> Self {
        Self {
            task,
            phase: Phase::Planning,
            subgoals: Vec::new(),
            completed_subgoals: Vec::new(),
            failed_subgoals: Vec::new(),
            current_subgoal: None,
            step_results: Vec::new(),
            memory: WorkingMemory::new(memory_capacity),
            usage: CostTracker::new(),
            llm_calls: 0,
            tool_calls: 0,
            iterations: 0,
            validation_failures: 0,
            elapsed_secs: 0.0,
            errors: Vec::new(),
            termination: None,
            final_output: None,
            started_at: Utc::now(),
        }
    }

    // ── Subgoals ──

    /// Append a pending subgoal and return its id.
    pub fn add_subgoal(
        &mut self,
        description: impl Into<String>,
        depends_on: Vec<String>,
        suggested_tools: Vec<String>,
    ) -> String {
        let mut subgoal = Subgoal::new(self.subgoals.len() + 1, description);
        subgoal.depends_on = depends_on;
        subgoal.suggested_tools = suggested_tools;
        let id = subgoal.id.clone();
        self.subgoals.push(subgoal);
        id
    }

    pub fn subgoal(&self, id: &str) -> Option<&Subgoal> {
        self.subgoals.iter().find(|s| s.id == id)
    }

    fn subgoal_mut(&mut self, id: &str) -> Option<&mut Subgoal> {
        self.subgoals.iter_mut().find(|s| s.id == id)
    }

    fn set_status(&mut self, id: &str, status: SubgoalStatus) -> bool {
        let Some(subgoal) = self.subgoal_mut(id) else {
            return false;
        };
        subgoal.status = status;
        self.completed_subgoals.retain(|s| s != id);
        self.failed_subgoals.retain(|s| s != id);
        match status {
            SubgoalStatus::Done => self.completed_subgoals.push(id.to_string()),
            SubgoalStatus::Failed => self.failed_subgoals.push(id.to_string()),
            SubgoalStatus::Pending | SubgoalStatus::Active => {}
        }
        true
    }

    /// Mark active and count the attempt.
    pub fn mark_active(&mut self, id: &str) -> bool {
        if !self.set_status(id, SubgoalStatus::Active) {
            return false;
        }
        if let Some(s) = self.subgoal_mut(id) {
            s.attempts += 1;
        }
        self.current_subgoal = Some(id.to_string());
        true
    }

    pub fn mark_pending(&mut self, id: &str) -> bool {
        self.set_status(id, SubgoalStatus::Pending)
    }

    pub fn mark_done(&mut self, id: &str, result: Option<String>) -> bool {
        if !self.set_status(id, SubgoalStatus::Done) {
            return false;
        }
        if let Some(s) = self.subgoal_mut(id) {
            if result.is_some() {
                s.result = result;
            }
            s.error = None;
        }
        true
    }

    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> bool {
        if !self.set_status(id, SubgoalStatus::Failed) {
            return false;
        }
        if let Some(s) = self.subgoal_mut(id) {
            s.error = Some(error.into());
        }
        true
    }

    pub fn counts(&self) -> SubgoalCounts {
        let mut counts = SubgoalCounts {
            total: self.subgoals.len(),
            ..Default::default()
        };
        for s in &self.subgoals {
            match s.status {
                SubgoalStatus::Done => counts.completed += 1,
                SubgoalStatus::Failed => counts.failed += 1,
                SubgoalStatus::Pending | SubgoalStatus::Active => counts.pending += 1,
            }
        }
        counts
    }

    pub fn has_open_subgoals(&self) -> bool {
        self.subgoals.iter().any(Subgoal::is_open)
    }

    pub fn all_done(&self) -> bool {
        !self.subgoals.is_empty()
            && self
                .subgoals
                .iter()
                .all(|s| s.status == SubgoalStatus::Done)
    }

    /// Check the bookkeeping invariants: every subgoal is counted exactly
    /// once and the id lists match the subgoal records.
    pub fn check_invariants(&self) -> Result<(), String> {
        let c = self.counts();
        if c.completed + c.failed + c.pending != c.total {
            return Err(format!("subgoal counts do not add up: {c:?}"));
        }
        if c.completed != self.completed_subgoals.len() {
            return Err("completed list out of sync".into());
        }
        if c.failed != self.failed_subgoals.len() {
            return Err("failed list out of sync".into());
        }
        Ok(())
    }

    // ── Accounting ──

    /// Add one completion call's usage under the given phase label.
    pub fn record_usage(&mut self, phase: Phase, usage: &CompletionUsage) {
        self.llm_calls += 1;
        self.usage.record(&phase.as_str().to_lowercase(), usage);
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            cost_usd: self.usage.total_cost_usd,
            tokens: self.usage.total_tokens(),
            iterations: self.iterations,
            elapsed_secs: self.elapsed_secs,
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Counts and cost as a short progress line.
    pub fn progress_summary(&self) -> String {
        let c = self.counts();
        format!(
            "{}/{} subgoals done, {} failed, {} pending; {} iterations, {} tool calls, ${:.4}",
            c.completed,
            c.total,
            c.failed,
            c.pending,
            self.iterations,
            self.tool_calls,
            self.usage.total_cost_usd
        )
    }

    /// Per-subgoal status lines for prompts and partial-result summaries.
    pub fn subgoal_report(&self) -> String {
        self.subgoals
            .iter()
            .map(|s| {
                let detail = match (&s.result, &s.error) {
                    (_, Some(e)) => format!(" (error: {e})"),
                    (Some(r), None) => format!(" (result: {r})"),
                    (None, None) => String::new(),
                };
                format!("- {} [{}] {}{detail}", s.id, s.status.as_str(), s.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Snapshot ───────────────────────────────────────────────────────

/// Versioned, self-describing persisted form of [`AgentState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: AgentState,
}

impl StateSnapshot {
    pub fn new(state: AgentState) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            state,
        }
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode a snapshot, rejecting unknown versions.
    pub fn from_json(text: &str) -> Result<Self, StateError> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let found = raw["version"].as_u64().unwrap_or(0);
        if u32::try_from(found).ok() != Some(STATE_VERSION) {
            return Err(StateError::UnsupportedVersion {
                found,
                expected: STATE_VERSION,
            });
        }
        Ok(serde_json::from_value(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::memory::Observation;
    use crate::tools::ToolErrorKind;
    use serde_json::json;

    fn state_with_plan() -> AgentState {
        let mut state = AgentState::new(Task::new("demo", "/tmp/ws"), 5);
        state.add_subgoal("first", vec![], vec!["write_file".into()]);
        state.add_subgoal("second", vec!["subgoal_1".into()], vec![]);
        state.add_subgoal("third", vec![], vec![]);
        state
    }

    #[test]
    fn task_ids_are_unique_and_prefixed() {
        let a = Task::new("x", ".");
        let b = Task::new("x", ".");
        assert!(a.id.starts_with("task_"));
        assert_eq!(a.id.len(), "task_".len() + 16);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn status_changes_keep_lists_in_sync() {
        let mut state = state_with_plan();
        assert!(state.mark_active("subgoal_1"));
        assert_eq!(state.subgoal("subgoal_1").unwrap().attempts, 1);
        state.mark_done("subgoal_1", Some("ok".into()));
        state.mark_failed("subgoal_3", "boom");
        state.check_invariants().unwrap();
        assert_eq!(state.completed_subgoals, vec!["subgoal_1"]);
        assert_eq!(state.failed_subgoals, vec!["subgoal_3"]);

        // Re-marking moves the id between lists instead of duplicating it.
        state.mark_pending("subgoal_3");
        state.mark_done("subgoal_3", None);
        state.check_invariants().unwrap();
        assert!(state.failed_subgoals.is_empty());
        assert_eq!(state.counts().completed, 2);
        assert!(!state.mark_done("subgoal_9", None));
    }

    #[test]
    fn all_done_requires_every_subgoal() {
        let mut state = state_with_plan();
        assert!(!state.all_done());
        for id in ["subgoal_1", "subgoal_2", "subgoal_3"] {
            state.mark_done(id, None);
        }
        assert!(state.all_done());
        assert!(!state.has_open_subgoals());
        assert!(!AgentState::new(Task::new("x", "."), 5).all_done());
    }

    #[test]
    fn usage_is_labelled_by_phase() {
        let mut state = state_with_plan();
        let u = CompletionUsage {
            input_tokens: 100,
            output_tokens: 20,
            cost_usd: 0.5,
        };
        state.record_usage(Phase::Planning, &u);
        state.record_usage(Phase::Acting, &u);
        state.iterations = 1;
        let snap = state.usage_snapshot();
        assert_eq!(snap.tokens, 240);
        assert_eq!(snap.cost_usd, 1.0);
        assert_eq!(state.llm_calls, 2);
        assert_eq!(state.usage.cost_by_phase["planning"], 0.5);
    }

    #[test]
    fn snapshot_round_trips_losslessly() {
        let mut state = state_with_plan();
        state.mark_active("subgoal_1");
        state.record_usage(
            Phase::Planning,
            &CompletionUsage {
                input_tokens: 1234,
                output_tokens: 56,
                cost_usd: 0.1 + 0.2,
            },
        );
        state.memory.append(Observation::tool(
            Phase::Observing,
            Some("subgoal_1".into()),
            ToolResult::failed("read_file", ToolErrorKind::Validation, "missing path", 0.003),
        ));
        state.step_results.push(StepResult {
            iteration: 1,
            subgoal_id: "subgoal_1".into(),
            invocations: vec![ToolInvocation::new("read_file", json!({}))],
            results: vec![],
            reasoning: Some("try".into()),
            timestamp: Utc::now(),
        });
        state.elapsed_secs = 1.0 / 3.0;

        let snapshot = StateSnapshot::new(state.clone());
        let text = snapshot.to_json().unwrap();
        let back = StateSnapshot::from_json(&text).unwrap();
        assert_eq!(back, snapshot);
        assert_eq!(back.state, state);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut value = serde_json::to_value(StateSnapshot::new(state_with_plan())).unwrap();
        value["version"] = json!(99);
        let err = StateSnapshot::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(
            err,
            StateError::UnsupportedVersion {
                found: 99,
                expected: 1
            }
        ));
    }

    #[test]
    fn oversized_version_is_not_truncated() {
        let mut value = serde_json::to_value(StateSnapshot::new(state_with_plan())).unwrap();
        let wrapped = u64::from(u32::MAX) + 2;
        value["version"] = json!(wrapped);
        let err = StateSnapshot::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(
            err,
            StateError::UnsupportedVersion { found, expected: 1 } if found == wrapped
        ));
    }

    #[test]
    fn reports_list_every_subgoal() {
        let mut state = state_with_plan();
        state.mark_failed("subgoal_2", "dependency failed");
        let report = state.subgoal_report();
        assert!(report.contains("- subgoal_1 [pending] first"));
        assert!(report.contains("[failed] second (error: dependency failed)"));
        assert!(state.progress_summary().starts_with("0/3 subgoals done, 1 failed"));
    }
}
