//! Working memory: a bounded, append-only log of observations.
//!
//! Observations are kept in arrival order. Once the log holds `capacity`
//! entries, each append evicts the oldest entry first (strict FIFO,
//! regardless of content). The log serializes with the rest of the agent
//! state so a resumed run sees the same context window.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::machine::Phase;
use crate::tools::ToolResult;

/// Default number of observations retained.
pub const DEFAULT_MEMORY_CAPACITY: usize = 20;

/// What an observation recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ObservationContent {
    ToolResult(ToolResult),
    Text(String),
}

/// One working-memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// `obs_{n}`, assigned on append.
    pub id: String,
    pub phase: Phase,
    pub subgoal_id: Option<String>,
    pub content: ObservationContent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Observation {
    pub fn tool(phase: Phase, subgoal_id: Option<String>, result: ToolResult) -> Self {
        Self {
            id: String::new(),
            phase,
            subgoal_id,
            content: ObservationContent::ToolResult(result),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn text(phase: Phase, subgoal_id: Option<String>, text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            phase,
            subgoal_id,
            content: ObservationContent::Text(text.into()),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// One line for prompt context.
    pub fn render(&self) -> String {
        let subgoal = self.subgoal_id.as_deref().unwrap_or("-");
        let body = match &self.content {
            ObservationContent::ToolResult(r) => r.brief(200),
            ObservationContent::Text(t) => {
                let mut s: String = t.chars().take(200).collect();
                if t.chars().count() > 200 {
                    s.push_str("...");
                }
                s
            }
        };
        format!("[{}] ({subgoal}) {body}", self.phase)
    }
}

/// Counts describing the current memory contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySummary {
    pub entries: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub total_appended: u64,
    pub by_phase: BTreeMap<Phase, usize>,
}

/// Bounded FIFO observation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    capacity: usize,
    entries: VecDeque<Observation>,
    total_appended: u64,
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl WorkingMemory {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            total_appended: 0,
        }
    }

    /// Append an observation, evicting the oldest entry when full. Returns
    /// the assigned id.
    pub fn append(&mut self, mut observation: Observation) -> String {
        self.total_appended += 1;
        observation.id = format!("obs_{}", self.total_appended);
        let id = observation.id.clone();
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(observation);
        id
    }

    /// The newest `max_entries` observations, oldest first.
    pub fn window(&self, max_entries: usize) -> Vec<&Observation> {
        let skip = self.entries.len().saturating_sub(max_entries);
        self.entries.iter().skip(skip).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.entries.iter()
    }

    pub fn by_phase(&self, phase: Phase) -> Vec<&Observation> {
        self.entries.iter().filter(|o| o.phase == phase).collect()
    }

    pub fn by_subgoal(&self, subgoal_id: &str) -> Vec<&Observation> {
        self.entries
            .iter()
            .filter(|o| o.subgoal_id.as_deref() == Some(subgoal_id))
            .collect()
    }

    /// Render the newest `max_entries` observations for a prompt.
    pub fn to_context_string(&self, max_entries: usize) -> String {
        let window = self.window(max_entries);
        if window.is_empty() {
            return "No previous observations.".into();
        }
        window
            .iter()
            .map(|o| o.render())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn summary(&self) -> MemorySummary {
        let mut by_phase = BTreeMap::new();
        for o in &self.entries {
            *by_phase.entry(o.phase).or_insert(0) += 1;
        }
        MemorySummary {
            entries: self.entries.len(),
            capacity: self.capacity,
            utilization: self.entries.len() as f64 / self.capacity as f64,
            total_appended: self.total_appended,
            by_phase,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }
}
