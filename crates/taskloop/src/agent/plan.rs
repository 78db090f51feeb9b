//! Plan validation and subgoal scheduling.
//!
//! A plan is a list of [`PlannedSubgoal`]s whose dependencies name other
//! subgoals by id (`subgoal_{n}`). Before a plan is applied it must be
//! non-empty, within the subgoal cap, reference only known subgoals and be
//! acyclic. Scheduling picks the first pending subgoal whose dependencies
//! are all done.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::state::{AgentState, SubgoalStatus};
use crate::error::AgentError;

/// A subgoal as proposed by the planner, before it gets an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedSubgoal {
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Ids of prerequisite subgoals.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl PlannedSubgoal {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            tools: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn using(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }
}

/// Validate a fresh plan.
pub fn validate_plan(plan: &[PlannedSubgoal], max_subgoals: usize) -> Result<(), AgentError> {
    if plan.is_empty() {
        return Err(AgentError::InvalidPlan("planner returned no subgoals".into()));
    }
    validate_additions(&[], plan, max_subgoals)
}

/// Validate subgoals appended after `existing_ids`. New subgoals are
/// numbered after the existing ones and may depend on either.
pub fn validate_additions(
    existing_ids: &[String],
    additions: &[PlannedSubgoal],
    max_subgoals: usize,
) -> Result<(), AgentError> {
    let total = existing_ids.len() + additions.len();
    if total > max_subgoals {
        return Err(AgentError::InvalidPlan(format!(
            "plan has {total} subgoals, more than the limit of {max_subgoals}"
        )));
    }

    let new_ids: Vec<String> = (0..additions.len())
        .map(|i| format!("subgoal_{}", existing_ids.len() + i + 1))
        .collect();
    let known: HashSet<&str> = existing_ids
        .iter()
        .chain(new_ids.iter())
        .map(String::as_str)
        .collect();

    for (id, sg) in new_ids.iter().zip(additions) {
        if sg.description.trim().is_empty() {
            return Err(AgentError::InvalidPlan(format!("{id} has an empty description")));
        }
        for dep in &sg.depends_on {
            if !known.contains(dep.as_str()) {
                return Err(AgentError::InvalidPlan(format!(
                    "{id} depends on unknown subgoal '{dep}'"
                )));
            }
        }
    }

    // Existing subgoals never depend on new ones, so cycles can only form
    // among the additions.
    let graph: HashMap<&str, Vec<&str>> = new_ids
        .iter()
        .zip(additions)
        .map(|(id, sg)| {
            (
                id.as_str(),
                sg.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    if let Some(id) = find_cycle(&graph) {
        return Err(AgentError::InvalidPlan(format!(
            "dependency cycle involving {id}"
        )));
    }
    Ok(())
}

/// Depth-first search for a cycle; returns a node on it.
fn find_cycle<'a>(graph: &HashMap<&'a str, Vec<&'a str>>) -> Option<&'a str> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(node) {
            Some(Mark::Visiting) => return Some(node),
            Some(Mark::Done) => return None,
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        for &dep in graph.get(node).map(Vec::as_slice).unwrap_or_default() {
            if let Some(hit) = visit(dep, graph, marks) {
                return Some(hit);
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut nodes: Vec<&str> = graph.keys().copied().collect();
    nodes.sort_unstable();
    nodes
        .into_iter()
        .find_map(|node| visit(node, graph, &mut marks))
}

/// Append validated subgoals to the state. Returns the new ids.
pub fn apply_plan(state: &mut AgentState, plan: Vec<PlannedSubgoal>) -> Vec<String> {
    plan.into_iter()
        .map(|sg| state.add_subgoal(sg.description, sg.depends_on, sg.tools))
        .collect()
}

/// First pending subgoal whose dependencies are all done.
pub fn next_ready(state: &AgentState) -> Option<String> {
    state
        .subgoals
        .iter()
        .find(|s| {
            s.status == SubgoalStatus::Pending
                && s.depends_on.iter().all(|d| {
                    state
                        .subgoal(d)
                        .is_some_and(|dep| dep.status == SubgoalStatus::Done)
                })
        })
        .map(|s| s.id.clone())
}

/// Fail every pending subgoal that can no longer run because a dependency
/// failed (transitively). Returns the ids marked.
pub fn fail_blocked(state: &mut AgentState) -> Vec<String> {
    let mut marked = Vec::new();
    loop {
        let blocked: Vec<String> = state
            .subgoals
            .iter()
            .filter(|s| s.status == SubgoalStatus::Pending)
            .filter(|s| {
                s.depends_on.iter().any(|d| {
                    state
                        .subgoal(d)
                        .is_some_and(|dep| dep.status == SubgoalStatus::Failed)
                })
            })
            .map(|s| s.id.clone())
            .collect();
        if blocked.is_empty() {
            break;
        }
        for id in blocked {
            debug!("Subgoal {id} blocked by a failed dependency");
            state.mark_failed(&id, "dependency failed");
            marked.push(id);
        }
    }
    marked
}
