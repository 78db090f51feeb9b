//! Per-task state directories for checkpointing and resume.
//!
//! Directory layout:
//! ```text
//! state_dir/
//!   task_0123456789abcdef/
//!     state.json                      latest StateSnapshot
//!     debug-20260101T120000.123Z.json snapshot + proximate error on failure
//! ```
//!
//! `state.json` is always written atomically (temp file, then rename), so a
//! crash mid-write leaves the previous checkpoint intact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::machine::Phase;
use crate::agent::state::{AgentState, StateSnapshot};
use crate::error::{AgentError, StateError};

const STATE_FILE: &str = "state.json";
const STATE_TMP: &str = ".state.json.tmp";

/// One stored run, as listed by [`StateStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRun {
    pub task_id: String,
    pub description: String,
    pub phase: Phase,
    pub saved_at: DateTime<Utc>,
    pub cost_usd: f64,
}

/// Failure record written next to the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugSnapshot {
    pub error_kind: String,
    pub error: String,
    pub snapshot: StateSnapshot,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Create a store, ensuring the root directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.dir.join(task_id)
    }

    /// Path of a task's checkpoint file.
    pub fn state_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(STATE_FILE)
    }

    /// Write a checkpoint of `state`. Returns the file path.
    pub fn save(&self, state: &AgentState) -> Result<PathBuf, StateError> {
        let dir = self.task_dir(&state.task.id);
        std::fs::create_dir_all(&dir)?;

        let json = StateSnapshot::new(state.clone()).to_json()?;
        let tmp_path = dir.join(STATE_TMP);
        let final_path = dir.join(STATE_FILE);
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &final_path)?;

        debug!(
            "Checkpoint saved: {} ({}, iteration {})",
            final_path.display(),
            state.phase,
            state.iterations
        );
        Ok(final_path)
    }

    /// Write a debug snapshot carrying the proximate error.
    pub fn save_debug(&self, state: &AgentState, error: &AgentError) -> Result<PathBuf, StateError> {
        let dir = self.task_dir(&state.task.id);
        std::fs::create_dir_all(&dir)?;

        let record = DebugSnapshot {
            error_kind: error.kind().to_string(),
            error: error.to_string(),
            snapshot: StateSnapshot::new(state.clone()),
        };
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = dir.join(format!("debug-{stamp}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;

        warn!("Debug snapshot written to {}", path.display());
        Ok(path)
    }

    /// Load a task's latest checkpoint. `None` if the task has none.
    pub fn load(&self, task_id: &str) -> Result<Option<StateSnapshot>, StateError> {
        let path = self.state_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_path(&path).map(Some)
    }

    /// Load a snapshot from any file.
    pub fn load_path(path: &Path) -> Result<StateSnapshot, StateError> {
        let json = std::fs::read_to_string(path)?;
        StateSnapshot::from_json(&json)
    }

    /// Every stored run, newest first. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<StoredRun>, StateError> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type().is_ok_and(|ft| ft.is_dir()) {
                continue;
            }
            let path = entry.path().join(STATE_FILE);
            if !path.exists() {
                continue;
            }
            match Self::load_path(&path) {
                Ok(snapshot) => runs.push(StoredRun {
                    task_id: snapshot.state.task.id.clone(),
                    description: snapshot.state.task.description.clone(),
                    phase: snapshot.state.phase,
                    saved_at: snapshot.saved_at,
                    cost_usd: snapshot.state.usage.total_cost_usd,
                }),
                Err(e) => warn!("Skipping unreadable checkpoint at {}: {e}", path.display()),
            }
        }
        runs.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(runs)
    }

    /// Remove a task's directory. Missing tasks are not an error.
    pub fn delete(&self, task_id: &str) -> Result<(), StateError> {
        let dir = self.task_dir(task_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::Task;

    fn state(id: &str) -> AgentState {
        let mut state = AgentState::new(Task::new("demo task", ".").with_id(id), 5);
        state.add_subgoal("first", vec![], vec![]);
        state
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();

        let original = state("task_a");
        let path = store.save(&original).unwrap();
        assert!(path.ends_with("task_a/state.json"));

        let loaded = store.load("task_a").unwrap().unwrap();
        assert_eq!(loaded.state, original);
        assert!(!store.task_dir("task_a").join(STATE_TMP).exists());
    }

    #[test]
    fn list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        store.save(&state("task_a")).unwrap();
        store.save(&state("task_b")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let runs = store.list().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.phase == Phase::Planning));

        store.delete("task_a").unwrap();
        store.delete("missing").unwrap();
        assert!(store.load("task_a").unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn debug_snapshot_carries_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let path = store
            .save_debug(&state("task_x"), &AgentError::Gateway("HTTP 401".into()))
            .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("debug-") && name.ends_with(".json"));

        let record: DebugSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(record.error_kind, "gateway");
        assert_eq!(record.snapshot.state.task.id, "task_x");
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let task_dir = dir.path().join("task_bad");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join(STATE_FILE), "{not json").unwrap();

        assert!(matches!(store.load("task_bad"), Err(StateError::Json(_))));
        assert!(store.list().unwrap().is_empty());
    }
}
