//! Agent runtime: the PLAN → ACT → OBSERVE → REFLECT loop and its
//! supporting modules.
//!
//! - [`runtime::Runtime`] drives a task to a terminal phase. Start here.
//! - [`config::RuntimeConfig`] holds model, retry, parallelism and memory
//!   settings.
//! - [`machine`] is the pure phase transition function.
//! - [`budget`] is the pure budget governor.
//! - [`events`] defines [`AgentUpdate`] and the [`UpdateObserver`] hook.
//! - [`state`] and [`session`] hold the serializable run state and its
//!   on-disk checkpoints.
//! - [`plan`] validates planner output and resolves subgoal dependencies.
//! - [`memory`] is the bounded working memory fed back into prompts.

pub mod budget;
pub mod config;
pub mod events;
pub mod machine;
pub mod memory;
pub mod plan;
pub mod runtime;
pub mod session;
pub mod state;

pub use budget::{Budget, BudgetDimension, BudgetVerdict, UsageSnapshot};
pub use config::RuntimeConfig;
pub use events::{AgentUpdate, FnObserver, LoggingObserver, UpdateKind, UpdateObserver};
pub use machine::{Phase, TransitionEvent};
pub use memory::{Observation, WorkingMemory};
pub use plan::PlannedSubgoal;
pub use runtime::{AgentRun, Runtime};
pub use session::{StateStore, StoredRun};
pub use state::{AgentState, StateSnapshot, StepResult, Subgoal, SubgoalStatus, Task};
