//! Convenience re-exports for common `taskloop` types.
//!
//! ```ignore
//! use taskloop::prelude::*;
//! ```
//!
//! Covers what most programs need to run a task: the HTTP client, the
//! gateway, the runtime and its configuration, budgets, updates and the
//! tool registry. Streaming internals, prompt builders and plan validation
//! are left out; import those from their modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ChatClient, CompletionRequest, CompletionResponse, DEFAULT_BASE_URL, DEFAULT_MODEL, Message,
    ToolDef, json_schema_for,
};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AgentRun, AgentState, AgentUpdate, Budget, BudgetDimension, FnObserver, LoggingObserver,
    Phase, Runtime, RuntimeConfig, StateSnapshot, StateStore, Task, UpdateKind, UpdateObserver,
};

// ── Completion service ──────────────────────────────────────────────
pub use crate::api::{CompletionBackend, CompletionGateway, RetryConfig, ScriptedBackend};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{AgentError, GatewayError};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    DangerousToolPolicy, ParamType, Tool, ToolCategory, ToolFuture, ToolMetadata, ToolParameter,
    ToolRegistry, ToolResult,
};
