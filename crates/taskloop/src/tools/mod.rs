//! Tool abstractions and execution.
//!
//! Every agent capability (reading files, fetching URLs, anything a host
//! application adds) is a [`Tool`] implementor. Tools are collected into a
//! [`ToolRegistry`], which handles dispatch, schema validation, the
//! dangerous-tool policy, timeouts, panic isolation, truncation, bounded
//! parallel batches and statistics.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`] trait, [`ToolRegistry`], [`ToolResult`].
//! - [`metadata`]: [`ToolMetadata`] with typed parameters and the derived
//!   JSON Schema.
//! - [`common`]: built-in workspace tools, registered at once with
//!   [`ToolRegistry::with_workspace_tools()`].
//! - [`code`]: opt-in `python_execute` with timeout and memory limits.
//! - [`names`]: canonical tool name constants.

pub mod code;
pub mod common;
pub mod core;
pub mod metadata;
pub mod names;

pub use code::{CodeExecutionConfig, PythonExecute};
pub use common::WorkspaceToolsConfig;
pub use core::{
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TOOL_TIMEOUT, DangerousToolPolicy, Tool, ToolErrorKind,
    ToolFailure, ToolFuture, ToolInvocation, ToolRegistry, ToolResult, ToolStats,
    truncate_result,
};
pub use metadata::{ParamType, ToolCategory, ToolMetadata, ToolParameter, parameters_for};
