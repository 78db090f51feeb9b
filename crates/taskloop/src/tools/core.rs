//! Tool abstraction and the name-keyed registry that executes tools.
//!
//! Every capability is a [`Tool`] implementor: static [`ToolMetadata`] plus
//! an async `execute`. The [`ToolRegistry`] owns dispatch and everything a
//! tool should not have to care about: unknown names, argument validation
//! against the declared schema, the dangerous-tool policy, deadlines,
//! panics, output truncation and per-tool statistics. A tool failure is
//! always a [`ToolResult`] with `success == false`, never an `Err`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use crate::ToolDef;
use crate::error::RegistryError;
use crate::tools::metadata::{ToolCategory, ToolMetadata};

/// Maximum serialized size (in bytes) of a tool output before truncation.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 30_000;

/// Default deadline for a single tool call.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send + 'a>>;

// ── Tool trait ─────────────────────────────────────────────────────

/// A capability the runtime can invoke on the planner's behalf.
///
/// `execute` receives arguments that have already been validated against
/// the schema derived from [`ToolMetadata::parameters`]. Returning `Err`
/// (or panicking) produces a failed [`ToolResult`]; the registry measures
/// elapsed time itself.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// impl Tool for Echo {
///     fn metadata(&self) -> ToolMetadata {
///         ToolMetadata::new("echo", "Echo the input back", ToolCategory::Data)
///             .param(ToolParameter::required("text", ParamType::String, "Text to echo"))
///     }
///
///     fn execute(&self, args: serde_json::Value) -> ToolFuture<'_> {
///         Box::pin(async move { Ok(args["text"].clone()) })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    fn metadata(&self) -> ToolMetadata;

    fn execute(&self, args: serde_json::Value) -> ToolFuture<'_>;

    fn name(&self) -> String {
        self.metadata().name
    }
}

// ── Requests and results ───────────────────────────────────────────

/// A tool invocation chosen by the planner during ACT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            params,
        }
    }
}

/// Why a tool call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    Validation,
    Execution,
    Timeout,
    PermissionDenied,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::Validation => "validation",
            ToolErrorKind::Execution => "execution",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::PermissionDenied => "permission_denied",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// Outcome of one invocation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<ToolFailure>,
    pub elapsed_secs: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cost_usd: f64,
}

impl ToolResult {
    pub fn ok(tool_name: impl Into<String>, output: serde_json::Value, elapsed_secs: f64) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: true,
            output,
            error: None,
            elapsed_secs,
            timestamp: Utc::now(),
            cost_usd: 0.0,
        }
    }

    pub fn failed(
        tool_name: impl Into<String>,
        kind: ToolErrorKind,
        message: impl Into<String>,
        elapsed_secs: f64,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            output: serde_json::Value::Null,
            error: Some(ToolFailure {
                kind,
                message: message.into(),
            }),
            elapsed_secs,
            timestamp: Utc::now(),
            cost_usd: 0.0,
        }
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    /// Short human-readable rendering for prompts and logs.
    pub fn brief(&self, max_chars: usize) -> String {
        let body = match (&self.error, &self.output) {
            (Some(err), _) => format!("error ({}): {}", err.kind, err.message),
            (None, serde_json::Value::String(s)) => s.clone(),
            (None, other) => other.to_string(),
        };
        let mut text: String = body.chars().take(max_chars).collect();
        if body.chars().count() > max_chars {
            text.push_str("...");
        }
        let status = if self.success { "ok" } else { "failed" };
        format!("{} [{status}] {text}", self.tool_name)
    }
}

// ── Policy and statistics ──────────────────────────────────────────

/// Gate for tools whose metadata sets `dangerous`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DangerousToolPolicy {
    #[default]
    Allow,
    /// Only the listed tool names may run.
    RequireAuthorization { authorized: Vec<String> },
}

impl DangerousToolPolicy {
    pub fn deny_all() -> Self {
        DangerousToolPolicy::RequireAuthorization { authorized: vec![] }
    }

    pub fn permits(&self, tool_name: &str) -> bool {
        match self {
            DangerousToolPolicy::Allow => true,
            DangerousToolPolicy::RequireAuthorization { authorized } => {
                authorized.iter().any(|t| t == tool_name)
            }
        }
    }
}

/// Per-tool execution counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub total_secs: f64,
    pub total_cost_usd: f64,
}

impl ToolStats {
    pub fn average_secs(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_secs / self.calls as f64
        }
    }

    fn record(&mut self, result: &ToolResult) {
        self.calls += 1;
        if result.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if result.error_kind() == Some(ToolErrorKind::Timeout) {
            self.timeouts += 1;
        }
        self.total_secs += result.elapsed_secs;
        self.total_cost_usd += result.cost_usd;
    }
}

// ── ToolRegistry ───────────────────────────────────────────────────

/// Name-keyed map of tools plus the execution policy around them.
///
/// Shareable across runtimes (`Arc<ToolRegistry>`): executions keep no
/// state between calls except the statistics counters.
///
/// # Example
///
/// ```ignore
/// let tools = ToolRegistry::new()
///     .with_max_output_bytes(15_000)
///     .with_workspace_tools("./workspace")?;
///
/// let result = tools
///     .execute("write_file", &json!({"path": "a.txt", "content": "hi"}), Duration::from_secs(5))
///     .await;
/// assert!(result.success);
/// ```
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Registration order, for stable catalogs and prompts.
    order: Vec<String>,
    max_output_bytes: usize,
    policy: DangerousToolPolicy,
    stats: Mutex<HashMap<String, ToolStats>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .field("max_output_bytes", &self.max_output_bytes)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            policy: DangerousToolPolicy::Allow,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Baseline dangerous-tool policy. Every call must satisfy it in
    /// addition to any policy passed to
    /// [`execute_with_policy`](Self::execute_with_policy).
    pub fn with_policy(mut self, policy: DangerousToolPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a tool. Fails if the name is taken.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        debug!("Registered tool {name}");
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Result<Self, RegistryError> {
        self.register(tool)?;
        Ok(self)
    }

    /// Remove a tool. Returns whether it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn by_category(&self, category: ToolCategory) -> Vec<ToolMetadata> {
        self.metadata()
            .into_iter()
            .filter(|m| m.category == category)
            .collect()
    }

    /// Metadata for every tool, in registration order.
    pub fn metadata(&self) -> Vec<ToolMetadata> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.metadata())
            .collect()
    }

    /// Function-calling definitions for the completion service.
    pub fn catalog(&self) -> Vec<ToolDef> {
        self.metadata().iter().map(ToolMetadata::to_tool_def).collect()
    }

    /// Plain-text tool list for planner prompts.
    pub fn describe_for_llm(&self) -> String {
        let tools = self.metadata();
        if tools.is_empty() {
            return "No tools available.".into();
        }
        tools
            .iter()
            .map(ToolMetadata::describe)
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ── Statistics ──

    pub fn statistics(&self) -> HashMap<String, ToolStats> {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn stats_for(&self, name: &str) -> Option<ToolStats> {
        self.stats.lock().ok().and_then(|s| s.get(name).cloned())
    }

    pub fn reset_statistics(&self) {
        if let Ok(mut s) = self.stats.lock() {
            s.clear();
        }
    }

    fn record(&self, result: &ToolResult) {
        if let Ok(mut s) = self.stats.lock() {
            s.entry(result.tool_name.clone()).or_default().record(result);
        }
    }

    // ── Execution ──

    /// Execute one call under the registry's own policy.
    pub async fn execute(
        &self,
        name: &str,
        args: &serde_json::Value,
        timeout: Duration,
    ) -> ToolResult {
        self.execute_with_policy(name, args, timeout, &self.policy)
            .await
    }

    /// Execute one call under an explicit dangerous-tool policy.
    ///
    /// A dangerous tool runs only when both `policy` and the registry's own
    /// policy permit it, so neither side can widen the other.
    pub async fn execute_with_policy(
        &self,
        name: &str,
        args: &serde_json::Value,
        timeout: Duration,
        policy: &DangerousToolPolicy,
    ) -> ToolResult {
        let result = self.dispatch(name, args, timeout, policy).await;
        self.record(&result);
        result
    }

    async fn dispatch(
        &self,
        name: &str,
        args: &serde_json::Value,
        timeout: Duration,
        policy: &DangerousToolPolicy,
    ) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            warn!("[tool] unknown tool '{name}'");
            return ToolResult::failed(
                name,
                ToolErrorKind::UnknownTool,
                format!("unknown tool '{name}'"),
                0.0,
            );
        };
        let meta = match std::panic::catch_unwind(AssertUnwindSafe(|| tool.metadata())) {
            Ok(meta) => meta,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("Tool {name} panicked while describing itself: {message}");
                return ToolResult::failed(
                    name,
                    ToolErrorKind::Execution,
                    format!("tool panicked: {message}"),
                    0.0,
                );
            }
        };

        if meta.dangerous && !(self.policy.permits(name) && policy.permits(name)) {
            info!("[tool] {name} blocked: dangerous tool not authorized");
            return ToolResult::failed(
                name,
                ToolErrorKind::PermissionDenied,
                format!("tool '{name}' is marked dangerous and has not been authorized"),
                0.0,
            );
        }

        if let Err(message) = validate_arguments(&meta, args) {
            info!("[tool] {name} rejected: {message}");
            return ToolResult::failed(name, ToolErrorKind::Validation, message, 0.0);
        }

        log_tool_call(name, args);
        let start = Instant::now();
        // Guard the synchronous part of `execute` as well as the future it
        // returns; a tool may panic before boxing its future.
        let call = async {
            match std::panic::catch_unwind(AssertUnwindSafe(|| tool.execute(args.clone()))) {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            }
        };
        let outcome = tokio::time::timeout(timeout, call).await;
        let elapsed = start.elapsed().as_secs_f64();

        let mut result = match outcome {
            Err(_) => {
                info!(
                    "Tool {name} timed out after {elapsed:.1}s (limit: {:.0}s)",
                    timeout.as_secs_f64()
                );
                ToolResult::failed(
                    name,
                    ToolErrorKind::Timeout,
                    format!("tool '{name}' timed out after {:.1} seconds", timeout.as_secs_f64()),
                    elapsed,
                )
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!("Tool {name} panicked: {message}");
                ToolResult::failed(
                    name,
                    ToolErrorKind::Execution,
                    format!("tool panicked: {message}"),
                    elapsed,
                )
            }
            Ok(Ok(Err(message))) => {
                debug!("Tool {name} failed in {:.0}ms: {message}", elapsed * 1000.0);
                ToolResult::failed(name, ToolErrorKind::Execution, message, elapsed)
            }
            Ok(Ok(Ok(output))) => {
                let output = truncate_output(output, self.max_output_bytes);
                debug!(
                    "Tool {name} completed in {:.0}ms ({} bytes)",
                    elapsed * 1000.0,
                    output.to_string().len()
                );
                ToolResult::ok(name, output, elapsed)
            }
        };
        result.cost_usd = meta.estimated_cost_usd;
        trace!("Tool {name} result: {}", result.brief(300));
        result
    }

    /// Execute independent calls with at most `max_parallel` in flight.
    ///
    /// Every call gets its own deadline. Results are returned in request
    /// order regardless of completion order.
    pub async fn execute_batch(
        &self,
        requests: &[ToolInvocation],
        max_parallel: usize,
        timeout: Duration,
        policy: &DangerousToolPolicy,
    ) -> Vec<ToolResult> {
        let permits = Arc::new(Semaphore::new(max_parallel.max(1)));
        let calls = requests.iter().map(|req| {
            let permits = Arc::clone(&permits);
            async move {
                let _permit = permits.acquire_owned().await.ok();
                self.execute_with_policy(&req.tool, &req.params, timeout, policy)
                    .await
            }
        });
        futures::future::join_all(calls).await
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate arguments against the schema derived from the tool's metadata.
///
/// Returns a message listing every violation, formatted so the planner can
/// self-correct.
pub fn validate_arguments(meta: &ToolMetadata, args: &serde_json::Value) -> Result<(), String> {
    if !args.is_object() {
        return Err(format!(
            "arguments for tool '{}' must be a JSON object, got {args}",
            meta.name
        ));
    }

    let schema = meta.json_schema();
    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        Err(e) => return Err(format!("tool '{}' declares an invalid schema: {e}", meta.name)),
    };

    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "argument validation failed for tool '{}':\n{}",
            meta.name,
            errors.join("\n")
        ))
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, args: &serde_json::Value) {
    let arguments = args.to_string();
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.len() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate a string to at most `max` bytes, appending a notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() > max {
        let cut = s.floor_char_boundary(max);
        let head = s.get(..cut).unwrap_or_default();
        format!("{head}...\n[truncated: {} bytes total]", s.len())
    } else {
        s
    }
}

/// Apply [`truncate_result`] to an output value's serialized form. Outputs
/// within the limit are returned untouched.
pub fn truncate_output(output: serde_json::Value, max: usize) -> serde_json::Value {
    let text = match output {
        serde_json::Value::String(s) => s,
        other => {
            let rendered = other.to_string();
            if rendered.len() <= max {
                return other;
            }
            rendered
        }
    };
    serde_json::Value::String(truncate_result(text, max))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
