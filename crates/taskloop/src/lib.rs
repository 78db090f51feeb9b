//! Resource-bounded task runtime for LLM tool-use agents.
//!
//! `taskloop` takes a natural-language task, asks a language-completion
//! service to break it into subgoals, and drives each subgoal through an
//! explicit state machine:
//!
//! ```text
//! PLANNING ─▶ ACTING ─▶ OBSERVING ─▶ REFLECTING ─┬─▶ ACTING
//!                                                ├─▶ COMPLETED
//!   (any) ─▶ FAILED | BUDGET_EXCEEDED            └─▶ FAILED
//! ```
//!
//! Every run is bounded by a [`Budget`](agent::budget::Budget) (cost,
//! tokens, iterations, wall-clock time), observable through a stream of
//! [`AgentUpdate`](agent::events::AgentUpdate)s, cancellable at every
//! suspension point, and fully serializable for crash recovery.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use taskloop::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ChatClient::new(DEFAULT_BASE_URL, std::env::var("DEEPSEEK_API_KEY")?)?;
//!     let config = RuntimeConfig::new(DEFAULT_MODEL).with_max_parallel_tools(3);
//!     let gateway = CompletionGateway::new(Arc::new(client), &config);
//!     let tools = ToolRegistry::new().with_workspace_tools("./workspace")?;
//!
//!     let task = Task::new("create file a.txt with content 'hi'", "./workspace")
//!         .with_budget(Budget::default().with_max_cost_usd(0.50));
//!
//!     let mut updates = Runtime::new(gateway, Arc::new(tools), config)
//!         .run(task)
//!         .into_stream();
//!     while let Some(update) = updates.next().await {
//!         println!("[{}] {}", update.kind, update.message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Run a task:** [`Runtime`](agent::runtime::Runtime) and
//!   [`AgentRun`](agent::runtime::AgentRun). The phase transition function
//!   lives in [`agent::machine`].
//! - **Limit spend:** [`agent::budget`] is the pure budget governor.
//! - **Add a capability:** implement [`Tool`](tools::Tool) and register it in
//!   a [`ToolRegistry`](tools::ToolRegistry). Built-in workspace tools are
//!   in [`tools::common`].
//! - **Talk to a model:** [`CompletionGateway`](api::gateway::CompletionGateway)
//!   over any [`CompletionBackend`](api::backend::CompletionBackend). The
//!   HTTP backend is [`ChatClient`]; tests use
//!   [`ScriptedBackend`](api::scripted::ScriptedBackend).
//! - **Persist and resume:** [`AgentState`](agent::state::AgentState),
//!   [`StateSnapshot`](agent::state::StateSnapshot) and
//!   [`StateStore`](agent::session::StateStore).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Runtime, state machine, budget governor, working memory, state and persistence |
//! | [`tools`] | [`Tool`](tools::Tool) trait, registry with validation/timeouts/statistics, workspace tools |
//! | [`api`] | Completion backends, gateway, retry, streaming assembly, pricing |
//! | [`settings`] | Layered file + environment configuration for the binary |

pub mod agent;
pub mod api;
pub mod error;
pub mod prelude;
pub mod settings;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ── Constants ──────────────────────────────────────────────────────

/// Default completion endpoint (OpenAI-compatible).
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";

/// Default model for all completion calls.
pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// Default HTTP timeout for a single completion request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use taskloop::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct WriteArgs {
///     path: String,
///     #[serde(default)]
///     append: Option<bool>,
/// }
///
/// let schema = json_schema_for::<WriteArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"path".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A role-tagged message sent to the completion service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
        }
    }
}

// ── Tool catalog types ─────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A structured tool call returned by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

// ── Request / response types ───────────────────────────────────────

/// Completion request body. Unused optional fields are omitted.
#[derive(Serialize, Debug, Default, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// Token usage statistics as reported by the service.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UsageInfo {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
}

impl UsageInfo {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
            total_tokens: Some(prompt_tokens + completion_tokens),
        }
    }
}

/// Generated text and/or structured tool calls from one completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

impl CompletionResponse {
    /// A text-only response with the given usage.
    pub fn text(content: impl Into<String>, usage: UsageInfo) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: vec![],
            usage: Some(usage),
            finish_reason: Some("stop".into()),
        }
    }

    /// A tool-call response with the given usage.
    pub fn tool_calls(calls: Vec<ToolCall>, usage: UsageInfo) -> Self {
        Self {
            content: None,
            tool_calls: calls,
            usage: Some(usage),
            finish_reason: Some("tool_calls".into()),
        }
    }
}

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for OpenAI-compatible chat completion endpoints.
pub struct ChatClient {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ChatClient {
    /// Create a client with the default request timeout.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, String> {
        Self::with_timeout(base_url, api_key, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("taskloop/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Full URL of the chat completions endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Send a (non-streaming) completion request.
    pub async fn chat(&self, body: &CompletionRequest) -> Result<CompletionResponse, String> {
        debug!(
            "Completion request: model={}, messages={}, tools={}, max_tokens={}, temp={}",
            body.model,
            body.messages.len(),
            body.tools.as_ref().map_or(0, |t| t.len()),
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("request failed: could not read response: {e}"))?;

        debug!(
            "Completion response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("API HTTP {status}: {text}"));
        }

        parse_chat_response(&text)
    }
}

/// Decode a non-streaming response body.
pub(crate) fn parse_chat_response(text: &str) -> Result<CompletionResponse, String> {
    let parsed: RawChatResponse =
        serde_json::from_str(text).map_err(|e| format!("failed to parse response: {e}"))?;

    if let Some(err) = parsed.error {
        return Err(format!("API error: {}", err.message));
    }

    if let Some(ref usage) = parsed.usage {
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
            usage.total_tokens.unwrap_or(0),
        );
    }

    match parsed.choices.and_then(|c| c.into_iter().next()) {
        Some(c) => Ok(CompletionResponse {
            content: c.message.content,
            tool_calls: c.message.tool_calls.unwrap_or_default(),
            usage: parsed.usage,
            finish_reason: c.finish_reason,
        }),
        None => Err("failed to parse response: no choices".into()),
    }
}
