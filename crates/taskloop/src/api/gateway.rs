//! The completion gateway: plan, act, reflect and summarize over one
//! retried completion primitive.
//!
//! Every operation returns a [`Completion`] that carries the priced usage
//! of the call even when the reply could not be parsed, so the runtime can
//! account for spend before deciding what to do with the content. Transport
//! failures are retried with backoff inside the gateway; the caller only
//! sees an `Err` once retries are exhausted, the failure is permanent, or
//! the run was cancelled.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::config::RuntimeConfig;
use crate::agent::plan::PlannedSubgoal;
use crate::agent::state::{AgentState, Subgoal, Task};
use crate::api::backend::CompletionBackend;
use crate::api::pricing::{CompletionUsage, ModelPricing, pricing_for_model};
use crate::api::prompts::{self, ActDecision, Reflection};
use crate::api::retry::{RetryConfig, retry_with_backoff};
use crate::api::streaming::{Delivery, deliveries};
use crate::error::GatewayError;
use crate::tools::ToolRegistry;
use crate::{CompletionRequest, CompletionResponse, Message, ToolDef};

/// One successful exchange with the completion service.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response: CompletionResponse,
    pub usage: CompletionUsage,
    /// Raw text chunks in arrival order; empty unless streaming.
    pub chunks: Vec<String>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// A reply plus the operation-specific reading of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion<T> {
    pub reply: Reply,
    /// `Err` holds the reason the content was unusable.
    pub parsed: Result<T, String>,
}

impl<T> Completion<T> {
    fn parse(reply: Reply, parse: impl FnOnce(&CompletionResponse) -> Result<T, String>) -> Self {
        let parsed = parse(&reply.response);
        Self { reply, parsed }
    }
}

pub struct CompletionGateway {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryConfig,
    streaming: bool,
    pricing: ModelPricing,
}

impl CompletionGateway {
    /// Pricing is looked up from the configured model name.
    pub fn new(backend: Arc<dyn CompletionBackend>, config: &RuntimeConfig) -> Self {
        Self {
            backend,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            retry: config.retry.clone(),
            streaming: config.streaming,
            pricing: pricing_for_model(&config.model),
        }
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn pricing(&self) -> &ModelPricing {
        &self.pricing
    }

    /// The underlying primitive: send `messages` (and optionally a tool
    /// catalog), retrying transient failures.
    pub async fn complete(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDef>>,
        cancel: &CancellationToken,
    ) -> Result<Reply, GatewayError> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: tools.filter(|t| !t.is_empty()),
        };
        debug!(
            "[gateway] {} request via {}: {} messages, {} tools, streaming={}",
            self.model,
            self.backend.name(),
            request.messages.len(),
            request.tools.as_ref().map_or(0, Vec::len),
            self.streaming
        );

        let start = Instant::now();
        let ((response, chunks), attempts) =
            retry_with_backoff(&self.retry, cancel, || self.call_once(&request)).await?;
        let usage = self.pricing.usage(response.usage.as_ref());

        info!(
            "[gateway] completion in {:.0}ms ({} attempt(s)): {} in / {} out tokens, ${:.6}",
            start.elapsed().as_secs_f64() * 1000.0,
            attempts,
            usage.input_tokens,
            usage.output_tokens,
            usage.cost_usd
        );
        Ok(Reply {
            response,
            usage,
            chunks,
            attempts,
        })
    }

    async fn call_once(
        &self,
        request: &CompletionRequest,
    ) -> Result<(CompletionResponse, Vec<String>), GatewayError> {
        if !self.streaming {
            return Ok((self.backend.complete(request).await?, Vec::new()));
        }
        let events = self.backend.complete_stream(request).await?;
        let mut chunks = Vec::new();
        let mut response = None;
        for delivery in deliveries(&events)? {
            match delivery {
                Delivery::Chunk(text) => chunks.push(text),
                Delivery::Final(r) => response = Some(r),
            }
        }
        let response =
            response.ok_or_else(|| GatewayError::Malformed("stream ended without a response".into()))?;
        Ok((response, chunks))
    }

    /// Ask for a decomposition of the task.
    pub async fn plan(
        &self,
        task: &Task,
        tool_descriptions: &str,
        max_subgoals: usize,
        cancel: &CancellationToken,
    ) -> Result<Completion<Vec<PlannedSubgoal>>, GatewayError> {
        let messages = prompts::plan_messages(task, tool_descriptions, max_subgoals);
        let reply = self.complete(messages, None, cancel).await?;
        Ok(Completion::parse(reply, |r| {
            prompts::parse_plan(r.content.as_deref().unwrap_or_default())
        }))
    }

    /// Ask which tools to invoke for `subgoal`.
    pub async fn act(
        &self,
        task: &Task,
        subgoal: &Subgoal,
        tools: &ToolRegistry,
        context: &str,
        max_calls: usize,
        cancel: &CancellationToken,
    ) -> Result<Completion<ActDecision>, GatewayError> {
        let messages =
            prompts::act_messages(task, subgoal, &tools.describe_for_llm(), context, max_calls);
        let reply = self.complete(messages, Some(tools.catalog()), cancel).await?;
        Ok(Completion::parse(reply, prompts::parse_act))
    }

    /// Ask for a judgement on the current subgoal.
    pub async fn reflect(
        &self,
        state: &AgentState,
        context: &str,
        allow_new_subgoals: bool,
        cancel: &CancellationToken,
    ) -> Result<Completion<Reflection>, GatewayError> {
        let messages = prompts::reflect_messages(state, context, allow_new_subgoals);
        let reply = self.complete(messages, None, cancel).await?;
        Ok(Completion::parse(reply, |r| {
            prompts::parse_reflection(r.content.as_deref().unwrap_or_default())
        }))
    }

    /// Ask for a final summary of the run.
    pub async fn summarize(
        &self,
        state: &AgentState,
        cancel: &CancellationToken,
    ) -> Result<Completion<String>, GatewayError> {
        let reply = self
            .complete(prompts::summary_messages(state), None, cancel)
            .await?;
        Ok(Completion::parse(reply, |r| {
            r.content
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .ok_or_else(|| "empty summary".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UsageInfo;
    use crate::api::scripted::ScriptedBackend;
    use serde_json::json;

    fn gateway(backend: Arc<ScriptedBackend>, config: RuntimeConfig) -> CompletionGateway {
        CompletionGateway::new(backend, &config)
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .fail(GatewayError::Transient("API HTTP 503: busy".into()))
                .fail(GatewayError::Transient("API HTTP 429: slow down".into()))
                .fail(GatewayError::Transient("request failed: timed out".into()))
                .text(r#"[{"description": "only step"}]"#),
        );
        let config = RuntimeConfig::new("deepseek-chat").with_retry(RetryConfig::immediate(5));
        let gw = gateway(Arc::clone(&backend), config);

        let task = Task::new("t", ".");
        let plan = gw
            .plan(&task, "tools", 10, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.reply.attempts, 4);
        assert_eq!(plan.parsed.unwrap()[0].description, "only step");
        assert_eq!(backend.calls(), 4);
        assert!(plan.reply.usage.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_error() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .fail(GatewayError::Transient("HTTP 503".into()))
                .fail(GatewayError::Transient("HTTP 503".into())),
        );
        let gw = gateway(
            backend,
            RuntimeConfig::new("m").with_retry(RetryConfig::immediate(1)),
        );
        let err = gw
            .complete(vec![Message::user("hi")], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn unparseable_reply_keeps_usage() {
        let backend = Arc::new(ScriptedBackend::new().text("I cannot plan that."));
        let gw = gateway(backend, RuntimeConfig::new("deepseek-chat"));
        let plan = gw
            .plan(&Task::new("t", "."), "tools", 10, &CancellationToken::new())
            .await
            .unwrap();
        assert!(plan.parsed.is_err());
        assert_eq!(plan.reply.usage.input_tokens, 100);
    }

    #[tokio::test]
    async fn streaming_collects_chunks_before_parsing() {
        let backend = Arc::new(
            ScriptedBackend::new().tool_calls(&[("write_file", json!({"path": "a.txt", "content": "hi"}))]),
        );
        backend.push(Ok(CompletionResponse::text(
            r#"{"subgoal_completed": true}"#,
            UsageInfo::new(5, 5),
        )));
        let gw = gateway(backend, RuntimeConfig::new("m").with_streaming(true));
        let cancel = CancellationToken::new();

        let mut state = AgentState::new(Task::new("t", "."), 5);
        let id = state.add_subgoal("write", vec![], vec![]);
        state.mark_active(&id);
        let act = gw
            .act(
                &state.task,
                state.subgoal(&id).unwrap(),
                &ToolRegistry::new(),
                "ctx",
                5,
                &cancel,
            )
            .await
            .unwrap();
        assert!(act.reply.chunks.is_empty());
        assert_eq!(act.parsed.unwrap().invocations[0].tool, "write_file");

        let reflect = gw.reflect(&state, "ctx", false, &cancel).await.unwrap();
        assert_eq!(reflect.reply.chunks, vec![r#"{"subgoal_completed": true}"#]);
        assert!(reflect.parsed.unwrap().subgoal_completed);
    }

    #[tokio::test]
    async fn cancellation_stops_the_call() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .text("late")
                .with_latency(std::time::Duration::from_secs(30)),
        );
        let gw = gateway(backend, RuntimeConfig::new("m"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gw
            .complete(vec![Message::user("hi")], None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Cancelled);
    }
}
