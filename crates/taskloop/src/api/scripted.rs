//! Deterministic completion backend.
//!
//! [`ScriptedBackend`] answers requests from a queue of prepared responses
//! and errors, in order. Once the queue is empty it returns the fallback
//! response, or a permanent error when none is set. Every request is
//! recorded so tests can inspect prompts after a run.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::api::backend::{CompletionBackend, CompletionFuture};
use crate::error::GatewayError;
use crate::{CompletionRequest, CompletionResponse, ToolCall, UsageInfo};

/// Usage attached by the convenience constructors.
const SCRIPTED_USAGE: (u32, u32) = (100, 20);

#[derive(Default)]
pub struct ScriptedBackend {
    queue: Mutex<VecDeque<Result<CompletionResponse, GatewayError>>>,
    fallback: Option<CompletionResponse>,
    latency: Option<Duration>,
    calls: AtomicU32,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response.
    pub fn respond(self, response: CompletionResponse) -> Self {
        self.push(Ok(response));
        self
    }

    /// Queue a text response with fixed usage.
    pub fn text(self, content: impl Into<String>) -> Self {
        let (p, c) = SCRIPTED_USAGE;
        self.respond(CompletionResponse::text(content, UsageInfo::new(p, c)))
    }

    /// Queue a native tool-call response with fixed usage. Each call is
    /// `(name, arguments)`.
    pub fn tool_calls(self, calls: &[(&str, serde_json::Value)]) -> Self {
        let (p, c) = SCRIPTED_USAGE;
        let calls = calls
            .iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall::new(format!("call_{i}"), *name, args.to_string()))
            .collect();
        self.respond(CompletionResponse::tool_calls(calls, UsageInfo::new(p, c)))
    }

    /// Queue an error.
    pub fn fail(self, error: GatewayError) -> Self {
        self.push(Err(error));
        self
    }

    /// Response used once the queue runs dry.
    pub fn with_fallback(mut self, response: CompletionResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    /// Delay every answer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue an entry on a shared backend.
    pub fn push(&self, entry: Result<CompletionResponse, GatewayError>) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(entry);
        }
    }

    /// Number of `complete` calls made, including failed ones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().map_or(0, |q| q.len())
    }

    /// Every request seen, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next(&self) -> Result<CompletionResponse, GatewayError> {
        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        match queued {
            Some(entry) => entry,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| GatewayError::Permanent("scripted backend exhausted".into())),
        }
    }
}

impl CompletionBackend for ScriptedBackend {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut r) = self.requests.lock() {
                r.push(request.clone());
            }
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.next()
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replays_queue_in_order_then_fallback() {
        let backend = ScriptedBackend::new()
            .fail(GatewayError::Transient("HTTP 503".into()))
            .text("one")
            .tool_calls(&[("read_file", json!({"path": "a"}))])
            .with_fallback(CompletionResponse::text("fallback", UsageInfo::new(1, 1)));
        let req = CompletionRequest::default();

        assert!(backend.complete(&req).await.unwrap_err().is_transient());
        assert_eq!(backend.complete(&req).await.unwrap().content.as_deref(), Some("one"));
        let calls = backend.complete(&req).await.unwrap().tool_calls;
        assert_eq!(calls[0].function.name, "read_file");
        assert_eq!(calls[0].function.arguments, r#"{"path":"a"}"#);
        assert_eq!(
            backend.complete(&req).await.unwrap().content.as_deref(),
            Some("fallback")
        );
        assert_eq!(backend.calls(), 4);
        assert_eq!(backend.requests().len(), 4);
        assert_eq!(backend.remaining(), 0);
    }

    #[tokio::test]
    async fn exhausted_without_fallback_is_permanent() {
        let backend = ScriptedBackend::new();
        let err = backend.complete(&CompletionRequest::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Permanent(_)));
    }
}
