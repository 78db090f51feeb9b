//! Server-Sent Events (SSE) streaming for chat completions.
//!
//! The wire stream is decoded into [`StreamEvent`]s. Turning those events
//! into a usable response is a pure fold ([`assemble`]); the runtime sees
//! the result as a sequence of [`Delivery`] values: raw text chunks for
//! display, then exactly one final structured response.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::error::GatewayError;
use crate::{ChatClient, CompletionRequest, CompletionResponse, ToolCall, UsageInfo};

/// A single event from an SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental text content delta.
    TextDelta(String),
    /// A tool call chunk (accumulated by `index` until complete).
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// Token usage information (sent in the final chunk).
    Usage(UsageInfo),
    /// The stream is complete.
    Done,
    /// An error occurred mid-stream.
    Error(String),
}

/// What the gateway hands to the runtime for one streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Raw text as it arrived; for display only.
    Chunk(String),
    /// The fully assembled response. Always last.
    Final(CompletionResponse),
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

impl ChatClient {
    /// Send a completion request with SSE streaming and collect the events.
    ///
    /// The body is read chunk by chunk so long responses do not hit a
    /// single-body timeout.
    pub async fn chat_stream(&self, body: &CompletionRequest) -> Result<Vec<StreamEvent>, String> {
        let mut stream_body =
            serde_json::to_value(body).map_err(|e| format!("failed to serialize request: {e}"))?;
        stream_body["stream"] = serde_json::Value::Bool(true);
        stream_body["stream_options"] = serde_json::json!({"include_usage": true});

        debug!("Sending streaming completion request: model={}", body.model);

        let mut resp = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&stream_body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("API HTTP {status}: {text}"));
        }

        let mut decoder = SseDecoder::default();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| format!("request failed: could not read stream chunk: {e}"))?
        {
            decoder.feed(&String::from_utf8_lossy(&chunk));
            if decoder.done {
                break;
            }
        }
        let events = decoder.finish();

        debug!("Stream completed with {} events", events.len());
        Ok(events)
    }
}

/// Incremental line decoder for an SSE body.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: String,
    events: Vec<StreamEvent>,
    done: bool,
}

impl SseDecoder {
    fn feed(&mut self, text: &str) {
        self.buffer.push_str(text);
        while !self.done
            && let Some(newline_pos) = self.buffer.find('\n')
        {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            self.line(line.trim());
        }
    }

    fn line(&mut self, line: &str) {
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        if line == "data: [DONE]" {
            self.events.push(StreamEvent::Done);
            self.done = true;
            return;
        }
        if let Some(data) = line.strip_prefix("data: ") {
            parse_sse_data(data, &mut self.events);
        }
    }

    fn finish(mut self) -> Vec<StreamEvent> {
        if !self.done {
            let remaining = std::mem::take(&mut self.buffer);
            self.line(remaining.trim());
        }
        if !self.done {
            self.events.push(StreamEvent::Done);
        }
        self.events
    }
}

/// Decode a complete SSE body into events. Always ends with `Done`.
pub fn parse_sse_body(body: &str) -> Vec<StreamEvent> {
    let mut decoder = SseDecoder::default();
    decoder.feed(body);
    decoder.finish()
}

/// Parse a single SSE `data:` payload into stream events.
fn parse_sse_data(data: &str, events: &mut Vec<StreamEvent>) {
    let chunk = match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e} (data: {data})");
            return;
        }
    };

    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::Usage(usage));
    }

    for choice in chunk.choices.unwrap_or_default() {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content
                && !content.is_empty()
            {
                events.push(StreamEvent::TextDelta(content));
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                events.push(StreamEvent::ToolCallDelta {
                    index: tc.index.unwrap_or(0),
                    id: tc.id,
                    name,
                    arguments_delta: arguments,
                });
            }
        }
        if choice.finish_reason.is_some() {
            trace!("Stream finish_reason: {:?}", choice.finish_reason);
        }
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct Assembly {
    text: String,
    calls: BTreeMap<usize, PartialCall>,
    usage: Option<UsageInfo>,
    error: Option<String>,
}

impl Assembly {
    fn apply(mut self, event: &StreamEvent) -> Self {
        match event {
            StreamEvent::TextDelta(delta) => self.text.push_str(delta),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments_delta,
            } => {
                let call = self.calls.entry(*index).or_default();
                if id.is_some() {
                    call.id.clone_from(id);
                }
                if let Some(name) = name {
                    call.name.push_str(name);
                }
                call.arguments.push_str(arguments_delta);
            }
            StreamEvent::Usage(usage) => self.usage = Some(usage.clone()),
            StreamEvent::Error(message) => {
                self.error.get_or_insert_with(|| message.clone());
            }
            StreamEvent::Done => {}
        }
        self
    }
}

/// Fold a complete event sequence into one response.
///
/// Tool-call fragments are joined by their `index`; the last `Usage` event
/// wins. Any `Error` event fails the whole response.
pub fn assemble(events: &[StreamEvent]) -> Result<CompletionResponse, GatewayError> {
    let assembly = events.iter().fold(Assembly::default(), Assembly::apply);

    if let Some(message) = assembly.error {
        return Err(GatewayError::from_message(message));
    }

    let tool_calls: Vec<ToolCall> = assembly
        .calls
        .into_iter()
        .map(|(index, call)| {
            let id = call.id.unwrap_or_else(|| format!("call_{index}"));
            ToolCall::new(id, call.name, call.arguments)
        })
        .collect();

    let finish_reason = if tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };

    Ok(CompletionResponse {
        content: (!assembly.text.is_empty()).then_some(assembly.text),
        tool_calls,
        usage: assembly.usage,
        finish_reason: Some(finish_reason.into()),
    })
}

/// Turn raw events into the chunk/final sequence the runtime consumes.
pub fn deliveries(events: &[StreamEvent]) -> Result<Vec<Delivery>, GatewayError> {
    let response = assemble(events)?;
    let mut out: Vec<Delivery> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta(t) => Some(Delivery::Chunk(t.clone())),
            _ => None,
        })
        .collect();
    out.push(Delivery::Final(response));
    Ok(out)
}

/// Synthesize the event sequence a stream would have produced for an
/// already complete response.
pub fn events_from_response(response: &CompletionResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(ref text) = response.content
        && !text.is_empty()
    {
        events.push(StreamEvent::TextDelta(text.clone()));
    }
    for (index, call) in response.tool_calls.iter().enumerate() {
        events.push(StreamEvent::ToolCallDelta {
            index,
            id: Some(call.id.clone()),
            name: Some(call.function.name.clone()),
            arguments_delta: call.function.arguments.clone(),
        });
    }
    if let Some(ref usage) = response.usage {
        events.push(StreamEvent::Usage(usage.clone()));
    }
    events.push(StreamEvent::Done);
    events
}
