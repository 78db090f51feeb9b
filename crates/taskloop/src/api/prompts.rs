//! Prompt construction and response parsing for the gateway operations.
//!
//! All four operations share one completion primitive; they differ only in
//! the messages built here and in how the reply is read back. Parsers are
//! lenient about packaging (code fences, prose around the JSON, alternate
//! field names) and strict about content: a reply without a usable payload
//! is an `Err` the runtime counts as a validation failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::plan::PlannedSubgoal;
use crate::agent::state::{AgentState, Subgoal, Task};
use crate::tools::ToolInvocation;
use crate::{CompletionResponse, Message};

const PLAN_SYSTEM: &str = "You are a precise task planner. Output only valid JSON.";

const ACT_SYSTEM: &str = "You are an autonomous agent executing one step of a plan. \
Call the available tools to accomplish the step. If you cannot call tools natively, \
answer with JSON only.";

const REFLECT_SYSTEM: &str = "You are a reflection engine for an autonomous agent. \
Analyze what just happened and decide what to do next. Respond with JSON only.";

const SUMMARY_SYSTEM: &str = "You summarize the outcome of completed agent tasks concisely.";

// ── Builders ───────────────────────────────────────────────────────

/// Messages asking for a decomposition of `task` into subgoals.
pub fn plan_messages(task: &Task, tool_descriptions: &str, max_subgoals: usize) -> Vec<Message> {
    let prompt = format!(
        "Break down the following task into clear, executable steps.\n\n\
         Task: {}\n\n\
         Available tools:\n{tool_descriptions}\n\n\
         Create a step-by-step plan of at most {max_subgoals} steps. For each step:\n\
         1. Describe what needs to be done\n\
         2. List which tools are needed (by name)\n\
         3. List the 1-based numbers of earlier steps it depends on\n\n\
         Return your plan as a JSON array:\n\
         [\n  {{\"description\": \"Step description\", \"tools\": [\"tool1\"], \"depends_on\": []}}\n]\n\n\
         Be specific and actionable. Each step must be completable with the available tools.",
        task.description
    );
    vec![Message::system(PLAN_SYSTEM), Message::user(prompt)]
}

/// Messages asking which tools to invoke for `subgoal`.
pub fn act_messages(
    task: &Task,
    subgoal: &Subgoal,
    tool_descriptions: &str,
    context: &str,
    max_calls: usize,
) -> Vec<Message> {
    let hint = if subgoal.suggested_tools.is_empty() {
        "none".to_string()
    } else {
        subgoal.suggested_tools.join(", ")
    };
    let prompt = format!(
        "Overall task: {}\n\n\
         Current step ({}): {}\n\
         Suggested tools: {hint}\n\n\
         Recent observations:\n{context}\n\n\
         Available tools:\n{tool_descriptions}\n\n\
         Use at most {max_calls} tool calls. Workspace paths are relative to the workspace root.\n\
         If you answer in text instead of native tool calls, return JSON:\n\
         {{\"tool_calls\": [{{\"tool\": \"tool_name\", \"params\": {{\"param\": \"value\"}}}}], \
         \"reasoning\": \"why these tools\"}}",
        task.description, subgoal.id, subgoal.description
    );
    vec![Message::system(ACT_SYSTEM), Message::user(prompt)]
}

/// Messages asking for a judgement on the current subgoal.
pub fn reflect_messages(state: &AgentState, context: &str, allow_new_subgoals: bool) -> Vec<Message> {
    let current = state
        .current_subgoal
        .as_deref()
        .and_then(|id| state.subgoal(id));
    let current_line = match current {
        Some(s) => format!("{} (attempt {}): {}", s.id, s.attempts, s.description),
        None => "none".into(),
    };
    let last_step = state
        .step_results
        .last()
        .map(|step| {
            let lines: Vec<String> = step.results.iter().map(|r| r.brief(300)).collect();
            if lines.is_empty() {
                "No tools were called.".to_string()
            } else {
                lines.join("\n")
            }
        })
        .unwrap_or_else(|| "No steps executed yet.".into());
    let augmentation = if allow_new_subgoals {
        ",\n  \"new_subgoals\": [{\"description\": \"...\", \"tools\": [], \"depends_on\": []}]"
    } else {
        ""
    };
    let prompt = format!(
        "Task: {}\n\n\
         Current subgoal: {current_line}\n\n\
         Tool results from the last step:\n{last_step}\n\n\
         Recent observations:\n{context}\n\n\
         Plan status:\n{}\n\n\
         Respond with JSON only:\n\
         {{\n  \"subgoal_completed\": true,\n  \"next_action\": \"continue\" | \"retry\" | \"skip\" | \"abort\",\n  \
         \"reasoning\": \"brief explanation\"{augmentation}\n}}\n\n\
         Guidelines:\n\
         - If the tools succeeded and the step is satisfied, set subgoal_completed to true\n\
         - If the error looks recoverable, use \"retry\"\n\
         - If the step cannot succeed, use \"skip\"; if the whole task cannot succeed, use \"abort\"",
        state.task.description,
        state.subgoal_report()
    );
    vec![Message::system(REFLECT_SYSTEM), Message::user(prompt)]
}

/// Messages asking for a final summary of a finished run.
pub fn summary_messages(state: &AgentState) -> Vec<Message> {
    let prompt = format!(
        "Summarize what was accomplished in this task.\n\n\
         Original task: {}\n\n\
         Steps:\n{}\n\n\
         Provide a concise summary of what was done and the outcome.",
        state.task.description,
        state.subgoal_report()
    );
    vec![Message::system(SUMMARY_SYSTEM), Message::user(prompt)]
}

/// Summary used when the model cannot be asked.
pub fn fallback_summary(state: &AgentState) -> String {
    let c = state.counts();
    format!(
        "Task finished with {}/{} subgoals completed ({} failed). {}",
        c.completed,
        c.total,
        c.failed,
        state.usage.summary()
    )
}

// ── JSON extraction ────────────────────────────────────────────────

/// Pull a JSON value out of model output, tolerating code fences and
/// surrounding prose.
pub fn extract_json(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Ok(v);
    }

    let unfenced = trimmed
        .split("```")
        .nth(1)
        .map(|inner| inner.strip_prefix("json").unwrap_or(inner).trim());
    if let Some(inner) = unfenced
        && let Ok(v) = serde_json::from_str(inner)
    {
        return Ok(v);
    }

    let candidates = [('{', '}'), ('[', ']')];
    let mut spans: Vec<(usize, usize)> = candidates
        .iter()
        .filter_map(|&(open, close)| Some((trimmed.find(open)?, trimmed.rfind(close)?)))
        .filter(|(start, end)| start < end)
        .collect();
    spans.sort_unstable();
    for (start, end) in spans {
        if let Some(slice) = trimmed.get(start..=end)
            && let Ok(v) = serde_json::from_str(slice)
        {
            return Ok(v);
        }
    }

    let preview: String = trimmed.chars().take(120).collect();
    Err(format!("no JSON found in response: {preview}"))
}

// ── Plan ───────────────────────────────────────────────────────────

/// Normalize a dependency reference to a subgoal id. Numbers are 1-based
/// subgoal numbers.
fn dependency_id(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| format!("subgoal_{n}")),
        Value::String(s) => {
            let s = s.trim();
            let number = s.strip_prefix("step_").unwrap_or(s);
            Some(match number.parse::<u64>() {
                Ok(n) => format!("subgoal_{n}"),
                Err(_) => s.to_string(),
            })
        }
        _ => None,
    }
}

fn string_list(item: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .find_map(|k| item.get(k).and_then(Value::as_array))
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn planned_subgoal(item: &Value) -> Result<PlannedSubgoal, String> {
    if let Some(text) = item.as_str() {
        return Ok(PlannedSubgoal::new(text));
    }
    let description = ["description", "task", "step"]
        .iter()
        .find_map(|k| item.get(k).and_then(Value::as_str))
        .ok_or_else(|| format!("plan step without a description: {item}"))?;
    let depends_on = ["depends_on", "dependencies"]
        .iter()
        .find_map(|k| item.get(k).and_then(Value::as_array))
        .map(|arr| arr.iter().filter_map(dependency_id).collect())
        .unwrap_or_default();
    Ok(PlannedSubgoal {
        description: description.to_string(),
        tools: string_list(item, &["tools", "required_tools", "suggested_tools"]),
        depends_on,
    })
}

fn planned_list(items: &[Value]) -> Result<Vec<PlannedSubgoal>, String> {
    items.iter().map(planned_subgoal).collect()
}

/// Parse a plan: a JSON array of steps, or an object wrapping one under
/// `subgoals`, `plan` or `steps`.
pub fn parse_plan(text: &str) -> Result<Vec<PlannedSubgoal>, String> {
    let value = extract_json(text)?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(_) => ["subgoals", "plan", "steps"]
            .iter()
            .find_map(|k| value.get(k).and_then(Value::as_array))
            .ok_or("plan object has no subgoal list")?,
        _ => return Err("plan is not a JSON array".into()),
    };
    planned_list(items)
}

// ── Act ────────────────────────────────────────────────────────────

/// Tool invocations chosen for one ACT step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActDecision {
    pub invocations: Vec<ToolInvocation>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Read tool invocations from native tool calls, falling back to the JSON
/// text format. Arguments that are not valid JSON are passed through as a
/// string so the registry reports them as a validation failure.
pub fn parse_act(response: &CompletionResponse) -> Result<ActDecision, String> {
    let reasoning = response
        .content
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    if !response.tool_calls.is_empty() {
        let invocations = response
            .tool_calls
            .iter()
            .map(|call| {
                let raw = call.function.arguments.trim();
                let params = if raw.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
                };
                ToolInvocation::new(call.function.name.clone(), params)
            })
            .collect();
        return Ok(ActDecision {
            invocations,
            reasoning,
        });
    }

    let text = reasoning.as_deref().ok_or("empty act response")?;
    let value = extract_json(text)?;
    let calls = match &value {
        Value::Array(calls) => calls,
        Value::Object(_) => value
            .get("tool_calls")
            .and_then(Value::as_array)
            .ok_or("act response has no tool_calls list")?,
        _ => return Err("act response is not a JSON object".into()),
    };
    let invocations = calls
        .iter()
        .map(|call| -> Result<ToolInvocation, String> {
            let tool = ["tool", "name"]
                .iter()
                .find_map(|k| call.get(k).and_then(Value::as_str))
                .ok_or_else(|| format!("tool call without a tool name: {call}"))?;
            let params = ["params", "arguments", "args"]
                .iter()
                .find_map(|k| call.get(k))
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            Ok(ToolInvocation::new(tool, params))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ActDecision {
        invocations,
        reasoning: value
            .get("reasoning")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

// ── Reflect ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextAction {
    #[default]
    Continue,
    Retry,
    Skip,
    Abort,
}

impl NextAction {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "continue" => Some(NextAction::Continue),
            "retry" => Some(NextAction::Retry),
            "skip" => Some(NextAction::Skip),
            "abort" => Some(NextAction::Abort),
            _ => None,
        }
    }
}

/// Outcome of one REFLECTING step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub subgoal_completed: bool,
    pub next_action: NextAction,
    pub reasoning: String,
    pub new_subgoals: Vec<PlannedSubgoal>,
}

pub fn parse_reflection(text: &str) -> Result<Reflection, String> {
    let value = extract_json(text)?;
    if !value.is_object() {
        return Err("reflection is not a JSON object".into());
    }
    let next_action = match value.get("next_action") {
        None | Some(Value::Null) => NextAction::Continue,
        Some(Value::String(s)) => {
            NextAction::parse(s).ok_or_else(|| format!("unknown next_action '{s}'"))?
        }
        Some(other) => return Err(format!("next_action is not a string: {other}")),
    };
    let new_subgoals = match value.get("new_subgoals").and_then(Value::as_array) {
        Some(items) => planned_list(items)?,
        None => Vec::new(),
    };
    Ok(Reflection {
        subgoal_completed: value
            .get("subgoal_completed")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        next_action,
        reasoning: value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        new_subgoals,
    })
}
