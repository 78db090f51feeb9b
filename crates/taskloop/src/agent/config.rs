//! Configuration for a [`Runtime`](super::runtime::Runtime) run.
//!
//! The runtime never reads global state: everything it needs arrives in a
//! [`RuntimeConfig`] at construction, and resource ceilings arrive with the
//! [`Task`](super::state::Task)'s [`Budget`](super::budget::Budget).
//!
//! # Examples
//!
//! Minimal configuration, everything else at defaults:
//!
//! ```ignore
//! let config = RuntimeConfig::new("deepseek-chat");
//! ```
//!
//! Customized with builder methods:
//!
//! ```ignore
//! let config = RuntimeConfig::new("deepseek-chat")
//!     .with_max_tokens(2048)
//!     .with_temperature(0.2)
//!     .with_streaming(true)
//!     .with_retries(5)
//!     .with_max_parallel_tools(4);
//! ```
//!
//! Less common knobs are plain struct fields:
//!
//! ```ignore
//! let config = RuntimeConfig {
//!     max_subgoal_attempts: 3,
//!     summarize_on_completion: false,
//!     ..RuntimeConfig::new("deepseek-chat")
//! };
//! ```

use std::time::Duration;

use crate::agent::memory::DEFAULT_MEMORY_CAPACITY;
use crate::api::retry::RetryConfig;
use crate::tools::{DEFAULT_TOOL_TIMEOUT, DangerousToolPolicy};

/// Runtime settings that are not resource ceilings.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Model identifier sent with every completion request.
    pub model: String,
    /// Maximum tokens per completion (0 leaves it to the service).
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Retry policy for transient completion failures.
    pub retry: RetryConfig,
    /// Request streamed completions and forward raw chunks as `text` updates.
    pub streaming: bool,
    /// Tool invocations executed concurrently within one ACT batch.
    pub max_parallel_tools: usize,
    /// Per-invocation deadline.
    pub tool_timeout: Duration,
    /// Invocations beyond this per ACT step are dropped.
    pub max_tool_calls_per_step: usize,
    /// Working-memory capacity.
    pub memory_capacity: usize,
    /// Observations included in act/reflect prompts.
    pub context_window: usize,
    /// Upper bound on the total number of subgoals.
    pub max_subgoals: usize,
    /// ACT attempts per subgoal before it is marked failed.
    pub max_subgoal_attempts: u32,
    /// Unparseable act/reflect responses tolerated before the run fails.
    pub max_validation_failures: u32,
    /// Let reflection append new subgoals to the plan.
    pub allow_plan_augmentation: bool,
    /// Gate for tools flagged dangerous, applied on top of the registry's
    /// own policy: a dangerous tool runs only if both permit it.
    pub dangerous_policy: DangerousToolPolicy,
    /// Checkpoint every N iterations (0 = only at terminal states).
    pub state_save_interval: u32,
    /// Ask the model for a final summary on success.
    pub summarize_on_completion: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            max_tokens: 2048,
            temperature: 0.3,
            retry: RetryConfig::default(),
            streaming: false,
            max_parallel_tools: 3,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_tool_calls_per_step: 5,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            context_window: 5,
            max_subgoals: 20,
            max_subgoal_attempts: 2,
            max_validation_failures: 3,
            allow_plan_augmentation: false,
            dangerous_policy: DangerousToolPolicy::default(),
            state_save_interval: 5,
            summarize_on_completion: true,
        }
    }
}

impl RuntimeConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Retry transient completion failures up to `max_retries` times with
    /// exponential backoff.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry = RetryConfig::with_retries(max_retries);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Values below one are raised to one.
    pub fn with_max_parallel_tools(mut self, n: usize) -> Self {
        self.max_parallel_tools = n.max(1);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    pub fn with_max_subgoals(mut self, max_subgoals: usize) -> Self {
        self.max_subgoals = max_subgoals;
        self
    }

    pub fn with_plan_augmentation(mut self, allow: bool) -> Self {
        self.allow_plan_augmentation = allow;
        self
    }

    pub fn with_dangerous_policy(mut self, policy: DangerousToolPolicy) -> Self {
        self.dangerous_policy = policy;
        self
    }

    pub fn with_state_save_interval(mut self, iterations: u32) -> Self {
        self.state_save_interval = iterations;
        self
    }

    pub fn with_summary(mut self, summarize: bool) -> Self {
        self.summarize_on_completion = summarize;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::new("m");
        assert_eq!(config.model, "m");
        assert_eq!(config.max_parallel_tools, 3);
        assert_eq!(config.tool_timeout, Duration::from_secs(30));
        assert_eq!(config.memory_capacity, 20);
        assert_eq!(config.context_window, 5);
        assert_eq!(config.max_subgoals, 20);
        assert!(!config.allow_plan_augmentation);
        assert!(config.summarize_on_completion);
        assert_eq!(config.dangerous_policy, DangerousToolPolicy::Allow);
    }

    #[test]
    fn builders() {
        let config = RuntimeConfig::new("m")
            .with_retries(5)
            .with_max_parallel_tools(0)
            .with_plan_augmentation(true)
            .with_streaming(true);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.max_parallel_tools, 1);
        assert!(config.allow_plan_augmentation);
        assert!(config.streaming);
    }
}
