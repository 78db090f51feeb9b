//! Binary settings: an optional TOML file layered with `TASKLOOP__*`
//! environment variables (double underscore nests, e.g.
//! `TASKLOOP__API__MODEL=deepseek-reasoner`).
//!
//! ```toml
//! log_level = "debug"
//! state_dir = "./.taskloop"
//!
//! [api]
//! model = "deepseek-chat"
//! timeout_secs = 60
//!
//! [limits]
//! max_cost_usd = 0.5
//! max_iterations = 20
//!
//! [workspace]
//! path = "./workspace"
//! max_file_size_mb = 10
//! allow_code_execution = true
//! code_memory_limit_mb = 256
//!
//! [runtime]
//! max_parallel_tools = 3
//! streaming = true
//! ```
//!
//! The API key may be omitted from both; it then falls back to
//! `DEEPSEEK_API_KEY`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::agent::budget::Budget;
use crate::agent::config::RuntimeConfig;
use crate::agent::state::Task;
use crate::api::retry::RetryConfig;
use crate::tools::{CodeExecutionConfig, DangerousToolPolicy, WorkspaceToolsConfig};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TASKLOOP";

/// Fallback source for the API key.
pub const API_KEY_ENV: &str = "DEEPSEEK_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("no API key: set api.api_key, TASKLOOP__API__API_KEY or {API_KEY_ENV}")]
    MissingApiKey,
}

/// Settings root.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub limits: LimitSettings,
    pub workspace: WorkspaceSettings,
    pub runtime: RuntimeSettings,
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set.
    pub log_level: String,
    /// Checkpoint directory. Checkpointing is off when unset.
    pub state_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            limits: LimitSettings::default(),
            workspace: WorkspaceSettings::default(),
            runtime: RuntimeSettings::default(),
            log_level: "info".into(),
            state_dir: None,
        }
    }
}

/// `[api]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub api_key: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: crate::DEFAULT_BASE_URL.into(),
            model: crate::DEFAULT_MODEL.into(),
            timeout_secs: crate::DEFAULT_REQUEST_TIMEOUT.as_secs(),
            api_key: None,
        }
    }
}

/// `[limits]`: the default task budget.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_cost_usd: f64,
    pub max_tokens: Option<u64>,
    pub max_iterations: u32,
    pub max_wall_clock_secs: f64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        let budget = Budget::default();
        Self {
            max_cost_usd: budget.max_cost_usd,
            max_tokens: budget.max_tokens,
            max_iterations: budget.max_iterations,
            max_wall_clock_secs: budget.max_wall_clock_secs,
        }
    }
}

/// `[workspace]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    pub path: PathBuf,
    pub max_file_size_mb: u64,
    /// Register `http_get`.
    pub allow_network: bool,
    /// Register `python_execute`.
    pub allow_code_execution: bool,
    /// Address-space cap for `python_execute` children.
    pub code_memory_limit_mb: u64,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./workspace"),
            max_file_size_mb: 10,
            allow_network: true,
            allow_code_execution: false,
            code_memory_limit_mb: crate::tools::code::DEFAULT_CODE_MEMORY_LIMIT_MB,
        }
    }
}

/// `[runtime]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_retries: u32,
    pub streaming: bool,
    pub max_parallel_tools: usize,
    pub tool_timeout_secs: u64,
    pub max_tool_calls_per_step: usize,
    pub memory_capacity: usize,
    pub context_window: usize,
    pub max_subgoals: usize,
    pub max_subgoal_attempts: u32,
    pub max_validation_failures: u32,
    pub allow_plan_augmentation: bool,
    pub state_save_interval: u32,
    pub summarize_on_completion: bool,
    /// When set, only these dangerous tools may run.
    pub authorized_dangerous_tools: Option<Vec<String>>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let rc = RuntimeConfig::default();
        Self {
            max_tokens: rc.max_tokens,
            temperature: rc.temperature,
            max_retries: rc.retry.max_retries,
            streaming: rc.streaming,
            max_parallel_tools: rc.max_parallel_tools,
            tool_timeout_secs: rc.tool_timeout.as_secs(),
            max_tool_calls_per_step: rc.max_tool_calls_per_step,
            memory_capacity: rc.memory_capacity,
            context_window: rc.context_window,
            max_subgoals: rc.max_subgoals,
            max_subgoal_attempts: rc.max_subgoal_attempts,
            max_validation_failures: rc.max_validation_failures,
            allow_plan_augmentation: rc.allow_plan_augmentation,
            state_save_interval: rc.state_save_interval,
            summarize_on_completion: rc.summarize_on_completion,
            authorized_dangerous_tools: None,
        }
    }
}

impl Settings {
    /// Load from `path` (if given and present) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        Self::build(path, None)
    }

    /// Layer the file under `env`. `None` reads the process environment.
    fn build(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Configured key, else `DEEPSEEK_API_KEY`.
    pub fn api_key(&self) -> Result<String, SettingsError> {
        self.api
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty()))
            .ok_or(SettingsError::MissingApiKey)
    }

    /// A task for `description` carrying the configured workspace and
    /// budget. Its workspace is the root [`workspace_tools`](Self::workspace_tools)
    /// confines the file tools to.
    pub fn task(&self, description: impl Into<String>) -> Task {
        Task::new(description, self.workspace.path.to_string_lossy()).with_budget(self.budget())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn budget(&self) -> Budget {
        let l = &self.limits;
        Budget {
            max_cost_usd: l.max_cost_usd,
            max_tokens: l.max_tokens,
            max_iterations: l.max_iterations,
            max_wall_clock_secs: l.max_wall_clock_secs,
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        let r = &self.runtime;
        let policy = match r.authorized_dangerous_tools {
            Some(ref authorized) => DangerousToolPolicy::RequireAuthorization {
                authorized: authorized.clone(),
            },
            None => DangerousToolPolicy::Allow,
        };
        RuntimeConfig {
            model: self.api.model.clone(),
            max_tokens: r.max_tokens,
            temperature: r.temperature,
            retry: RetryConfig::with_retries(r.max_retries),
            streaming: r.streaming,
            max_parallel_tools: r.max_parallel_tools.max(1),
            tool_timeout: Duration::from_secs(r.tool_timeout_secs),
            max_tool_calls_per_step: r.max_tool_calls_per_step,
            memory_capacity: r.memory_capacity,
            context_window: r.context_window,
            max_subgoals: r.max_subgoals,
            max_subgoal_attempts: r.max_subgoal_attempts,
            max_validation_failures: r.max_validation_failures,
            allow_plan_augmentation: r.allow_plan_augmentation,
            dangerous_policy: policy,
            state_save_interval: r.state_save_interval,
            summarize_on_completion: r.summarize_on_completion,
        }
    }

    pub fn workspace_tools(&self) -> WorkspaceToolsConfig {
        let ws = &self.workspace;
        let tools = WorkspaceToolsConfig::new(&ws.path)
            .max_file_size_mb(ws.max_file_size_mb)
            .network(ws.allow_network);
        if ws.allow_code_execution {
            tools.code_execution(
                CodeExecutionConfig::default()
                    .max_memory_mb(ws.code_memory_limit_mb)
                    .timeout(Duration::from_secs(self.runtime.tool_timeout_secs)),
            )
        } else {
            tools
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_without_sources() {
        let settings = Settings::build(None, env(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.api.base_url, "https://api.deepseek.com");
        assert_eq!(settings.api.model, "deepseek-chat");
        assert_eq!(settings.api.timeout_secs, 60);
        assert_eq!(settings.workspace.path, PathBuf::from("./workspace"));
        assert_eq!(settings.workspace.max_file_size_mb, 10);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.runtime_config(), RuntimeConfig::default());
        assert_eq!(settings.budget(), Budget::default());
    }

    #[test]
    fn file_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskloop.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"
state_dir = "/tmp/states"

[api]
model = "deepseek-reasoner"

[limits]
max_cost_usd = 0.5
max_iterations = 12

[runtime]
streaming = true
authorized_dangerous_tools = ["delete_file"]
"#,
        )
        .unwrap();

        let settings = Settings::build(
            Some(&path),
            env(&[
                ("TASKLOOP__LIMITS__MAX_ITERATIONS", "7"),
                ("TASKLOOP__WORKSPACE__PATH", "/srv/ws"),
                ("TASKLOOP__API__API_KEY", "sk-test"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.state_dir, Some(PathBuf::from("/tmp/states")));
        assert_eq!(settings.api.model, "deepseek-reasoner");
        assert_eq!(settings.api_key().unwrap(), "sk-test");

        let budget = settings.budget();
        assert_eq!(budget.max_cost_usd, 0.5);
        assert_eq!(budget.max_iterations, 7);

        let rc = settings.runtime_config();
        assert_eq!(rc.model, "deepseek-reasoner");
        assert!(rc.streaming);
        assert!(rc.dangerous_policy.permits("delete_file"));
        assert!(!rc.dangerous_policy.permits("shred"));

        assert_eq!(settings.workspace_tools().root, PathBuf::from("/srv/ws"));
        assert!(settings.workspace_tools().code_execution.is_none());
    }

    #[test]
    fn task_workspace_matches_tool_root() {
        let settings = Settings::build(
            None,
            env(&[
                ("TASKLOOP__WORKSPACE__PATH", "/srv/ws"),
                ("TASKLOOP__LIMITS__MAX_COST_USD", "0.25"),
            ]),
        )
        .unwrap();
        let task = settings.task("tidy up");
        assert_eq!(PathBuf::from(&task.workspace), settings.workspace_tools().root);
        assert_eq!(task.budget.max_cost_usd, 0.25);
    }

    #[test]
    fn code_execution_is_opt_in_with_memory_cap() {
        let settings = Settings::build(
            None,
            env(&[
                ("TASKLOOP__WORKSPACE__ALLOW_CODE_EXECUTION", "true"),
                ("TASKLOOP__WORKSPACE__CODE_MEMORY_LIMIT_MB", "128"),
            ]),
        )
        .unwrap();
        let code = settings.workspace_tools().code_execution.unwrap();
        assert_eq!(code.max_memory_mb, 128);
        assert_eq!(code.timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let settings =
            Settings::build(Some(Path::new("/nonexistent/taskloop.toml")), env(&[])).unwrap();
        assert_eq!(settings.limits.max_iterations, 50);
    }

    #[test]
    fn malformed_value_is_reported() {
        let err = Settings::build(None, env(&[("TASKLOOP__LIMITS__MAX_ITERATIONS", "many")]))
            .unwrap_err();
        assert!(matches!(err, SettingsError::Config(_)));
    }
}
