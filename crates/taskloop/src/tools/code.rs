//! Sandboxed code execution.
//!
//! [`PythonExecute`] runs a snippet in a child process started from the
//! workspace root. The child gets a virtual-memory cap (`ulimit -v`, applied
//! by the wrapping `sh` before it execs the interpreter), a null stdin, its
//! own deadline and `kill_on_drop`, so a timeout at either this tool or the
//! registry kills the process instead of leaking it. stdout and stderr are
//! captured separately.
//!
//! The tool is flagged dangerous and is only registered when code execution
//! is enabled in [`WorkspaceToolsConfig`](super::WorkspaceToolsConfig).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::tools::core::{Tool, ToolFuture};
use crate::tools::metadata::{ToolCategory, ToolMetadata};
use crate::tools::names;

pub const DEFAULT_CODE_MEMORY_LIMIT_MB: u64 = 512;

pub const DEFAULT_CODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit status the wrapper uses when the memory cap cannot be applied.
const LIMIT_FAILED_EXIT: i32 = 125;

/// Limits for [`PythonExecute`].
#[derive(Debug, Clone, PartialEq)]
pub struct CodeExecutionConfig {
    /// Interpreter command line; the code is appended as the last argument.
    pub interpreter: Vec<String>,
    pub max_memory_mb: u64,
    /// Upper bound for the per-call `timeout_secs` argument.
    pub timeout: Duration,
}

impl Default for CodeExecutionConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".into(), "-I".into(), "-c".into()],
            max_memory_mb: DEFAULT_CODE_MEMORY_LIMIT_MB,
            timeout: DEFAULT_CODE_TIMEOUT,
        }
    }
}

impl CodeExecutionConfig {
    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a different interpreter, e.g. `["python3.12", "-c"]`.
    pub fn interpreter<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interpreter = argv.into_iter().map(Into::into).collect();
        self
    }
}

/// Typed arguments for `python_execute`.
#[derive(Deserialize, JsonSchema)]
pub struct PythonExecuteArgs {
    /// Python source to run. Print anything you need to see.
    pub code: String,
    /// Execution timeout in seconds (default 30, capped by configuration).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub struct PythonExecute {
    root: PathBuf,
    config: CodeExecutionConfig,
}

impl PythonExecute {
    pub fn new(root: impl Into<PathBuf>, config: CodeExecutionConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    fn deadline(&self, requested: Option<u64>) -> Duration {
        match requested {
            Some(secs) if secs > 0 => Duration::from_secs(secs).min(self.config.timeout),
            _ => self.config.timeout,
        }
    }

    /// `sh -c 'ulimit -v KB || exit 125; exec "$@"' sh <interpreter...> <code>`
    fn command(&self, code: &str) -> Result<Command, String> {
        let Some((program, rest)) = self.config.interpreter.split_first() else {
            return Err("no interpreter configured".into());
        };
        let limit_kb = self.config.max_memory_mb.saturating_mul(1024);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!(
                "ulimit -v {limit_kb} || exit {LIMIT_FAILED_EXIT}; exec \"$@\""
            ))
            .arg("sh")
            .arg(program)
            .args(rest)
            .arg(code)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

impl Tool for PythonExecute {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            names::PYTHON_EXECUTE,
            "Run Python code in a child process with a timeout and memory limit. \
             Returns captured stdout, stderr and the exit code.",
            ToolCategory::Code,
        )
        .params_from::<PythonExecuteArgs>()
        .filesystem()
        .dangerous()
    }

    fn execute(&self, args: serde_json::Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: PythonExecuteArgs = serde_json::from_value(args)
                .map_err(|e| format!("invalid arguments: {e}"))?;
            let deadline = self.deadline(args.timeout_secs);
            let child = self
                .command(&args.code)?
                .spawn()
                .map_err(|e| format!("failed to start interpreter: {e}"))?;

            // Dropping the pending wait on timeout kills the child.
            let output = tokio::time::timeout(deadline, child.wait_with_output())
                .await
                .map_err(|_| {
                    format!(
                        "code execution timed out after {} seconds",
                        deadline.as_secs_f64()
                    )
                })?
                .map_err(|e| format!("failed to collect output: {e}"))?;

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let exit_code = output.status.code();
            debug!(
                "Code execution exited with {:?} ({} bytes stdout, {} bytes stderr)",
                exit_code,
                stdout.len(),
                stderr.len()
            );

            match exit_code {
                Some(0) => Ok(json!({
                    "stdout": stdout,
                    "stderr": stderr,
                    "exit_code": 0,
                    "lines": args.code.lines().count(),
                })),
                Some(LIMIT_FAILED_EXIT) if stdout.is_empty() => Err(format!(
                    "could not apply the {} MB memory limit: {}",
                    self.config.max_memory_mb,
                    stderr.trim()
                )),
                Some(code) => Err(format!(
                    "code exited with status {code}\n[stdout]\n{stdout}\n[stderr]\n{stderr}"
                )),
                None => Err(format!(
                    "code was terminated by a signal (memory limit {} MB)\n[stderr]\n{stderr}",
                    self.config.max_memory_mb
                )),
            }
        })
    }
}
