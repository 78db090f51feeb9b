//! Built-in workspace tools.
//!
//! Every file tool is confined to a workspace root: absolute paths and any
//! `..` component are rejected before touching the filesystem, and reads
//! and writes are capped at `max_file_size_bytes`.
//!
//! # Available tools
//!
//! | Tool | Name | Purpose |
//! |------|------|---------|
//! | [`ReadFile`] | `read_file` | Read a UTF-8 file |
//! | [`WriteFile`] | `write_file` | Create, overwrite or append to a file |
//! | [`ListDirectory`] | `list_directory` | List a directory, optionally recursively |
//! | [`DeleteFile`] | `delete_file` | Delete a file (dangerous) |
//! | [`HttpGet`] | `http_get` | Fetch a URL |
//! | [`PythonExecute`] | `python_execute` | Run code under limits (opt-in, dangerous) |
//!
//! # Example
//!
//! ```ignore
//! let tools = ToolRegistry::new().with_workspace_tools_configured(
//!     WorkspaceToolsConfig::new("./workspace").max_file_size_mb(1),
//! )?;
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::RegistryError;
use crate::tools::code::{CodeExecutionConfig, PythonExecute};
use crate::tools::core::{Tool, ToolFuture, ToolRegistry};
use crate::tools::metadata::{ToolCategory, ToolMetadata};
use crate::tools::names;

// ── Defaults ────────────────────────────────────────────────────────

pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

pub const DEFAULT_MAX_HTTP_RESPONSE_BYTES: u64 = 5 * 1024 * 1024;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared settings for the workspace tools.
#[derive(Debug, Clone)]
pub struct WorkspaceToolsConfig {
    pub root: PathBuf,
    pub max_file_size_bytes: u64,
    pub max_http_response_bytes: u64,
    pub http_timeout: Duration,
    /// Register `http_get`.
    pub enable_network: bool,
    /// Register `python_execute` with these limits.
    pub code_execution: Option<CodeExecutionConfig>,
}

impl WorkspaceToolsConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            max_http_response_bytes: DEFAULT_MAX_HTTP_RESPONSE_BYTES,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            enable_network: true,
            code_execution: None,
        }
    }

    pub fn max_file_size_mb(mut self, mb: u64) -> Self {
        self.max_file_size_bytes = mb * 1024 * 1024;
        self
    }

    pub fn max_file_size_bytes(mut self, bytes: u64) -> Self {
        self.max_file_size_bytes = bytes;
        self
    }

    pub fn network(mut self, enabled: bool) -> Self {
        self.enable_network = enabled;
        self
    }

    pub fn code_execution(mut self, config: CodeExecutionConfig) -> Self {
        self.code_execution = Some(config);
        self
    }
}

impl ToolRegistry {
    /// Register the built-in workspace tools with default limits.
    pub fn with_workspace_tools(self, root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        self.with_workspace_tools_configured(WorkspaceToolsConfig::new(root))
    }

    pub fn with_workspace_tools_configured(
        self,
        config: WorkspaceToolsConfig,
    ) -> Result<Self, RegistryError> {
        let config = Arc::new(config);
        let mut reg = self
            .with(ReadFile::new(Arc::clone(&config)))?
            .with(WriteFile::new(Arc::clone(&config)))?
            .with(ListDirectory::new(Arc::clone(&config)))?
            .with(DeleteFile::new(Arc::clone(&config)))?;
        if let Some(ref code) = config.code_execution {
            reg = reg.with(PythonExecute::new(&config.root, code.clone()))?;
        }
        if config.enable_network {
            reg.with(HttpGet::new(config))
        } else {
            Ok(reg)
        }
    }
}

/// Resolve a workspace-relative path, rejecting anything that could escape.
pub fn resolve_in_workspace(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let rel = Path::new(relative);
    if rel.is_absolute() || relative.starts_with('/') || relative.starts_with('\\') {
        return Err(format!("access denied: '{relative}' is an absolute path"));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(format!("access denied: '{relative}' is outside the workspace")),
        }
    }
    Ok(root.join(rel))
}

fn parse<A: for<'de> Deserialize<'de>>(args: serde_json::Value) -> Result<A, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

// ── Typed argument structs ──────────────────────────────────────────

/// Typed arguments for `read_file`.
#[derive(Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// File path relative to the workspace root (e.g. 'notes/todo.md').
    pub path: String,
}

/// Typed arguments for `write_file`.
#[derive(Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    /// File path relative to the workspace root. Parent directories are created.
    pub path: String,
    /// Text to write.
    pub content: String,
    /// Append instead of overwriting (default false).
    #[serde(default)]
    pub append: Option<bool>,
}

/// Typed arguments for `list_directory`.
#[derive(Deserialize, JsonSchema)]
pub struct ListDirectoryArgs {
    /// Directory relative to the workspace root (default '.').
    #[serde(default)]
    pub path: Option<String>,
    /// List files in all subdirectories (default false).
    #[serde(default)]
    pub recursive: Option<bool>,
}

/// Typed arguments for `delete_file`.
#[derive(Deserialize, JsonSchema)]
pub struct DeleteFileArgs {
    /// File path relative to the workspace root.
    pub path: String,
}

/// Typed arguments for `http_get`.
#[derive(Deserialize, JsonSchema)]
pub struct HttpGetArgs {
    /// Absolute http:// or https:// URL to fetch.
    pub url: String,
}

// ── ReadFile ────────────────────────────────────────────────────────

pub struct ReadFile {
    config: Arc<WorkspaceToolsConfig>,
}

impl ReadFile {
    pub fn new(config: Arc<WorkspaceToolsConfig>) -> Self {
        Self { config }
    }
}

impl Tool for ReadFile {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            names::READ_FILE,
            "Read a UTF-8 text file from the workspace",
            ToolCategory::File,
        )
        .params_from::<ReadFileArgs>()
        .filesystem()
    }

    fn execute(&self, args: serde_json::Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: ReadFileArgs = parse(args)?;
            let full_path = resolve_in_workspace(&self.config.root, &args.path)?;

            let meta = fs::metadata(&full_path)
                .await
                .map_err(|_| format!("file not found: {}", args.path))?;
            if meta.is_dir() {
                return Err(format!(
                    "'{}' is a directory, not a file. Use list_directory to browse directories.",
                    args.path
                ));
            }
            if meta.len() > self.config.max_file_size_bytes {
                return Err(format!(
                    "file too large: {} bytes (max: {})",
                    meta.len(),
                    self.config.max_file_size_bytes
                ));
            }

            let bytes = fs::read(&full_path)
                .await
                .map_err(|e| format!("error reading '{}': {e}", args.path))?;
            let content = String::from_utf8(bytes)
                .map_err(|_| format!("file is not valid UTF-8 text: {}", args.path))?;

            Ok(json!({
                "path": args.path,
                "content": content,
                "size_bytes": meta.len(),
                "lines": content.lines().count(),
            }))
        })
    }
}

// ── WriteFile ───────────────────────────────────────────────────────

pub struct WriteFile {
    config: Arc<WorkspaceToolsConfig>,
}

impl WriteFile {
    pub fn new(config: Arc<WorkspaceToolsConfig>) -> Self {
        Self { config }
    }
}

impl Tool for WriteFile {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            names::WRITE_FILE,
            "Write text to a file in the workspace, creating directories as needed",
            ToolCategory::File,
        )
        .params_from::<WriteFileArgs>()
        .filesystem()
    }

    fn execute(&self, args: serde_json::Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: WriteFileArgs = parse(args)?;
            let full_path = resolve_in_workspace(&self.config.root, &args.path)?;
            let size = args.content.len() as u64;
            if size > self.config.max_file_size_bytes {
                return Err(format!(
                    "content too large: {size} bytes (max: {})",
                    self.config.max_file_size_bytes
                ));
            }

            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("error creating directories for '{}': {e}", args.path))?;
            }

            let append = args.append.unwrap_or(false);
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&full_path)
                .await
                .map_err(|e| format!("error opening '{}': {e}", args.path))?;
            file.write_all(args.content.as_bytes())
                .await
                .map_err(|e| format!("error writing '{}': {e}", args.path))?;
            file.flush()
                .await
                .map_err(|e| format!("error writing '{}': {e}", args.path))?;

            let action = if append { "Appended to" } else { "Wrote" };
            Ok(json!(format!(
                "{action} {} ({} characters)",
                args.path,
                args.content.chars().count()
            )))
        })
    }
}

// ── ListDirectory ───────────────────────────────────────────────────

pub struct ListDirectory {
    config: Arc<WorkspaceToolsConfig>,
}

impl ListDirectory {
    pub fn new(config: Arc<WorkspaceToolsConfig>) -> Self {
        Self { config }
    }
}

impl Tool for ListDirectory {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            names::LIST_DIRECTORY,
            "List entries of a workspace directory. Directories end with '/'. \
             Recursive listings contain files only.",
            ToolCategory::File,
        )
        .params_from::<ListDirectoryArgs>()
        .filesystem()
    }

    fn execute(&self, args: serde_json::Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: ListDirectoryArgs = parse(args)?;
            let dir = args.path.unwrap_or_else(|| ".".into());
            let root = &self.config.root;
            let full_path = resolve_in_workspace(root, &dir)?;

            let meta = fs::metadata(&full_path)
                .await
                .map_err(|_| format!("directory not found: {dir}"))?;
            if !meta.is_dir() {
                return Err(format!("not a directory: {dir}"));
            }

            let mut entries = Vec::new();
            if args.recursive.unwrap_or(false) {
                let mut pending = vec![full_path];
                while let Some(current) = pending.pop() {
                    let mut reader = fs::read_dir(&current)
                        .await
                        .map_err(|e| format!("error listing '{dir}': {e}"))?;
                    while let Some(entry) = reader
                        .next_entry()
                        .await
                        .map_err(|e| format!("error listing '{dir}': {e}"))?
                    {
                        let path = entry.path();
                        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                            pending.push(path);
                        } else {
                            entries.push(relative_display(root, &path));
                        }
                    }
                }
            } else {
                let mut reader = fs::read_dir(&full_path)
                    .await
                    .map_err(|e| format!("error listing '{dir}': {e}"))?;
                while let Some(entry) = reader
                    .next_entry()
                    .await
                    .map_err(|e| format!("error listing '{dir}': {e}"))?
                {
                    let mut name = relative_display(root, &entry.path());
                    if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                        name.push('/');
                    }
                    entries.push(name);
                }
            }
            entries.sort();
            Ok(json!(entries))
        })
    }
}

// ── DeleteFile ──────────────────────────────────────────────────────

pub struct DeleteFile {
    config: Arc<WorkspaceToolsConfig>,
}

impl DeleteFile {
    pub fn new(config: Arc<WorkspaceToolsConfig>) -> Self {
        Self { config }
    }
}

impl Tool for DeleteFile {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            names::DELETE_FILE,
            "Delete a file from the workspace. Cannot be undone.",
            ToolCategory::File,
        )
        .params_from::<DeleteFileArgs>()
        .filesystem()
        .dangerous()
    }

    fn execute(&self, args: serde_json::Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: DeleteFileArgs = parse(args)?;
            let full_path = resolve_in_workspace(&self.config.root, &args.path)?;
            let meta = fs::metadata(&full_path)
                .await
                .map_err(|_| format!("file not found: {}", args.path))?;
            if !meta.is_file() {
                return Err(format!("not a file: {}", args.path));
            }
            fs::remove_file(&full_path)
                .await
                .map_err(|e| format!("error deleting '{}': {e}", args.path))?;
            Ok(json!(format!("Deleted {}", args.path)))
        })
    }
}

// ── HttpGet ─────────────────────────────────────────────────────────

pub struct HttpGet {
    config: Arc<WorkspaceToolsConfig>,
}

impl HttpGet {
    pub fn new(config: Arc<WorkspaceToolsConfig>) -> Self {
        Self { config }
    }
}

impl Tool for HttpGet {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            names::HTTP_GET,
            "Fetch a URL with HTTP GET and return the status and body text",
            ToolCategory::Web,
        )
        .params_from::<HttpGetArgs>()
        .network()
    }

    fn execute(&self, args: serde_json::Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: HttpGetArgs = parse(args)?;
            if !(args.url.starts_with("http://") || args.url.starts_with("https://")) {
                return Err(format!("unsupported URL scheme: {}", args.url));
            }
            let max = self.config.max_http_response_bytes;

            let client = reqwest::Client::builder()
                .timeout(self.config.http_timeout)
                .user_agent(concat!("taskloop/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| e.to_string())?;
            let resp = client
                .get(&args.url)
                .send()
                .await
                .map_err(|e| format!("request failed: {e}"))?;

            if let Some(len) = resp.content_length()
                && len > max
            {
                return Err(format!("response too large: {len} bytes (max: {max})"));
            }

            let status = resp.status().as_u16();
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            let body = resp
                .text()
                .await
                .map_err(|e| format!("failed to read response body: {e}"))?;
            if body.len() as u64 > max {
                return Err(format!("response too large: {} bytes (max: {max})", body.len()));
            }

            Ok(json!({
                "url": args.url,
                "status": status,
                "content_type": content_type,
                "body": body,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::core::{DangerousToolPolicy, ToolErrorKind};

    const T: Duration = Duration::from_secs(5);

    fn registry(root: &Path) -> ToolRegistry {
        ToolRegistry::new()
            .with_workspace_tools_configured(WorkspaceToolsConfig::new(root).network(false))
            .unwrap()
    }

    #[test]
    fn path_resolution_rejects_escapes() {
        let root = Path::new("/ws");
        assert_eq!(resolve_in_workspace(root, "a/b.txt").unwrap(), root.join("a/b.txt"));
        assert!(resolve_in_workspace(root, "./a.txt").is_ok());
        assert!(resolve_in_workspace(root, "../etc/passwd").is_err());
        assert!(resolve_in_workspace(root, "a/../../x").is_err());
        assert!(resolve_in_workspace(root, "/etc/passwd").is_err());
    }

    #[test]
    fn registers_all_file_tools() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert_eq!(
            reg.names(),
            vec!["read_file", "write_file", "list_directory", "delete_file"]
        );
        let with_net = ToolRegistry::new().with_workspace_tools(dir.path()).unwrap();
        assert!(with_net.contains("http_get"));
        assert!(with_net.get("delete_file").unwrap().metadata().dangerous);
        assert!(!with_net.contains("python_execute"));

        let with_code = ToolRegistry::new()
            .with_workspace_tools_configured(
                WorkspaceToolsConfig::new(dir.path())
                    .network(false)
                    .code_execution(CodeExecutionConfig::default()),
            )
            .unwrap();
        assert_eq!(with_code.names().last().map(String::as_str), Some("python_execute"));
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        let w = reg
            .execute("write_file", &json!({"path": "notes/a.txt", "content": "hi"}), T)
            .await;
        assert!(w.success, "{w:?}");
        assert_eq!(w.output, json!("Wrote notes/a.txt (2 characters)"));

        let a = reg
            .execute(
                "write_file",
                &json!({"path": "notes/a.txt", "content": "!", "append": true}),
                T,
            )
            .await;
        assert!(a.success);

        let r = reg.execute("read_file", &json!({"path": "notes/a.txt"}), T).await;
        assert!(r.success);
        assert_eq!(r.output["content"], "hi!");
        assert_eq!(r.output["lines"], 1);
    }

    #[tokio::test]
    async fn read_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let reg = registry(dir.path());

        let missing = reg.execute("read_file", &json!({"path": "nope.txt"}), T).await;
        assert_eq!(missing.error_kind(), Some(ToolErrorKind::Execution));
        assert!(missing.error_message().unwrap().contains("not found"));

        let is_dir = reg.execute("read_file", &json!({"path": "sub"}), T).await;
        assert!(is_dir.error_message().unwrap().contains("directory"));

        let escape = reg.execute("read_file", &json!({"path": "../x"}), T).await;
        assert!(escape.error_message().unwrap().contains("outside"));
    }

    #[tokio::test]
    async fn size_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ToolRegistry::new()
            .with_workspace_tools_configured(
                WorkspaceToolsConfig::new(dir.path())
                    .max_file_size_bytes(4)
                    .network(false),
            )
            .unwrap();
        let w = reg
            .execute("write_file", &json!({"path": "big.txt", "content": "too long"}), T)
            .await;
        assert!(w.error_message().unwrap().contains("too large"));

        std::fs::write(dir.path().join("big.txt"), "0123456789").unwrap();
        let r = reg.execute("read_file", &json!({"path": "big.txt"}), T).await;
        assert!(r.error_message().unwrap().contains("too large"));
    }

    #[tokio::test]
    async fn list_flat_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.txt"), "x").unwrap();
        std::fs::write(dir.path().join("a/b/deep.txt"), "x").unwrap();
        let reg = registry(dir.path());

        let flat = reg.execute("list_directory", &json!({}), T).await;
        assert_eq!(flat.output, json!(["a/", "top.txt"]));

        let deep = reg
            .execute("list_directory", &json!({"path": ".", "recursive": true}), T)
            .await;
        assert_eq!(deep.output, json!(["a/b/deep.txt", "top.txt"]));
    }

    #[tokio::test]
    async fn delete_is_gated_by_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tmp.txt"), "x").unwrap();
        let reg = registry(dir.path());

        let denied = reg
            .execute_with_policy(
                "delete_file",
                &json!({"path": "tmp.txt"}),
                T,
                &DangerousToolPolicy::deny_all(),
            )
            .await;
        assert_eq!(denied.error_kind(), Some(ToolErrorKind::PermissionDenied));
        assert!(dir.path().join("tmp.txt").exists());

        let deleted = reg.execute("delete_file", &json!({"path": "tmp.txt"}), T).await;
        assert!(deleted.success);
        assert!(!dir.path().join("tmp.txt").exists());
    }

    #[tokio::test]
    async fn http_get_rejects_non_http_urls() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ToolRegistry::new().with_workspace_tools(dir.path()).unwrap();
        let r = reg
            .execute("http_get", &json!({"url": "file:///etc/passwd"}), T)
            .await;
        assert!(r.error_message().unwrap().contains("unsupported URL scheme"));
    }
}
