//! Run a task through the plan/act/observe/reflect loop from the command line.
//!
//! Reads the API key from `api.api_key` in the config file,
//! `TASKLOOP__API__API_KEY`, or `DEEPSEEK_API_KEY`.
//!
//! # Examples
//!
//! ```sh
//! # Run a task in ./workspace with a 50 cent ceiling
//! taskloop run "create file a.txt with content 'hi'" --max-cost 0.5
//!
//! # Stream model output and checkpoint to ./.taskloop
//! taskloop run "summarize notes.md into summary.md" --stream --state-dir .taskloop
//!
//! # Machine-readable updates, one JSON object per line
//! taskloop run "list the workspace" --json
//!
//! # Continue an interrupted run, or look at one
//! taskloop resume .taskloop/task_0123456789abcdef/state.json
//! taskloop inspect .taskloop/task_0123456789abcdef/state.json
//! ```
//!
//! Exit status: 0 when the task completed, 1 when it failed, 2 when it hit
//! its budget or was cancelled with Ctrl-C.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use taskloop::prelude::*;
use taskloop::settings::Settings;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Budget-governed task runner.
#[derive(Parser)]
#[command(name = "taskloop", version)]
struct Cli {
    /// TOML settings file (overridable with TASKLOOP__* variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print updates as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a new task
    Run(RunArgs),
    /// Continue a run from its state.json checkpoint
    Resume {
        /// Path to a state.json file
        state: PathBuf,
    },
    /// Show a stored run
    Inspect {
        /// Path to a state.json file
        state: PathBuf,
    },
    /// List runs stored in the state directory
    List {
        /// State directory (defaults to the configured state_dir)
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Natural-language task description
    task: String,

    // ── Workspace ──────────────────────────────────────────────
    /// Directory the file tools are confined to
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Checkpoint directory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    // ── Budget ─────────────────────────────────────────────────
    /// Maximum spend in USD
    #[arg(long)]
    max_cost: Option<f64>,

    /// Maximum ACT iterations
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Maximum wall-clock seconds
    #[arg(long)]
    max_seconds: Option<f64>,

    // ── Model ──────────────────────────────────────────────────
    /// Model to use for every completion call
    #[arg(long)]
    model: Option<String>,

    /// Stream model output as it arrives
    #[arg(long)]
    stream: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    init_tracing(&settings.log_level);

    let result = match cli.command {
        Command::Run(args) => run(settings, args, cli.json).await,
        Command::Resume { state } => resume(settings, &state, cli.json).await,
        Command::Inspect { state } => inspect(&state, cli.json),
        Command::List { state_dir } => list(&settings, state_dir, cli.json),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

/// Log to stderr so stdout carries only updates. `RUST_LOG` overrides the
/// configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Commands ───────────────────────────────────────────────────────

async fn run(mut settings: Settings, args: RunArgs, json: bool) -> Result<i32, String> {
    if let Some(workspace) = args.workspace {
        settings.workspace.path = workspace;
    }
    if let Some(dir) = args.state_dir {
        settings.state_dir = Some(dir);
    }
    if let Some(max) = args.max_cost {
        settings.limits.max_cost_usd = max;
    }
    if let Some(max) = args.max_iterations {
        settings.limits.max_iterations = max;
    }
    if let Some(max) = args.max_seconds {
        settings.limits.max_wall_clock_secs = max;
    }
    if let Some(model) = args.model {
        settings.api.model = model;
    }
    if args.stream {
        settings.runtime.streaming = true;
    }

    std::fs::create_dir_all(&settings.workspace.path).map_err(|e| {
        format!(
            "cannot create workspace {}: {e}",
            settings.workspace.path.display()
        )
    })?;

    let task = settings.task(args.task);
    let store = match settings.state_dir {
        Some(ref dir) => Some(StateStore::new(dir).map_err(|e| e.to_string())?),
        None => None,
    };
    let runtime = build_runtime(&settings, store)?;
    Ok(drive(runtime.run(task), json).await)
}

async fn resume(settings: Settings, path: &Path, json: bool) -> Result<i32, String> {
    let snapshot = StateStore::load_path(path).map_err(|e| format!("{}: {e}", path.display()))?;
    info!(
        "Loaded {} saved at {}",
        snapshot.state.task.id, snapshot.saved_at
    );

    // Checkpoints live at <state_dir>/<task_id>/state.json.
    let dir = settings
        .state_dir
        .clone()
        .or_else(|| path.parent().and_then(Path::parent).map(Path::to_path_buf));
    let store = match dir {
        Some(dir) => Some(StateStore::new(dir).map_err(|e| e.to_string())?),
        None => None,
    };

    let mut settings = settings;
    settings.workspace.path = PathBuf::from(&snapshot.state.task.workspace);
    let runtime = build_runtime(&settings, store)?;
    Ok(drive(runtime.resume(snapshot.state), json).await)
}

fn inspect(path: &Path, json: bool) -> Result<i32, String> {
    let snapshot = StateStore::load_path(path).map_err(|e| format!("{}: {e}", path.display()))?;
    if json {
        let text = serde_json::to_string_pretty(&snapshot).map_err(|e| e.to_string())?;
        println!("{text}");
        return Ok(0);
    }

    let state = &snapshot.state;
    println!("Task:      {} ({})", state.task.description, state.task.id);
    println!("Workspace: {}", state.task.workspace);
    println!("Saved:     {}", snapshot.saved_at);
    println!("Phase:     {}", state.phase);
    println!("Progress:  {}", state.progress_summary());
    println!(
        "Calls:     {} completion, {} tool, {} iteration(s)",
        state.llm_calls, state.tool_calls, state.iterations
    );
    println!("Cost:      {}", state.usage.summary());
    if let Some(ref t) = state.termination {
        println!("Ended:     {} ({})", t.reason, t.error_kind.as_deref().unwrap_or("ok"));
    }
    println!("\nSubgoals:\n{}", state.subgoal_report());
    if !state.errors.is_empty() {
        println!("\nErrors:");
        for e in &state.errors {
            println!("  - {e}");
        }
    }
    if let Some(ref output) = state.final_output {
        println!("\nOutput:\n{output}");
    }
    Ok(0)
}

fn list(settings: &Settings, state_dir: Option<PathBuf>, json: bool) -> Result<i32, String> {
    let Some(dir) = state_dir.or_else(|| settings.state_dir.clone()) else {
        return Err("no state directory: pass --state-dir or set state_dir".into());
    };
    let runs = StateStore::new(dir)
        .and_then(|store| store.list())
        .map_err(|e| e.to_string())?;
    for run in &runs {
        if json {
            println!("{}", serde_json::to_string(run).map_err(|e| e.to_string())?);
        } else {
            println!(
                "{}  {:<15} ${:<8.4} {}  {}",
                run.task_id,
                run.phase,
                run.cost_usd,
                run.saved_at.format("%Y-%m-%d %H:%M:%S"),
                run.description
            );
        }
    }
    Ok(0)
}

// ── Helpers ────────────────────────────────────────────────────────

fn build_runtime(settings: &Settings, store: Option<StateStore>) -> Result<Runtime, String> {
    let api_key = settings.api_key().map_err(|e| e.to_string())?;
    let client = ChatClient::with_timeout(&settings.api.base_url, api_key, settings.request_timeout())
        .map_err(|e| format!("failed to create API client: {e}"))?;

    let config = settings.runtime_config();
    let gateway = CompletionGateway::new(Arc::new(client), &config);
    let tools = ToolRegistry::new()
        .with_workspace_tools_configured(settings.workspace_tools())
        .map_err(|e| e.to_string())?;
    info!(
        "Model {} via {}, tools: {}",
        config.model,
        settings.api.base_url,
        tools.names().join(", ")
    );

    let mut runtime = Runtime::new(gateway, Arc::new(tools), config).with_observer(LoggingObserver);
    if let Some(store) = store {
        runtime = runtime.with_store(store);
    }
    Ok(runtime)
}

/// Print updates until the run ends; Ctrl-C cancels it.
async fn drive(mut run: AgentRun, json: bool) -> i32 {
    let token = run.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            token.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    while let Some(update) = run.next_update().await {
        if json {
            if let Ok(line) = serde_json::to_string(&update) {
                println!("{line}");
            }
            continue;
        }
        match update.kind {
            UpdateKind::Text => {
                print!("{}", update.message);
                let _ = stdout.flush();
            }
            UpdateKind::PhaseChanged => println!("── {}", update.message),
            UpdateKind::ToolStarted => println!("  [tool] {}", update.message),
            UpdateKind::ToolFinished => {
                let mark = if update.payload["success"] == true { "ok" } else { "failed" };
                println!("  [tool] {mark}: {}", update.message);
            }
            UpdateKind::CostUpdate => {}
            UpdateKind::Completed => println!("\n{}", update.message),
            UpdateKind::Error | UpdateKind::BudgetExceeded | UpdateKind::Cancelled => {
                println!("\n[{}] {}", update.kind, update.message);
                if let Some(output) = update.payload["final_output"].as_str() {
                    println!("{output}");
                }
            }
        }
    }

    let state = run.state();
    info!("{} ({})", state.progress_summary(), state.usage.summary());
    exit_code(state)
}

fn exit_code(state: &AgentState) -> i32 {
    let cancelled = state
        .termination
        .as_ref()
        .and_then(|t| t.error_kind.as_deref())
        == Some("cancelled");
    match state.phase {
        Phase::Completed => 0,
        Phase::BudgetExceeded => 2,
        _ if cancelled => 2,
        _ => 1,
    }
}
