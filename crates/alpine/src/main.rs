//! alpine — drives an external AI coding assistant through iterative,
//! state-driven development tasks.
//!
//! Entry Orchestrator (Section 4.9): parses flags, validates
//! mutually-exclusive combinations, loads configuration, and dispatches to
//! either one foreground workflow run or the HTTP control plane.

use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use eyre::WrapErr;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

use alpine::engine::{Engine, RunOptions};
use alpine::event_bus::EventBus;
use alpine::run_registry::RunRegistry;
use alpine::server::{self, AppState};
use alpine::signal;
use alpine_core::config::Config;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "alpine", version, about = "Drive an AI assistant through an iterative task loop")]
struct Cli {
    /// The task description. Omit with --continue.
    task: Option<String>,

    /// Skip the planning bootstrap prompt.
    #[arg(long)]
    no_plan: bool,

    /// Do not create a worktree; use the current directory.
    #[arg(long)]
    no_worktree: bool,

    /// Continue from an existing state file. Task argument forbidden.
    #[arg(long = "continue")]
    continue_: bool,

    /// Run the HTTP control plane. No task argument allowed.
    #[arg(long)]
    serve: bool,

    /// Port for --serve (0 = OS-assigned).
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(message) = validate_flags(&cli) {
        eprintln!("{message}");
        return ExitCode::from(2);
    }

    let config = match load_config() {
        Ok(config) => config,
        Err(report) => {
            eprintln!("{report:?}");
            return ExitCode::from(2);
        }
    };

    init_logging(config.verbosity);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async_main(cli, config))
}

/// Load process configuration, wrapped in `eyre` for a readable report on
/// the rare case a deployer has set e.g. `ALPINE_HTTP_PORT=notaport`
/// (Section 10.2: `main`'s fallible setup path uses `eyre::Result`).
fn load_config() -> eyre::Result<Config> {
    Config::from_env().wrap_err("failed to load configuration from ALPINE_* environment variables")
}

fn validate_flags(cli: &Cli) -> Result<(), String> {
    if cli.serve {
        if cli.task.is_some() {
            return Err("--serve does not accept a task argument".to_string());
        }
        if cli.continue_ {
            return Err("--serve and --continue are mutually exclusive".to_string());
        }
    } else {
        if cli.port.is_some() {
            return Err("--port only applies with --serve".to_string());
        }
        if cli.continue_ && cli.task.is_some() {
            return Err("--continue does not accept a task argument".to_string());
        }
        if !cli.continue_ && cli.task.as_deref().unwrap_or("").trim().is_empty() {
            return Err("a task is required unless --continue is set".to_string());
        }
    }
    Ok(())
}

fn init_logging(verbosity: alpine_core::config::Verbosity) {
    let directive = verbosity.as_filter_directive();
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .init();
}

async fn async_main(cli: Cli, config: Config) -> ExitCode {
    let root_cancel = CancellationToken::new();
    signal::install(root_cancel.clone());

    if cli.serve {
        run_server(config, cli.port, root_cancel).await
    } else {
        run_once(cli, config, root_cancel).await
    }
}

async fn run_once(cli: Cli, config: Config, root_cancel: CancellationToken) -> ExitCode {
    let bus = EventBus::new(config.stream_buffer_size, config.max_clients_per_run);
    let run_id = alpine_core::types::RunId::new();
    let engine = Engine::new(&config, bus, run_id);

    let options = RunOptions {
        generate_plan: !cli.no_plan,
        no_worktree: cli.no_worktree,
        continue_mode: cli.continue_,
    };
    let task = cli.task.unwrap_or_default();

    match engine
        .run(root_cancel, &config.workdir, &task, options)
        .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let run_error: alpine_core::RunError = e.into();
            if run_error.is_failure() {
                error!("run failed: {run_error}");
            }
            ExitCode::from(run_error.exit_code() as u8)
        }
    }
}

async fn run_server(config: Config, port_override: Option<u16>, root_cancel: CancellationToken) -> ExitCode {
    match run_server_inner(config, port_override, root_cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            error!("{report:?}");
            ExitCode::FAILURE
        }
    }
}

/// The server's own fallible setup path (runs directory, socket bind),
/// wrapped in `eyre` for the same reason `load_config` is: these are
/// one-shot startup failures, not per-run errors in the Section 7 taxonomy.
async fn run_server_inner(
    config: Config,
    port_override: Option<u16>,
    root_cancel: CancellationToken,
) -> eyre::Result<()> {
    let mut config = config;
    if let Some(port) = port_override {
        config.http_port = port;
    }

    let runs_root = config.workdir.join("runs");
    std::fs::create_dir_all(&runs_root)
        .wrap_err_with(|| format!("failed to create runs directory at {}", runs_root.display()))?;

    let bus = EventBus::new(config.stream_buffer_size, config.max_clients_per_run);
    let state = Arc::new(AppState {
        config: Arc::new(config),
        bus,
        registry: Arc::new(RunRegistry::new()),
        runs_root,
        errors_total: AtomicU64::new(0),
        started_at: Instant::now(),
        root_cancel: root_cancel.clone(),
    });

    server::start_server(state.clone())
        .await
        .wrap_err("http control plane failed")?;

    state.registry.cancel_all();
    state.bus.close_all();
    Ok(())
}
