//! AutoGLM Panel - command-line front-end
//!
//! # Overview
//!
//! A thin presentation layer over the library. It initializes:
//! - Logging infrastructure (daily rotating file, console mirror with `--verbose`)
//! - Tokio runtime (subprocess supervision and output streaming)
//! - State management ([`StateManager`])
//! - Configuration loading ([`ConfigManager`])
//!
//! # Commands
//!
//! - `status`: run one device check and print the summary
//! - `run <TASK>...`: check devices, launch the agent, stream its output; Ctrl-C cancels
//! - `config show | set <key> <value> | path`: inspect or edit the settings file
//!
//! # Exit codes
//!
//! `run` mirrors the agent: 0 on success, the agent's own code on failure, 1 when it could
//! not start or died from a signal, 130 when cancelled, 2 when a precondition refused it.

use anyhow::{Context, Result};
use autoglm_panel::config::DEFAULT_CONFIG_FILE;
use autoglm_panel::services::{CancelOutcome, ProcessRunner};
use autoglm_panel::{
    APP_NAME, ConfigManager, ConfigRecord, DeviceMonitor, DeviceStatus, StateChange,
    StateManager, TaskOrchestrator, TaskState, TokioProcessRunner, VERSION,
};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// How long to wait for the agent to be released when the front-end exits abnormally
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "autoglm-panel", version, about = "Launch and supervise the AutoGLM phone agent")]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: Utf8PathBuf,

    /// Directory for log files
    #[arg(long, global = true, default_value = "logs")]
    log_dir: String,

    /// Debug-level logging
    #[arg(long, global = true)]
    debug: bool,

    /// Mirror log output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the bridge tool and list connected devices
    Status,

    /// Run the agent on a task described in natural language
    Run {
        /// Task text; multiple words are joined with spaces
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,

        /// Save the captured output to this file when the run ends
        #[arg(long)]
        save_output: Option<Utf8PathBuf>,

        /// Seconds to wait after a terminate request before killing the agent
        #[arg(long, default_value_t = 5)]
        grace_secs: u64,
    },

    /// Inspect or edit the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the settings with the API key masked
    Show,

    /// Set one key, e.g. `config set apiKey sk-...` or `config set lang en`
    Set { key: String, value: String },

    /// Print the settings file location
    Path,
}

/// Shared pieces every command needs
struct App {
    config_manager: ConfigManager,
    state: Arc<StateManager>,
    runner: Arc<dyn ProcessRunner>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let _guard = autoglm_panel::logging::setup_logging_with_console(
        &cli.log_dir,
        APP_NAME,
        cli.debug,
        cli.verbose,
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("autoglm-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let app = App {
        config_manager: ConfigManager::new(&cli.config),
        state: Arc::new(StateManager::new()),
        runner: Arc::new(TokioProcessRunner::new()),
    };

    let result = runtime.block_on(dispatch(&app, cli.command));

    app.state.metrics().log_summary();
    runtime.shutdown_timeout(Duration::from_secs(5));
    tracing::info!("Shutdown complete");

    result.inspect_err(|e| tracing::error!("{:#}", e))
}

async fn dispatch(app: &App, command: Command) -> Result<ExitCode> {
    match command {
        Command::Status => status(app).await,
        Command::Run {
            task,
            save_output,
            grace_secs,
        } => {
            run_task(
                app,
                &task.join(" "),
                save_output,
                Duration::from_secs(grace_secs),
            )
            .await
        }
        Command::Config { action } => config_command(app, action),
    }
}

fn load_config(app: &App) -> ConfigRecord {
    let loaded = app.config_manager.load();
    if let Some(warning) = &loaded.warning {
        eprintln!("warning: {}; using defaults", warning);
    }
    loaded.record
}

async fn check_device(app: &App, config: &ConfigRecord) -> Result<DeviceStatus> {
    let monitor = DeviceMonitor::new(app.runner.clone(), app.state.clone(), &config.adb_path);
    monitor
        .check_status()
        .await
        .context("Device status check did not complete")
}

async fn status(app: &App) -> Result<ExitCode> {
    let config = load_config(app);
    let device = check_device(app, &config).await?;

    println!("{}", device.summary());

    Ok(if device.has_connected_device() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_task(
    app: &App,
    task: &str,
    save_output: Option<Utf8PathBuf>,
    grace_period: Duration,
) -> Result<ExitCode> {
    let config = load_config(app);
    let device = check_device(app, &config).await?;
    eprintln!("Device: {}", device.summary());

    let orchestrator = TaskOrchestrator::new(app.runner.clone(), app.state.clone())
        .with_grace_period(grace_period);

    // Subscribe first so no output line is missed
    let mut events = app.state.subscribe();
    let run_id = match orchestrator.execute(task, &config, &device) {
        Ok(run_id) => run_id,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(ExitCode::from(2));
        }
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(StateChange::TaskOutput { run_id: id, line }) if id == run_id => {
                    println!("{}", line)
                }
                Ok(StateChange::TaskCancelling { .. }) => eprintln!("Cancelling..."),
                Ok(StateChange::TaskReady) | Err(RecvError::Closed) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Output display fell behind, {} events skipped", skipped);
                }
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if let CancelOutcome::Requested(id) = orchestrator.cancel() {
                    tracing::info!("Ctrl-C received, cancelling run {}", id);
                }
            },
        }
    }

    if !orchestrator.shutdown(SHUTDOWN_TIMEOUT).await {
        eprintln!("warning: the agent process could not be released");
    }

    if let Some(path) = save_output {
        match orchestrator.export_output(&path) {
            Ok(count) => eprintln!("Saved {} lines to {}", count, path),
            Err(e) => eprintln!("warning: {:#}", e),
        }
    }

    let final_state = orchestrator
        .current_run()
        .map(|run| run.state)
        .unwrap_or_default();
    eprintln!("Run {}: {}", run_id, final_state);

    Ok(exit_code_for(&final_state))
}

fn exit_code_for(state: &TaskState) -> ExitCode {
    match state {
        TaskState::Succeeded => ExitCode::SUCCESS,
        TaskState::Cancelled => ExitCode::from(130),
        TaskState::Failed {
            exit_code: Some(code),
            ..
        } => u8::try_from(*code)
            .ok()
            .filter(|code| *code != 0)
            .map_or(ExitCode::FAILURE, ExitCode::from),
        _ => ExitCode::FAILURE,
    }
}

fn config_command(app: &App, action: ConfigAction) -> Result<ExitCode> {
    match action {
        ConfigAction::Show => {
            let record = load_config(app);
            let text = serde_json::to_string_pretty(&record.redacted())
                .context("Failed to render settings")?;
            println!("{}", text);
        }
        ConfigAction::Set { key, value } => {
            // Strict load: never replace a file we could not read with defaults
            let mut record = app
                .config_manager
                .try_load()
                .context("Refusing to overwrite an unreadable settings file")?
                .unwrap_or_default();
            record.set_field(&key, &value)?;
            app.config_manager.save(&record)?;
            tracing::info!("Updated {} in {}", key, app.config_manager.config_path());
            println!("{} updated", key);
        }
        ConfigAction::Path => println!("{}", app.config_manager.config_path()),
    }
    Ok(ExitCode::SUCCESS)
}
