use crate::models::{ConfigRecord, DeviceStatus, RunId, TaskRun, TaskState};
use crate::services::process::{CommandSpec, ProcessHandle, ProcessRunner};
use crate::state::StateManager;
use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

/// How long a cancelled agent gets to exit on its own before it is killed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Reasons an `execute` request is refused before anything is spawned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionViolation {
    #[error("Please enter a task")]
    EmptyTask,

    #[error("A task is already running, wait for it to finish")]
    RunActive,

    #[error("Configure the API key in settings first")]
    MissingApiKey,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No device connected, check adb and the device connection")]
    NoDevice,
}

/// Result of [`TaskOrchestrator::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Termination was requested for this run
    Requested(RunId),
    /// A cancel for this run is already in progress
    AlreadyCancelling(RunId),
    /// Nothing was running
    NotRunning,
}

/// Bookkeeping for the run that currently holds the process slot
struct ActiveRun {
    run_id: RunId,
    cancel_tx: watch::Sender<bool>,
}

/// Launches the automation agent and supervises it.
///
/// At most one run exists at a time. [`execute`](Self::execute) checks every precondition
/// synchronously and claims the run slot atomically; the agent is then spawned and pumped on
/// a tokio task. Output lines are appended to the run and published one by one as they
/// arrive. Whatever happens to the process, the slot is released when the supervisor ends.
///
/// # Cancellation
///
/// [`cancel`](Self::cancel) marks the run `Cancelled` at once, then the supervisor sends a
/// terminate request, waits up to the grace period, and kills the process if it is still
/// alive. `TaskReady` is published only after the process handle is released.
#[derive(Clone)]
pub struct TaskOrchestrator {
    runner: Arc<dyn ProcessRunner>,
    state: Arc<StateManager>,
    grace_period: Duration,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl TaskOrchestrator {
    pub fn new(runner: Arc<dyn ProcessRunner>, state: Arc<StateManager>) -> Self {
        Self {
            runner,
            state,
            grace_period: DEFAULT_GRACE_PERIOD,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Override the terminate-to-kill grace period
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// A new run would be accepted (ignoring the other preconditions)
    pub fn is_ready(&self) -> bool {
        self.lock_active().is_none() && self.state.read(|s| s.is_ready())
    }

    /// Snapshot of the latest run, finished or not
    pub fn current_run(&self) -> Option<TaskRun> {
        self.state.read(|s| s.current_run.clone())
    }

    /// Start the agent on `task_text`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails without spawning anything if the task is blank, a run is active, the API key
    /// is missing, the config does not validate, or no device is connected.
    pub fn execute(
        &self,
        task_text: &str,
        config: &ConfigRecord,
        device: &DeviceStatus,
    ) -> Result<RunId, PreconditionViolation> {
        let result = self.start_run(task_text, config, device);
        if let Err(e) = &result {
            self.state.metrics().record_run_rejected();
            tracing::warn!("Task rejected: {}", e);
        }
        result
    }

    fn start_run(
        &self,
        task_text: &str,
        config: &ConfigRecord,
        device: &DeviceStatus,
    ) -> Result<RunId, PreconditionViolation> {
        let task = task_text.trim();
        if task.is_empty() {
            return Err(PreconditionViolation::EmptyTask);
        }

        // Held until the slot is recorded so cancel() never sees a half-started run
        let mut active = self.lock_active();
        if active.is_some() || !self.state.read(|s| s.is_ready()) {
            return Err(PreconditionViolation::RunActive);
        }

        if !config.has_api_key() {
            return Err(PreconditionViolation::MissingApiKey);
        }

        config
            .validate()
            .map_err(|e| PreconditionViolation::InvalidConfig(e.to_string()))?;

        if !device.has_connected_device() {
            return Err(PreconditionViolation::NoDevice);
        }

        let spec = agent_command(config, task);
        let mut shown_args = vec![spec.program.clone()];
        shown_args.extend(spec.display_args());

        let run_id = self
            .state
            .begin_run(task.to_string(), shown_args)
            .ok_or(PreconditionViolation::RunActive)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *active = Some(ActiveRun { run_id, cancel_tx });
        drop(active);

        self.state.metrics().record_run_started();
        tracing::info!("Starting run {}: {}", run_id, spec);

        let guard = RunGuard {
            orchestrator: self.clone(),
            run_id,
            finished: false,
        };
        tokio::spawn(guard.supervise(spec, cancel_rx));

        Ok(run_id)
    }

    /// Request cancellation of the active run.
    pub fn cancel(&self) -> CancelOutcome {
        let active = self.lock_active();
        let Some(run) = active.as_ref() else {
            tracing::info!("Cancel requested but no task is running");
            return CancelOutcome::NotRunning;
        };

        if *run.cancel_tx.borrow() {
            return CancelOutcome::AlreadyCancelling(run.run_id);
        }

        tracing::info!("Cancelling run {}", run.run_id);
        self.state.mark_cancelled(run.run_id);
        run.cancel_tx.send_replace(true);
        CancelOutcome::Requested(run.run_id)
    }

    /// Resolve once no process handle is held.
    pub async fn wait_until_ready(&self) {
        let mut events = self.state.subscribe();
        loop {
            if self.is_ready() {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Cancel any active run and wait for its process to be released.
    ///
    /// # Returns
    /// False if the process was still held when `timeout` expired
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if let CancelOutcome::Requested(run_id) = self.cancel() {
            tracing::warn!("Shutting down during run {}, cancelling it", run_id);
        }
        let released = tokio::time::timeout(timeout, self.wait_until_ready())
            .await
            .is_ok();
        if !released {
            tracing::error!("Agent process still held after {:?}", timeout);
        }
        released
    }

    /// Write the latest run's captured output to a text file.
    ///
    /// # Returns
    /// The number of lines written
    pub fn export_output(&self, path: &Utf8Path) -> Result<usize> {
        let lines = self.state.read(|s| s.output_lines().to_vec());
        if lines.is_empty() {
            bail!("No output to save");
        }

        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(path, content).with_context(|| format!("Failed to write output to {}", path))?;

        tracing::info!("Saved {} output lines to {}", lines.len(), path);
        Ok(lines.len())
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the slot and record the final state.
    fn complete(&self, run_id: RunId, outcome: TaskState) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|run| run.run_id == run_id) {
            *active = None;
        }
        self.state.finish_run(run_id, outcome);
        drop(active);

        let Some(run) = self.current_run().filter(|run| run.id == run_id) else {
            return;
        };

        let metrics = self.state.metrics();
        metrics.record_run_time(run.elapsed());
        match &run.state {
            TaskState::Succeeded => {
                metrics.record_run_succeeded();
                tracing::info!(
                    "Run {} succeeded in {:.2}s",
                    run_id,
                    run.elapsed().as_secs_f32()
                );
            }
            TaskState::Cancelled => {
                metrics.record_run_cancelled();
                tracing::info!("Run {} cancelled", run_id);
            }
            TaskState::Failed { reason, .. } => {
                metrics.record_run_failed();
                tracing::error!("Run {} failed: {}", run_id, reason);
            }
            TaskState::Idle | TaskState::Running => {}
        }
    }

    /// Forward output until the stream closes, applying cancellation along the way.
    async fn pump(
        &self,
        run_id: RunId,
        mut handle: ProcessHandle,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> TaskState {
        let controller = handle.controller();
        let mut cancel_requested = false;
        let mut cancel_open = true;
        let mut kill_armed = false;
        let kill_timer = tokio::time::sleep(self.grace_period);
        tokio::pin!(kill_timer);

        loop {
            tokio::select! {
                line = handle.next_line() => match line {
                    Some(line) => self.state.append_output(run_id, line),
                    None => break,
                },
                changed = cancel_rx.changed(), if cancel_open && !cancel_requested => {
                    if changed.is_err() {
                        cancel_open = false;
                    } else if *cancel_rx.borrow_and_update() {
                        cancel_requested = true;
                        tracing::info!("Asking agent (run {}) to terminate", run_id);
                        controller.terminate();
                        kill_timer.as_mut().reset(Instant::now() + self.grace_period);
                        kill_armed = true;
                    }
                },
                _ = &mut kill_timer, if kill_armed => {
                    tracing::warn!(
                        "Agent (run {}) still alive {:?} after terminate, killing it",
                        run_id,
                        self.grace_period
                    );
                    controller.kill();
                    kill_armed = false;
                },
            }
        }

        match handle.wait().await {
            _ if cancel_requested => TaskState::Cancelled,
            Ok(exit_code) => TaskState::from_exit_code(exit_code),
            Err(e) => TaskState::Failed {
                exit_code: None,
                reason: format!("lost track of the agent process: {}", e),
            },
        }
    }
}

/// Owns one run's supervision. Dropping it unfinished (panic, runtime shutdown) still
/// releases the slot.
struct RunGuard {
    orchestrator: TaskOrchestrator,
    run_id: RunId,
    finished: bool,
}

impl RunGuard {
    async fn supervise(mut self, spec: CommandSpec, cancel_rx: watch::Receiver<bool>) {
        let outcome = match self.orchestrator.runner.spawn(&spec) {
            Ok(handle) => {
                tracing::debug!("Agent for run {} has pid {:?}", self.run_id, handle.pid());
                self.orchestrator.pump(self.run_id, handle, cancel_rx).await
            }
            Err(e) => TaskState::Failed {
                exit_code: None,
                reason: format!("failed to start the agent: {}", e),
            },
        };

        self.finished = true;
        self.orchestrator.complete(self.run_id, outcome);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.orchestrator.complete(
                self.run_id,
                TaskState::Failed {
                    exit_code: None,
                    reason: "supervisor stopped unexpectedly".to_string(),
                },
            );
        }
    }
}

/// Agent arguments in the order the agent's CLI expects.
///
/// `--base-url <baseUrl> --model <model> --apikey <apiKey> --max-steps <maxSteps> --lang <lang> <task>`
pub fn build_agent_args(config: &ConfigRecord, task: &str) -> Vec<String> {
    vec![
        "--base-url".to_string(),
        config.base_url.trim().to_string(),
        "--model".to_string(),
        config.model.clone(),
        "--apikey".to_string(),
        config.api_key.trim().to_string(),
        "--max-steps".to_string(),
        config.max_steps.trim().to_string(),
        "--lang".to_string(),
        config.lang.to_string(),
        task.to_string(),
    ]
}

/// Full command for the agent: program, optional script, arguments, and environment.
///
/// The agent is a Python program; forcing UTF-8 and unbuffered output makes its log lines
/// arrive as they are printed.
pub fn agent_command(config: &ConfigRecord, task: &str) -> CommandSpec {
    let mut spec = CommandSpec::new(config.agent_program.trim());

    let script = config.agent_script.trim();
    if !script.is_empty() {
        spec = spec.arg(script);
    }

    spec = spec
        .args(build_agent_args(config, task))
        .env("PYTHONIOENCODING", "utf-8")
        .env("PYTHONUNBUFFERED", "1");

    let workdir = config.agent_workdir.trim();
    if !workdir.is_empty() {
        spec = spec.current_dir(Utf8PathBuf::from(workdir));
    }

    spec
}
