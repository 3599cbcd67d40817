// State management module
//
// This module provides the StateManager which wraps AppState with thread-safe access
// using Arc<RwLock<T>> and emits change events for whatever presentation layer is attached.

use crate::metrics::Metrics;
use crate::models::{AppState, DeviceStatus, RunId, TaskRun, TaskState};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::sync::broadcast;

/// Buffer size of the event channel. Output bursts from the agent can be large; a
/// subscriber that falls further behind gets `RecvError::Lagged` and should re-read
/// the snapshot.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Change events emitted when state is modified
///
/// These events notify subscribers (a GUI, the CLI front-end) about state changes
/// without requiring them to poll.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// Device monitor published a new status
    DeviceStatusChanged(DeviceStatus),

    /// A run was accepted and is about to spawn the agent
    TaskStarted { run_id: RunId, task: String },

    /// One line of agent output, in emission order
    TaskOutput { run_id: RunId, line: String },

    /// Cancellation was requested; the process is being shut down
    TaskCancelling { run_id: RunId },

    /// The run reached its final state and the process was released
    TaskFinished { run_id: RunId, state: TaskState },

    /// A new run may be started
    TaskReady,
}

/// Thread-safe state manager with event emission
///
/// This is the central state component that:
/// - Provides thread-safe access to [`AppState`] via `Arc<RwLock<T>>`
/// - Detects state changes and emits [`StateChange`] events
/// - Performs the single-flight check-and-set for new runs
/// - Supports subscribing to state changes via tokio broadcast channels
///
/// # Usage
///
/// - [`snapshot()`](Self::snapshot) / [`read()`](Self::read) for readers
/// - [`subscribe()`](Self::subscribe) for listening to state changes
/// - device and run transitions are called by their owning services only
///
/// # Related Types
///
/// - [`crate::services::DeviceMonitor`]: Sole writer of the device status
/// - [`crate::services::TaskOrchestrator`]: Sole writer of the current run
pub struct StateManager {
    /// The application state protected by RwLock for thread-safe access
    state: Arc<RwLock<AppState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,

    metrics: Arc<Metrics>,
}

impl StateManager {
    /// Create a new StateManager with default state and fresh metrics
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(Metrics::new()))
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        let (state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(AppState::default())),
            state_tx,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Get a read-only snapshot of the current state
    pub fn snapshot(&self) -> AppState {
        self.read(|state| state.clone())
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let ready = state_manager.read(|state| state.is_ready());
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&AppState) -> R,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Subscribe to state change events
    ///
    /// Returns a receiver that will get notified of all future state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    /// Apply `update_fn` and emit the events describing what it changed.
    fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut AppState),
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let old_state = state.clone();

        update_fn(&mut state);
        self.metrics.record_state_update();

        let changes = detect_changes(&old_state, &state);

        // Sent while still holding the lock so events from concurrent writers
        // reach subscribers in the order the writes happened
        for change in &changes {
            self.emit(change.clone());
        }

        changes
    }

    fn emit(&self, change: StateChange) {
        // No subscribers is fine
        match self.state_tx.send(change) {
            Ok(_) => self.metrics.record_state_broadcast(),
            Err(_) => self.metrics.record_state_broadcast_error(),
        }
    }

    /// Replace the device status wholesale.
    pub fn set_device_status(&self, status: DeviceStatus) -> Vec<StateChange> {
        self.update(|state| {
            state.device_status = status;
        })
    }

    /// Atomically claim the single run slot and install a fresh `Running` run.
    ///
    /// # Returns
    /// The new run id, or `None` if a run still holds the slot
    pub fn begin_run(&self, task: String, command_args: Vec<String>) -> Option<RunId> {
        let mut run_id = None;
        self.update(|state| {
            if state.task_active {
                return;
            }
            state.last_run_id += 1;
            let id = state.last_run_id;
            state.current_run = Some(TaskRun::new(id, task, command_args));
            state.task_active = true;
            run_id = Some(id);
        });
        run_id
    }

    /// Append one output line to the run and publish it.
    pub fn append_output(&self, run_id: RunId, line: String) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(run) = state.run_mut(run_id) else {
            tracing::debug!("Dropping output for stale run {}", run_id);
            return;
        };
        run.output_lines.push(line.clone());
        self.metrics.record_output_line();
        self.emit(StateChange::TaskOutput { run_id, line });
    }

    /// Mark a running run as `Cancelled`. The run slot stays claimed until
    /// [`finish_run`](Self::finish_run).
    ///
    /// # Returns
    /// False if the run is not the current one or is no longer `Running`
    pub fn mark_cancelled(&self, run_id: RunId) -> bool {
        let mut marked = false;
        self.update(|state| {
            if let Some(run) = state.run_mut(run_id) {
                if run.state.is_running() {
                    run.state = TaskState::Cancelled;
                    marked = true;
                }
            }
        });
        marked
    }

    /// Record the final state and release the run slot.
    ///
    /// A run already marked `Cancelled` stays `Cancelled` whatever the exit code.
    pub fn finish_run(&self, run_id: RunId, final_state: TaskState) -> Vec<StateChange> {
        self.update(|state| {
            let Some(run) = state.run_mut(run_id) else {
                tracing::warn!("finish_run for unknown run {}", run_id);
                return;
            };
            if run.state.is_running() {
                run.state = final_state;
            }
            run.ended_at = Some(SystemTime::now());
            state.task_active = false;
        })
    }
}

/// Detect what changed between two states and generate events
fn detect_changes(old: &AppState, new: &AppState) -> Vec<StateChange> {
    let mut changes = Vec::new();

    if old.device_status != new.device_status {
        changes.push(StateChange::DeviceStatusChanged(new.device_status.clone()));
    }

    let old_id = old.current_run.as_ref().map(|run| run.id);
    if let Some(run) = &new.current_run {
        if old_id != Some(run.id) {
            changes.push(StateChange::TaskStarted {
                run_id: run.id,
                task: run.task.clone(),
            });
        } else if new.task_active && run.state == TaskState::Cancelled {
            let was_cancelled = old
                .current_run
                .as_ref()
                .is_some_and(|old_run| old_run.state == TaskState::Cancelled);
            if !was_cancelled {
                changes.push(StateChange::TaskCancelling { run_id: run.id });
            }
        }

        if old.task_active && !new.task_active {
            changes.push(StateChange::TaskFinished {
                run_id: run.id,
                state: run.state.clone(),
            });
        }
    }

    if old.task_active && !new.task_active {
        changes.push(StateChange::TaskReady);
    }

    changes
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// Cloning shares the same state, channel, and metrics
impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}
