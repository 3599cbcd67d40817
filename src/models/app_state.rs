use crate::models::{DeviceStatus, RunId, TaskRun, TaskState};

/// Maximum number of automation runs allowed at once.
///
/// The agent drives the phone through adb; only one may do so at a time.
///
/// Enforced by [`crate::state::StateManager::begin_run`], which checks and sets
/// [`AppState::task_active`] under one write lock.
pub const MAX_CONCURRENT_RUNS: usize = 1;

/// Single source of truth for the panel's runtime state.
///
/// # Thread Safety
///
/// `AppState` is wrapped in `Arc<RwLock<AppState>>` by [`crate::state::StateManager`].
/// Never access it directly; use the manager's methods:
/// - [`read()`](crate::state::StateManager::read) / [`snapshot()`](crate::state::StateManager::snapshot) for readers
/// - the device and run transitions, which also emit [`crate::state::StateChange`] events
///
/// # Ownership
///
/// - `device_status` is written only by [`crate::services::DeviceMonitor`]
/// - `current_run` and `task_active` are written only by [`crate::services::TaskOrchestrator`]
#[derive(Clone, Debug, Default)]
pub struct AppState {
    /// Last published bridge/device status
    pub device_status: DeviceStatus,

    /// Most recent run; kept after it finishes so its output stays readable
    pub current_run: Option<TaskRun>,

    /// A process handle is held for `current_run`. Cleared only after the process is released,
    /// so it can stay set for a while after the run reached `Cancelled`.
    pub task_active: bool,

    /// Monotonic counter used to assign run ids
    pub last_run_id: RunId,
}

impl AppState {
    /// Ready to accept a new `execute`
    pub fn is_ready(&self) -> bool {
        !self.task_active
    }

    pub fn run_state(&self) -> TaskState {
        self.current_run
            .as_ref()
            .map(|run| run.state.clone())
            .unwrap_or_default()
    }

    pub fn output_lines(&self) -> &[String] {
        self.current_run
            .as_ref()
            .map(|run| run.output_lines.as_slice())
            .unwrap_or(&[])
    }

    /// The run with `id`, if it is the current one
    pub fn run_mut(&mut self, id: RunId) -> Option<&mut TaskRun> {
        self.current_run.as_mut().filter(|run| run.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state() {
        let state = AppState::default();
        assert!(state.is_ready());
        assert_eq!(state.run_state(), TaskState::Idle);
        assert!(state.output_lines().is_empty());
        assert_eq!(state.device_status, DeviceStatus::unknown());
    }

    #[test]
    fn test_run_mut_matches_id() {
        let mut state = AppState {
            current_run: Some(TaskRun::new(3, "task".into(), vec![])),
            ..Default::default()
        };
        assert!(state.run_mut(3).is_some());
        assert!(state.run_mut(4).is_none());
    }

    #[test]
    fn test_max_concurrent_runs_is_one() {
        assert_eq!(MAX_CONCURRENT_RUNS, 1);
    }
}
