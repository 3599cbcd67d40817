use std::fmt;
use std::time::{Duration, SystemTime};

/// Identifier of a task run, unique within the process.
pub type RunId = u64;

/// Lifecycle of a single automation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TaskState {
    #[default]
    Idle,
    Running,
    Succeeded,
    /// `exit_code` is `None` when the process never started or was killed by a signal
    Failed {
        exit_code: Option<i32>,
        reason: String,
    },
    Cancelled,
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }

    /// Process exit code 0 => `Succeeded`, anything else => `Failed`.
    pub fn from_exit_code(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(0) => TaskState::Succeeded,
            Some(code) => TaskState::Failed {
                exit_code: Some(code),
                reason: format!("agent exited with code {}", code),
            },
            None => TaskState::Failed {
                exit_code: None,
                reason: "agent terminated by signal".to_string(),
            },
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Idle => write!(f, "idle"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed { reason, .. } => write!(f, "failed: {}", reason),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One execution of the automation agent and its captured output.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRun {
    pub id: RunId,
    pub task: String,
    /// Argument vector with the API key masked
    pub command_args: Vec<String>,
    pub state: TaskState,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    pub output_lines: Vec<String>,
}

impl TaskRun {
    pub fn new(id: RunId, task: String, command_args: Vec<String>) -> Self {
        Self {
            id,
            task,
            command_args,
            state: TaskState::Running,
            started_at: SystemTime::now(),
            ended_at: None,
            output_lines: Vec::new(),
        }
    }

    /// Wall-clock duration, up to now while the run is still going
    pub fn elapsed(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(SystemTime::now);
        end.duration_since(self.started_at).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_exit_code() {
        assert_eq!(TaskState::from_exit_code(Some(0)), TaskState::Succeeded);
        assert!(matches!(
            TaskState::from_exit_code(Some(2)),
            TaskState::Failed {
                exit_code: Some(2),
                ..
            }
        ));
        assert!(matches!(
            TaskState::from_exit_code(None),
            TaskState::Failed {
                exit_code: None,
                ..
            }
        ));
    }

    #[test]
    fn test_new_run_is_running() {
        let run = TaskRun::new(1, "open settings".into(), vec!["--lang".into(), "cn".into()]);
        assert!(run.state.is_running());
        assert!(run.output_lines.is_empty());
        assert!(run.ended_at.is_none());
    }

    #[test]
    fn test_finished_states() {
        assert!(!TaskState::Idle.is_finished());
        assert!(!TaskState::Running.is_finished());
        assert!(TaskState::Succeeded.is_finished());
        assert!(TaskState::Cancelled.is_finished());
    }
}
