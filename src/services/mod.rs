//! Services module - the panel's business logic, independent of any presentation layer.
//!
//! # Components
//!
//! - [`process`]: The [`ProcessRunner`] seam. [`TokioProcessRunner`] spawns real programs
//!   with stdout and stderr merged into one ordered line stream; tests substitute fakes built
//!   on [`ProcessHandle::channel`].
//!
//! - [`DeviceMonitor`]: Queries the Android debug bridge (`adb version`, then `adb devices`)
//!   and publishes a [`crate::models::DeviceStatus`]. Checks run off the caller's task; only
//!   the newest of several overlapping checks publishes its result.
//!
//! - [`TaskOrchestrator`]: Validates preconditions, launches the automation agent, streams
//!   its output into the current run, and handles cancellation with a terminate, grace
//!   period, kill sequence.
//!
//! Both services write through [`crate::state::StateManager`], which turns each transition
//! into [`crate::state::StateChange`] events for whoever is listening.
//!
//! # Usage Example
//!
//! ```ignore
//! use autoglm_panel::services::{DeviceMonitor, TaskOrchestrator, TokioProcessRunner};
//!
//! let runner = Arc::new(TokioProcessRunner::new());
//! let monitor = DeviceMonitor::new(runner.clone(), state.clone(), &config.adb_path);
//! let device = monitor.check_status().await?;
//!
//! let orchestrator = TaskOrchestrator::new(runner, state.clone());
//! let run_id = orchestrator.execute("open the settings app", &config, &device)?;
//! ```

pub mod device;
pub mod process;
pub mod task;

pub use device::{DeviceMonitor, parse_devices, parse_version, probe};
pub use process::{
    CommandOutput, CommandSpec, ProcessController, ProcessDriver, ProcessError, ProcessHandle,
    ProcessRunner, ProcessSignal, TokioProcessRunner, run_to_completion,
};
pub use task::{
    CancelOutcome, PreconditionViolation, TaskOrchestrator, agent_command, build_agent_args,
};
