//! Data models for the control panel core.
//!
//! - [`ConfigRecord`]: Settings loaded from `autoglm_config.json` (API endpoint, model, key, step budget, language, tool paths)
//! - [`DeviceStatus`]: Bridge tool availability plus connected device ids
//! - [`TaskRun`]: One execution of the automation agent and its captured output
//! - [`AppState`]: The runtime state container shared through [`StateManager`](crate::state::StateManager)
//! - [`MAX_CONCURRENT_RUNS`]: Single-flight limit (always 1)

pub mod app_state;
pub mod config;
pub mod device;
pub mod task;

pub use app_state::{AppState, MAX_CONCURRENT_RUNS};
pub use config::{ConfigRecord, Lang, mask_secret};
pub use device::{BridgeState, DeviceState, DeviceStatus};
pub use task::{RunId, TaskRun, TaskState};
