// AutoGLM Panel - control panel core for the AutoGLM phone automation agent
//
// This is the library crate containing configuration, device monitoring, and run supervision.
// The binary crate (main.rs) provides a command-line front-end over it.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::{ConfigError, ConfigManager, LoadedConfig};
pub use metrics::Metrics;
pub use models::{AppState, ConfigRecord, DeviceStatus, Lang, RunId, TaskRun, TaskState};
pub use services::{DeviceMonitor, TaskOrchestrator, TokioProcessRunner};
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
