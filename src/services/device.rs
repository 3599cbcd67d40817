//! Bridge tool (adb) and device discovery.
//!
//! [`DeviceMonitor::check_status`] publishes `Checking` right away, then runs
//! `adb version` and `adb devices` on a tokio task and publishes the final
//! [`DeviceStatus`]. Every tool invocation is bounded by a timeout, so a check always
//! settles in a terminal state.

use crate::models::DeviceStatus;
use crate::services::process::{CommandSpec, ProcessError, ProcessRunner, run_to_completion};
use crate::state::StateManager;
use regex::Regex;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Upper bound for each bridge tool invocation
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state token `adb devices` prints for usable devices
const CONNECTED_TOKEN: &str = "device";

/// Matches "Android Debug Bridge version 1.0.41" and similar
static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bversion\s+(\S+)").expect("Invalid version regex"));

/// Discovers bridge tool availability and connected devices.
///
/// Overlapping checks are allowed; each one is numbered and only the newest may publish
/// its final status, so an old slow check cannot overwrite a newer result.
#[derive(Clone)]
pub struct DeviceMonitor {
    runner: Arc<dyn ProcessRunner>,
    state: Arc<StateManager>,
    adb_path: String,
    timeout: Duration,
    /// Number of the newest check; held while publishing
    generation: Arc<Mutex<u64>>,
}

impl DeviceMonitor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        state: Arc<StateManager>,
        adb_path: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            state,
            adb_path: adb_path.into(),
            timeout: DEFAULT_TOOL_TIMEOUT,
            generation: Arc::new(Mutex::new(0)),
        }
    }

    /// Override the per-invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn adb_path(&self) -> &str {
        &self.adb_path
    }

    /// Last published status
    pub fn last_status(&self) -> DeviceStatus {
        self.state.read(|s| s.device_status.clone())
    }

    /// Start a status check.
    ///
    /// Publishes `Checking` before returning. The returned handle resolves to the final
    /// status; callers that only care about events can drop it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn check_status(&self) -> JoinHandle<DeviceStatus> {
        let generation = {
            let mut current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
            *current += 1;
            self.state.set_device_status(DeviceStatus::checking());
            *current
        };
        self.state.metrics().record_status_check();
        tracing::info!("Checking {} status (check #{})", self.adb_path, generation);

        let runner = Arc::clone(&self.runner);
        let state = Arc::clone(&self.state);
        let latest = Arc::clone(&self.generation);
        let adb_path = self.adb_path.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let status = probe(runner.as_ref(), &adb_path, timeout).await;

            let current = latest.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == generation {
                tracing::info!("Device status: {}", status.summary());
                state.set_device_status(status.clone());
            } else {
                tracing::debug!(
                    "Check #{} superseded by #{}, not publishing",
                    generation,
                    *current
                );
            }
            status
        })
    }
}

/// Query the bridge tool and build the resulting status. Never returns `Checking`.
pub async fn probe(runner: &dyn ProcessRunner, adb_path: &str, timeout: Duration) -> DeviceStatus {
    let version_spec = CommandSpec::new(adb_path).arg("version");
    let version = match run_to_completion(runner, &version_spec, timeout).await {
        Ok(output) if output.success() => match parse_version(&output.lines) {
            Some(version) => version,
            None => {
                tracing::warn!("Unrecognized `{} version` output: {:?}", adb_path, output.lines);
                return DeviceStatus::unavailable("unrecognized version output");
            }
        },
        Ok(output) => {
            return DeviceStatus::unavailable(exit_reason(adb_path, "version", output.exit_code));
        }
        Err(e) => return DeviceStatus::unavailable(describe_error(adb_path, &e)),
    };

    tracing::debug!("{} version {}", adb_path, version);

    let devices_spec = CommandSpec::new(adb_path).arg("devices");
    match run_to_completion(runner, &devices_spec, timeout).await {
        Ok(output) if output.success() => {
            let devices = parse_devices(&output.text());
            tracing::debug!("Connected devices: {:?}", devices);
            DeviceStatus::available(Some(version), devices)
        }
        Ok(output) => DeviceStatus::unavailable(exit_reason(adb_path, "devices", output.exit_code)),
        Err(e) => DeviceStatus::unavailable(describe_error(adb_path, &e)),
    }
}

/// Extract the version token from `adb version` output.
pub fn parse_version(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        VERSION_PATTERN
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Device ids from `adb devices` output, in listed order.
///
/// A line counts iff it is non-empty and its second tab-separated field is exactly
/// `device`; unauthorized and offline devices are skipped, as is the header.
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim_end_matches(['\r', '\n']))
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            let state = fields.next()?.trim();
            (state == CONNECTED_TOKEN && !id.is_empty()).then(|| id.to_string())
        })
        .collect()
}

fn exit_reason(adb_path: &str, subcommand: &str, exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("`{} {}` exited with code {}", adb_path, subcommand, code),
        None => format!("`{} {}` was terminated", adb_path, subcommand),
    }
}

fn describe_error(adb_path: &str, error: &ProcessError) -> String {
    match error {
        ProcessError::NotFound(_) => format!("{} not found", adb_path),
        ProcessError::Timeout(limit) => {
            format!("{} did not respond within {}s", adb_path, limit.as_secs_f32())
        }
        other => other.to_string(),
    }
}
