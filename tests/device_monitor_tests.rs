//! Integration tests for DeviceMonitor
//!
//! These tests verify:
//! - The two-step probe (version, then devices) and its resulting status
//! - The `Checking` -> final event sequence
//! - Tool failures and timeouts surface as `Unavailable`
//! - Only the newest of overlapping checks publishes its result

mod common;

use autoglm_panel::models::{BridgeState, DeviceState};
use autoglm_panel::services::ProcessSignal;
use autoglm_panel::{DeviceMonitor, DeviceStatus, StateChange, StateManager};
use common::{FakeRunner, Script};
use std::sync::Arc;
use tokio::time::{Duration, sleep, timeout};

const VERSION_OUTPUT: &[&str] = &[
    "Android Debug Bridge version 1.0.41",
    "Version 34.0.5-10900879",
    "Installed as /usr/bin/adb",
];

fn setup(
    scripts: impl IntoIterator<Item = Script>,
) -> (Arc<FakeRunner>, Arc<StateManager>, DeviceMonitor) {
    let runner = FakeRunner::new(scripts);
    let state = Arc::new(StateManager::new());
    let monitor = DeviceMonitor::new(runner.clone(), state.clone(), "adb");
    (runner, state, monitor)
}

#[tokio::test]
async fn test_connected_device_reported() {
    let (runner, state, monitor) = setup([
        Script::exit(VERSION_OUTPUT, 0),
        Script::exit(
            &[
                "List of devices attached",
                "ABC123\tdevice",
                "emulator-5554\toffline",
                "",
            ],
            0,
        ),
    ]);
    let mut rx = state.subscribe();

    let status = monitor.check_status().await.unwrap();

    assert_eq!(status.bridge_state(), &BridgeState::Available);
    assert_eq!(status.bridge_version(), Some("1.0.41"));
    assert_eq!(
        status.device_state(),
        &DeviceState::Connected(vec!["ABC123".to_string()])
    );
    assert_eq!(monitor.last_status(), status);

    let first = timeout(Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, StateChange::DeviceStatusChanged(DeviceStatus::checking()));
    assert_eq!(second, StateChange::DeviceStatusChanged(status));

    let spawned = runner.spawned();
    assert_eq!(spawned.len(), 2);
    assert_eq!(spawned[0].program, "adb");
    assert_eq!(spawned[0].args, vec!["version"]);
    assert_eq!(spawned[1].args, vec!["devices"]);
}

#[tokio::test]
async fn test_no_devices_is_disconnected() {
    let (_runner, _state, monitor) = setup([
        Script::exit(VERSION_OUTPUT, 0),
        Script::exit(&["List of devices attached", ""], 0),
    ]);

    let status = monitor.check_status().await.unwrap();
    assert_eq!(status.bridge_state(), &BridgeState::Available);
    assert_eq!(status.device_state(), &DeviceState::Disconnected);
    assert!(!status.has_connected_device());
}

#[tokio::test]
async fn test_missing_tool_is_unavailable() {
    let (runner, _state, monitor) = setup([Script::NotFound]);

    let status = monitor.check_status().await.unwrap();
    assert_eq!(status.bridge_state(), &BridgeState::Unavailable);
    assert!(matches!(status.device_state(), DeviceState::Error(_)));
    assert!(status.is_terminal());

    // Devices are never queried once the version check fails
    assert_eq!(runner.spawned().len(), 1);
}

#[tokio::test]
async fn test_version_nonzero_exit_is_unavailable() {
    let (runner, _state, monitor) = setup([Script::exit(&["error: something broke"], 1)]);

    let status = monitor.check_status().await.unwrap();
    assert_eq!(status.bridge_state(), &BridgeState::Unavailable);
    assert_eq!(runner.spawned().len(), 1);
}

#[tokio::test]
async fn test_unrecognized_version_output_is_unavailable() {
    let (_runner, _state, monitor) = setup([Script::exit(&["hello"], 0)]);

    let status = monitor.check_status().await.unwrap();
    assert_eq!(
        status.device_state(),
        &DeviceState::Error("unrecognized version output".to_string())
    );
}

#[tokio::test]
async fn test_devices_query_failure_is_unavailable() {
    let (_runner, _state, monitor) =
        setup([Script::exit(VERSION_OUTPUT, 0), Script::exit(&[], 1)]);

    let status = monitor.check_status().await.unwrap();
    assert_eq!(status.bridge_state(), &BridgeState::Unavailable);
    assert!(!status.has_connected_device());
}

#[tokio::test]
async fn test_hung_tool_times_out_and_is_killed() {
    let (runner, state, monitor) = setup([Script::Stuck]);
    let monitor = monitor.with_timeout(Duration::from_millis(50));

    let status = timeout(Duration::from_secs(2), monitor.check_status())
        .await
        .expect("check should finish after the tool timeout")
        .unwrap();

    assert_eq!(status.bridge_state(), &BridgeState::Unavailable);
    assert!(state.read(|s| s.device_status.is_terminal()));
    assert!(runner.signals().contains(&ProcessSignal::Kill));
}

#[tokio::test]
async fn test_checking_published_before_returning() {
    let (_runner, state, monitor) = setup([Script::Stuck]);
    let monitor = monitor.with_timeout(Duration::from_millis(200));

    let handle = monitor.check_status();
    assert!(state.read(|s| s.device_status.is_checking()));

    handle.await.unwrap();
    assert!(!state.read(|s| s.device_status.is_checking()));
}

#[tokio::test]
async fn test_newest_overlapping_check_wins() {
    let (runner, state, monitor) = setup([
        // First check: slow version query
        Script::Slow {
            lines: vec![VERSION_OUTPUT[0].to_string()],
            delay: Duration::from_millis(200),
        },
        // Second check runs entirely while the first is still waiting
        Script::exit(VERSION_OUTPUT, 0),
        Script::exit(&["List of devices attached", "NEW\tdevice"], 0),
        // First check's devices query
        Script::exit(&["List of devices attached", "OLD\tdevice"], 0),
    ]);

    let first = monitor.check_status();

    // Make sure the first check claimed the slow script
    timeout(Duration::from_secs(1), async {
        while runner.spawned().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let second = monitor.check_status().await.unwrap();
    assert_eq!(second.connected_devices().to_vec(), vec!["NEW".to_string()]);

    // The superseded check still returns its own result but does not publish it
    let stale = first.await.unwrap();
    assert_eq!(stale.connected_devices().to_vec(), vec!["OLD".to_string()]);
    assert_eq!(
        state.read(|s| s.device_status.connected_devices().to_vec()),
        vec!["NEW".to_string()]
    );
}

#[tokio::test]
async fn test_status_checks_counted() {
    let (_runner, state, monitor) = setup([Script::NotFound, Script::NotFound]);

    monitor.check_status().await.unwrap();
    monitor.check_status().await.unwrap();

    assert_eq!(
        state
            .metrics()
            .status_checks
            .load(std::sync::atomic::Ordering::Relaxed),
        2
    );
}
