//! Integration tests for StateManager with state change events
//!
//! These tests verify that the StateManager correctly:
//! - Emits state change events on mutations
//! - Supports multiple subscribers
//! - Handles concurrent access from multiple threads
//! - Keeps the single run slot consistent across transitions

use autoglm_panel::{DeviceStatus, StateChange, StateManager, TaskState};
use std::sync::Arc;
use std::thread;
use tokio::time::{Duration, timeout};

async fn recv(rx: &mut tokio::sync::broadcast::Receiver<StateChange>) -> StateChange {
    timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Channel closed")
}

#[tokio::test]
async fn test_device_status_events_emitted() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    state.set_device_status(DeviceStatus::checking());
    let connected = DeviceStatus::available(Some("1.0.41".into()), vec!["ABC123".into()]);
    state.set_device_status(connected.clone());

    assert_eq!(
        recv(&mut rx).await,
        StateChange::DeviceStatusChanged(DeviceStatus::checking())
    );
    assert_eq!(recv(&mut rx).await, StateChange::DeviceStatusChanged(connected));
}

#[tokio::test]
async fn test_multiple_subscribers_receive_events() {
    let state = Arc::new(StateManager::new());
    let mut receivers = vec![state.subscribe(), state.subscribe(), state.subscribe()];

    let run_id = state.begin_run("open settings".into(), vec![]).unwrap();

    for rx in &mut receivers {
        assert_eq!(
            recv(rx).await,
            StateChange::TaskStarted {
                run_id,
                task: "open settings".into()
            }
        );
    }
}

#[tokio::test]
async fn test_run_lifecycle_event_order() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    let run_id = state.begin_run("task".into(), vec!["python".into()]).unwrap();
    state.append_output(run_id, "line 1".into());
    state.append_output(run_id, "line 2".into());
    state.finish_run(run_id, TaskState::from_exit_code(Some(0)));

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            StateChange::TaskStarted {
                run_id,
                task: "task".into()
            },
            StateChange::TaskOutput {
                run_id,
                line: "line 1".into()
            },
            StateChange::TaskOutput {
                run_id,
                line: "line 2".into()
            },
            StateChange::TaskFinished {
                run_id,
                state: TaskState::Succeeded
            },
            StateChange::TaskReady,
        ]
    );
}

#[tokio::test]
async fn test_cancel_event_sequence() {
    let state = Arc::new(StateManager::new());
    let run_id = state.begin_run("task".into(), vec![]).unwrap();
    let mut rx = state.subscribe();

    assert!(state.mark_cancelled(run_id));
    assert_eq!(recv(&mut rx).await, StateChange::TaskCancelling { run_id });

    // Still busy until the process is released
    assert!(!state.read(|s| s.is_ready()));
    assert!(state.begin_run("other".into(), vec![]).is_none());

    state.finish_run(run_id, TaskState::from_exit_code(None));
    assert_eq!(
        recv(&mut rx).await,
        StateChange::TaskFinished {
            run_id,
            state: TaskState::Cancelled
        }
    );
    assert_eq!(recv(&mut rx).await, StateChange::TaskReady);
}

#[test]
fn test_concurrent_begin_run_single_winner() {
    let state = Arc::new(StateManager::new());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let state = Arc::clone(&state);
            thread::spawn(move || state.begin_run(format!("task {}", i), vec![]))
        })
        .collect();

    let winners: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(winners, vec![1]);
    assert!(!state.read(|s| s.is_ready()));
}

#[test]
fn test_concurrent_output_is_not_lost() {
    let state = Arc::new(StateManager::new());
    let run_id = state.begin_run("task".into(), vec![]).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                for i in 0..50 {
                    state.append_output(run_id, format!("{}-{}", t, i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(state.read(|s| s.output_lines().len()), 200);
    // Lines from one writer stay in that writer's order
    let lines = state.read(|s| s.output_lines().to_vec());
    let from_zero: Vec<_> = lines.iter().filter(|l| l.starts_with("0-")).collect();
    let expected: Vec<String> = (0..50).map(|i| format!("0-{}", i)).collect();
    assert_eq!(from_zero, expected.iter().collect::<Vec<_>>());
}

#[test]
fn test_snapshot_is_independent_copy() {
    let state = StateManager::new();
    let run_id = state.begin_run("task".into(), vec![]).unwrap();
    let before = state.snapshot();

    state.append_output(run_id, "later".into());

    assert!(before.output_lines().is_empty());
    assert_eq!(state.snapshot().output_lines().to_vec(), vec!["later".to_string()]);
}

#[test]
fn test_events_without_subscribers_are_counted() {
    let state = StateManager::new();
    state.set_device_status(DeviceStatus::checking());

    use std::sync::atomic::Ordering;
    assert_eq!(state.metrics().state_broadcasts.load(Ordering::Relaxed), 0);
    assert_eq!(state.metrics().state_broadcast_errors.load(Ordering::Relaxed), 1);
}
