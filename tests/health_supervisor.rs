use std::sync::Arc;
use std::time::Duration;

use gear_inspector_lib::config::HealthSettings;
use gear_inspector_lib::device::{DeviceManager, HealthSupervisor, LinkState, MockConnector};
use gear_inspector_lib::events::{self, EventReceiver, InspectionEvent};
use gear_inspector_lib::serial::mock::MockDeviceHandle;

fn fast_health() -> HealthSettings {
    HealthSettings {
        reconnect_interval_ms: 20,
        ping_interval_ms: 20,
        ping_timeout_ms: 60,
    }
}

fn supervised(board: &MockDeviceHandle) -> (Arc<HealthSupervisor>, EventReceiver) {
    let (events, rx) = events::channel();
    let manager = Arc::new(DeviceManager::new(
        Arc::new(MockConnector::new(board.clone())),
        events,
    ));
    (HealthSupervisor::new(manager, fast_health()), rx)
}

fn link_states(rx: &mut EventReceiver) -> Vec<LinkState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let InspectionEvent::LinkStateChanged { state } = event {
            states.push(state);
        }
    }
    states
}

#[tokio::test]
async fn first_tick_connects_and_releases() {
    let board = MockDeviceHandle::default();
    let (supervisor, mut rx) = supervised(&board);

    assert_eq!(supervisor.tick().await, LinkState::Connected);
    assert_eq!(board.commands(), vec!["R"]);
    assert!(supervisor.record().connected);
    assert_eq!(
        link_states(&mut rx),
        vec![LinkState::Connecting, LinkState::Connected]
    );
}

#[tokio::test]
async fn connected_tick_pings() {
    let board = MockDeviceHandle::default();
    let (supervisor, _rx) = supervised(&board);

    supervisor.tick().await;
    assert_eq!(supervisor.tick().await, LinkState::Connected);
    assert_eq!(board.commands(), vec!["R", "P"]);
}

#[tokio::test]
async fn missing_pong_drops_the_link() {
    let board = MockDeviceHandle::default();
    let (supervisor, mut rx) = supervised(&board);
    supervisor.tick().await;
    link_states(&mut rx);

    board.set_answer_pings(false);
    assert_eq!(supervisor.tick().await, LinkState::Disconnected);
    assert_eq!(supervisor.record().consecutive_failures, 1);
    assert_eq!(link_states(&mut rx), vec![LinkState::Disconnected]);

    // Next tick reconnects and the board is released again
    board.set_answer_pings(true);
    board.clear_commands();
    assert_eq!(supervisor.tick().await, LinkState::Connected);
    assert_eq!(board.commands(), vec!["R"]);
    assert_eq!(supervisor.record().consecutive_failures, 0);
}

#[tokio::test]
async fn unplug_and_replug_recovers_without_intervention() {
    let board = MockDeviceHandle::default();
    let (supervisor, _rx) = supervised(&board);
    supervisor.tick().await;

    board.set_unplugged(true);
    assert_eq!(supervisor.tick().await, LinkState::Disconnected);
    assert_eq!(supervisor.tick().await, LinkState::Disconnected);
    assert_eq!(supervisor.tick().await, LinkState::Disconnected);
    assert_eq!(supervisor.record().consecutive_failures, 3);

    board.set_unplugged(false);
    board.clear_commands();
    assert_eq!(supervisor.tick().await, LinkState::Connected);
    assert_eq!(board.commands(), vec!["R"]);
    assert!(!board.is_holding());
}

#[tokio::test]
async fn suspended_ticks_leave_the_link_alone() {
    let board = MockDeviceHandle::default();
    let (supervisor, _rx) = supervised(&board);
    supervisor.tick().await;
    board.clear_commands();

    {
        let _paused = supervisor.suspend().await;
        assert!(supervisor.is_suspended());
        for _ in 0..3 {
            supervisor.tick().await;
        }
        assert!(board.commands().is_empty());
    }

    assert!(!supervisor.is_suspended());
    supervisor.tick().await;
    assert_eq!(board.commands(), vec!["P"]);
}

#[tokio::test]
async fn suspended_supervisor_does_not_reconnect() {
    let board = MockDeviceHandle::default();
    let (supervisor, _rx) = supervised(&board);

    let paused = supervisor.suspend().await;
    assert_eq!(supervisor.tick().await, LinkState::Disconnected);
    assert!(board.commands().is_empty());
    drop(paused);

    assert_eq!(supervisor.tick().await, LinkState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_loop_connects_pings_and_shuts_down() {
    let board = MockDeviceHandle::default();
    let (supervisor, _rx) = supervised(&board);
    let mut state = supervisor.manager().subscribe_state();

    supervisor.start().await;
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_connected()))
        .await
        .expect("connected in time")
        .expect("state channel open");

    tokio::time::sleep(Duration::from_millis(150)).await;
    let pings = board.commands().iter().filter(|c| *c == "P").count();
    assert!(pings >= 2, "expected periodic pings, saw {}", pings);

    supervisor.shutdown().await;
    let settled = board.commands().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(board.commands().len(), settled, "no traffic after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_prompt_while_a_run_holds_the_link() {
    let board = MockDeviceHandle::default();
    let (supervisor, _rx) = supervised(&board);
    let mut state = supervisor.manager().subscribe_state();

    supervisor.start().await;
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_connected()))
        .await
        .expect("connected in time")
        .expect("state channel open");

    let slot = supervisor.manager().lock_link().await;
    // Let the loop wake up and queue on the link
    tokio::time::sleep(Duration::from_millis(80)).await;

    let started = std::time::Instant::now();
    supervisor.shutdown().await;
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "shutdown took {:?}",
        started.elapsed()
    );
    drop(slot);
}
