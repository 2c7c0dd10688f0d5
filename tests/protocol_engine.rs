use std::time::{Duration, Instant};

use gear_inspector_lib::serial::mock::{MockDevice, MockDeviceHandle};
use gear_inspector_lib::serial::{MotionProtocol, ProtocolError, SerialInterface};
use gear_inspector_lib::stop::StopSignal;

fn protocol_over(board: &MockDeviceHandle) -> MotionProtocol {
    let io = MockDevice::attach(board.clone());
    MotionProtocol::new(SerialInterface::from_io(Box::new(io), "mock"), 10)
}

#[tokio::test]
async fn move_waits_for_done() {
    let (_device, board) = MockDevice::new();
    board.set_move_time(Duration::from_millis(40));
    let mut protocol = protocol_over(&board);

    let started = Instant::now();
    protocol
        .move_to(45.0, Duration::from_secs(1), None)
        .await
        .expect("move completes");

    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(board.commands(), vec!["M45.000000"]);
    assert_eq!(protocol.metrics().requests_completed, 1);
    assert!(protocol.pending().is_none());
}

#[tokio::test]
async fn debug_chatter_is_ignored() {
    let (_device, board) = MockDevice::new();
    board.set_noise(Some("dbg: steps=1600 accel=ok"));
    let mut protocol = protocol_over(&board);

    protocol
        .move_to(10.0, Duration::from_secs(1), None)
        .await
        .expect("noise before DONE is skipped");
    protocol
        .ping(Duration::from_millis(200))
        .await
        .expect("noise before PONG is skipped");

    assert_eq!(protocol.metrics().noise_lines, 2);
}

#[tokio::test]
async fn missing_done_times_out() {
    let (_device, board) = MockDevice::new();
    board.never_finish_move(0);
    let mut protocol = protocol_over(&board);

    let started = Instant::now();
    let err = protocol
        .move_to(90.0, Duration::from_millis(150), None)
        .await
        .unwrap_err();

    assert_eq!(err, ProtocolError::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "returned late: {:?}", elapsed);
    assert_eq!(protocol.metrics().timeouts, 1);
    assert!(protocol.pending().is_none());
}

#[tokio::test]
async fn stop_cancels_a_wait_promptly() {
    let (_device, board) = MockDevice::new();
    board.never_finish_move(0);
    let mut protocol = protocol_over(&board);

    let stop = StopSignal::new();
    let trigger = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
    });

    let started = Instant::now();
    let err = protocol
        .move_to(90.0, Duration::from_secs(10), Some(&stop))
        .await
        .unwrap_err();

    assert_eq!(err, ProtocolError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn unplugged_board_reports_link_closed() {
    let (_device, board) = MockDevice::new();
    board.set_move_time(Duration::from_millis(100));
    let mut protocol = protocol_over(&board);

    let unplug = board.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        unplug.set_unplugged(true);
    });

    let err = protocol
        .move_to(30.0, Duration::from_secs(1), None)
        .await
        .unwrap_err();
    assert_eq!(err, ProtocolError::LinkClosed);

    // Sending into a dead link fails the same way
    let err = protocol.ping(Duration::from_millis(100)).await.unwrap_err();
    assert_eq!(err, ProtocolError::LinkClosed);
}

#[tokio::test]
async fn late_done_cannot_satisfy_the_next_request() {
    let (_device, board) = MockDevice::new();
    board.set_move_time(Duration::from_millis(120));
    let mut protocol = protocol_over(&board);

    let err = protocol
        .move_to(15.0, Duration::from_millis(30), None)
        .await
        .unwrap_err();
    assert_eq!(err, ProtocolError::Timeout);

    // Let the abandoned DONE arrive, then issue a new request
    tokio::time::sleep(Duration::from_millis(150)).await;
    protocol
        .ping(Duration::from_millis(200))
        .await
        .expect("ping answered");

    // The stale DONE was drained before P went out, never read as noise
    assert_eq!(protocol.metrics().noise_lines, 0);
    assert_eq!(board.commands(), vec!["M15.000000", "P"]);
}

#[tokio::test]
async fn fire_and_forget_commands_need_no_reply() {
    let (_device, board) = MockDevice::new();
    let mut protocol = protocol_over(&board);

    protocol.hold().await.expect("hold");
    assert!(board.is_holding());
    protocol.zero().await.expect("zero");
    protocol.release().await.expect("release");
    assert!(!board.is_holding());

    assert_eq!(board.commands(), vec!["H", "Z", "R"]);
}

#[tokio::test]
async fn dropped_wait_does_not_wedge_the_link() {
    let (_device, board) = MockDevice::new();
    board.set_answer_pings(false);
    let mut protocol = protocol_over(&board);

    let outer = tokio::time::timeout(
        Duration::from_millis(5),
        protocol.ping(Duration::from_millis(100)),
    )
    .await;
    assert!(outer.is_err(), "outer timeout fires first");
    assert!(protocol.pending().is_some());

    board.set_answer_pings(true);
    protocol
        .ping(Duration::from_millis(200))
        .await
        .expect("ping after an abandoned wait");
    protocol
        .move_to(30.0, Duration::from_secs(1), None)
        .await
        .expect("move after an abandoned wait");
    assert!(protocol.pending().is_none());
}
