use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use serterm::device::port::DeviceEvent;
use serterm::input::{self, HotKeySlot};
use serterm::options::Options;
use serterm::print;
use serterm::session::Session;

fn session_with_device() -> (Session, mpsc::Sender<DeviceEvent>, mpsc::Sender<Vec<u8>>) {
    print::set_mute(true);
    let (input_tx, input_rx) = mpsc::channel(1);
    let mut session = Session::new(
        Options::default(),
        true,
        input_rx,
        Arc::new(HotKeySlot::new()),
        input::new_device_fd_cell(),
        None,
    );
    let (device_tx, device_rx) = mpsc::channel(64);
    session.attach_device_channel(device_rx);
    (session, device_tx, input_tx)
}

#[tokio::test]
async fn expect_matches_pattern_in_stream() {
    let (mut session, device_tx, _input_tx) = session_with_device();
    tokio::spawn(async move {
        device_tx
            .send(DeviceEvent::Data(b"boot... ok, continuing".to_vec()))
            .await
            .unwrap();
    });
    assert_eq!(session.expect("ok", 1000).await, 1);
}

#[tokio::test]
async fn expect_supports_extended_regex() {
    let (mut session, device_tx, _input_tx) = session_with_device();
    tokio::spawn(async move {
        device_tx
            .send(DeviceEvent::Data(b"status=42\r\n".to_vec()))
            .await
            .unwrap();
    });
    assert_eq!(session.expect("status=[0-9]+", 1000).await, 1);
}

#[tokio::test]
async fn expect_times_out_on_silence() {
    let (mut session, _device_tx, _input_tx) = session_with_device();
    let start = Instant::now();
    assert_eq!(session.expect("ready", 200).await, 0);
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn expect_rejects_bad_arguments() {
    let (mut session, _device_tx, _input_tx) = session_with_device();
    assert_eq!(session.expect("ok", -1).await, -1);
    assert_eq!(session.expect("(unclosed", 100).await, -1);
}

#[tokio::test]
async fn window_keeps_only_the_most_recent_bytes() {
    let (mut session, device_tx, _input_tx) = session_with_device();
    tokio::spawn(async move {
        // Overflow the 2000-byte window, then finish with a marker that
        // only matches once the oldest bytes have been dropped.
        device_tx
            .send(DeviceEvent::Data(vec![b'a'; 2500]))
            .await
            .unwrap();
        device_tx
            .send(DeviceEvent::Data(b"END".to_vec()))
            .await
            .unwrap();
    });
    assert_eq!(session.expect("^a{1997}END$", 2000).await, 1);
}

#[tokio::test]
async fn each_expect_starts_with_an_empty_window() {
    let (mut session, device_tx, _input_tx) = session_with_device();
    let feeder = device_tx.clone();
    tokio::spawn(async move {
        feeder
            .send(DeviceEvent::Data(b"first ok".to_vec()))
            .await
            .unwrap();
    });
    assert_eq!(session.expect("ok", 1000).await, 1);

    // The earlier bytes must not satisfy a second expect.
    assert_eq!(session.expect("first", 200).await, 0);
}

#[tokio::test]
async fn read_error_returns_zero() {
    let (mut session, device_tx, _input_tx) = session_with_device();
    drop(device_tx);
    assert_eq!(session.expect("anything", 1000).await, 0);
}
