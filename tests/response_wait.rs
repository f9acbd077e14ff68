use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use serterm::device::port::DeviceEvent;
use serterm::input::{self, HotKeySlot};
use serterm::options::Options;
use serterm::print;
use serterm::session::Session;

fn response_wait_session(
    timeout_ms: u64,
) -> (Session, mpsc::Sender<DeviceEvent>, mpsc::Sender<Vec<u8>>) {
    print::set_mute(true);
    let mut opts = Options::default();
    opts.response_wait = true;
    opts.response_timeout = timeout_ms;
    let (input_tx, input_rx) = mpsc::channel(1);
    let mut session = Session::new(
        opts,
        false,
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
async fn device_reply_ends_with_success() {
    let (mut session, device_tx, _input_tx) = response_wait_session(500);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        device_tx
            .send(DeviceEvent::Data(b"MODEL X\r\n".to_vec()))
            .await
            .unwrap();
    });
    assert_eq!(session.event_loop().await.unwrap(), 0);
    // The reply was received and counted.
    assert_eq!(session.counters().0, 9);
}

#[tokio::test]
async fn silence_times_out_with_failure() {
    let (mut session, _device_tx, _input_tx) = response_wait_session(300);
    let start = Instant::now();
    assert_eq!(session.event_loop().await.unwrap(), 1);
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn piped_input_eof_keeps_waiting_for_the_reply() {
    let (mut session, device_tx, input_tx) = response_wait_session(1000);
    drop(input_tx);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        device_tx
            .send(DeviceEvent::Data(b"OK\n".to_vec()))
            .await
            .unwrap();
    });
    assert_eq!(session.event_loop().await.unwrap(), 0);
}
