use std::sync::Arc;

use tokio::sync::mpsc;

use serterm::device::port::DeviceEvent;
use serterm::input::{self, HotKeySlot};
use serterm::options::{Options, ScriptSource};
use serterm::print;
use serterm::script;
use serterm::session::Session;

fn scripted_session(source: &str) -> (Session, mpsc::Sender<DeviceEvent>, mpsc::Sender<Vec<u8>>) {
    print::set_mute(true);
    let mut opts = Options::default();
    opts.script = Some(ScriptSource::Inline(source.to_string()));
    let (input_tx, input_rx) = mpsc::channel(1);
    let mut session = Session::new(
        opts,
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
async fn exit_terminates_with_code() {
    let (mut session, _device_tx, _input_tx) = scripted_session("exit(3)");
    assert_eq!(script::run(&mut session).await, Some(3));
}

#[tokio::test]
async fn negative_sleeps_are_no_ops() {
    let (mut session, _device_tx, _input_tx) =
        scripted_session("sleep(-1)\nmsleep(-100)\nprint(42)");
    let start = std::time::Instant::now();
    assert_eq!(script::run(&mut session).await, None);
    assert!(start.elapsed() < std::time::Duration::from_millis(500));
}

#[tokio::test]
async fn send_without_device_reports_failure() {
    let (mut session, _device_tx, _input_tx) = scripted_session("exit(send(\"ping\"))");
    // send() returns -1 when not connected; exit propagates it.
    assert_eq!(script::run(&mut session).await, Some(-1));
}

#[tokio::test]
async fn expect_result_flows_through_nested_calls() {
    let (mut session, device_tx, _input_tx) = scripted_session("exit(expect(\"go\", 1000))");
    tokio::spawn(async move {
        device_tx
            .send(DeviceEvent::Data(b"ready... go!".to_vec()))
            .await
            .unwrap();
    });
    assert_eq!(script::run(&mut session).await, Some(1));
}

#[tokio::test]
async fn parse_errors_do_not_end_the_session() {
    let (mut session, _device_tx, _input_tx) = scripted_session("nonsense(");
    assert_eq!(script::run(&mut session).await, None);
}

#[tokio::test]
async fn unknown_functions_stop_the_script() {
    let (mut session, _device_tx, _input_tx) = scripted_session("frobnicate(1)\nexit(7)");
    assert_eq!(script::run(&mut session).await, None);
}

#[tokio::test]
async fn deferred_line_config_stages_without_a_device() {
    let (mut session, _device_tx, _input_tx) =
        scripted_session("config_high(DTR)\nconfig_low(RTS)");
    assert_eq!(script::run(&mut session).await, None);

    let staged = session.line_table_mut().staged();
    assert_eq!(staged.len(), 2);
    assert_eq!(staged[0].0.name(), "DTR");
    assert!(staged[0].1);
    assert_eq!(staged[1].0.name(), "RTS");
    assert!(!staged[1].1);
}
