use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serialport::{SerialPort, TTYPort};
use tokio::sync::mpsc;

use serterm::device::DevicePort;
use serterm::input::{self, HotKeySlot};
use serterm::options::{InputMode, Options, DEFAULT_PREFIX_CODE};
use serterm::print;
use serterm::session::Session;

fn pty_session(opts: Options) -> (Session, TTYPort, mpsc::Sender<Vec<u8>>) {
    print::set_mute(true);
    let (master, mut peer) = TTYPort::pair().expect("pty pair");
    peer.set_timeout(Duration::from_millis(500)).unwrap();

    let (input_tx, input_rx) = mpsc::channel(16);
    let mut session = Session::new(
        opts,
        true,
        input_rx,
        Arc::new(HotKeySlot::new()),
        input::new_device_fd_cell(),
        None,
    );
    session.attach_port(DevicePort::from_tty(master).expect("wrap pty"));
    (session, peer, input_tx)
}

fn read_exactly(peer: &mut TTYPort, count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; count];
    peer.read_exact(&mut buffer).expect("device side read");
    buffer
}

#[tokio::test]
async fn line_mode_cr_transmits_buffer_and_cr() {
    let mut opts = Options::default();
    opts.input_mode = InputMode::Line;
    opts.local_echo = true;
    let (mut session, mut peer, _input_tx) = pty_session(opts);

    for byte in b"hi\r" {
        session.process_input_byte(*byte).await;
    }

    assert_eq!(read_exactly(&mut peer, 3), b"hi\r");
    assert_eq!(session.counters().1, 3);
}

#[tokio::test]
async fn line_mode_backspace_is_destructive() {
    let mut opts = Options::default();
    opts.input_mode = InputMode::Line;
    let (mut session, mut peer, _input_tx) = pty_session(opts);

    for byte in b"hx\x7fi\r" {
        session.process_input_byte(*byte).await;
    }

    assert_eq!(read_exactly(&mut peer, 3), b"hi\r");
}

#[tokio::test]
async fn line_mode_swallows_arrow_keys() {
    let mut opts = Options::default();
    opts.input_mode = InputMode::Line;
    let (mut session, mut peer, _input_tx) = pty_session(opts);

    for byte in b"a\x1b[Cb\r" {
        session.process_input_byte(*byte).await;
    }

    assert_eq!(read_exactly(&mut peer, 3), b"ab\r");
}

#[tokio::test]
async fn hex_input_pairs_become_one_byte() {
    let mut opts = Options::default();
    opts.input_mode = InputMode::Hex;
    let (mut session, mut peer, _input_tx) = pty_session(opts);

    session.process_input_byte(b'4').await;
    session.process_input_byte(b'1').await;
    session.sync_staging();

    assert_eq!(read_exactly(&mut peer, 1), [0x41]);
    assert_eq!(session.counters().1, 1);
}

#[tokio::test]
async fn invalid_hex_digit_is_discarded() {
    let mut opts = Options::default();
    opts.input_mode = InputMode::Hex;
    let (mut session, mut peer, _input_tx) = pty_session(opts);

    session.process_input_byte(b'g').await;
    session.process_input_byte(b'4').await;
    session.process_input_byte(b'2').await;
    session.sync_staging();

    assert_eq!(read_exactly(&mut peer, 1), [0x42]);
}

#[tokio::test]
async fn prefix_literal_reaches_the_device() {
    let (mut session, mut peer, _input_tx) = pty_session(Options::default());

    for byte in [DEFAULT_PREFIX_CODE, DEFAULT_PREFIX_CODE, b'X'] {
        session.process_input_byte(byte).await;
    }
    session.sync_staging();

    assert_eq!(read_exactly(&mut peer, 2), [DEFAULT_PREFIX_CODE, b'X']);
    assert_eq!(session.counters().1, 2);
}

#[tokio::test]
async fn uppercase_map_applies_in_the_write_path() {
    let mut opts = Options::default();
    opts.map = serterm::transform::MapFlags::OLTU;
    let (mut session, mut peer, _input_tx) = pty_session(opts);

    for byte in b"abc" {
        session.process_input_byte(*byte).await;
    }
    session.sync_staging();

    assert_eq!(read_exactly(&mut peer, 3), b"ABC");
}

#[tokio::test]
async fn onlcrnl_sends_a_literal_crlf_pair() {
    let mut opts = Options::default();
    opts.map = serterm::transform::MapFlags::ONLCRNL;
    let (mut session, mut peer, _input_tx) = pty_session(opts);

    session.process_input_byte(b'\n').await;
    session.sync_staging();

    assert_eq!(read_exactly(&mut peer, 2), b"\r\n");
    assert_eq!(session.counters().1, 2);
}
