use std::sync::Arc;

use tokio::sync::mpsc;

use serterm::input::{self, HotKeySlot};
use serterm::options::{InputMode, Options, TimestampMode, DEFAULT_PREFIX_CODE};
use serterm::print;
use serterm::session::{KeyOutcome, Session};
use serterm::transform::MapFlags;

const PREFIX: u8 = DEFAULT_PREFIX_CODE;

fn test_session(opts: Options) -> (Session, mpsc::Sender<Vec<u8>>) {
    print::set_mute(true);
    let (tx, rx) = mpsc::channel(16);
    let session = Session::new(
        opts,
        true,
        rx,
        Arc::new(HotKeySlot::new()),
        input::new_device_fd_cell(),
        None,
    );
    (session, tx)
}

#[tokio::test]
async fn prefix_prefix_forwards_one_literal_prefix() {
    let (mut session, _tx) = test_session(Options::default());

    assert_eq!(session.handle_command_sequence(PREFIX).await, KeyOutcome::Consumed);
    assert_eq!(
        session.handle_command_sequence(PREFIX).await,
        KeyOutcome::Forward(PREFIX)
    );
    // The double-prefix state is reset: the next byte is ordinary data.
    assert_eq!(
        session.handle_command_sequence(b'X').await,
        KeyOutcome::Forward(b'X')
    );
}

#[tokio::test]
async fn plain_bytes_are_forwarded() {
    let (mut session, _tx) = test_session(Options::default());
    for byte in [b'A', b'z', 0x00, 0xfe] {
        assert_eq!(
            session.handle_command_sequence(byte).await,
            KeyOutcome::Forward(byte)
        );
    }
}

#[tokio::test]
async fn disabled_prefix_passes_through() {
    let mut opts = Options::default();
    opts.prefix_enabled = false;
    let (mut session, _tx) = test_session(opts);
    assert_eq!(
        session.handle_command_sequence(PREFIX).await,
        KeyOutcome::Forward(PREFIX)
    );
}

#[tokio::test]
async fn quit_command_ends_session() {
    let (mut session, _tx) = test_session(Options::default());
    session.handle_command_sequence(PREFIX).await;
    assert_eq!(session.handle_command_sequence(b'q').await, KeyOutcome::Exit(0));
}

#[tokio::test]
async fn toggle_commands_publish_whole_fields() {
    let (mut session, _tx) = test_session(Options::default());

    session.handle_command_sequence(PREFIX).await;
    session.handle_command_sequence(b'e').await;
    assert!(session.opts().local_echo);

    session.handle_command_sequence(PREFIX).await;
    session.handle_command_sequence(b'm').await;
    assert!(session.opts().map.contains(MapFlags::MSB2LSB));

    session.handle_command_sequence(PREFIX).await;
    session.handle_command_sequence(b'U').await;
    assert!(session.opts().map.contains(MapFlags::OLTU));

    session.handle_command_sequence(PREFIX).await;
    session.handle_command_sequence(b't').await;
    assert_eq!(session.opts().timestamp, TimestampMode::TwentyFourHour);
}

#[tokio::test]
async fn input_mode_cycles_normal_hex_line() {
    let (mut session, _tx) = test_session(Options::default());

    session.handle_command_sequence(PREFIX).await;
    session.handle_command_sequence(b'i').await;
    assert_eq!(session.opts().input_mode, InputMode::Hex);

    session.handle_command_sequence(PREFIX).await;
    session.handle_command_sequence(b'i').await;
    assert_eq!(session.opts().input_mode, InputMode::Line);

    session.handle_command_sequence(PREFIX).await;
    session.handle_command_sequence(b'i').await;
    assert_eq!(session.opts().input_mode, InputMode::Normal);
}

#[tokio::test]
async fn line_sub_command_consumes_exactly_one_byte() {
    let (mut session, _tx) = test_session(Options::default());

    session.handle_command_sequence(PREFIX).await;
    assert_eq!(session.handle_command_sequence(b'g').await, KeyOutcome::Consumed);
    // Invalid digit: warned about and discarded, state returns to none.
    assert_eq!(session.handle_command_sequence(b'9').await, KeyOutcome::Consumed);
    assert_eq!(
        session.handle_command_sequence(b'a').await,
        KeyOutcome::Forward(b'a')
    );
}

#[tokio::test]
async fn unknown_prefixed_key_is_ignored() {
    let (mut session, _tx) = test_session(Options::default());
    session.handle_command_sequence(PREFIX).await;
    assert_eq!(session.handle_command_sequence(b'!').await, KeyOutcome::Consumed);
    assert_eq!(
        session.handle_command_sequence(b'!').await,
        KeyOutcome::Forward(b'!')
    );
}
