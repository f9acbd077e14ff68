//! Status message output.
//!
//! Status, warning and error messages share one output discipline: a
//! timestamp prefix, optional ANSI color, CRLF line endings (the terminal
//! is in raw mode) and the "tainted line" rule, which inserts a newline
//! before a status line whenever raw device output was printed last.
//! All of it is silenced by `--mute`.
//!
//! Fatal connection errors that the wait loop may retry are recorded
//! instead of printed; they surface at exit only when auto-connect is off.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::timestamp;

static MUTE: AtomicBool = AtomicBool::new(false);
static COLOR: AtomicI16 = AtomicI16::new(-1);
static TAINTED: AtomicBool = AtomicBool::new(false);
static SILENT_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

const ANSI_RESET: &str = "\x1b[0m";

pub fn init(color: i16, mute: bool) {
    COLOR.store(color, Ordering::Relaxed);
    MUTE.store(mute, Ordering::Relaxed);
}

pub fn set_mute(mute: bool) {
    MUTE.store(mute, Ordering::Relaxed);
}

/// Raw device output reached the terminal; the next status line must
/// start on a fresh line.
pub fn set_tainted(tainted: bool) {
    TAINTED.store(tainted, Ordering::Relaxed);
}

fn color_prefix() -> String {
    match COLOR.load(Ordering::Relaxed) {
        -1 => String::new(),
        256 => "\x1b[1m".to_string(),
        index => format!("\x1b[1;38;5;{index}m"),
    }
}

fn color_suffix() -> &'static str {
    if COLOR.load(Ordering::Relaxed) < 0 {
        ""
    } else {
        ANSI_RESET
    }
}

/// `[hh:mm:ss.mmm] message` followed by CRLF.
pub fn status_line(args: std::fmt::Arguments) {
    if MUTE.load(Ordering::Relaxed) {
        return;
    }
    let mut out = std::io::stdout().lock();
    if TAINTED.swap(false, Ordering::Relaxed) {
        let _ = out.write_all(b"\n");
    }
    let _ = write!(
        out,
        "\r{}[{}] {}{}\r\n",
        color_prefix(),
        timestamp::status_stamp(),
        args,
        color_suffix()
    );
    let _ = out.flush();
}

/// Like [`status_line`] but without the trailing CRLF (prompts).
pub fn status_raw(args: std::fmt::Arguments) {
    if MUTE.load(Ordering::Relaxed) {
        return;
    }
    let mut out = std::io::stdout().lock();
    if TAINTED.swap(false, Ordering::Relaxed) {
        let _ = out.write_all(b"\n");
    }
    let _ = write!(
        out,
        "{}[{}] {}{}",
        color_prefix(),
        timestamp::status_stamp(),
        args,
        color_suffix()
    );
    let _ = out.flush();
}

/// Colored output with no stamp and no tainted handling (in-stream
/// decorations such as line timestamps).
pub fn colored_raw(args: std::fmt::Arguments) {
    if MUTE.load(Ordering::Relaxed) {
        return;
    }
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "{}{}{}", color_prefix(), args, color_suffix());
    let _ = out.flush();
}

pub fn warning_line(args: std::fmt::Arguments) {
    if MUTE.load(Ordering::Relaxed) {
        return;
    }
    status_line(format_args!("Warning: {args}"));
}

/// Print an error immediately (stderr, same formatting discipline).
pub fn error_line(args: std::fmt::Arguments) {
    if MUTE.load(Ordering::Relaxed) {
        return;
    }
    let mut err = std::io::stderr().lock();
    if TAINTED.swap(false, Ordering::Relaxed) {
        let _ = err.write_all(b"\n");
    }
    let _ = write!(
        err,
        "\r{}[{}] Error: {}{}\r\n",
        color_prefix(),
        timestamp::status_stamp(),
        args,
        color_suffix()
    );
    let _ = err.flush();
}

/// Record an error that only matters when the session will not retry.
pub fn record_silent_error(message: String) {
    if let Ok(mut slot) = SILENT_ERROR.lock() {
        *slot = Some(message);
    }
}

/// Print the recorded silent error, if retrying was disabled.
pub fn flush_silent_error(no_autoconnect: bool) {
    if !no_autoconnect {
        return;
    }
    if let Ok(mut slot) = SILENT_ERROR.lock() {
        if let Some(message) = slot.take() {
            error_line(format_args!("{message}"));
        }
    }
}

/// Print a multi-line ASCII art block through the status channel.
pub fn status_array(art: &str) {
    status_line(format_args!(""));
    for line in art.lines() {
        colored_raw(format_args!("{line}\r\n"));
    }
    status_line(format_args!(""));
}

/// Print the 256-color index table (`--color list`).
pub fn list_colors() {
    let mut out = std::io::stdout().lock();
    for index in 0..=255u16 {
        let _ = write!(out, "\x1b[1;38;5;{index}mThis is color {index}\x1b[0m\n");
    }
    let _ = out.flush();
}

#[macro_export]
macro_rules! status {
    ($($arg:tt)*) => {
        $crate::print::status_line(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! status_prompt {
    ($($arg:tt)*) => {
        $crate::print::status_raw(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {
        $crate::print::warning_line(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error_msg {
    ($($arg:tt)*) => {
        $crate::print::error_line(format_args!($($arg)*))
    };
}
