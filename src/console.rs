//! Controlling-terminal raw mode and attribute restoration.
//!
//! Saved termios states are parked in a process-wide registry so that
//! every exit path can restore them, including the input pump's
//! immediate-quit path which terminates from its own task.

use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::Mutex;

use nix::sys::termios::{
    cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
};
use once_cell::sync::Lazy;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("Saving current stdin settings failed ({0})")]
    SaveStdin(nix::Error),

    #[error("Could not apply new stdin settings ({0})")]
    ApplyStdin(nix::Error),

    #[error("Saving current stdout settings failed ({0})")]
    SaveStdout(nix::Error),

    #[error("Could not apply new stdout settings ({0})")]
    ApplyStdout(nix::Error),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

#[derive(Default)]
struct SavedState {
    stdin: Option<Termios>,
    stdout: Option<Termios>,
    device: Option<(RawFd, Termios)>,
}

static SAVED: Lazy<Mutex<SavedState>> = Lazy::new(|| Mutex::new(SavedState::default()));

pub fn is_interactive() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

fn stdout_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 }
}

/// Switch stdin to raw mode, VMIN=1/VTIME=0, saving the old state.
pub fn configure_stdin() -> Result<()> {
    let stdin = std::io::stdin();
    let saved = tcgetattr(stdin.as_fd()).map_err(ConsoleError::SaveStdin)?;

    let mut raw = saved.clone();
    cfmakeraw(&mut raw);
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;

    tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw).map_err(ConsoleError::ApplyStdin)?;

    if let Ok(mut state) = SAVED.lock() {
        state.stdin = Some(saved);
    }
    Ok(())
}

/// Switch stdout to raw mode, saving the old state. When stdin is piped,
/// ISIG stays enabled so ^C still terminates the process.
pub fn configure_stdout(interactive: bool) -> Result<()> {
    if !stdout_is_tty() {
        return Ok(());
    }
    let stdout = std::io::stdout();
    let saved = tcgetattr(stdout.as_fd()).map_err(ConsoleError::SaveStdout)?;

    let mut raw = saved.clone();
    cfmakeraw(&mut raw);
    if !interactive {
        raw.local_flags |= LocalFlags::ISIG;
    }
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;

    tcsetattr(stdout.as_fd(), SetArg::TCSANOW, &raw).map_err(ConsoleError::ApplyStdout)?;

    if let Ok(mut state) = SAVED.lock() {
        state.stdout = Some(saved);
    }
    Ok(())
}

/// Park the device's original attributes for restoration at exit.
pub fn register_device(fd: RawFd, termios: Termios) {
    if let Ok(mut state) = SAVED.lock() {
        state.device = Some((fd, termios));
    }
}

pub fn unregister_device() {
    if let Ok(mut state) = SAVED.lock() {
        state.device = None;
    }
}

/// Replay every saved termios state. Safe to call more than once.
pub fn restore_all() {
    let Ok(mut state) = SAVED.lock() else {
        return;
    };
    if let Some((fd, termios)) = state.device.take() {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = tcsetattr(borrowed, SetArg::TCSANOW, &termios);
    }
    if let Some(termios) = state.stdin.take() {
        let _ = tcsetattr(std::io::stdin().as_fd(), SetArg::TCSANOW, &termios);
    }
    if let Some(termios) = state.stdout.take() {
        let _ = tcsetattr(std::io::stdout().as_fd(), SetArg::TCSANOW, &termios);
    }
}

/// Restore all terminal state and end the process. Used by paths that
/// cannot unwind back to main, such as the input pump's quit command.
pub fn terminate(code: i32) -> ! {
    restore_all();
    std::process::exit(code);
}
