//! The input pump.
//!
//! One blocking task reads the local input stream for the lifetime of the
//! process and forwards it to the event loop through a channel. It also
//! observes two things on the way through: the first keystroke while the
//! hot-key slot is armed (the transfer abort signal, never forwarded),
//! and the prefix+q / prefix+F fast paths that must keep working while
//! the main task is blocked in a transfer.

use std::io::Read;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::console;
use crate::{status, warning};

pub const CHUNK_SIZE: usize = 8192;

const HOTKEY_IDLE: u8 = 0xff;
const HOTKEY_ARMED: u8 = 0x00;

/// One-slot mailbox written by the pump and read by the transfer adapter.
#[derive(Debug)]
pub struct HotKeySlot(AtomicU8);

impl HotKeySlot {
    pub fn new() -> Self {
        Self(AtomicU8::new(HOTKEY_IDLE))
    }

    /// Start capturing: the next keystroke is stored instead of forwarded.
    pub fn arm(&self) {
        self.0.store(HOTKEY_ARMED, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.0.store(HOTKEY_IDLE, Ordering::SeqCst);
    }

    /// Pump side: consume the byte if the slot is armed.
    pub fn try_capture(&self, byte: u8) -> bool {
        self.0
            .compare_exchange(HOTKEY_ARMED, byte, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Transfer side: true once a keystroke was captured. Only meaningful
    /// between arm() and disarm().
    pub fn triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst) != HOTKEY_ARMED
    }
}

impl Default for HotKeySlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared cell holding the current device fd (negative when closed), so
/// the pump can flush the device queues without touching the port object.
pub type DeviceFdCell = Arc<AtomicI32>;

pub fn new_device_fd_cell() -> DeviceFdCell {
    Arc::new(AtomicI32::new(-1))
}

pub struct PumpConfig {
    pub interactive: bool,
    pub prefix_enabled: bool,
    pub prefix_code: u8,
}

/// Spawn the pump. The returned receiver is the event loop's canonical
/// input source; it closes when the local input stream reaches EOF.
pub fn spawn_pump(
    config: PumpConfig,
    hotkey: Arc<HotKeySlot>,
    device_fd: DeviceFdCell,
) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::task::spawn_blocking(move || {
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut previous: u8 = 0;

        loop {
            let count = match stdin.read(&mut buffer) {
                Ok(0) => {
                    // EOF: dropping the sender signals end-of-input.
                    log::debug!("stdin reached EOF, input pump exiting");
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warning!("Could not read from stdin ({e})");
                    continue;
                }
            };

            let mut forwarded = Vec::with_capacity(count);
            for &byte in &buffer[..count] {
                // Abort hot-key check runs before anything else, so any
                // keystroke during a blocking transfer is visible to it.
                if hotkey.try_capture(byte) {
                    continue;
                }

                if config.interactive && config.prefix_enabled {
                    if previous == config.prefix_code {
                        match byte {
                            b'q' => console::terminate(0),
                            b'F' => {
                                status!("Flushed data I/O channels");
                                let fd = device_fd.load(Ordering::SeqCst);
                                if fd >= 0 {
                                    unsafe {
                                        libc::tcflush(fd, libc::TCIOFLUSH);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    previous = byte;
                }

                forwarded.push(byte);
            }

            if forwarded.is_empty() {
                continue;
            }
            if tx.blocking_send(forwarded).is_err() {
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hotkey_slot_captures_once_when_armed() {
        let slot = HotKeySlot::new();
        assert!(!slot.try_capture(b'a'));
        slot.arm();
        assert!(!slot.triggered());
        assert!(slot.try_capture(b'a'));
        assert!(slot.triggered());
        assert!(!slot.try_capture(b'b'));
        slot.disarm();
        assert!(!slot.try_capture(b'b'));
    }
}
