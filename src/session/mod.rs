//! Session orchestration: device lifecycle and recovery.
//!
//! One [`Session`] exists per run. It owns the options record, the
//! device port and its reader channel, the input channel fed by the
//! pump, the optional socket hub, the log writer and all of the small
//! per-session editing state. The lifecycle is wait-for-device,
//! connect, run the event loop, and on device loss either reconnect
//! (auto-connect) or exit.

mod event_loop;
mod keys;

pub use event_loop::InputFlow;
pub use keys::KeyOutcome;

use std::collections::VecDeque;
use std::io::Write;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::alert;
use crate::console;
use crate::device::port::DeviceEvent;
use crate::device::{rs485, DevicePort, LineConfigTable};
use crate::input::{DeviceFdCell, HotKeySlot};
use crate::logfile::LogWriter;
use crate::options::{Options, ScriptRun};
use crate::print;
use crate::script;
use crate::socket::SocketHub;
use crate::timestamp::Timestamper;
use crate::transform::HexAccumulator;
use crate::{error_msg, status, warning};

use keys::KeyState;

/// Capacity of the rolling receive window used by expect().
pub const RECEIVE_WINDOW_SIZE: usize = 2000;

const LINE_SIZE_MAX: usize = 1000;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Unrecoverable even with auto-connect (bad device, lock held).
    #[error("{0}")]
    Fatal(String),

    /// Open failed; the wait loop may retry.
    #[error("{0}")]
    Transient(String),

    /// The connected device went away mid-session.
    #[error("{0}")]
    Runtime(String),
}

pub struct Session {
    pub(crate) opts: Options,
    pub(crate) interactive: bool,
    pub(crate) port: Option<DevicePort>,
    pub(crate) device_rx: Option<mpsc::Receiver<DeviceEvent>>,
    /// Bytes already received from the reader but not yet consumed.
    pub(crate) pending: VecDeque<u8>,
    pub(crate) input_rx: mpsc::Receiver<Vec<u8>>,
    pub(crate) input_pending: VecDeque<u8>,
    pub(crate) input_closed: bool,
    pub(crate) socket: Option<SocketHub>,
    pub(crate) logger: LogWriter,
    pub(crate) stamper: Timestamper,
    hotkey: Arc<HotKeySlot>,
    device_fd_cell: DeviceFdCell,
    pub(crate) rx_total: u64,
    pub(crate) tx_total: u64,
    pub(crate) next_timestamp: bool,
    pub(crate) keys: KeyState,
    pub(crate) line_buffer: Vec<u8>,
    /// Previous two input bytes, for arrow-key escape recognition.
    pub(crate) prev_input: [u8; 2],
    pub(crate) hex_in: HexAccumulator,
    line_table: LineConfigTable,
    receive_window: VecDeque<u8>,
    rs485_saved: Option<rs485::SerialRs485>,
}

impl Session {
    pub fn new(
        opts: Options,
        interactive: bool,
        input_rx: mpsc::Receiver<Vec<u8>>,
        hotkey: Arc<HotKeySlot>,
        device_fd_cell: DeviceFdCell,
        socket: Option<SocketHub>,
    ) -> Session {
        let log_strip = opts.log_strip;
        Session {
            opts,
            interactive,
            port: None,
            device_rx: None,
            pending: VecDeque::new(),
            input_rx,
            input_pending: VecDeque::new(),
            input_closed: false,
            socket,
            logger: LogWriter::new(log_strip),
            stamper: Timestamper::new(),
            hotkey,
            device_fd_cell,
            rx_total: 0,
            tx_total: 0,
            next_timestamp: false,
            keys: KeyState::default(),
            line_buffer: Vec::new(),
            prev_input: [0; 2],
            hex_in: HexAccumulator::default(),
            line_table: LineConfigTable::new(),
            receive_window: VecDeque::with_capacity(RECEIVE_WINDOW_SIZE),
            rs485_saved: None,
        }
    }

    pub fn opts(&self) -> &Options {
        &self.opts
    }

    pub fn hotkey(&self) -> &HotKeySlot {
        &self.hotkey
    }

    pub fn port_mut(&mut self) -> Option<&mut DevicePort> {
        self.port.as_mut()
    }

    pub fn port_fd(&self) -> Option<RawFd> {
        self.port.as_ref().map(|port| port.fd())
    }

    pub fn line_table_mut(&mut self) -> &mut LineConfigTable {
        &mut self.line_table
    }

    pub fn counters(&self) -> (u64, u64) {
        (self.rx_total, self.tx_total)
    }

    /// Wire a device byte stream directly (used by tests in place of a
    /// real port's reader task).
    pub fn attach_device_channel(&mut self, rx: mpsc::Receiver<DeviceEvent>) {
        self.device_rx = Some(rx);
    }

    /// Attach an already-open port (pseudo-terminal pairs in tests).
    pub fn attach_port(&mut self, port: DevicePort) {
        self.device_fd_cell.store(port.fd(), Ordering::SeqCst);
        self.port = Some(port);
    }

    /// Top-level run loop: connect (waiting for the device when
    /// auto-connect is on), recover from device loss, return the
    /// process exit code.
    pub async fn run(&mut self) -> i32 {
        if self.opts.log && !self.logger.open(self.opts.log_filename.clone().as_deref(), &self.opts.device) {
            self.opts.log = false;
        }

        let code = loop {
            if self.opts.auto_connect {
                if let Some(code) = self.wait_for_device().await {
                    break code;
                }
            }
            match self.connect().await {
                Ok(code) => break code,
                Err(SessionError::Fatal(message)) => {
                    error_msg!("{message}");
                    break 1;
                }
                Err(SessionError::Transient(message))
                | Err(SessionError::Runtime(message)) => {
                    print::record_silent_error(message);
                    if !self.opts.auto_connect {
                        break 1;
                    }
                }
            }
        };

        self.finish().await;
        code
    }

    /// Poll for the device at ~1 Hz. With an interactive stdin the input
    /// and socket channels stay serviced so key commands keep working.
    /// Returns an exit code if a command ended the session.
    async fn wait_for_device(&mut self) -> Option<i32> {
        let mut first = true;
        let mut last_errno: i32 = 0;

        loop {
            if self.interactive {
                let wait = if first {
                    Duration::from_millis(1)
                } else {
                    Duration::from_secs(1)
                };
                first = false;

                let deadline = tokio::time::Instant::now() + wait;
                loop {
                    let event = tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => None,
                        chunk = self.input_rx.recv(), if !self.input_closed => Some(chunk),
                        _ = Self::socket_recv(&mut self.socket) => {
                            // Clients may connect while waiting; their
                            // bytes have nowhere to go yet.
                            continue;
                        }
                    };
                    match event {
                        None => break,
                        Some(None) => {
                            self.input_closed = true;
                            error_msg!("Could not read from stdin");
                            return Some(1);
                        }
                        Some(Some(chunk)) => {
                            self.input_pending.extend(chunk);
                            while let Some(byte) = self.input_pending.pop_front() {
                                match self.handle_command_sequence(byte).await {
                                    KeyOutcome::Exit(code) => return Some(code),
                                    // Forwards have no device to go to.
                                    _ => {}
                                }
                            }
                        }
                    }
                }
            } else {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            match device_accessible(&self.opts.device) {
                Ok(()) => return None,
                Err(errno) => {
                    if errno != last_errno {
                        warning!("Could not open tty device ({})", errno_message(errno));
                        status!("Waiting for tty device..");
                        last_errno = errno;
                    }
                }
            }
        }
    }

    pub(crate) async fn socket_recv(socket: &mut Option<SocketHub>) -> Option<u8> {
        match socket {
            Some(hub) => hub.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Open, configure and run the device session. Returns the exit code
    /// for normal endings; device loss surfaces as `Runtime` after the
    /// disconnect has been performed.
    async fn connect(&mut self) -> Result<i32, SessionError> {
        let mut port = DevicePort::open(&self.opts).map_err(classify_open_error)?;

        status!("Connected");
        print::set_tainted(false);
        alert::connect(self.opts.alert).await;

        if self.opts.timestamp.enabled() {
            self.next_timestamp = true;
        }

        console::register_device(port.fd(), port.saved_termios());
        self.device_fd_cell.store(port.fd(), Ordering::SeqCst);

        if self.opts.rs485 {
            match rs485::mode_enable(port.fd(), &self.opts.rs485_config) {
                Ok(saved) => self.rs485_saved = Some(saved),
                Err(e) if cfg!(target_os = "linux") => {
                    warning!("{e}");
                }
                Err(e) => return Err(SessionError::Fatal(e.to_string())),
            }
        }

        let device_rx = port
            .spawn_reader()
            .map_err(|e| SessionError::Transient(e.to_string()))?;
        self.device_rx = Some(device_rx);
        self.port = Some(port);

        if !self.interactive {
            self.forward_piped_input().await?;
        }

        if self.opts.script_run != ScriptRun::Never {
            let exit = script::run(self).await;
            if self.opts.script_run == ScriptRun::Once {
                self.opts.script_run = ScriptRun::Never;
            }
            if let Some(code) = exit {
                return Ok(code);
            }
        }

        if !self.interactive && !self.opts.response_wait {
            return Ok(0);
        }

        self.event_loop().await
    }

    /// Piped stdin: forward everything to the device unmodified until
    /// end of input.
    async fn forward_piped_input(&mut self) -> Result<(), SessionError> {
        while let Some(chunk) = self.input_rx.recv().await {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| SessionError::Runtime("not connected".into()))?;
            port.write_all_direct(&chunk).map_err(|e| {
                SessionError::Fatal(format!("Could not write to serial device ({e})"))
            })?;
        }
        self.input_closed = true;
        Ok(())
    }

    /// Tear the connection down: alert, restore attributes, release the
    /// lock, close.
    pub(crate) async fn disconnect(&mut self) {
        if let Some(mut port) = self.port.take() {
            status!("Disconnected");
            if let Some(saved) = self.rs485_saved.take() {
                rs485::mode_restore(port.fd(), &saved);
            }
            port.restore();
            console::unregister_device();
            self.device_fd_cell.store(-1, Ordering::SeqCst);
            self.device_rx = None;
            self.pending.clear();
            alert::disconnect(self.opts.alert).await;
        }
    }

    async fn finish(&mut self) {
        self.disconnect().await;
        if self.logger.is_open() {
            if let Some(name) = self.logger.filename() {
                status!("Saved log to file {name}");
            }
            self.logger.close();
        }
        print::flush_silent_error(!self.opts.auto_connect);
    }

    /// One device byte through the single reader channel, honoring bytes
    /// already buffered. `Ok(None)` is a timeout; errors mean the device
    /// is gone.
    pub async fn read_device_byte(
        &mut self,
        timeout: Option<Duration>,
    ) -> std::io::Result<Option<u8>> {
        if let Some(byte) = self.pending.pop_front() {
            return Ok(Some(byte));
        }
        let Some(rx) = self.device_rx.as_mut() else {
            return Err(std::io::Error::other("not connected"));
        };

        let event = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx.recv()).await {
                Ok(event) => event,
                Err(_) => return Ok(None),
            },
            None => rx.recv().await,
        };

        match event {
            Some(DeviceEvent::Data(chunk)) => {
                self.pending.extend(chunk);
                Ok(self.pending.pop_front())
            }
            Some(DeviceEvent::Error(message)) => Err(std::io::Error::other(message)),
            Some(DeviceEvent::Disconnected) | None => {
                Err(std::io::Error::other("device disconnected"))
            }
        }
    }

    /// Wait for `pattern` (an extended regular expression) in the device
    /// stream. Clears the rolling receive window, echoes every received
    /// byte, and matches the window after each one. Returns 1 on match,
    /// 0 on timeout or read error, -1 on bad arguments.
    pub async fn expect(&mut self, pattern: &str, timeout_ms: i64) -> i32 {
        self.receive_window.clear();

        if timeout_ms < 0 {
            return -1;
        }
        let timeout = if timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64))
        };

        let regex = match regex::bytes::Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                warning!("Could not compile regex ({e})");
                return -1;
            }
        };

        loop {
            match self.read_device_byte(timeout).await {
                Ok(Some(byte)) => {
                    let mut out = std::io::stdout().lock();
                    let _ = out.write_all(&[byte]);
                    let _ = out.flush();
                    drop(out);
                    print::set_tainted(true);

                    if self.receive_window.len() == RECEIVE_WINDOW_SIZE {
                        self.receive_window.pop_front();
                    }
                    self.receive_window.push_back(byte);

                    if regex.is_match(self.receive_window.make_contiguous()) {
                        return 1;
                    }
                }
                Ok(None) | Err(_) => return 0,
            }
        }
    }

    /// Next byte from the local input stream (used by the filename line
    /// editor). Returns None when input is closed.
    pub(crate) async fn read_input_byte(&mut self) -> Option<u8> {
        if let Some(byte) = self.input_pending.pop_front() {
            return Some(byte);
        }
        if self.input_closed {
            return None;
        }
        match self.input_rx.recv().await {
            Some(chunk) => {
                self.input_pending.extend(chunk);
                self.input_pending.pop_front()
            }
            None => {
                self.input_closed = true;
                None
            }
        }
    }

    /// Minimal line editor on the input stream: BS/DEL rub out, echo,
    /// CR ends the line.
    pub(crate) async fn read_line_editor(&mut self) -> Option<String> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let byte = self.read_input_byte().await?;
            match byte {
                0x08 | 0x7f => {
                    if !line.is_empty() {
                        echo_raw(b"\x08 \x08");
                        line.pop();
                    }
                }
                b'\r' => {
                    echo_raw(b"\r");
                    break;
                }
                _ => {
                    if line.len() < LINE_SIZE_MAX - 1 {
                        echo_raw(&[byte]);
                        line.push(byte);
                    }
                }
            }
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Drain the staged device writes; any error here means the device
    /// went away and is reported by the event loop's read path.
    pub fn sync_staging(&mut self) {
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.sync() {
                log::debug!("staging drain failed ({e})");
            }
        }
    }
}

fn echo_raw(bytes: &[u8]) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(bytes);
    let _ = out.flush();
}

fn classify_open_error(error: crate::device::DeviceError) -> SessionError {
    use crate::device::DeviceError;
    match error {
        DeviceError::NotTty | DeviceError::Locked => SessionError::Fatal(error.to_string()),
        DeviceError::Open(_) => SessionError::Transient(error.to_string()),
        other => SessionError::Fatal(other.to_string()),
    }
}

fn device_accessible(path: &str) -> Result<(), i32> {
    let Ok(cpath) = std::ffi::CString::new(path) else {
        return Err(libc::EINVAL);
    };
    let status = unsafe { libc::access(cpath.as_ptr(), libc::R_OK) };
    if status == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

fn errno_message(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}
