//! The multiplexed event loop.
//!
//! Steady state: device bytes flow through the render pipeline to the
//! terminal, the log and the socket; local and socket bytes flow through
//! the command interpreter and the transmit pipeline to the device. In
//! response-wait mode every wait is bounded by the response timeout and
//! the first CR/LF from the device ends the session successfully.

use std::io::Write;
use std::time::Duration;

use crate::device::port::DeviceEvent;
use crate::options::{InputMode, OutputMode};
use crate::print;
use crate::transform::{self, Forward, Render};
use crate::warning;

use super::keys::KeyOutcome;
use super::{Session, SessionError};

enum Event {
    Device(DeviceEvent),
    DeviceClosed,
    Input(Vec<u8>),
    InputClosed,
    Socket(u8),
    SocketClosed,
}

/// Result of processing one locally-originated byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFlow {
    Continue,
    Exit(i32),
}

impl Session {
    /// Run the interactive event loop until the session ends.
    pub async fn event_loop(&mut self) -> Result<i32, SessionError> {
        loop {
            // Bytes a transfer or expect left behind re-enter the normal
            // render path first.
            while let Some(byte) = self.pending.pop_front() {
                if let Some(code) = self.render_device_byte(byte) {
                    return Ok(code);
                }
            }

            let event = if self.opts.response_wait {
                let timeout = Duration::from_millis(self.opts.response_timeout.max(1));
                match tokio::time::timeout(timeout, self.next_event()).await {
                    Ok(event) => event,
                    // Response timeout exits with failure.
                    Err(_) => return Ok(1),
                }
            } else {
                self.next_event().await
            };

            match event {
                Event::Device(DeviceEvent::Data(chunk)) => {
                    self.rx_total += chunk.len() as u64;
                    for byte in chunk {
                        if let Some(code) = self.render_device_byte(byte) {
                            return Ok(code);
                        }
                    }
                }
                Event::Device(DeviceEvent::Error(message)) => {
                    log::debug!("device read error: {message}");
                    self.disconnect().await;
                    return Err(SessionError::Runtime(
                        "Could not read from tty device".into(),
                    ));
                }
                Event::Device(DeviceEvent::Disconnected) | Event::DeviceClosed => {
                    self.disconnect().await;
                    return Err(SessionError::Runtime(
                        "Could not read from tty device".into(),
                    ));
                }
                Event::Input(chunk) => {
                    self.input_pending.extend(chunk);
                    while let Some(byte) = self.input_pending.pop_front() {
                        match self.process_input_byte(byte).await {
                            InputFlow::Continue => {}
                            InputFlow::Exit(code) => {
                                self.sync_staging();
                                return Ok(code);
                            }
                        }
                    }
                    self.sync_staging();
                }
                Event::InputClosed => {
                    self.input_closed = true;
                    if self.interactive {
                        self.sync_staging();
                        return Ok(0);
                    }
                    // Piped input already ended; keep serving the device
                    // (response-wait).
                }
                Event::Socket(byte) => {
                    self.forward_to_tty(byte).await;
                    self.sync_staging();
                }
                Event::SocketClosed => {}
            }
        }
    }

    async fn next_event(&mut self) -> Event {
        let device_rx = self.device_rx.as_mut();
        let input_closed = self.input_closed;
        let input_rx = &mut self.input_rx;
        let socket = &mut self.socket;

        tokio::select! {
            event = async {
                match device_rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match event {
                Some(event) => Event::Device(event),
                None => Event::DeviceClosed,
            },
            chunk = input_rx.recv(), if !input_closed => match chunk {
                Some(chunk) => Event::Input(chunk),
                None => Event::InputClosed,
            },
            byte = Self::socket_recv(socket) => match byte {
                Some(byte) => Event::Socket(byte),
                None => Event::SocketClosed,
            },
        }
    }

    /// Render one received byte: timestamp injection, receive maps, the
    /// current renderer, then the log and socket taps. Returns an exit
    /// code when response-wait is satisfied.
    pub(crate) fn render_device_byte(&mut self, byte: u8) -> Option<i32> {
        if self.next_timestamp
            && byte != b'\n'
            && byte != b'\r'
            && self.opts.output_mode == OutputMode::Normal
        {
            if let Some(stamp) = self.stamper.stamp(self.opts.timestamp) {
                print::colored_raw(format_args!("[{stamp}] "));
                self.logger.print(&format!("[{stamp}] "));
                self.next_timestamp = false;
            }
        }

        let (mapped, render) = transform::map_receive(byte, self.opts.map);
        match render {
            Render::Byte(byte) => self.emit_rendered(byte),
            Render::CrLf => {
                self.emit_rendered(b'\r');
                self.emit_rendered(b'\n');
                if self.opts.timestamp.enabled() {
                    self.next_timestamp = true;
                }
            }
            Render::ClearScreen => {
                self.emit_rendered(0x1b);
                self.emit_rendered(b'c');
            }
        }

        self.logger.putc(mapped);
        if let Some(hub) = &self.socket {
            hub.write_byte(mapped);
        }
        print::set_tainted(true);

        if mapped == b'\n' && self.opts.timestamp.enabled() {
            self.next_timestamp = true;
        }

        if self.opts.response_wait && (mapped == b'\r' || mapped == b'\n') {
            self.sync_staging();
            return Some(0);
        }
        None
    }

    /// Emit one byte through the current renderer (normal or hex).
    pub(crate) fn emit_rendered(&mut self, byte: u8) {
        let mut out = std::io::stdout().lock();
        match self.opts.output_mode {
            OutputMode::Normal => {
                let _ = out.write_all(&[byte]);
            }
            OutputMode::Hex => {
                let _ = write!(out, "{byte:02x} ");
            }
        }
        let _ = out.flush();
    }

    fn optional_local_echo(&mut self, byte: u8) {
        if !self.opts.local_echo {
            return;
        }
        self.emit_rendered(byte);
        self.logger.putc(byte);
    }

    /// One locally-originated byte: command interpretation, input-mode
    /// filtering, then the transmit pipeline.
    pub async fn process_input_byte(&mut self, byte: u8) -> InputFlow {
        let outcome = self.handle_command_sequence(byte).await;
        let forwarded = match outcome {
            KeyOutcome::Exit(code) => return InputFlow::Exit(code),
            KeyOutcome::Consumed => return InputFlow::Continue,
            KeyOutcome::Forward(byte) => byte,
        };

        match self.opts.input_mode {
            InputMode::Hex => {
                if !transform::is_hex_digit(forwarded) {
                    warning!(
                        "Invalid hex character: '{}' (0x{:02x})",
                        forwarded as char,
                        forwarded
                    );
                    return InputFlow::Continue;
                }
                self.forward_to_tty(forwarded).await;
            }
            InputMode::Line => self.line_mode_input(forwarded).await,
            InputMode::Normal => self.forward_to_tty(forwarded).await,
        }
        InputFlow::Continue
    }

    /// Line input mode: buffer locally with destructive backspace and
    /// swallowed arrow keys; CR transmits the buffer plus '\r' and
    /// drains staging.
    async fn line_mode_input(&mut self, byte: u8) {
        match byte {
            0x1b => {}
            b'[' if self.prev_input[0] == 0x1b => {}
            b'A' | b'B' | b'C' | b'D'
                if self.prev_input[1] == 0x1b && self.prev_input[0] == b'[' => {}
            0x08 | 0x7f => {
                if !self.line_buffer.is_empty() {
                    let mut out = std::io::stdout().lock();
                    if self.opts.output_mode == OutputMode::Hex && self.opts.local_echo {
                        let _ = out.write_all(b"\x08\x08\x08   \x08\x08\x08");
                    } else {
                        let _ = out.write_all(b"\x08 \x08");
                    }
                    let _ = out.flush();
                    self.line_buffer.pop();
                }
            }
            b'\r' => {
                let line = std::mem::take(&mut self.line_buffer);
                if let Some(port) = self.port.as_mut() {
                    let mut sent = 0;
                    match port.write_bytes(&line, &self.opts) {
                        Ok(count) => sent += count,
                        Err(e) => warning!("Could not write to tty device ({e})"),
                    }
                    match port.write_bytes(b"\r", &self.opts) {
                        Ok(count) => sent += count,
                        Err(e) => warning!("Could not write to tty device ({e})"),
                    }
                    self.tx_total += sent as u64;
                }
                self.optional_local_echo(b'\r');
                self.sync_staging();
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(b"\r\n");
                let _ = out.flush();
            }
            _ => {
                if self.line_buffer.len() < crate::device::port::CHUNK_SIZE {
                    self.optional_local_echo(byte);
                    self.line_buffer.push(byte);
                } else {
                    warning!("Input exceeds maximum line length. Truncating.");
                }
            }
        }

        self.prev_input[1] = self.prev_input[0];
        self.prev_input[0] = byte;
    }

    /// The transmit path: output maps, local echo, then the staged (or
    /// delayed) device write.
    pub(crate) async fn forward_to_tty(&mut self, byte: u8) {
        match transform::map_transmit(byte, self.opts.map) {
            Forward::CrLfPair => {
                self.optional_local_echo(b'\r');
                self.optional_local_echo(b'\n');
                if let Some(port) = self.port.as_mut() {
                    if let Err(e) = port.write_bytes(b"\r\n", &self.opts) {
                        warning!("Could not write to tty device ({e})");
                    }
                }
                self.tx_total += 2;
            }
            forward => match self.opts.output_mode {
                OutputMode::Normal => {
                    if self.opts.input_mode == InputMode::Hex {
                        let Forward::Byte(byte) = forward else {
                            return;
                        };
                        self.handle_hex_prompt(byte).await;
                    } else {
                        match forward {
                            Forward::Byte(byte) => {
                                self.optional_local_echo(byte);
                                if let Some(port) = self.port.as_mut() {
                                    if let Err(e) = port.write_bytes(&[byte], &self.opts) {
                                        warning!("Could not write to tty device ({e})");
                                    }
                                }
                            }
                            Forward::Break => {
                                self.optional_local_echo(0);
                                if let Some(port) = self.port.as_ref() {
                                    port.send_break();
                                }
                            }
                            Forward::CrLfPair => unreachable!(),
                        }
                        self.tx_total += 1;
                    }
                }
                OutputMode::Hex => {
                    if self.opts.input_mode == InputMode::Hex {
                        let Forward::Byte(byte) = forward else {
                            return;
                        };
                        self.handle_hex_prompt(byte).await;
                    } else if let Forward::Byte(byte) = forward {
                        // Hex display mode keeps keyboard input local.
                        self.optional_local_echo(byte);
                    }
                }
            },
        }
    }

    /// Hex input: echo the digit; a completed pair erases the prompt and
    /// sends the composed byte.
    async fn handle_hex_prompt(&mut self, digit: u8) {
        {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(&[digit]);
            let _ = out.flush();
        }
        print::set_tainted(true);

        let Some(value) = self.hex_in.push(digit) else {
            return;
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        {
            let mut out = std::io::stdout().lock();
            if self.opts.local_echo {
                let _ = out.write_all(b" ");
            } else {
                let _ = out.write_all(b"\x08 \x08\x08 \x08");
            }
            let _ = out.flush();
        }

        if let Some(port) = self.port.as_mut() {
            match port.write_bytes(&[value], &self.opts) {
                Ok(_) => self.tx_total += 1,
                Err(e) => warning!("Could not write to tty device ({e})"),
            }
        }
    }
}
