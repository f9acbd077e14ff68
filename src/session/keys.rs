//! The in-band key command interpreter.
//!
//! Input bytes are transparent except the configured prefix; a prefix
//! followed by a command key is consumed, and prefix twice forwards one
//! literal prefix byte. A few commands consume exactly one follow-up
//! byte (line toggle/pulse digits, the xmodem protocol picker).

use std::io::Write;

use crate::device::lines::{self, ModemLine, ALL_LINES};
use crate::device::rs485;
use crate::options::{InputMode, OutputMode, TimestampMode};
use crate::script;
use crate::transfer::{self, Protocol};
use crate::{status, status_prompt, warning};

use super::Session;

const COFFEE_ART: &str = "        ( (\n         ) )\n       ........\n       |      |]\n       \\      /\n        `----'\n\nTime for a coffee break!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SubCommand {
    #[default]
    None,
    LineToggle,
    LinePulse,
    Xmodem,
}

#[derive(Debug, Default)]
pub(crate) struct KeyState {
    pub previous: u8,
    pub sub: SubCommand,
}

/// What to do with an input byte after command interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Not a command; forward to the device (subject to input modes).
    Forward(u8),
    /// Swallowed by the interpreter.
    Consumed,
    /// End the session with this exit code.
    Exit(i32),
}

impl Session {
    /// Feed one locally-originated byte through the command state
    /// machine.
    pub async fn handle_command_sequence(&mut self, byte: u8) -> KeyOutcome {
        // A pending sub-command consumes exactly one byte.
        match std::mem::take(&mut self.keys.sub) {
            SubCommand::None => {}
            SubCommand::LineToggle => {
                self.line_poke(byte, false).await;
                return KeyOutcome::Consumed;
            }
            SubCommand::LinePulse => {
                self.line_poke(byte, true).await;
                return KeyOutcome::Consumed;
            }
            SubCommand::Xmodem => {
                match byte {
                    b'0' => {
                        status!("Send file with XMODEM-1K");
                        self.prompt_and_send(Protocol::Xmodem1k).await;
                    }
                    b'1' => {
                        status!("Send file with XMODEM-CRC");
                        self.prompt_and_send(Protocol::XmodemCrc).await;
                    }
                    _ => {}
                }
                return KeyOutcome::Consumed;
            }
        }

        if self.opts.prefix_enabled && self.keys.previous == self.opts.prefix_code {
            if byte == self.opts.prefix_code {
                // Double prefix forwards a single literal prefix byte.
                self.keys.previous = 0;
                return KeyOutcome::Forward(byte);
            }
            let outcome = self.run_command(byte).await;
            self.keys.previous = byte;
            return outcome;
        }

        self.keys.previous = byte;
        if self.opts.prefix_enabled && byte == self.opts.prefix_code {
            return KeyOutcome::Consumed;
        }
        KeyOutcome::Forward(byte)
    }

    async fn run_command(&mut self, byte: u8) -> KeyOutcome {
        match byte {
            b'?' => self.print_help(),
            b'b' => {
                if let Some(port) = self.port.as_ref() {
                    port.send_break();
                } else {
                    warning!("Not connected");
                }
            }
            b'c' => self.print_config(),
            b'e' => {
                self.opts.local_echo = !self.opts.local_echo;
                status!(
                    "Switched local echo {}",
                    if self.opts.local_echo { "on" } else { "off" }
                );
            }
            b'f' => self.toggle_log(),
            // The input pump already flushed the queues for prefix+F.
            b'F' => {}
            b'g' => {
                status!("Please enter which serial line number to toggle:");
                self.print_line_menu();
                self.keys.sub = SubCommand::LineToggle;
            }
            b'h' => self.cycle_output_mode(),
            b'i' => self.cycle_input_mode(),
            b'o' => self.cycle_output_mode(),
            b'l' => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(b"\x1bc");
                let _ = out.flush();
            }
            b'L' => self.print_line_states(),
            b'm' => {
                use crate::transform::MapFlags;
                self.opts.map.toggle(MapFlags::MSB2LSB);
                if self.opts.map.contains(MapFlags::MSB2LSB) {
                    status!("Switched to reverse bit order");
                } else {
                    status!("Switched to normal bit order");
                }
            }
            b'p' => {
                status!("Please enter which serial line number to pulse:");
                self.print_line_menu();
                self.keys.sub = SubCommand::LinePulse;
            }
            b'q' => return KeyOutcome::Exit(0),
            b'r' => {
                if let Some(code) = script::run(self).await {
                    return KeyOutcome::Exit(code);
                }
            }
            b's' => {
                status!("Statistics:");
                status!(" Sent {} bytes", self.tx_total);
                status!(" Received {} bytes", self.rx_total);
            }
            b't' => self.cycle_timestamp_mode(),
            b'U' => {
                use crate::transform::MapFlags;
                self.opts.map.toggle(MapFlags::OLTU);
            }
            b'v' => status!("serterm v{}", env!("CARGO_PKG_VERSION")),
            b'x' => {
                status!("Please enter which X modem protocol to use:");
                status!(" (0) XMODEM-1K");
                status!(" (1) XMODEM-CRC");
                self.keys.sub = SubCommand::Xmodem;
            }
            b'y' => {
                status!("Send file with YMODEM");
                self.prompt_and_send(Protocol::Ymodem).await;
            }
            b'z' => crate::print::status_array(COFFEE_ART),
            _ => {}
        }
        KeyOutcome::Consumed
    }

    fn print_help(&self) {
        let p = self.opts.prefix_key;
        status!("Key commands:");
        status!(" ctrl-{p} ?       List available key commands");
        status!(" ctrl-{p} b       Send break");
        status!(" ctrl-{p} c       Show configuration");
        status!(" ctrl-{p} e       Toggle local echo mode");
        status!(" ctrl-{p} f       Toggle log to file");
        status!(" ctrl-{p} F       Flush data I/O buffers");
        status!(" ctrl-{p} g       Toggle serial port line");
        status!(" ctrl-{p} h       Toggle hex output");
        status!(" ctrl-{p} i       Toggle input mode");
        status!(" ctrl-{p} l       Clear screen");
        status!(" ctrl-{p} L       Show line states");
        status!(" ctrl-{p} m       Toggle MSB to LSB bit order");
        status!(" ctrl-{p} o       Toggle output mode");
        status!(" ctrl-{p} p       Pulse serial port line");
        status!(" ctrl-{p} q       Quit");
        status!(" ctrl-{p} r       Run script");
        status!(" ctrl-{p} s       Show statistics");
        status!(" ctrl-{p} t       Toggle line timestamp mode");
        status!(" ctrl-{p} U       Toggle conversion to uppercase on output");
        status!(" ctrl-{p} v       Show version");
        status!(" ctrl-{p} x       Send file via Xmodem");
        status!(" ctrl-{p} y       Send file via Ymodem");
        status!(" ctrl-{p} ctrl-{p}  Send ctrl-{p} character");
    }

    fn print_config(&self) {
        status!("Configuration:");
        status!(" Device: {}", self.opts.device);
        status!(" Baudrate: {}", self.opts.baudrate);
        status!(" Databits: {}", self.opts.databits);
        status!(" Flow: {}", self.opts.flow.as_str());
        status!(" Stopbits: {}", self.opts.stopbits);
        status!(" Parity: {}", self.opts.parity.as_str());
        status!(" Output delay: {}", self.opts.output_delay);
        status!(" Output line delay: {}", self.opts.output_line_delay);
        status!(" Local echo: {}", if self.opts.local_echo { "yes" } else { "no" });
        status!(" Timestamps: {}", self.opts.timestamp.as_str());
        if self.opts.log {
            status!(
                " Log file: {}",
                self.logger.filename().unwrap_or("(generated)")
            );
        }
        let map = self.opts.map.names().join(",");
        if !map.is_empty() {
            status!(" Map flags: {map}");
        }
        if let Some(socket) = &self.opts.socket {
            status!(" Socket: {socket}");
        }
        if self.opts.rs485 {
            rs485::print_config(&self.opts.rs485_config);
        }
    }

    fn print_line_menu(&self) {
        status!("(0) DTR");
        status!("(1) RTS");
        status!("(2) CTS");
        status!("(3) DSR");
        status!("(4) DCD");
        status!("(5) RI");
    }

    fn print_line_states(&self) {
        let Some(fd) = self.port_fd() else {
            warning!("Not connected");
            return;
        };
        let state = match lines::get_state(fd) {
            Ok(state) => state,
            Err(e) => {
                warning!("Could not get line state ({e})");
                return;
            }
        };
        status!("Line states:");
        for line in ALL_LINES {
            status!(
                " {}: {}",
                line.name(),
                if state & line.mask() != 0 { "LOW" } else { "HIGH" }
            );
        }
    }

    async fn line_poke(&mut self, digit: u8, pulse: bool) {
        let Some(line) = ModemLine::from_digit(digit) else {
            warning!("Invalid line number");
            return;
        };
        let Some(fd) = self.port_fd() else {
            warning!("Not connected");
            return;
        };
        let result = if pulse {
            lines::line_pulse(fd, line, line.pulse_duration(&self.opts.pulse)).await
        } else {
            lines::line_toggle(fd, line)
        };
        if let Err(e) = result {
            warning!("Could not set line state ({e})");
        }
    }

    fn toggle_log(&mut self) {
        if self.opts.log {
            self.logger.close();
            self.opts.log = false;
        } else if self
            .logger
            .open(self.opts.log_filename.clone().as_deref(), &self.opts.device)
        {
            self.opts.log = true;
        }
        status!(
            "Switched log to file {}",
            if self.opts.log { "on" } else { "off" }
        );
    }

    fn cycle_input_mode(&mut self) {
        self.opts.input_mode = match self.opts.input_mode {
            InputMode::Normal => {
                status!("Switched to hex input mode");
                InputMode::Hex
            }
            InputMode::Hex => {
                status!("Switched to line input mode");
                InputMode::Line
            }
            InputMode::Line => {
                status!("Switched to normal input mode");
                InputMode::Normal
            }
        };
        self.hex_in.reset();
    }

    fn cycle_output_mode(&mut self) {
        self.opts.output_mode = match self.opts.output_mode {
            OutputMode::Normal => {
                status!("Switched to hex output mode");
                OutputMode::Hex
            }
            OutputMode::Hex => {
                status!("Switched to normal output mode");
                OutputMode::Normal
            }
        };
    }

    fn cycle_timestamp_mode(&mut self) {
        self.opts.timestamp = self.opts.timestamp.next();
        match self.opts.timestamp {
            TimestampMode::None => status!("Switched timestamp off"),
            mode => status!("Switched to {} timestamp mode", mode.as_str()),
        }
    }

    async fn prompt_and_send(&mut self, protocol: Protocol) {
        status_prompt!("Enter file name: ");
        let Some(filename) = self.read_line_editor().await else {
            return;
        };
        if filename.is_empty() {
            return;
        }
        status!("Sending file '{}'  ", filename);
        status!("Press any key to abort transfer");
        match transfer::send(self, &filename, protocol).await {
            Ok(()) => status!("Done"),
            Err(e) => {
                log::debug!("transfer failed: {e}");
                status!("Aborted");
            }
        }
    }
}
