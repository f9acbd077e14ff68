//! Session log capture.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Local;

use crate::warning;

fn is_esc_csi_intermediate(c: u8) -> bool {
    (0x20..=0x3f).contains(&c)
}

fn is_esc_end(c: u8) -> bool {
    (0x30..=0x7e).contains(&c)
}

fn is_ctrl(c: u8) -> bool {
    c <= 0x1f
}

/// Append-mode log writer with an optional control/escape strip filter.
#[derive(Debug, Default)]
pub struct LogWriter {
    file: Option<File>,
    filename: Option<String>,
    strip: bool,
    strip_state: StripState,
}

#[derive(Debug, Default)]
struct StripState {
    previous: u8,
    esc_sequence: bool,
}

impl StripState {
    /// Decide whether a byte belongs to an escape sequence or is an ASCII
    /// control character and should be left out of the log.
    fn strip(&mut self, byte: u8) -> bool {
        let strip = match byte {
            b'\n' => {
                // A newline ends any escape sequence parse that went wrong.
                self.esc_sequence = false;
                false
            }
            0x1b => true,
            0x5b if self.previous == 0x1b => {
                self.esc_sequence = true;
                true
            }
            c if is_ctrl(c) => true,
            c if self.esc_sequence && is_esc_csi_intermediate(c) => true,
            c if self.esc_sequence && is_esc_end(c) => {
                self.esc_sequence = false;
                true
            }
            _ => false,
        };
        self.previous = byte;
        strip
    }
}

impl LogWriter {
    pub fn new(strip: bool) -> Self {
        Self {
            strip,
            ..Default::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Open the log file, generating `serterm_<device>_<time>.log` when no
    /// name was configured. Returns false (with a warning) on failure.
    pub fn open(&mut self, filename: Option<&str>, device: &str) -> bool {
        let name = match filename {
            Some(name) => name.to_string(),
            None => {
                let base = Path::new(device)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "serial".to_string());
                format!(
                    "serterm_{}_{}.log",
                    base,
                    Local::now().format("%Y-%m-%dT%H:%M:%S")
                )
            }
        };

        match OpenOptions::new().create(true).append(true).open(&name) {
            Ok(file) => {
                self.file = Some(file);
                self.filename = Some(name);
                true
            }
            Err(e) => {
                warning!("Could not open log file {name} ({e})");
                false
            }
        }
    }

    pub fn putc(&mut self, byte: u8) {
        let Some(file) = &mut self.file else {
            return;
        };
        if self.strip && self.strip_state.strip(byte) {
            return;
        }
        let _ = file.write_all(&[byte]);
    }

    pub fn print(&mut self, text: &str) {
        if let Some(file) = &mut self.file {
            let _ = file.write_all(text.as_bytes());
        }
    }

    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_all(input: &[u8]) -> Vec<u8> {
        let mut state = StripState::default();
        input
            .iter()
            .copied()
            .filter(|&b| !state.strip(b))
            .collect()
    }

    #[test]
    fn strips_csi_sequences_and_control_chars() {
        assert_eq!(strip_all(b"\x1b[31mred\x1b[0m\n"), b"red\n");
        assert_eq!(strip_all(b"plain text\n"), b"plain text\n");
    }

    #[test]
    fn keeps_newline_drops_carriage_return() {
        assert_eq!(strip_all(b"line\r\n"), b"line\n");
    }

    #[test]
    fn newline_resets_a_broken_escape_parse() {
        assert_eq!(strip_all(b"\x1b[\nok"), b"\nok");
    }
}
