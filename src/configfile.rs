//! Configuration file support.
//!
//! serterm reads an INI-style file from the first present of
//! `$XDG_CONFIG_HOME/serterm/config`, `$HOME/.config/serterm/config` and
//! `$HOME/.sertermrc`. A named section applies when its `pattern`
//! matches the positional argument, first as plain text and then as an
//! extended regular expression; entries outside any section are
//! defaults, applied only when a section matched. A parenthesised
//! capture of the regex is substituted for `%s` in the section's `tty`
//! value.

use std::collections::BTreeMap;
use std::path::PathBuf;

use regex::Regex;
use thiserror::Error;

use crate::options::{AlertMode, FlowControl, Options, ParityMode, TimestampMode};
use crate::transform::MapFlags;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration line {line}: {text}")]
    Syntax { line: usize, text: String },

    #[error("{0}")]
    Value(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A parsed configuration file: default entries plus named sections.
#[derive(Debug, Default)]
pub struct ConfigFile {
    pub defaults: BTreeMap<String, String>,
    pub sections: Vec<Section>,
}

#[derive(Debug, Default)]
pub struct Section {
    pub name: String,
    pub entries: BTreeMap<String, String>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<ConfigFile> {
        let mut file = ConfigFile::default();
        let mut current: Option<Section> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or(ConfigError::Syntax {
                    line: index + 1,
                    text: raw.to_string(),
                })?;
                if let Some(done) = current.take() {
                    file.sections.push(done);
                }
                current = Some(Section {
                    name: name.trim().to_string(),
                    entries: BTreeMap::new(),
                });
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::Syntax {
                line: index + 1,
                text: raw.to_string(),
            })?;
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            match &mut current {
                Some(section) => {
                    section.entries.insert(key, value);
                }
                None => {
                    file.defaults.insert(key, value);
                }
            }
        }
        if let Some(done) = current.take() {
            file.sections.push(done);
        }
        Ok(file)
    }

    /// Find the section whose `pattern` matches the user's positional
    /// argument. Plain-text equality is tried before regex matching; the
    /// first regex capture group, if any, is returned for substitution.
    pub fn match_section(&self, user: &str) -> Option<(&Section, Option<String>)> {
        for section in &self.sections {
            let Some(pattern) = section.entries.get("pattern") else {
                continue;
            };
            if pattern == user {
                return Some((section, None));
            }
        }
        for section in &self.sections {
            let Some(pattern) = section.entries.get("pattern") else {
                continue;
            };
            let Ok(re) = Regex::new(pattern) else {
                log::debug!("invalid section pattern '{}', skipped", pattern);
                continue;
            };
            if let Some(captures) = re.captures(user) {
                let matched = captures.get(1).map(|m| m.as_str().to_string());
                return Some((section, matched));
            }
        }
        None
    }
}

fn resolve_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg).join("serterm/config");
        if path.exists() {
            return Some(path);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home).join(".config/serterm/config");
        if path.exists() {
            return Some(path);
        }
        let path = PathBuf::from(&home).join(".sertermrc");
        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Apply the configuration file to the options record: defaults first,
/// then the section matched by `user` (which also resolves the device
/// path through `tty` and `%s` substitution).
pub fn apply(opts: &mut Options, user: &str) -> std::result::Result<(), String> {
    let Some(path) = resolve_path() else {
        return Ok(());
    };
    let text = std::fs::read_to_string(&path)
        .map_err(|e| format!("Unable to read {}: {e}", path.display()))?;
    let file = ConfigFile::parse(&text).map_err(|e| e.to_string())?;

    // Nothing applies, defaults included, unless a section matches the
    // positional argument.
    let Some((section, capture)) = file.match_section(user) else {
        log::debug!("no configuration section matches '{user}'");
        return Ok(());
    };

    log::debug!("matched configuration section [{}]", section.name);
    apply_entries(opts, &file.defaults)?;
    apply_entries(opts, &section.entries)?;
    if let Some(tty) = section.entries.get("tty") {
        opts.device = match capture {
            Some(capture) => tty.replacen("%s", &capture, 1),
            None => tty.clone(),
        };
    }
    Ok(())
}

fn apply_entries(
    opts: &mut Options,
    entries: &BTreeMap<String, String>,
) -> std::result::Result<(), String> {
    for (key, value) in entries {
        match key.as_str() {
            "pattern" | "tty" => {}
            "baudrate" => opts.baudrate = parse_number(key, value)? as u32,
            "databits" => opts.databits = parse_number(key, value)? as u8,
            "flow" => opts.flow = FlowControl::parse(value)?,
            "stopbits" => opts.stopbits = parse_number(key, value)? as u8,
            "parity" => opts.parity = ParityMode::parse(value)?,
            "output-delay" => opts.output_delay = parse_number(key, value)?,
            "output-line-delay" => opts.output_line_delay = parse_number(key, value)?,
            "no-autoconnect" => opts.auto_connect = !parse_bool(value),
            "log" => opts.log = parse_bool(value),
            "local-echo" => opts.local_echo = parse_bool(value),
            "timestamp" => {
                opts.timestamp = if parse_bool(value) {
                    TimestampMode::TwentyFourHour
                } else {
                    TimestampMode::None
                }
            }
            "timestamp-format" => opts.timestamp = TimestampMode::parse(value)?,
            "log-filename" => opts.log_filename = Some(value.clone()),
            "map" => opts.map = MapFlags::parse(value)?,
            "color" => {
                opts.color = value
                    .parse()
                    .map_err(|_| format!("Invalid color value: {value}"))?
            }
            "alert" => opts.alert = AlertMode::parse(value)?,
            _ => log::debug!("ignoring unknown configuration key '{key}'"),
        }
    }
    Ok(())
}

fn parse_number(key: &str, value: &str) -> std::result::Result<u64, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid value for {key}: {value}"))
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# defaults
baudrate = 9600
local-echo = 1

[usb devices]
pattern = usb([0-9]*)
tty = /dev/ttyUSB%s
baudrate = 115200

[rpi]
pattern = rpi
tty = /dev/serial0
";

    #[test]
    fn parses_defaults_and_sections() {
        let file = ConfigFile::parse(SAMPLE).unwrap();
        assert_eq!(file.defaults.get("baudrate").unwrap(), "9600");
        assert_eq!(file.sections.len(), 2);
        assert_eq!(file.sections[0].name, "usb devices");
    }

    #[test]
    fn plain_match_wins_over_regex() {
        let file = ConfigFile::parse(SAMPLE).unwrap();
        let (section, capture) = file.match_section("rpi").unwrap();
        assert_eq!(section.name, "rpi");
        assert!(capture.is_none());
    }

    #[test]
    fn regex_match_substitutes_capture() {
        let file = ConfigFile::parse(SAMPLE).unwrap();
        let (section, capture) = file.match_section("usb12").unwrap();
        assert_eq!(section.name, "usb devices");
        assert_eq!(capture.as_deref(), Some("12"));
        let tty = section.entries.get("tty").unwrap();
        assert_eq!(tty.replacen("%s", capture.as_deref().unwrap(), 1), "/dev/ttyUSB12");
    }

    #[test]
    fn rejects_bad_syntax() {
        assert!(ConfigFile::parse("key without equals\n").is_err());
        assert!(ConfigFile::parse("[unterminated\n").is_err());
    }
}
