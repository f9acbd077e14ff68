//! Line timestamp generation.

use chrono::{DateTime, Local};

use crate::options::TimestampMode;

/// Produces the timestamp strings injected in front of received lines.
/// The start and delta modes are measured against the session start and
/// the previous stamp respectively.
#[derive(Debug)]
pub struct Timestamper {
    start: DateTime<Local>,
    previous: DateTime<Local>,
}

impl Timestamper {
    pub fn new() -> Self {
        let now = Local::now();
        Self {
            start: now,
            previous: now,
        }
    }

    /// Current timestamp string for the given mode, millisecond precision.
    /// Returns None when timestamping is off.
    pub fn stamp(&mut self, mode: TimestampMode) -> Option<String> {
        let now = Local::now();
        let stamp = match mode {
            TimestampMode::None => None,
            TimestampMode::TwentyFourHour => Some(now.format("%H:%M:%S%.3f").to_string()),
            TimestampMode::TwentyFourHourStart => Some(format_elapsed(now - self.start)),
            TimestampMode::TwentyFourHourDelta => Some(format_elapsed(now - self.previous)),
            TimestampMode::Iso8601 => Some(now.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
        };
        self.previous = now;
        stamp
    }
}

impl Default for Timestamper {
    fn default() -> Self {
        Self::new()
    }
}

fn format_elapsed(elapsed: chrono::Duration) -> String {
    let millis = elapsed.num_milliseconds().max(0);
    let seconds = millis / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60,
        millis % 1000
    )
}

/// Wall-clock stamp used in front of status messages.
pub fn status_stamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn stamp_shapes_match_mode() {
        let mut ts = Timestamper::new();
        let hms = Regex::new(r"^\d{2}:\d{2}:\d{2}\.\d{3}$").unwrap();
        let iso = Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}$").unwrap();

        assert!(ts.stamp(TimestampMode::None).is_none());
        assert!(hms.is_match(&ts.stamp(TimestampMode::TwentyFourHour).unwrap()));
        assert!(hms.is_match(&ts.stamp(TimestampMode::TwentyFourHourStart).unwrap()));
        assert!(hms.is_match(&ts.stamp(TimestampMode::TwentyFourHourDelta).unwrap()));
        assert!(iso.is_match(&ts.stamp(TimestampMode::Iso8601).unwrap()));
    }

    #[test]
    fn start_mode_counts_from_session_start() {
        let mut ts = Timestamper::new();
        let stamp = ts.stamp(TimestampMode::TwentyFourHourStart).unwrap();
        assert!(stamp.starts_with("00:00:00"));
    }
}
