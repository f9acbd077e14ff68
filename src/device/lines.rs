//! Modem line control.
//!
//! The six RS-232 modem lines are driven through TIOCMGET/TIOCMSET.
//! Polarity follows active-low wire semantics: driving a line HIGH
//! clears its TIOCM bit, driving it LOW sets it, and the state display
//! reports a set bit as LOW.

use std::os::fd::RawFd;

use libc::c_int;

use crate::options::PulseDurations;
use crate::status;

nix::ioctl_read_bad!(tiocmget, libc::TIOCMGET, c_int);
nix::ioctl_write_ptr_bad!(tiocmset, libc::TIOCMSET, c_int);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemLine {
    Dtr,
    Rts,
    Cts,
    Dsr,
    Dcd,
    Ri,
}

pub const ALL_LINES: [ModemLine; 6] = [
    ModemLine::Dtr,
    ModemLine::Rts,
    ModemLine::Cts,
    ModemLine::Dsr,
    ModemLine::Dcd,
    ModemLine::Ri,
];

impl ModemLine {
    pub fn mask(&self) -> c_int {
        match self {
            ModemLine::Dtr => libc::TIOCM_DTR,
            ModemLine::Rts => libc::TIOCM_RTS,
            ModemLine::Cts => libc::TIOCM_CTS,
            ModemLine::Dsr => libc::TIOCM_DSR,
            ModemLine::Dcd => libc::TIOCM_CAR,
            ModemLine::Ri => libc::TIOCM_RI,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModemLine::Dtr => "DTR",
            ModemLine::Rts => "RTS",
            ModemLine::Cts => "CTS",
            ModemLine::Dsr => "DSR",
            ModemLine::Dcd => "DCD",
            ModemLine::Ri => "RI",
        }
    }

    pub fn from_mask(mask: c_int) -> Option<ModemLine> {
        ALL_LINES.iter().copied().find(|line| line.mask() == mask)
    }

    /// Sub-command digit mapping: 0..5 over DTR,RTS,CTS,DSR,DCD,RI.
    pub fn from_digit(digit: u8) -> Option<ModemLine> {
        match digit {
            b'0' => Some(ModemLine::Dtr),
            b'1' => Some(ModemLine::Rts),
            b'2' => Some(ModemLine::Cts),
            b'3' => Some(ModemLine::Dsr),
            b'4' => Some(ModemLine::Dcd),
            b'5' => Some(ModemLine::Ri),
            _ => None,
        }
    }

    pub fn pulse_duration(&self, pulse: &PulseDurations) -> u64 {
        match self {
            ModemLine::Dtr => pulse.dtr,
            ModemLine::Rts => pulse.rts,
            ModemLine::Cts => pulse.cts,
            ModemLine::Dsr => pulse.dsr,
            ModemLine::Dcd => pulse.dcd,
            ModemLine::Ri => pulse.ri,
        }
    }
}

pub fn get_state(fd: RawFd) -> std::io::Result<c_int> {
    let mut state: c_int = 0;
    unsafe { tiocmget(fd, &mut state) }.map_err(std::io::Error::from)?;
    Ok(state)
}

fn set_state(fd: RawFd, state: c_int) -> std::io::Result<()> {
    unsafe { tiocmset(fd, &state) }.map_err(std::io::Error::from)?;
    Ok(())
}

/// Drive a line. `high == true` clears the TIOCM bit (see module docs).
pub fn line_set(fd: RawFd, line: ModemLine, high: bool) -> std::io::Result<()> {
    let mut state = get_state(fd)?;
    if high {
        state &= !line.mask();
        status!("Setting {} to HIGH", line.name());
    } else {
        state |= line.mask();
        status!("Setting {} to LOW", line.name());
    }
    set_state(fd, state)
}

pub fn line_toggle(fd: RawFd, line: ModemLine) -> std::io::Result<()> {
    let mut state = get_state(fd)?;
    if state & line.mask() != 0 {
        state &= !line.mask();
        status!("Setting {} to HIGH", line.name());
    } else {
        state |= line.mask();
        status!("Setting {} to LOW", line.name());
    }
    set_state(fd, state)
}

pub async fn line_pulse(fd: RawFd, line: ModemLine, duration_ms: u64) -> std::io::Result<()> {
    line_toggle(fd, line)?;
    if duration_ms > 0 {
        status!("Waiting {duration_ms} ms");
        tokio::time::sleep(std::time::Duration::from_millis(duration_ms)).await;
    }
    line_toggle(fd, line)
}

#[derive(Debug, Clone, Copy, Default)]
struct LineConfigSlot {
    mask: c_int,
    value: bool,
    reserved: bool,
}

/// Deferred "stage then apply" line configuration. Scripts queue several
/// settings and commit them with a single TIOCMSET. At most one slot per
/// mask.
#[derive(Debug, Default)]
pub struct LineConfigTable {
    slots: [LineConfigSlot; 6],
}

impl LineConfigTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a setting; an existing slot for the same mask is updated.
    pub fn config(&mut self, line: ModemLine, high: bool) {
        let mask = line.mask();
        for slot in &mut self.slots {
            if slot.mask == mask && slot.reserved {
                slot.value = high;
                return;
            }
        }
        for slot in &mut self.slots {
            if !slot.reserved {
                *slot = LineConfigSlot {
                    mask,
                    value: high,
                    reserved: true,
                };
                return;
            }
        }
    }

    pub fn staged(&self) -> Vec<(ModemLine, bool)> {
        self.slots
            .iter()
            .filter(|slot| slot.reserved)
            .filter_map(|slot| ModemLine::from_mask(slot.mask).map(|line| (line, slot.value)))
            .collect()
    }

    /// Apply the staged settings to a TIOCM state word. Lines without a
    /// staged slot are left unchanged.
    pub fn resolve(&self, mut state: c_int) -> c_int {
        for slot in self.slots.iter().filter(|slot| slot.reserved) {
            if slot.value {
                state &= !slot.mask;
            } else {
                state |= slot.mask;
            }
        }
        state
    }

    /// Commit every staged setting with one TIOCMSET and reset the table.
    pub fn apply(&mut self, fd: RawFd) -> std::io::Result<()> {
        let state = get_state(fd)?;
        for (line, high) in self.staged() {
            status!(
                "Setting {} to {}",
                line.name(),
                if high { "HIGH" } else { "LOW" }
            );
        }
        let result = set_state(fd, self.resolve(state));
        self.reset();
        result
    }

    pub fn reset(&mut self) {
        self.slots = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_clears_low_sets() {
        let mut table = LineConfigTable::new();
        table.config(ModemLine::Dtr, true);
        table.config(ModemLine::Rts, false);

        let before = libc::TIOCM_DTR | libc::TIOCM_CTS;
        let after = table.resolve(before);

        assert_eq!(after & libc::TIOCM_DTR, 0, "HIGH clears the bit");
        assert_ne!(after & libc::TIOCM_RTS, 0, "LOW sets the bit");
        assert_ne!(after & libc::TIOCM_CTS, 0, "untouched lines keep state");
    }

    #[test]
    fn one_slot_per_mask() {
        let mut table = LineConfigTable::new();
        table.config(ModemLine::Dtr, true);
        table.config(ModemLine::Dtr, false);
        assert_eq!(table.staged().len(), 1);
        assert_eq!(table.staged()[0], (ModemLine::Dtr, false));
    }

    #[test]
    fn apply_resets_the_table() {
        let mut table = LineConfigTable::new();
        table.config(ModemLine::Ri, true);
        table.reset();
        assert!(table.staged().is_empty());
        assert_eq!(table.resolve(0x55), 0x55);
    }

    #[test]
    fn digits_select_lines_in_order() {
        let names: Vec<_> = (b'0'..=b'5')
            .map(|d| ModemLine::from_digit(d).unwrap().name())
            .collect();
        assert_eq!(names, ["DTR", "RTS", "CTS", "DSR", "DCD", "RI"]);
        assert!(ModemLine::from_digit(b'6').is_none());
    }
}
