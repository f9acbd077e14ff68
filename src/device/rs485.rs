//! RS-485 transceiver mode (Linux).

use std::os::fd::RawFd;

use crate::options::Rs485Config;
use crate::status;

use super::{DeviceError, Result};

pub const SER_RS485_ENABLED: u32 = 1 << 0;
pub const SER_RS485_RTS_ON_SEND: u32 = 1 << 1;
pub const SER_RS485_RTS_AFTER_SEND: u32 = 1 << 2;
pub const SER_RS485_RX_DURING_TX: u32 = 1 << 4;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;

    const TIOCGRS485: libc::c_ulong = 0x542e;
    const TIOCSRS485: libc::c_ulong = 0x542f;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SerialRs485 {
        pub flags: u32,
        pub delay_rts_before_send: u32,
        pub delay_rts_after_send: u32,
        pub padding: [u32; 5],
    }

    nix::ioctl_read_bad!(tiocgrs485, TIOCGRS485, SerialRs485);
    nix::ioctl_write_ptr_bad!(tiocsrs485, TIOCSRS485, SerialRs485);

    /// Enable RS-485 mode with the configured flags and delays; the
    /// previous mode is returned so it can be restored at exit.
    pub fn mode_enable(fd: RawFd, config: &Rs485Config) -> Result<SerialRs485> {
        let mut saved = SerialRs485::default();
        unsafe { tiocgrs485(fd, &mut saved) }
            .map_err(|e| DeviceError::Rs485(e.to_string()))?;

        let mut wanted = SerialRs485 {
            flags: SER_RS485_ENABLED | super::config_flags(config),
            delay_rts_before_send: if config.delay_rts_before_send > 0 {
                config.delay_rts_before_send
            } else {
                saved.delay_rts_before_send
            },
            delay_rts_after_send: if config.delay_rts_after_send > 0 {
                config.delay_rts_after_send
            } else {
                saved.delay_rts_after_send
            },
            padding: [0; 5],
        };

        unsafe { tiocsrs485(fd, &mut wanted) }
            .map_err(|e| DeviceError::Rs485(e.to_string()))?;
        Ok(saved)
    }

    pub fn mode_restore(fd: RawFd, saved: &SerialRs485) {
        let mut saved = *saved;
        if unsafe { tiocsrs485(fd, &mut saved) }.is_err() {
            log::warn!("could not restore RS-485 mode");
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SerialRs485;

    pub fn mode_enable(_fd: RawFd, _config: &Rs485Config) -> Result<SerialRs485> {
        Err(DeviceError::Rs485(
            "RS-485 mode is not supported on this system".into(),
        ))
    }

    pub fn mode_restore(_fd: RawFd, _saved: &SerialRs485) {}
}

pub use imp::{mode_enable, mode_restore, SerialRs485};

fn config_flags(config: &Rs485Config) -> u32 {
    let mut flags = 0;
    if config.rts_on_send {
        flags |= SER_RS485_RTS_ON_SEND;
    }
    if config.rts_after_send {
        flags |= SER_RS485_RTS_AFTER_SEND;
    }
    if config.rx_during_tx {
        flags |= SER_RS485_RX_DURING_TX;
    }
    flags
}

pub fn print_config(config: &Rs485Config) {
    status!(" RS-485 Configuration:");
    status!(
        "  RTS_ON_SEND: {}",
        if config.rts_on_send { "high" } else { "low" }
    );
    status!(
        "  RTS_AFTER_SEND: {}",
        if config.rts_after_send { "high" } else { "low" }
    );
    status!("  RTS_DELAY_BEFORE_SEND = {}", config.delay_rts_before_send);
    status!("  RTS_DELAY_AFTER_SEND = {}", config.delay_rts_after_send);
    status!(
        "  RX_DURING_TX: {}",
        if config.rx_during_tx { "enabled" } else { "disabled" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_config() {
        let mut config = Rs485Config::default();
        assert_eq!(config_flags(&config), 0);
        config.rts_on_send = true;
        config.rx_during_tx = true;
        assert_eq!(
            config_flags(&config),
            SER_RS485_RTS_ON_SEND | SER_RS485_RX_DURING_TX
        );
    }
}
