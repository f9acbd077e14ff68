pub mod lines;
pub mod port;
pub mod rs485;

pub use lines::{LineConfigTable, ModemLine};
pub use port::{DeviceEvent, DevicePort};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Could not open tty device ({0})")]
    Open(std::io::Error),

    #[error("Not a tty device")]
    NotTty,

    #[error("Device file is locked by another process")]
    Locked,

    #[error("Could not get port settings ({0})")]
    GetAttr(std::io::Error),

    #[error("Could not apply port settings ({0})")]
    SetAttr(std::io::Error),

    #[error("Could not read from tty device")]
    Read,

    #[error("RS-485 mode is not supported ({0})")]
    Rs485(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    Serialport(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
