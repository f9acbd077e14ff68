//! The serial device port.
//!
//! Owns the opened serial device: exclusive advisory lock, termios
//! configuration derived from the options record, the staged write path
//! with its drain discipline, and the blocking reader task that feeds
//! device bytes into the event loop as a channel.

use std::io::Write;
use std::os::fd::{BorrowedFd, RawFd};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::termios::{self, InputFlags, SetArg, Termios};
use serialport::{DataBits, FlowControl as SpFlow, Parity as SpParity, SerialPort, StopBits, TTYPort};
use tokio::sync::mpsc;

use super::{DeviceError, Result};
use crate::options::{FlowControl, Options, ParityMode};
use crate::transform::MapFlags;

/// Read chunk and staging flush threshold.
pub const CHUNK_SIZE: usize = 8192;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Event stream produced by the reader task.
#[derive(Debug)]
pub enum DeviceEvent {
    Data(Vec<u8>),
    Disconnected,
    Error(String),
}

/// Write accumulator that collapses many small writes into fewer
/// syscalls. Draining flushes the sink between chunks so the bytes are
/// on the wire when it returns.
#[derive(Debug, Default)]
pub struct StagingBuffer {
    buffer: Vec<u8>,
}

impl StagingBuffer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(2 * CHUNK_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Stage bytes, draining first if they would overflow the threshold.
    pub fn write<W: Write>(&mut self, data: &[u8], sink: &mut W) -> std::io::Result<()> {
        if self.buffer.len() + data.len() > CHUNK_SIZE {
            self.drain(sink)?;
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Push everything to the sink and reset.
    pub fn drain<W: Write>(&mut self, sink: &mut W) -> std::io::Result<()> {
        let mut written = 0;
        while written < self.buffer.len() {
            match sink.write(&self.buffer[written..]) {
                Ok(count) => {
                    written += count;
                    sink.flush()?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("write error while draining staging buffer ({e})");
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
        self.buffer.clear();
        Ok(())
    }
}

pub struct DevicePort {
    port: TTYPort,
    staging: StagingBuffer,
    saved: Termios,
    reader_stop: Option<Arc<AtomicBool>>,
}

impl DevicePort {
    /// Open and configure the device per the options record.
    ///
    /// Verifies the file is a tty, takes the exclusive advisory lock,
    /// flushes stale I/O and applies the raw termios configuration.
    pub fn open(opts: &Options) -> Result<DevicePort> {
        let saved = snapshot_termios(&opts.device)?;

        let builder = serialport::new(&opts.device, opts.baudrate)
            .data_bits(data_bits(opts.databits))
            .stop_bits(if opts.stopbits == 2 {
                StopBits::Two
            } else {
                StopBits::One
            })
            .parity(match opts.parity {
                ParityMode::Odd => SpParity::Odd,
                ParityMode::Even => SpParity::Even,
                // Mark/space are applied below through termios.
                _ => SpParity::None,
            })
            .flow_control(match opts.flow {
                FlowControl::Hard => SpFlow::Hardware,
                FlowControl::Soft => SpFlow::Software,
                FlowControl::None => SpFlow::None,
            })
            .timeout(READ_TIMEOUT);

        let port = builder
            .open_native()
            .map_err(|e| DeviceError::Open(std::io::Error::other(e.to_string())))?;

        let fd = port.as_raw_fd();

        let status = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if status == -1 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::WouldBlock
        {
            return Err(DeviceError::Locked);
        }

        unsafe {
            libc::tcflush(fd, libc::TCIOFLUSH);
        }

        let mut device = DevicePort {
            port,
            staging: StagingBuffer::new(),
            saved,
            reader_stop: None,
        };
        device.apply_extra_termios(opts)?;
        Ok(device)
    }

    /// Input-flag mappings and mark/space parity that the serialport
    /// builder cannot express.
    fn apply_extra_termios(&mut self, opts: &Options) -> Result<()> {
        let needs_iflags = opts
            .map
            .intersects(MapFlags::INLCR | MapFlags::IGNCR | MapFlags::ICRNL);
        let needs_parity = matches!(opts.parity, ParityMode::Mark | ParityMode::Space);
        if !needs_iflags && !needs_parity {
            return Ok(());
        }

        let fd = self.fd();
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut tio = termios::tcgetattr(borrowed)
            .map_err(|e| DeviceError::GetAttr(std::io::Error::from(e)))?;

        if opts.map.contains(MapFlags::INLCR) {
            tio.input_flags |= InputFlags::INLCR;
        }
        if opts.map.contains(MapFlags::IGNCR) {
            tio.input_flags |= InputFlags::IGNCR;
        }
        if opts.map.contains(MapFlags::ICRNL) {
            tio.input_flags |= InputFlags::ICRNL;
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if needs_parity {
            use nix::sys::termios::ControlFlags;
            tio.control_flags |= ControlFlags::PARENB | ControlFlags::CMSPAR;
            match opts.parity {
                ParityMode::Mark => tio.control_flags |= ControlFlags::PARODD,
                ParityMode::Space => tio.control_flags &= !ControlFlags::PARODD,
                _ => {}
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        if needs_parity {
            return Err(DeviceError::SetAttr(std::io::Error::other(
                "mark/space parity is not supported on this platform",
            )));
        }

        termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
            .map_err(|e| DeviceError::SetAttr(std::io::Error::from(e)))?;
        Ok(())
    }

    /// Wrap an already-open port (pseudo-terminal pairs in tests).
    pub fn from_tty(port: TTYPort) -> Result<DevicePort> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(port.as_raw_fd()) };
        let saved = termios::tcgetattr(borrowed)
            .map_err(|e| DeviceError::GetAttr(std::io::Error::from(e)))?;
        Ok(DevicePort {
            port,
            staging: StagingBuffer::new(),
            saved,
            reader_stop: None,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.port.as_raw_fd()
    }

    /// The device attributes as they were before this session opened it.
    pub fn saved_termios(&self) -> Termios {
        self.saved.clone()
    }

    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    /// Stage bytes for the device, or write them one at a time with the
    /// configured inter-byte and per-line delays. Upper-casing (OLTU)
    /// applies across the whole buffer.
    pub fn write_bytes(&mut self, data: &[u8], opts: &Options) -> Result<usize> {
        let upper;
        let data = if opts.map.contains(MapFlags::OLTU) {
            upper = data.to_ascii_uppercase();
            &upper[..]
        } else {
            data
        };

        if opts.output_delay > 0 || opts.output_line_delay > 0 {
            for &byte in data {
                self.port.write_all(&[byte])?;
                if opts.output_line_delay > 0 && byte == b'\n' {
                    std::thread::sleep(Duration::from_millis(opts.output_line_delay));
                }
                self.port.flush()?;
                if opts.output_delay > 0 {
                    std::thread::sleep(Duration::from_millis(opts.output_delay));
                }
            }
        } else {
            self.staging.write(data, &mut self.port)?;
        }
        Ok(data.len())
    }

    /// Drain the staging buffer to the device.
    pub fn sync(&mut self) -> Result<()> {
        self.staging.drain(&mut self.port)?;
        Ok(())
    }

    /// Unstaged write, used by transfers and the script bridge.
    pub fn write_direct(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let count = self.port.write(data)?;
        Ok(count)
    }

    pub fn write_all_direct(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.port.write_all(data)
    }

    pub fn send_break(&self) {
        unsafe {
            libc::tcsendbreak(self.fd(), 0);
        }
    }

    pub fn flush_io_queues(&self) {
        unsafe {
            libc::tcflush(self.fd(), libc::TCIOFLUSH);
        }
    }

    /// Spawn the blocking reader task. Bytes arrive on the returned
    /// channel until the port disconnects or the reader is stopped.
    pub fn spawn_reader(&mut self) -> Result<mpsc::Receiver<DeviceEvent>> {
        let mut reader = self.port.try_clone_native()?;
        reader.set_timeout(READ_TIMEOUT)?;

        let stop = Arc::new(AtomicBool::new(false));
        self.reader_stop = Some(stop.clone());

        let (tx, rx) = mpsc::channel(64);
        tokio::task::spawn_blocking(move || {
            let mut buffer = [0u8; CHUNK_SIZE];
            while !stop.load(Ordering::SeqCst) {
                match std::io::Read::read(&mut reader, &mut buffer) {
                    Ok(0) => {
                        let _ = tx.blocking_send(DeviceEvent::Disconnected);
                        return;
                    }
                    Ok(count) => {
                        if tx
                            .blocking_send(DeviceEvent::Data(buffer[..count].to_vec()))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = tx.blocking_send(DeviceEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    pub fn stop_reader(&mut self) {
        if let Some(stop) = self.reader_stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
    }

    /// Restore the saved attributes and release the lock. The fd itself
    /// closes when the port is dropped.
    pub fn restore(&mut self) {
        self.stop_reader();
        let fd = self.fd();
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = termios::tcsetattr(borrowed, SetArg::TCSANOW, &self.saved);
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
    }
}

impl Drop for DevicePort {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

fn data_bits(databits: u8) -> DataBits {
    match databits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Capture the device's termios before serialport reconfigures it, so
/// the original state can be restored at exit. Also rejects non-tty
/// targets up front.
fn snapshot_termios(path: &str) -> Result<Termios> {
    let cpath = std::ffi::CString::new(path)
        .map_err(|_| DeviceError::Open(std::io::Error::other("invalid device path")))?;
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(DeviceError::Open(std::io::Error::last_os_error()));
    }

    if unsafe { libc::isatty(fd) } != 1 {
        unsafe { libc::close(fd) };
        return Err(DeviceError::NotTty);
    }

    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let result = termios::tcgetattr(borrowed)
        .map_err(|e| DeviceError::GetAttr(std::io::Error::from(e)));
    unsafe { libc::close(fd) };
    result
}

/// List the serial devices known to the host.
pub fn list_devices() {
    match serialport::available_ports() {
        Ok(mut ports) => {
            ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
            for port in ports {
                println!("{}", port.port_name);
            }
        }
        Err(e) => {
            eprintln!("Error: Failed to enumerate ports: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_preserves_order_and_resets() {
        let mut staging = StagingBuffer::new();
        let mut sink = Vec::new();

        staging.write(b"hello ", &mut sink).unwrap();
        staging.write(b"world", &mut sink).unwrap();
        assert_eq!(staging.len(), 11);
        assert!(sink.is_empty());

        staging.drain(&mut sink).unwrap();
        assert_eq!(sink, b"hello world");
        assert!(staging.is_empty());
    }

    #[test]
    fn staging_flushes_before_overflow() {
        let mut staging = StagingBuffer::new();
        let mut sink = Vec::new();

        let big = vec![0xaa; CHUNK_SIZE];
        staging.write(&big, &mut sink).unwrap();
        staging.write(b"tail", &mut sink).unwrap();

        // The first chunk had to hit the sink to make room.
        assert_eq!(sink.len(), CHUNK_SIZE);
        assert_eq!(staging.len(), 4);

        staging.drain(&mut sink).unwrap();
        assert_eq!(sink.len(), CHUNK_SIZE + 4);
        assert_eq!(&sink[CHUNK_SIZE..], b"tail");
    }
}
