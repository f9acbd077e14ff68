//! XMODEM-1K / XMODEM-CRC / YMODEM file sender.
//!
//! Minimalistic sender over the session's device port. The transfer owns
//! the byte flow for its duration; the input pump's hot-key slot is the
//! abort signal, so any keystroke cancels a running transfer.

use std::time::Duration;

use thiserror::Error;

use crate::session::Session;

const STX: u8 = 0x02;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const EOT: u8 = 0x04;

const BLOCK_SIZE: usize = 1024;
const SYNC_POLL: Duration = Duration::from_millis(50);
const RESPONSE_TRIES: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Xmodem1k,
    XmodemCrc,
    Ymodem,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Xmodem1k => "XMODEM-1K",
            Protocol::XmodemCrc => "XMODEM-CRC",
            Protocol::Ymodem => "YMODEM",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("aborted")]
    Aborted,

    #[error("transfer cancelled by receiver")]
    Cancelled,

    #[error("could not open file ({0})")]
    File(std::io::Error),

    #[error("serial I/O failed ({0})")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// CRC-16/XMODEM.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let mut s = (byte as u16) ^ (crc >> 8);
        s ^= s >> 4;
        crc = (crc << 8) ^ s ^ (s << 5) ^ (s << 12);
    }
    crc
}

/// Frame one 1K data block: STX, sequence, complement, padded payload,
/// CRC high, CRC low.
pub fn build_packet(seq: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = [0u8; BLOCK_SIZE];
    let take = data.len().min(BLOCK_SIZE);
    payload[..take].copy_from_slice(&data[..take]);
    let crc = crc16(&payload);

    let mut packet = Vec::with_capacity(BLOCK_SIZE + 5);
    packet.push(STX);
    packet.push(seq);
    packet.push(0xff - seq);
    packet.extend_from_slice(&payload);
    packet.push((crc >> 8) as u8);
    packet.push(crc as u8);
    packet
}

/// YMODEM file header payload: name, NUL, "length mtime mode".
pub fn ymodem_header(filename: &str, length: u64, mtime: u64, mode: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(128);
    header.extend_from_slice(filename.as_bytes());
    header.push(0);
    header.extend_from_slice(format!("{} {:o} {:o}", length, mtime, mode).as_bytes());
    header
}

fn progress(byte: u8) {
    use std::io::Write;
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(&[byte]);
    let _ = out.flush();
}

/// Send a file. The caller prints "Done" or "Aborted".
pub async fn send(session: &mut Session, path: &str, protocol: Protocol) -> Result<()> {
    let data = std::fs::read(path).map_err(TransferError::File)?;
    let metadata = std::fs::metadata(path).map_err(TransferError::File)?;

    // Staged bytes must be on the wire before the transfer owns the line.
    session.sync_staging();

    session.hotkey().arm();
    let result = match protocol {
        Protocol::Xmodem1k | Protocol::XmodemCrc => send_blocks(session, &data, 1).await,
        Protocol::Ymodem => send_ymodem(session, path, &data, &metadata).await,
    };
    session.hotkey().disarm();

    if let Some(port) = session.port_mut() {
        port.flush_io_queues();
    }
    result
}

async fn send_ymodem(
    session: &mut Session,
    path: &str,
    data: &[u8],
    metadata: &std::fs::Metadata,
) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    let header = ymodem_header(&name, metadata.len(), metadata.mtime().max(0) as u64, metadata.mode());

    send_blocks(session, &header, 0).await?;
    send_blocks(session, data, 1).await?;
    // Empty header block signals end of batch.
    send_blocks(session, &[0u8], 0).await?;
    Ok(())
}

/// The shared block pump. `seq_start == 0` marks a header transfer: no
/// EOT handshake, and a silent receiver is treated as having ACKed the
/// final (fin) block since some receivers never ACK it.
async fn send_blocks(session: &mut Session, data: &[u8], seq_start: u8) -> Result<()> {
    sync_with_receiver(session).await?;

    let is_fin = seq_start == 0 && data.first().copied() == Some(0);
    let mut seq = seq_start;
    let mut remaining = data;

    while !remaining.is_empty() {
        if session.hotkey().triggered() {
            return Err(TransferError::Aborted);
        }

        let take = remaining.len().min(BLOCK_SIZE);
        let packet = build_packet(seq, &remaining[..take]);
        write_abortable(session, &packet).await?;

        let response = read_response(session).await?;
        let response = match response {
            Some(byte) => byte,
            None if is_fin => ACK,
            None => b'?',
        };

        match response {
            NAK => progress(b'N'),
            ACK => progress(b'.'),
            b'C' => progress(b'C'),
            CAN => {
                progress(b'!');
                return Err(TransferError::Cancelled);
            }
            _ => progress(b'?'),
        }

        if response == ACK {
            seq = seq.wrapping_add(1);
            remaining = &remaining[take..];
        }
    }

    if seq_start != 0 {
        finish_with_eot(session).await?;
    }
    Ok(())
}

/// Drain pending bytes until the receiver requests CRC mode ('C').
async fn sync_with_receiver(session: &mut Session) -> Result<()> {
    loop {
        if session.hotkey().triggered() {
            return Err(TransferError::Aborted);
        }
        match session.read_device_byte(Some(SYNC_POLL)).await {
            Ok(Some(b'C')) => return Ok(()),
            Ok(Some(CAN)) => return Err(TransferError::Cancelled),
            Ok(Some(_)) => {}
            Ok(None) => {}
            Err(_) => return Err(TransferError::Io(std::io::Error::other("read failed"))),
        }
    }
}

async fn read_response(session: &mut Session) -> Result<Option<u8>> {
    for _ in 0..RESPONSE_TRIES {
        if session.hotkey().triggered() {
            return Err(TransferError::Aborted);
        }
        match session.read_device_byte(Some(SYNC_POLL)).await {
            Ok(Some(byte)) => return Ok(Some(byte)),
            Ok(None) => {}
            Err(_) => return Err(TransferError::Io(std::io::Error::other("read failed"))),
        }
    }
    Ok(None)
}

async fn write_abortable(session: &mut Session, packet: &[u8]) -> Result<()> {
    if session.hotkey().triggered() {
        return Err(TransferError::Aborted);
    }
    let port = session
        .port_mut()
        .ok_or_else(|| std::io::Error::other("not connected"))?;
    port.write_all_direct(packet)?;
    Ok(())
}

/// Send EOT at 1 Hz until the receiver ACKs or cancels.
async fn finish_with_eot(session: &mut Session) -> Result<()> {
    loop {
        if session.hotkey().triggered() {
            return Err(TransferError::Aborted);
        }
        write_abortable(session, &[EOT]).await?;
        progress(b'|');
        match session.read_device_byte(Some(Duration::from_secs(1))).await {
            Ok(Some(ACK)) => {
                progress(b'\r');
                progress(b'\n');
                return Ok(());
            }
            Ok(Some(CAN)) => {
                progress(b'\r');
                progress(b'\n');
                return Err(TransferError::Cancelled);
            }
            Ok(_) => {}
            Err(_) => return Err(TransferError::Io(std::io::Error::other("read failed"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vector() {
        assert_eq!(crc16(b"123456789"), 0x31c3);
        assert_eq!(crc16(&[0u8; 4]), crc16(&[0u8; 4]));
    }

    #[test]
    fn packet_layout() {
        let packet = build_packet(3, b"hi");
        assert_eq!(packet.len(), BLOCK_SIZE + 5);
        assert_eq!(packet[0], STX);
        assert_eq!(packet[1], 3);
        assert_eq!(packet[2], 0xff - 3);
        assert_eq!(&packet[3..5], b"hi");
        assert!(packet[5..3 + BLOCK_SIZE].iter().all(|&b| b == 0));

        let crc = crc16(&packet[3..3 + BLOCK_SIZE]);
        assert_eq!(packet[3 + BLOCK_SIZE], (crc >> 8) as u8);
        assert_eq!(packet[4 + BLOCK_SIZE], crc as u8);
    }

    #[test]
    fn ymodem_header_format() {
        let header = ymodem_header("fw.bin", 1234, 0o17016745000, 0o100644);
        let nul = header.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&header[..nul], b"fw.bin");
        let meta = std::str::from_utf8(&header[nul + 1..]).unwrap();
        assert_eq!(meta, "1234 17016745000 100644");
    }
}
