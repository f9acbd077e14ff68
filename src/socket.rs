//! Control socket multiplexer.
//!
//! When `--socket` is given, serterm listens on a unix or TCP socket and
//! splices every connected client into the session: client bytes join
//! the local input path, and everything the device prints is fanned out
//! to all clients.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{broadcast, mpsc};

use crate::status;

const DEFAULT_PORT: u16 = 3333;
const MAX_CLIENTS: usize = 16;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Missing socket filename")]
    MissingFilename,

    #[error("{0}: Invalid socket scheme, must be prefixed with 'unix:', 'inet:', or 'inet6:'")]
    InvalidScheme(String),

    #[error("Invalid port number: {0}")]
    InvalidPort(String),

    #[error("Failed to bind to socket ({0})")]
    Bind(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SocketError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketSpec {
    Unix(String),
    Inet(u16),
    Inet6(u16),
}

impl SocketSpec {
    pub fn parse(spec: &str) -> Result<SocketSpec> {
        if let Some(path) = spec.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(SocketError::MissingFilename);
            }
            return Ok(SocketSpec::Unix(path.to_string()));
        }
        if let Some(port) = spec.strip_prefix("inet:") {
            return Ok(SocketSpec::Inet(parse_port(port)?));
        }
        if let Some(port) = spec.strip_prefix("inet6:") {
            return Ok(SocketSpec::Inet6(parse_port(port)?));
        }
        Err(SocketError::InvalidScheme(spec.to_string()))
    }
}

fn parse_port(text: &str) -> Result<u16> {
    if text.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    text.parse()
        .map_err(|_| SocketError::InvalidPort(text.to_string()))
}

/// The session's handle on the socket listener: an input channel carrying
/// client bytes and a broadcast sender for device-side output.
pub struct SocketHub {
    input_rx: mpsc::Receiver<u8>,
    output_tx: broadcast::Sender<u8>,
    unix_path: Option<String>,
}

impl SocketHub {
    pub async fn recv(&mut self) -> Option<u8> {
        self.input_rx.recv().await
    }

    /// Fan one rendered device byte out to every connected client.
    pub fn write_byte(&self, byte: u8) {
        let _ = self.output_tx.send(byte);
    }
}

impl Drop for SocketHub {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Bind the listener and spawn the accept loop.
pub async fn configure(spec: &str) -> Result<SocketHub> {
    let spec = SocketSpec::parse(spec)?;
    let (input_tx, input_rx) = mpsc::channel::<u8>(256);
    let (output_tx, _) = broadcast::channel::<u8>(4096);
    let clients = Arc::new(AtomicUsize::new(0));

    let unix_path = match &spec {
        SocketSpec::Unix(path) => {
            cleanup_stale_socket(path);
            let listener = UnixListener::bind(path).map_err(SocketError::Bind)?;
            status!("Listening on socket {path}");
            let output = output_tx.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    serve_client(stream, input_tx.clone(), output.clone(), clients.clone());
                }
            });
            Some(path.clone())
        }
        SocketSpec::Inet(port) | SocketSpec::Inet6(port) => {
            let address = match &spec {
                SocketSpec::Inet(_) => format!("0.0.0.0:{port}"),
                _ => format!("[::]:{port}"),
            };
            let listener = TcpListener::bind(&address)
                .await
                .map_err(SocketError::Bind)?;
            status!("Listening on socket port {port}");
            let output = output_tx.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    serve_client(stream, input_tx.clone(), output.clone(), clients.clone());
                }
            });
            None
        }
    };

    Ok(SocketHub {
        input_rx,
        output_tx,
        unix_path,
    })
}

fn serve_client<S>(
    stream: S,
    input_tx: mpsc::Sender<u8>,
    output_tx: broadcast::Sender<u8>,
    clients: Arc<AtomicUsize>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if clients.fetch_add(1, Ordering::SeqCst) >= MAX_CLIENTS {
        clients.fetch_sub(1, Ordering::SeqCst);
        log::debug!("socket client rejected, {MAX_CLIENTS} already connected");
        return;
    }

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut output_rx = output_tx.subscribe();

    tokio::spawn(async move {
        let mut buffer = [0u8; 256];
        loop {
            match read_half.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    for &byte in &buffer[..count] {
                        // Match the behavior of a terminal in raw mode.
                        let byte = if byte == b'\n' { b'\r' } else { byte };
                        if input_tx.send(byte).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        clients.fetch_sub(1, Ordering::SeqCst);
    });

    tokio::spawn(async move {
        loop {
            match output_rx.recv().await {
                Ok(byte) => {
                    if write_half.write_all(&[byte]).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

/// Remove a leftover unix socket file nobody is listening on.
fn cleanup_stale_socket(path: &str) {
    if !std::path::Path::new(path).exists() {
        return;
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            status!("Cleaning up old socket file");
            let _ = std::fs::remove_file(path);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_schemes_parse() {
        assert_eq!(
            SocketSpec::parse("unix:/tmp/s").unwrap(),
            SocketSpec::Unix("/tmp/s".into())
        );
        assert_eq!(SocketSpec::parse("inet:4444").unwrap(), SocketSpec::Inet(4444));
        assert_eq!(SocketSpec::parse("inet:").unwrap(), SocketSpec::Inet(DEFAULT_PORT));
        assert_eq!(SocketSpec::parse("inet6:").unwrap(), SocketSpec::Inet6(DEFAULT_PORT));
        assert!(SocketSpec::parse("unix:").is_err());
        assert!(SocketSpec::parse("tcp:1000").is_err());
        assert!(SocketSpec::parse("inet:notaport").is_err());
    }
}
