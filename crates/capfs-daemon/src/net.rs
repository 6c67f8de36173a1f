//! Stream transport layer
//!
//! Handles Unix socket setup and message framing over any byte stream.

use std::io;
use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use capfs_core::{deserialize_message, serialize_message, RpcMessage, MAX_MESSAGE_SIZE};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Deserialization(String),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("unexpected message: {0}")]
    Unexpected(&'static str),

    #[error("connection closed by peer")]
    Closed,
}

/// Send a message on a stream
pub async fn send_message<W>(stream: &mut W, msg: &RpcMessage) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let data = serialize_message(msg).map_err(|e| ConnectionError::Send(e.to_string()))?;

    let size = data.len() - 4;
    if size > MAX_MESSAGE_SIZE {
        return Err(ConnectionError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    stream
        .write_all(&data)
        .await
        .map_err(|e| ConnectionError::Send(e.to_string()))?;

    Ok(())
}

/// Receive a message from a stream
///
/// End of stream before a length prefix is a clean close.
pub async fn recv_message<R>(stream: &mut R) -> Result<RpcMessage, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    // Read length prefix
    let mut len_buf = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        return Err(match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
                ConnectionError::Closed
            }
            _ => ConnectionError::Receive(e.to_string()),
        });
    }

    let len = u32::from_le_bytes(len_buf) as usize;

    // Validate length
    if len > MAX_MESSAGE_SIZE {
        return Err(ConnectionError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    // Read payload
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| ConnectionError::Receive(e.to_string()))?;

    deserialize_message(&payload).map_err(|e| ConnectionError::Deserialization(e.to_string()))
}

/// Bind a listening socket, replacing a stale socket file left by an
/// earlier run.
pub fn bind_socket(path: &Path) -> Result<UnixListener, ConnectionError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if is_socket(&meta) => {
            debug!(path = ?path, "removing stale socket");
            std::fs::remove_file(path).map_err(ConnectionError::Bind)?;
        }
        _ => {}
    }
    UnixListener::bind(path).map_err(ConnectionError::Bind)
}

fn is_socket(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_socket()
}

/// Connect to a listening socket
pub async fn connect_socket(path: &Path) -> Result<UnixStream, ConnectionError> {
    UnixStream::connect(path)
        .await
        .map_err(ConnectionError::Connect)
}
