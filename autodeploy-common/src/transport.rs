//! Unix socket framing between the webhook receiver and the daemon.
//!
//! One request and one response per connection. The client writes the signed
//! message and half-closes its write side; end-of-stream marks the end of the
//! request. The daemon writes a single response and closes. There is no
//! length prefix.
//!
//! A response's first line is the status token: `OK` on success, anything
//! else (the daemon sends `ERROR: ...`) is a failure.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

/// Upper bound for a signed request.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Upper bound for a daemon response (git and post-script output included).
pub const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

pub const OK_TOKEN: &str = "OK";
pub const ERROR_TOKEN: &str = "ERROR";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Response written by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResponse {
    Ok(String),
    Error(String),
}

impl SyncResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ok(body) => format!("{OK_TOKEN}\n{body}").into_bytes(),
            Self::Error(text) => format!("{ERROR_TOKEN}: {text}").into_bytes(),
        }
    }
}

/// Response as seen by the receiver: the body it relays and whether the
/// daemon reported success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonReply {
    pub body: String,
    pub success: bool,
}

impl DaemonReply {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let (status, rest) = text.split_once('\n').unwrap_or((text.as_ref(), ""));

        if status == OK_TOKEN {
            Self {
                body: rest.to_string(),
                success: true,
            }
        } else {
            Self {
                body: text.into_owned(),
                success: false,
            }
        }
    }
}

/// Read until the peer closes its write side, refusing more than `limit` bytes.
pub async fn read_to_end_limited<R>(reader: R, limit: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = reader.take(limit as u64 + 1);
    limited.read_to_end(&mut buf).await?;
    if buf.len() > limit {
        return Err(TransportError::TooLarge { limit });
    }
    Ok(buf)
}

/// Server side: read one full request with a deadline.
pub async fn read_request<R>(reader: R, deadline: Duration) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    timeout(deadline, read_to_end_limited(reader, MAX_REQUEST_BYTES))
        .await
        .map_err(|_| TransportError::TimedOut(deadline))?
}

/// Server side: write the response and close the write direction.
pub async fn write_response<W>(writer: &mut W, response: &SyncResponse) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.to_bytes()).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Client side: deliver `payload` to the daemon and wait for its reply.
pub async fn send_message(
    socket_path: &Path,
    payload: &[u8],
    deadline: Duration,
) -> Result<DaemonReply, TransportError> {
    let stream = timeout(deadline, UnixStream::connect(socket_path))
        .await
        .map_err(|_| TransportError::TimedOut(deadline))?
        .map_err(|source| TransportError::Connect {
            path: socket_path.to_path_buf(),
            source,
        })?;
    let (mut reader, mut writer) = stream.into_split();

    writer.write_all(payload).await?;
    // Half-close: the daemon reads until EOF, we keep reading its answer.
    writer.shutdown().await?;
    debug!("Sent {} bytes to {}", payload.len(), socket_path.display());

    let response = timeout(deadline, read_to_end_limited(&mut reader, MAX_RESPONSE_BYTES))
        .await
        .map_err(|_| TransportError::TimedOut(deadline))??;
    drop(writer);

    Ok(DaemonReply::from_bytes(&response))
}
