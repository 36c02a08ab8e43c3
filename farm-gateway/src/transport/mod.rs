//! Inter-node transport link.
//!
//! Every node runs one [`LinkServer`] (inbound) and one or more
//! [`LinkClient`]s (outbound). Envelopes travel as length-prefixed JSON:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ JSON envelope            │
//! │ Big-endian u32   │ {"v":1,"type":...}       │
//! └──────────────────┴──────────────────────────┘
//! ```

pub mod client;
pub mod probe;
pub mod server;

pub use client::{LinkClient, Outbox};
pub use probe::LivenessProbe;
pub use server::{ConnectionSet, EnvelopeHandler, LinkServer};

use crate::config::Endpoint;
use farm_protocol::envelope::{check_len, LENGTH_PREFIX_LEN};
use farm_protocol::{Envelope, EnvelopeError};
use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Per-client link state.
///
/// `Disconnected -> Connecting -> Connected -> Lost -> Connecting ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link to {0} is not connected")]
    NotConnected(Endpoint),
    #[error("cannot bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("link I/O: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("peer closed the connection")]
    Closed,
    #[error("nothing received within {0:?}")]
    Timeout(Duration),
    #[error("outbox to {0} is full")]
    OutboxFull(Endpoint),
    #[error("link shut down")]
    Cancelled,
}

/// Writes one length-prefixed envelope.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
{
    let frame = envelope.to_frame()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed body without interpreting it.
///
/// A body that fails to parse leaves the stream aligned, so callers can log
/// it and keep reading. An oversized prefix cannot be skipped safely and is
/// returned as an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, LinkError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(LinkError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = check_len(u32::from_be_bytes(len_buf) as usize)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
