//! Byte pump for an established circuit
//!
//! Copies both directions between the two peers' streams. Every chunk is
//! accounted with [`Relay::record_bytes`] before it is written, so the relay
//! never forwards a byte beyond the circuit's limit: the chunk that crosses
//! the limit is truncated and the circuit closes.
//!
//! The pump stops on the first of:
//! - both directions reaching end of stream ([`CloseReason::Finished`])
//! - an I/O error on either side ([`CloseReason::Finished`])
//! - the byte limit ([`CloseReason::ByteLimit`])
//! - the circuit deadline ([`CloseReason::DurationLimit`])
//! - the engine closing the circuit (reservation closed, sweep, shutdown)

use relay_core::{ByteVerdict, CircuitGrant, CircuitId, CloseReason, ClosedCircuit, Relay};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Bytes read per chunk
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Why one direction stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Error,
    ByteLimit,
    Closed,
}

async fn copy_direction<R, W>(
    relay: &Relay,
    id: CircuitId,
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
) -> Result<(), Stop>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = reader.read(&mut buf).await.map_err(|_| Stop::Error)?;
        if n == 0 {
            // Half-close: the other direction keeps flowing
            let _ = writer.shutdown().await;
            return Ok(());
        }
        match relay.record_bytes(id, n as u64) {
            ByteVerdict::Continue => {
                writer.write_all(&buf[..n]).await.map_err(|_| Stop::Error)?;
            }
            ByteVerdict::LimitReached { permitted } => {
                let permitted = usize::try_from(permitted).map_or(n, |p| p.min(n));
                writer
                    .write_all(&buf[..permitted])
                    .await
                    .map_err(|_| Stop::Error)?;
                let _ = writer.flush().await;
                return Err(Stop::ByteLimit);
            }
            ByteVerdict::Unknown => return Err(Stop::Closed),
        }
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Relay bytes between `source` and `destination` until the circuit ends,
/// then close it
///
/// Returns the closed circuit, or `None` if the engine had already closed it.
pub async fn pump<S, D>(
    relay: &Relay,
    grant: &CircuitGrant,
    source: S,
    destination: D,
    chunk_size: usize,
) -> Option<ClosedCircuit>
where
    S: AsyncRead + AsyncWrite,
    D: AsyncRead + AsyncWrite,
{
    let (mut src_rd, mut src_wr) = tokio::io::split(source);
    let (mut dst_rd, mut dst_wr) = tokio::io::split(destination);

    let reason = {
        let forward = copy_direction(relay, grant.id, &mut src_rd, &mut dst_wr, chunk_size);
        let backward = copy_direction(relay, grant.id, &mut dst_rd, &mut src_wr, chunk_size);

        tokio::select! {
            _ = grant.cancel.cancelled() => None,
            _ = deadline(grant.deadline) => Some(CloseReason::DurationLimit),
            copied = async { tokio::try_join!(forward, backward) } => match copied {
                Ok(_) | Err(Stop::Error) => Some(CloseReason::Finished),
                Err(Stop::ByteLimit) => Some(CloseReason::ByteLimit),
                Err(Stop::Closed) => None,
            },
        }
    };

    let _ = src_wr.shutdown().await;
    let _ = dst_wr.shutdown().await;
    trace!(id = %grant.id, ?reason, "pump stopped");

    reason.and_then(|reason| relay.close_circuit(grant.id, reason))
}
