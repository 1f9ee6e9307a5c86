//! Tunnel - byte and datagram relay between an inbound peer and an outbound
//!
//! ```text
//! Open → EarlyDataPending → Relaying → Closed
//! ```
//!
//! `copy_early_conn` captures whatever the client sends in the first 100ms and
//! writes it to the server before the relay starts, so protocols that carry the
//! first payload inside their handshake avoid an extra round trip.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

use crate::app::metrics::{TRAFFIC_BYTES_DOWNLOADED, TRAFFIC_BYTES_UPLOADED};
use crate::common::{SharedPacketConn, MAX_PACKET_SIZE};
use crate::error::{is_closed_io, Error, Result};

/// How long the client gets to send its first payload
pub const EARLY_DATA_TIMEOUT: Duration = Duration::from_millis(100);

/// Early data capture buffer (16KB)
const EARLY_DATA_BUFFER_SIZE: usize = 16 * 1024;

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// UDP session idle timeout
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Lifecycle of a tunneled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Open,
    EarlyDataPending,
    Relaying,
    Closed,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TunnelState::Open => "open",
            TunnelState::EarlyDataPending => "early-data",
            TunnelState::Relaying => "relaying",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Forward the client's early payload to the server, then relay both ways.
///
/// Returns the bytes moved client → server (early payload included) and
/// server → client.
pub async fn copy_early_conn<C, S>(mut client: C, mut server: S) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    trace!("tunnel {} -> {}", TunnelState::Open, TunnelState::EarlyDataPending);

    let payload = read_early_data(&mut client, EARLY_DATA_TIMEOUT)
        .await
        .map_err(|e| e.cause("read payload"))?;

    // An empty payload still goes through the writer so the server side
    // sees its handshake flushed before relaying.
    server
        .write_all(&payload)
        .await
        .map_err(|e| Error::from(e).cause("client handshake"))?;
    server
        .flush()
        .await
        .map_err(|e| Error::from(e).cause("client handshake"))?;

    let early = payload.len() as u64;
    drop(payload);

    trace!(
        "tunnel {} -> {} ({} early bytes)",
        TunnelState::EarlyDataPending,
        TunnelState::Relaying,
        early
    );
    let (up, down) = copy_conn(client, server).await?;
    Ok((up + early, down))
}

/// Read whatever arrives within `window`, stopping early on EOF or a full buffer.
///
/// The window expiring is the "no early data" case, not an error.
async fn read_early_data<R>(reader: &mut R, window: Duration) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + window;
    let mut payload = BytesMut::with_capacity(EARLY_DATA_BUFFER_SIZE);

    while payload.len() < EARLY_DATA_BUFFER_SIZE {
        match tokio::time::timeout_at(deadline, reader.read_buf(&mut payload)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => continue,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Ok(Err(e)) => return Err(e.into()),
        }
    }

    Ok(payload)
}

/// Relay bytes in both directions until both sides finish or one fails.
///
/// EOF on one side half-closes the other; the first error ends both directions.
pub async fn copy_conn<A, B>(a: A, b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let upload = copy_half(&mut a_read, &mut b_write);
    let download = copy_half(&mut b_read, &mut a_write);

    let result = tokio::try_join!(upload, download);
    trace!("tunnel {} -> {}", TunnelState::Relaying, TunnelState::Closed);

    let (up, down) = result?;
    TRAFFIC_BYTES_UPLOADED.inc_by(up);
    TRAFFIC_BYTES_DOWNLOADED.inc_by(down);
    Ok((up, down))
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if is_closed_io(&e) => break,
            Err(e) => return Err(e.into()),
        };
        match writer.write_all(&buf[..n]).await {
            Ok(()) => {}
            Err(e) if is_closed_io(&e) => return Ok(total),
            Err(e) => return Err(e.into()),
        }
        writer.flush().await?;
        total += n as u64;
    }

    // Propagate EOF; the peer may already be gone
    let _ = writer.shutdown().await;
    Ok(total)
}

/// Relay datagrams between an inbound packet connection and an outbound one.
///
/// Ends when either side closes or errors, or when the inbound side has been
/// idle for `UDP_IDLE_TIMEOUT`. Both connections are closed on return.
pub async fn copy_packet(inbound: SharedPacketConn, outbound: SharedPacketConn) -> Result<()> {
    copy_packet_with_timeout(inbound, outbound, UDP_IDLE_TIMEOUT).await
}

pub async fn copy_packet_with_timeout(
    inbound: SharedPacketConn,
    outbound: SharedPacketConn,
    idle: Duration,
) -> Result<()> {
    let upload = relay_packets(&inbound, &outbound, Some(idle));
    let download = relay_packets(&outbound, &inbound, None);

    let result = tokio::select! {
        r = upload => r,
        r = download => r,
    };

    let _ = inbound.close();
    let _ = outbound.close();

    match result {
        Err(e) if e.is_closed() || e.is_timeout() => Ok(()),
        other => other,
    }
}

async fn relay_packets(
    from: &SharedPacketConn,
    to: &SharedPacketConn,
    idle: Option<Duration>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let (n, addr) = match idle {
            Some(idle) => tokio::time::timeout(idle, from.read_packet(&mut buf)).await??,
            None => from.read_packet(&mut buf).await?,
        };
        to.write_packet(Bytes::copy_from_slice(&buf[..n]), addr)
            .await?;
    }
}
