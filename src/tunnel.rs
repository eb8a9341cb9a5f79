//! CONNECT tunnelling.
//!
//! TLS traffic is opaque, so once the tunnel is up the proxy only shuttles
//! bytes. Either side may speak at any time, and each direction is copied
//! independently of the other.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ProxyConfig, HEADER_SIZE};
use crate::error::ProxyError;
use crate::message::find_header_end;
use crate::request::ParsedRequest;

/// Bytes moved through one tunnel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelEnd {
    ClientClosed,
    OriginClosed,
    Cancelled,
}

/// Opens the origin connection, acknowledges the CONNECT and relays until
/// either peer closes or `cancel` fires.
pub async fn relay_tunnel(
    client: &mut TcpStream,
    request: &ParsedRequest,
    config: &ProxyConfig,
    cancel: &CancellationToken,
) -> Result<(TunnelEnd, TunnelStats), ProxyError> {
    let origin = &request.origin;
    let connected = timeout(
        config.connect_timeout,
        TcpStream::connect((origin.host.as_str(), origin.port)),
    )
    .await;

    let mut upstream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            reply_bad_gateway(client, &request.version).await;
            return Err(e.into());
        }
        Err(_) => {
            reply_bad_gateway(client, &request.version).await;
            return Err(ProxyError::Timeout);
        }
    };

    let established = format!("{} 200 Connection established\r\n\r\n", request.version);
    client.write_all(established.as_bytes()).await?;
    debug!("Tunnel to {} established", origin);

    // Bytes the client sent right behind the CONNECT headers belong to the tunnel.
    let pipelined = find_header_end(&request.raw)
        .map(|end| &request.raw[end..])
        .unwrap_or_default();
    if !pipelined.is_empty() {
        upstream.write_all(pipelined).await?;
    }

    let (end, mut stats) = pump(client, &mut upstream, cancel).await?;
    stats.client_to_origin += pipelined.len() as u64;
    Ok((end, stats))
}

/// Copies bytes both ways between `client` and `upstream`.
///
/// The two directions run as separate futures, so a peer that is slow to read
/// only stalls the direction writing to it. The tunnel ends as soon as either
/// direction sees end of stream.
pub async fn pump(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    cancel: &CancellationToken,
) -> Result<(TunnelEnd, TunnelStats), ProxyError> {
    let mut stats = TunnelStats::default();
    if cancel.is_cancelled() {
        return Ok((TunnelEnd::Cancelled, stats));
    }

    let (mut client_rx, mut client_tx) = client.split();
    let (mut upstream_rx, mut upstream_tx) = upstream.split();

    let end = tokio::select! {
        () = cancel.cancelled() => TunnelEnd::Cancelled,
        copied = forward(&mut client_rx, &mut upstream_tx, &mut stats.client_to_origin) => {
            copied?;
            TunnelEnd::ClientClosed
        }
        copied = forward(&mut upstream_rx, &mut client_tx, &mut stats.origin_to_client) => {
            copied?;
            TunnelEnd::OriginClosed
        }
    };

    debug!(
        "Tunnel closed ({:?}): {} bytes up, {} bytes down",
        end, stats.client_to_origin, stats.origin_to_client
    );
    Ok((end, stats))
}

/// Moves bytes from `rx` to `tx` until `rx` reaches end of stream.
async fn forward<R, W>(rx: &mut R, tx: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    loop {
        let n = rx.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        tx.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}

async fn reply_bad_gateway(client: &mut TcpStream, version: &str) {
    let response = format!("{version} 502 Bad Gateway\r\n\r\n");
    if let Err(e) = client.write_all(response.as_bytes()).await {
        debug!("Failed to send 502 response: {}", e);
    }
}
