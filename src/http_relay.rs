use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::ProxyCache;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::message::{header_value, read_http_message};
use crate::request::ParsedRequest;

const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Bytes exchanged with origin servers on behalf of one client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Request bytes sent to the origin.
    pub bytes_sent: u64,
    /// Response bytes received from the origin.
    pub bytes_received: u64,
}

/// Answers a plain HTTP request from the cache or from its origin.
///
/// A cache hit never touches the network. On a miss the request is forwarded
/// verbatim and the response is cached when it carries both `Date` and
/// `Expires`.
pub async fn relay_http(
    client: &mut TcpStream,
    request: &ParsedRequest,
    cache: &ProxyCache,
    config: &ProxyConfig,
    stats: &mut ConnectionStats,
) -> Result<(), ProxyError> {
    let origin = &request.origin;

    let reply = match cache.lookup(origin).await {
        Some(cached) => {
            debug!("CACHE HIT: {}", origin);
            cached
        }
        None => {
            debug!("CACHE MISS: {}", origin);
            let reply = fetch(client, request, config, stats).await?;
            store(cache, request, &reply).await;
            reply
        }
    };

    client.write_all(&reply).await?;
    Ok(())
}

async fn fetch(
    client: &mut TcpStream,
    request: &ParsedRequest,
    config: &ProxyConfig,
    stats: &mut ConnectionStats,
) -> Result<Bytes, ProxyError> {
    let origin = &request.origin;
    let mut upstream = match timeout(
        config.connect_timeout,
        TcpStream::connect((origin.host.as_str(), origin.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            reply_bad_gateway(client).await;
            return Err(e.into());
        }
        Err(_) => {
            reply_bad_gateway(client).await;
            return Err(ProxyError::Timeout);
        }
    };

    upstream.write_all(&request.raw).await?;
    stats.bytes_sent += request.raw.len() as u64;

    let reply = read_http_message(&mut upstream, config.io_timeout).await?;
    stats.bytes_received += reply.len() as u64;
    Ok(reply)
}

async fn store(cache: &ProxyCache, request: &ParsedRequest, reply: &Bytes) {
    let (Some(date), Some(expires)) = (header_value(reply, "Date"), header_value(reply, "Expires")) else {
        debug!("No cache policy from {}, not caching", request.origin);
        return;
    };

    match cache.insert(&request.origin, reply.clone(), &date, &expires).await {
        Ok(()) => debug!("CACHED: {} (expires {})", request.origin, expires),
        Err(e) => warn!("Not caching response from {}: {}", request.origin, e),
    }
}

async fn reply_bad_gateway(client: &mut TcpStream) {
    if let Err(e) = client.write_all(RESPONSE_502).await {
        debug!("Failed to send 502 response: {}", e);
    }
}
