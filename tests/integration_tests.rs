/// Integration tests for tunnelsquid
/// Exercises the relays, the connection handler and the server over loopback sockets
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tunnelsquid::*;

const CACHEABLE_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
Expires: Fri, 01 Jan 2100 00:00:00 GMT\r\n\
Content-Length: 5\r\n\r\nhello";

const UNCACHEABLE_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (accepted, peer) = accepted.unwrap();
    (connected.unwrap(), accepted, peer)
}

/// Origin that answers every connection with `response`, split into
/// `chunks` writes, and counts how many connections it saw.
async fn spawn_origin(response: &'static [u8], chunks: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request).await;
                let step = response.len().div_ceil(chunks);
                for piece in response.chunks(step) {
                    stream.write_all(piece).await.unwrap();
                    stream.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            });
        }
    });

    (addr, accepted)
}

fn get_request(addr: SocketAddr) -> ParsedRequest {
    let raw = format!("GET http://{addr}/ HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    parse_request(Bytes::from(raw)).unwrap()
}

async fn relay_once(request: &ParsedRequest, cache: &ProxyCache) -> (Vec<u8>, ConnectionStats) {
    let (mut client, mut proxy_side, _) = socket_pair().await;
    let mut stats = ConnectionStats::default();
    relay_http(&mut proxy_side, request, cache, &ProxyConfig::default(), &mut stats)
        .await
        .unwrap();
    drop(proxy_side);

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    (received, stats)
}

#[tokio::test]
async fn test_http_relay_caches_by_origin() {
    let (addr, accepted) = spawn_origin(CACHEABLE_RESPONSE, 1).await;
    let cache = ProxyCache::new();
    let request = get_request(addr);

    let (first, stats) = relay_once(&request, &cache).await;
    assert_eq!(first, CACHEABLE_RESPONSE);
    assert_eq!(stats.bytes_sent, request.raw.len() as u64);
    assert_eq!(stats.bytes_received, CACHEABLE_RESPONSE.len() as u64);
    assert_eq!(cache.len().await, 1);

    let (second, stats) = relay_once(&request, &cache).await;
    assert_eq!(second, CACHEABLE_RESPONSE);
    assert_eq!(stats, ConnectionStats::default());
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_http_relay_without_cache_headers() {
    let (addr, accepted) = spawn_origin(UNCACHEABLE_RESPONSE, 1).await;
    let cache = ProxyCache::new();
    let request = get_request(addr);

    let (first, _) = relay_once(&request, &cache).await;
    let (second, _) = relay_once(&request, &cache).await;

    assert_eq!(first, UNCACHEABLE_RESPONSE);
    assert_eq!(second, UNCACHEABLE_RESPONSE);
    assert!(cache.is_empty().await);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_http_relay_malformed_date_still_forwards() {
    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nDate: someday\r\nExpires: never\r\nContent-Length: 2\r\n\r\nok";
    let (addr, _) = spawn_origin(RESPONSE, 1).await;
    let cache = ProxyCache::new();

    let (received, _) = relay_once(&get_request(addr), &cache).await;
    assert_eq!(received, RESPONSE);
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_response_split_across_writes() {
    let (addr, _) = spawn_origin(CACHEABLE_RESPONSE, 7).await;
    let cache = ProxyCache::new();

    let (received, stats) = relay_once(&get_request(addr), &cache).await;
    assert_eq!(received, CACHEABLE_RESPONSE);
    assert_eq!(stats.bytes_received, CACHEABLE_RESPONSE.len() as u64);
}

#[tokio::test]
async fn test_tunnel_relays_both_ways() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let raw = format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
    let request = parse_request(Bytes::from(raw)).unwrap();

    let (mut client, mut proxy_side, _) = socket_pair().await;
    let cancel = CancellationToken::new();
    let relay = tokio::spawn(async move {
        relay_tunnel(&mut proxy_side, &request, &ProxyConfig::default(), &cancel).await
    });

    let (mut upstream, _) = origin.accept().await.unwrap();

    let established = b"HTTP/1.1 200 Connection established\r\n\r\n";
    let mut buf = vec![0u8; established.len()];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, established);

    // Opaque bytes pass through unchanged and in order
    for round in 0..3u8 {
        let up = vec![round; 1000];
        client.write_all(&up).await.unwrap();
        let mut got = vec![0u8; up.len()];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, up);

        let down = vec![round + 100; 3000];
        upstream.write_all(&down).await.unwrap();
        let mut got = vec![0u8; down.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, down);
    }

    drop(upstream);
    let (end, stats) = relay.await.unwrap().unwrap();
    assert_eq!(end, TunnelEnd::OriginClosed);
    assert_eq!(stats.client_to_origin, 3000);
    assert_eq!(stats.origin_to_client, 9000);
}

#[tokio::test]
async fn test_tunnel_unreachable_origin_replies_502() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let request = parse_request(Bytes::from(format!("CONNECT {addr} HTTP/1.1\r\n\r\n"))).unwrap();
    let (mut client, mut proxy_side, _) = socket_pair().await;
    let cancel = CancellationToken::new();

    let result = relay_tunnel(&mut proxy_side, &request, &ProxyConfig::default(), &cancel).await;
    assert!(result.is_err());
    drop(proxy_side);

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
}

fn context(blocklist: Blocklist) -> ProxyContext {
    ProxyContext::new(ProxyCache::new(), Arc::new(blocklist), ProxyConfig::default())
}

/// Runs a handler for one request and returns what the client received.
async fn handle(ctx: ProxyContext, raw: String) -> (Vec<u8>, ConnectionStats) {
    let (mut client, proxy_side, peer) = socket_pair().await;
    let handler = ConnectionHandler::new(proxy_side, peer, ctx, CancellationToken::new());
    let running = tokio::spawn(handler.run());

    client.write_all(raw.as_bytes()).await.unwrap();
    let stats = running.await.unwrap();

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    (received, stats)
}

async fn assert_never_contacted(origin: &TcpListener) {
    let attempt = tokio::time::timeout(Duration::from_millis(200), origin.accept()).await;
    assert!(attempt.is_err(), "origin was contacted");
}

#[tokio::test]
async fn test_blocked_origin_is_never_contacted() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = origin.local_addr().unwrap();

    let mut blocklist = Blocklist::new();
    blocklist.insert_key("http127.0.0.1");

    let raw = format!("GET http://{addr}/ HTTP/1.1\r\n\r\n");
    let (received, stats) = handle(context(blocklist), raw).await;

    assert!(received.is_empty());
    assert_eq!(stats, ConnectionStats::default());
    assert_never_contacted(&origin).await;
}

#[tokio::test]
async fn test_blocked_hostname_scenario() {
    let blocklist = Blocklist::from_urls(["http://blocked.example"]);
    let raw = "GET http://blocked.example:80/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n".to_string();

    let (received, stats) = handle(context(blocklist), raw).await;
    assert!(received.is_empty());
    assert_eq!(stats.bytes_sent, 0);
    assert_eq!(stats.bytes_received, 0);
}

#[tokio::test]
async fn test_unsupported_port_is_rejected() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = origin.local_addr().unwrap();

    let raw = format!("GET http://{addr}/ HTTP/1.1\r\n\r\n");
    let (received, stats) = handle(context(Blocklist::new()), raw).await;

    assert!(received.is_empty());
    assert_eq!(stats, ConnectionStats::default());
    assert_never_contacted(&origin).await;
}

#[tokio::test]
async fn test_chunked_request_is_rejected() {
    let raw = "POST http://example.com/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_string();
    let (received, stats) = handle(context(Blocklist::new()), raw).await;
    assert!(received.is_empty());
    assert_eq!(stats, ConnectionStats::default());
}

#[tokio::test]
async fn test_server_survives_bad_connections_and_shuts_down() {
    let config = ProxyConfig::default().with_listen_addr("127.0.0.1:0".parse().unwrap());
    let ctx = ProxyContext::new(ProxyCache::new(), Arc::new(Blocklist::new()), config);
    let server = ProxyServer::bind(ctx).await.unwrap();
    let addr = server.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(server.run(shutdown.clone()));

    for _ in 0..3 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"garbage\r\n\r\n").await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    shutdown.cancel();
    let totals = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(totals.connections, 3);
    assert_eq!(totals.bytes_sent, 0);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_server_shutdown_drops_idle_clients() {
    let config = ProxyConfig::default().with_listen_addr("127.0.0.1:0".parse().unwrap());
    let ctx = ProxyContext::new(ProxyCache::new(), Arc::new(Blocklist::new()), config);
    let server = ProxyServer::bind(ctx).await.unwrap();
    let addr = server.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(server.run(shutdown.clone()));

    // Connected but silent for the whole test.
    let mut client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let totals = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("shutdown waited on a client that never sent a request")
        .unwrap();
    assert_eq!(totals.connections, 1);
    assert_eq!(totals.bytes_sent, 0);

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}
