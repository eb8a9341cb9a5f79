use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocklist::BlockPolicy;
use crate::cache::ProxyCache;
use crate::config::{ProxyConfig, HTTPS_PORT, HTTP_PORT};
use crate::error::ProxyError;
use crate::http_relay::{relay_http, ConnectionStats};
use crate::message::read_http_message;
use crate::request::{parse_request, ParsedRequest};
use crate::tunnel::relay_tunnel;

/// Shared state handed to every connection handler.
#[derive(Clone)]
pub struct ProxyContext {
    pub cache: ProxyCache,
    pub blocklist: Arc<dyn BlockPolicy>,
    pub config: Arc<ProxyConfig>,
}

impl ProxyContext {
    pub fn new(cache: ProxyCache, blocklist: Arc<dyn BlockPolicy>, config: ProxyConfig) -> Self {
        Self {
            cache,
            blocklist,
            config: Arc::new(config),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Http,
    Tunnel,
}

/// Picks the relay for a request: plain HTTP on port 80, CONNECT on port 443.
pub fn route(request: &ParsedRequest) -> Result<Route, ProxyError> {
    match request.origin.port {
        HTTP_PORT => Ok(Route::Http),
        HTTPS_PORT if request.method == "CONNECT" => Ok(Route::Tunnel),
        port => Err(ProxyError::UnsupportedProtocol {
            method: request.method.clone(),
            port,
        }),
    }
}

/// Serves one client connection from first byte to close.
///
/// The client socket and any origin socket are owned by this handler and are
/// closed when it finishes, whichever way that happens.
pub struct ConnectionHandler {
    client: TcpStream,
    peer: SocketAddr,
    ctx: ProxyContext,
    cancel: CancellationToken,
    stats: ConnectionStats,
}

impl ConnectionHandler {
    pub fn new(client: TcpStream, peer: SocketAddr, ctx: ProxyContext, cancel: CancellationToken) -> Self {
        Self {
            client,
            peer,
            ctx,
            cancel,
            stats: ConnectionStats::default(),
        }
    }

    /// Runs the connection to completion and returns its HTTP byte counts.
    ///
    /// Errors end this connection only; they are logged here and never
    /// propagate to the server.
    pub async fn run(mut self) -> ConnectionStats {
        match self.process().await {
            Ok(()) => {}
            Err(e) if e.is_policy() => warn!("[-] {}: {}. Cancelling...", self.peer, e),
            Err(e) if e.is_transport() => debug!("Connection from {} ended: {}", self.peer, e),
            Err(e) => warn!("Rejected request from {}: {}", self.peer, e),
        }
        self.stats
    }

    async fn process(&mut self) -> Result<(), ProxyError> {
        let raw = tokio::select! {
            () = self.cancel.cancelled() => {
                debug!("Dropping idle client {} on shutdown", self.peer);
                return Ok(());
            }
            raw = read_http_message(&mut self.client, self.ctx.config.io_timeout) => raw?,
        };
        let request = parse_request(raw)?;
        debug!("Client {} attempting to connect to {}", self.peer, request.origin);

        if self.ctx.blocklist.is_blocked(&request.block_key()) {
            return Err(ProxyError::Blocked(request.origin.to_string()));
        }

        match route(&request)? {
            Route::Http => {
                let started = Instant::now();
                relay_http(
                    &mut self.client,
                    &request,
                    &self.ctx.cache,
                    &self.ctx.config,
                    &mut self.stats,
                )
                .await?;

                if self.ctx.config.timing {
                    let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                    info!("{} took {:.5} ms", request.summary(), elapsed);
                } else {
                    info!("{}", request.summary());
                }
            }
            Route::Tunnel => {
                info!("{}", request.summary());
                relay_tunnel(&mut self.client, &request, &self.ctx.config, &self.cancel).await?;
            }
        }
        Ok(())
    }
}
