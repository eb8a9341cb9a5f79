use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::{ConnectionHandler, ProxyContext};
use crate::http_relay::ConnectionStats;

/// HTTP bytes relayed by every finished connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: u64,
}

impl TrafficTotals {
    fn record(&mut self, stats: ConnectionStats) {
        self.bytes_sent += stats.bytes_sent;
        self.bytes_received += stats.bytes_received;
        self.connections += 1;
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    ctx: ProxyContext,
}

impl ProxyServer {
    pub async fn bind(ctx: ProxyContext) -> io::Result<Self> {
        let listener = TcpListener::bind(ctx.config.listen_addr).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` is cancelled, then cancels every
    /// live handler, waits for them and returns the traffic totals.
    pub async fn run(self, shutdown: CancellationToken) -> TrafficTotals {
        let mut handlers = JoinSet::new();
        let mut totals = TrafficTotals::default();

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((client, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let handler = ConnectionHandler::new(
                                client,
                                peer,
                                self.ctx.clone(),
                                shutdown.child_token(),
                            );
                            handlers.spawn(handler.run());
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
            }

            while let Some(finished) = handlers.try_join_next() {
                reap(finished, &mut totals);
            }
        }

        info!("[-] Stopping proxy server...");
        drop(self.listener);
        if !handlers.is_empty() {
            info!("Waiting for {} active connections to finish...", handlers.len());
        }
        while let Some(finished) = handlers.join_next().await {
            reap(finished, &mut totals);
        }

        info!(
            "Served {} connections, HTTP data sent: {} bytes, received: {} bytes",
            totals.connections, totals.bytes_sent, totals.bytes_received
        );
        totals
    }
}

fn reap(finished: Result<ConnectionStats, tokio::task::JoinError>, totals: &mut TrafficTotals) {
    match finished {
        Ok(stats) => totals.record(stats),
        Err(e) => warn!("Connection handler aborted: {}", e),
    }
}
