use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const PROXY_PORT: u16 = 4012;
pub const HEADER_SIZE: usize = 8192; // one receive, and the largest header block accepted
pub const CACHE_CAPACITY: usize = 200;
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const BLOCKLIST_FILE: &str = "blocklist.txt";

/// Runtime settings for the proxy server.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub blocklist_path: PathBuf,
    /// Append elapsed time to the per-request summary line.
    pub timing: bool,
    pub connect_timeout: Duration,
    /// Upper bound on any single receive from a client or origin.
    pub io_timeout: Duration,
}

impl ProxyConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_timing(mut self, timing: bool) -> Self {
        self.timing = timing;
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, PROXY_PORT)),
            blocklist_path: PathBuf::from(BLOCKLIST_FILE),
            timing: false,
            connect_timeout: CONNECT_TIMEOUT,
            io_timeout: CONNECTION_TIMEOUT,
        }
    }
}
