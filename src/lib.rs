//! Forwarding HTTP/HTTPS proxy.
//!
//! Plain HTTP requests are answered from an origin-keyed response cache or
//! fetched from the origin; `CONNECT` requests become opaque byte tunnels.
//! Origins on the blocklist are refused before anything is forwarded.

pub mod blocklist;
pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod http_relay;
pub mod message;
pub mod request;
pub mod server;
pub mod tunnel;

pub use blocklist::{BlockPolicy, Blocklist};
pub use cache::{format_http_date, parse_http_date, CacheEntry, ProxyCache};
pub use config::{ProxyConfig, CACHE_CAPACITY, HEADER_SIZE, PROXY_PORT};
pub use error::{BlocklistError, ProxyError};
pub use handler::{route, ConnectionHandler, ProxyContext, Route};
pub use http_relay::{relay_http, ConnectionStats};
pub use message::read_http_message;
pub use request::{parse_request, Origin, ParsedRequest, Scheme};
pub use server::{ProxyServer, TrafficTotals};
pub use tunnel::{pump, relay_tunnel, TunnelEnd, TunnelStats};
