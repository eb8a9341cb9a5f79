use std::io;
use thiserror::Error;

/// Everything that can end a single proxied connection early.
///
/// None of these are fatal to the server: the connection handler logs the
/// error and closes both sockets.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A message uses a framing the proxy does not implement (chunked bodies).
    #[error("unsupported framing: {0}")]
    Unsupported(&'static str),

    #[error("header block exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("malformed request line")]
    MalformedRequestLine,

    #[error("unsupported scheme: {0:?}")]
    UnsupportedScheme(String),

    /// Only plain HTTP on port 80 and CONNECT on port 443 are relayed.
    #[error("unsupported protocol: {method} on port {port}")]
    UnsupportedProtocol { method: String, port: u16 },

    #[error("malformed HTTP date: {0:?}")]
    MalformedDate(String),

    #[error("origin {0} is blocked")]
    Blocked(String),

    #[error("timed out waiting for peer")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Policy rejections are expected outcomes, not faults.
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    /// Errors caused by the peer or the network rather than by the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout | Self::Io(_))
    }
}

/// Errors from reading or editing the persisted blocklist.
#[derive(Debug, Error)]
pub enum BlocklistError {
    #[error("'{0}' is not a valid http(s) URL")]
    InvalidUrl(String),

    #[error("'{0}' is not in the blocklist")]
    NotListed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
