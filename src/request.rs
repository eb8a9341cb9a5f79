use bytes::Bytes;
use std::fmt;
use url::Url;

use crate::config::{HTTPS_PORT, HTTP_PORT};
use crate::error::ProxyError;

const MAX_HEADERS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => HTTP_PORT,
            Self::Https => HTTPS_PORT,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `host:port` pair a request targets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The first request read from a client connection.
#[derive(Clone, Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub origin: Origin,
    pub scheme: Scheme,
    pub version: String,
    /// The request exactly as received, for verbatim forwarding.
    pub raw: Bytes,
}

impl ParsedRequest {
    /// Blocklist key: scheme immediately followed by hostname, no port.
    pub fn block_key(&self) -> String {
        format!("{}{}", self.scheme, self.origin.host)
    }

    pub fn summary(&self) -> String {
        format!("{} {} {}", self.method, self.origin, self.version)
    }
}

/// Parses the request line of `raw` into method, origin and version.
pub fn parse_request(raw: Bytes) -> Result<ParsedRequest, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(ProxyError::MalformedRequestLine),
    }

    let method = req.method.ok_or(ProxyError::MalformedRequestLine)?.to_string();
    let target = req.path.ok_or(ProxyError::MalformedRequestLine)?;
    let version = format!("HTTP/1.{}", req.version.ok_or(ProxyError::MalformedRequestLine)?);
    let (scheme, origin) = parse_target(target)?;

    Ok(ParsedRequest {
        method,
        origin,
        scheme,
        version,
        raw,
    })
}

/// Resolves a request target to its scheme and origin.
///
/// Absolute-form targets (`http://host/path`) carry their own scheme and fall
/// back to its default port. Anything without `://` is an authority
/// (`host:port`, as sent with CONNECT) and must name its port.
pub fn parse_target(target: &str) -> Result<(Scheme, Origin), ProxyError> {
    if let Some((name, _)) = target.split_once("://") {
        let scheme = Scheme::from_name(&name.to_ascii_lowercase())
            .ok_or_else(|| ProxyError::UnsupportedScheme(name.to_string()))?;
        let url = Url::parse(target).map_err(|_| ProxyError::MalformedRequestLine)?;
        let host = url.host_str().ok_or(ProxyError::MalformedRequestLine)?;
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        return Ok((scheme, Origin::new(host, port)));
    }

    let (host, port) = split_authority(target)?;
    let scheme = if port == HTTPS_PORT {
        Scheme::Https
    } else {
        Scheme::Http
    };
    Ok((scheme, Origin::new(host, port)))
}

fn split_authority(authority: &str) -> Result<(String, u16), ProxyError> {
    let Some(colon_pos) = authority.rfind(':') else {
        // No scheme and no port: nothing to default the port from.
        return Err(ProxyError::UnsupportedScheme(String::new()));
    };
    let host = authority[..colon_pos].trim_start_matches('[').trim_end_matches(']');
    let port = authority[colon_pos + 1..]
        .parse::<u16>()
        .map_err(|_| ProxyError::MalformedRequestLine)?;
    if host.is_empty() {
        return Err(ProxyError::MalformedRequestLine);
    }
    Ok((host.to_ascii_lowercase(), port))
}
