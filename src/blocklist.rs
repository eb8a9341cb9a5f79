//! Origins the proxy refuses to serve.
//!
//! The list is persisted as one URL per line (`http://example.com`). At
//! startup each valid URL is reduced to its scheme followed by its hostname
//! (`httpexample.com`), which is what requests are matched against. Ports and
//! paths are ignored, so a listed host is blocked on every port and path for
//! that scheme.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, warn};
use url::Url;

use crate::error::BlocklistError;

/// Decides whether requests for a `scheme+hostname` key are refused.
pub trait BlockPolicy: Send + Sync {
    fn is_blocked(&self, key: &str) -> bool;
}

#[derive(Clone, Debug, Default)]
pub struct Blocklist {
    keys: HashSet<String>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the list from persisted URLs, skipping lines that are not valid.
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys = HashSet::new();
        for url in urls {
            let url = url.as_ref().trim();
            if url.is_empty() {
                continue;
            }
            match block_key(url) {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(_) => warn!("Ignoring invalid blocklist entry '{}'", url),
            }
        }
        Self { keys }
    }

    /// Reads the blocklist file; a missing file means nothing is blocked.
    pub fn load(path: &Path) -> Result<Self, BlocklistError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Self::from_urls(contents.lines())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No blocklist at {}", path.display());
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Adds a single match key directly.
    pub fn insert_key(&mut self, key: impl Into<String>) {
        self.keys.insert(key.into());
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

impl BlockPolicy for Blocklist {
    fn is_blocked(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

/// Reduces an `http(s)` URL to its `scheme+hostname` match key.
pub fn block_key(url: &str) -> Result<String, BlocklistError> {
    let parsed = Url::parse(url).map_err(|_| BlocklistError::InvalidUrl(url.to_string()))?;
    match (parsed.scheme(), parsed.host_str()) {
        (scheme @ ("http" | "https"), Some(host)) => Ok(format!("{scheme}{host}")),
        _ => Err(BlocklistError::InvalidUrl(url.to_string())),
    }
}

/// Appends valid URLs to the blocklist file.
///
/// Returns one result per URL so callers can report each one.
pub fn add_urls(path: &Path, urls: &[String]) -> Result<Vec<Result<String, BlocklistError>>, BlocklistError> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut outcomes = Vec::with_capacity(urls.len());
    for url in urls {
        match block_key(url) {
            Ok(_) => {
                writeln!(file, "{url}")?;
                outcomes.push(Ok(url.clone()));
            }
            Err(e) => outcomes.push(Err(e)),
        }
    }
    Ok(outcomes)
}

/// Removes exact URL lines from the blocklist file.
pub fn remove_urls(path: &Path, urls: &[String]) -> Result<Vec<Result<String, BlocklistError>>, BlocklistError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let mut lines: Vec<&str> = contents.lines().collect();

    let mut outcomes = Vec::with_capacity(urls.len());
    for url in urls {
        match lines.iter().position(|line| *line == url.as_str()) {
            Some(pos) => {
                lines.remove(pos);
                outcomes.push(Ok(url.clone()));
            }
            None => outcomes.push(Err(BlocklistError::NotListed(url.clone()))),
        }
    }

    let mut rewritten = lines.join("\n");
    if !rewritten.is_empty() {
        rewritten.push('\n');
    }
    fs::write(path, rewritten)?;
    Ok(outcomes)
}
