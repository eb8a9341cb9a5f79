use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CACHE_CAPACITY;
use crate::error::ProxyError;
use crate::request::Origin;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub data: Bytes,
    /// The origin's `Date` header at the time of caching.
    pub cached_at: SystemTime,
    /// The origin's `Expires` header; never updated in place.
    pub expires_at: SystemTime,
}

/// Response cache keyed by origin, one entry per `host:port`.
///
/// Cloning is cheap and every clone shares the same entries. Each operation
/// holds the lock for its whole duration.
#[derive(Clone)]
pub struct ProxyCache {
    entries: Arc<Mutex<HashMap<Origin, CacheEntry>>>,
    capacity: usize,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Cached response for `origin` if it has not expired yet.
    ///
    /// An expired entry found here is dropped.
    pub async fn lookup(&self, origin: &Origin) -> Option<Bytes> {
        let mut entries = self.entries.lock().await;
        let now = SystemTime::now();

        match entries.get(origin) {
            Some(entry) if entry.expires_at > now => Some(entry.data.clone()),
            Some(_) => {
                entries.remove(origin);
                debug!("Dropped expired cache entry for {}", origin);
                None
            }
            None => None,
        }
    }

    /// The stored entry for `origin`, expired or not.
    pub async fn entry(&self, origin: &Origin) -> Option<CacheEntry> {
        self.entries.lock().await.get(origin).cloned()
    }

    /// Caches `data` for `origin` using the response's `Date` and `Expires`
    /// header values.
    ///
    /// Fails with [`ProxyError::MalformedDate`] without touching the cache if
    /// either value is not an HTTP date.
    pub async fn insert(
        &self,
        origin: &Origin,
        data: Bytes,
        date: &str,
        expires: &str,
    ) -> Result<(), ProxyError> {
        let entry = CacheEntry {
            data,
            cached_at: parse_http_date(date)?,
            expires_at: parse_http_date(expires)?,
        };

        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity && !entries.contains_key(origin) {
            if !remove_expired_at(&mut entries, SystemTime::now()) {
                evict_oldest(&mut entries);
            }
        }
        entries.insert(origin.clone(), entry);
        Ok(())
    }

    /// Drops every entry whose expiry is not in the future.
    ///
    /// Returns whether anything was removed.
    pub async fn remove_expired(&self) -> bool {
        let mut entries = self.entries.lock().await;
        remove_expired_at(&mut entries, SystemTime::now())
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

impl Default for ProxyCache {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_expired_at(entries: &mut HashMap<Origin, CacheEntry>, now: SystemTime) -> bool {
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);
    let removed = before - entries.len();
    if removed > 0 {
        debug!("Removed {} expired cache entries", removed);
    }
    removed > 0
}

fn evict_oldest(entries: &mut HashMap<Origin, CacheEntry>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.cached_at)
        .map(|(origin, _)| origin.clone());
    if let Some(origin) = oldest {
        entries.remove(&origin);
        debug!("Evicted oldest cache entry for {}", origin);
    }
}

/// Parses an HTTP date such as `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn parse_http_date(value: &str) -> Result<SystemTime, ProxyError> {
    httpdate::parse_http_date(value.trim()).map_err(|_| ProxyError::MalformedDate(value.to_string()))
}

pub fn format_http_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}
