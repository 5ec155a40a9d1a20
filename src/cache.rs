use std::num::NonZeroUsize;
use std::sync::Mutex;

use axum::body::Body;
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use lru::LruCache;

/// A cached upstream response: the exact triple replayed to later callers.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl CacheEntry {
    pub(crate) fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// LRU response cache keyed by inbound path.
///
/// The query string is never part of the key: `/a?x=1` and `/a?x=2` share an
/// entry. Entries never expire on their own; they only leave by LRU eviction
/// once the capacity is exceeded. One cache is shared by every request the
/// middleware handles, behind a mutex.
///
/// Two concurrent first requests for a cold path will both miss and both
/// forward upstream; whichever stores last wins. That race is accepted;
/// there is no in-flight request coalescing.
pub(crate) struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl ResponseCache {
    pub(crate) fn new(capacity: Option<NonZeroUsize>) -> Self {
        let entries = match capacity {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Fetch the entry for `path`, marking it most recently used.
    pub(crate) fn lookup(&self, path: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(path).cloned()
    }

    /// Insert or overwrite the entry for `path`, marking it most recently
    /// used and evicting the least recently used entry when over capacity.
    pub(crate) fn store(&self, path: &str, entry: CacheEntry) {
        self.entries.lock().unwrap().put(path.to_string(), entry);
    }
}
