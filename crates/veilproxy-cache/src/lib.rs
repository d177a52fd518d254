//! C8: Edge Cache. A process-local `DashMap` store keyed on the normalized
//! GET request, holding only responses that passed the session-safety
//! filter (no `Set-Cookie`, a cacheable content type, no private/no-store
//! directive).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::{HeaderMap, HeaderValue};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: bytes::Bytes,
    stored_at: Instant,
}

#[derive(Clone, Default)]
pub struct EdgeCache {
    store: Arc<DashMap<String, CacheEntry>>,
}

/// Build the cache key for a GET request: method is implicit (only GET is
/// ever stored), the key is the proxy-visible host plus path and query —
/// the same string two different clients hitting the same target produce.
pub fn cache_key(host: &str, path_and_query: &str) -> String {
    format!("{host}{path_and_query}")
}

/// Whether a response is eligible to be written into the cache: status 200,
/// a content type present in `cacheable_types` (matched by substring), and
/// no `private`/`no-store`/`no-cache` in `Cache-Control`.
pub fn is_cacheable(status: u16, headers: &HeaderMap, cacheable_types: &[String]) -> bool {
    if status != 200 {
        return false;
    }
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !cacheable_types.iter().any(|t| content_type.contains(t.as_str())) {
        return false;
    }
    if let Some(cc) = headers.get(http::header::CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
        let lower = cc.to_ascii_lowercase();
        if lower.contains("private") || lower.contains("no-store") || lower.contains("no-cache") {
            return false;
        }
    }
    true
}

impl EdgeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str, ttl: Duration) -> Option<CacheEntry> {
        let entry = self.store.get(key)?;
        if entry.stored_at.elapsed() > ttl {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    /// Store a response, stripping `Set-Cookie` (a cached entry must never
    /// replay another visitor's session cookie) and setting the on-disk
    /// cache-control headers a CDN in front of this proxy should honor.
    pub fn put(&self, key: String, status: u16, mut headers: HeaderMap, body: bytes::Bytes, ttl_seconds: u64) {
        headers.remove(http::header::SET_COOKIE);
        if let Ok(hv) = HeaderValue::from_str(&format!("public, max-age={ttl_seconds}")) {
            headers.insert(http::header::CACHE_CONTROL, hv);
        }
        headers.insert(
            http::header::HeaderName::from_static("cloudflare-cdn-cache-control"),
            HeaderValue::from_str(&format!("max-age={ttl_seconds}")).unwrap(),
        );
        headers.insert(
            http::header::VARY,
            HeaderValue::from_static("Accept-Encoding"),
        );
        self.store.insert(
            key,
            CacheEntry {
                status,
                headers,
                body,
                stored_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_200_and_private_and_wrong_type() {
        let mut h = HeaderMap::new();
        h.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let types = vec!["text/css".to_string()];
        assert!(!is_cacheable(200, &h, &types));

        h.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/css"));
        assert!(is_cacheable(200, &h, &types));
        assert!(!is_cacheable(404, &h, &types));

        h.insert(http::header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=60"));
        assert!(!is_cacheable(200, &h, &types));
    }

    #[test]
    fn put_strips_set_cookie_and_adds_cache_headers() {
        let cache = EdgeCache::new();
        let mut h = HeaderMap::new();
        h.insert(http::header::SET_COOKIE, HeaderValue::from_static("sid=abc"));
        cache.put("x.com/a".into(), 200, h, bytes::Bytes::from_static(b"hi"), 3600);
        let entry = cache.get("x.com/a", Duration::from_secs(3600)).unwrap();
        assert!(entry.headers.get(http::header::SET_COOKIE).is_none());
        assert_eq!(
            entry.headers.get(http::header::CACHE_CONTROL).unwrap(),
            "public, max-age=3600"
        );
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let cache = EdgeCache::new();
        cache.put("x.com/a".into(), 200, HeaderMap::new(), bytes::Bytes::from_static(b"hi"), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("x.com/a", Duration::from_millis(0)).is_none());
    }
}
