//! Per-plugin result memoization (spec §3/§4.2).
//!
//! Some plugins (interface auth is the canonical case) make an expensive decision - an
//! outbound HTTP callout - that only depends on a small slice of the request. Rather than
//! repeat that callout on every request, the chain fingerprints the slice it depends on
//! and reuses the last decision's published context keys for a short TTL.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use http::HeaderMap;

/// Context keys looked at when building a fingerprint; kept small and fixed per spec §3.
const FINGERPRINT_HEADERS: &[&str] = &["authorization", "content-type", "user-agent"];

pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

struct CacheEntry {
    payload: HashMap<String, String>,
    expires_at: Instant,
}

/// A TTL cache keyed by (plugin name, method, host, path, query, fixed header subset).
pub struct PluginResultCache {
    entries: DashMap<u64, CacheEntry>,
    ttl: Duration,
}

impl Default for PluginResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl PluginResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns the cached published-context payload for this fingerprint, if still fresh.
    pub fn get(&self, fingerprint: u64) -> Option<HashMap<String, String>> {
        let entry = self.entries.get(&fingerprint)?;
        if entry.expires_at > Instant::now() {
            Some(entry.payload.clone())
        } else {
            None
        }
    }

    pub fn put(&self, fingerprint: u64, payload: HashMap<String, String>) {
        self.entries.insert(
            fingerprint,
            CacheEntry {
                payload,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

/// Computes the fingerprint for a plugin's decision on this request.
pub fn fingerprint(
    plugin_name: &str,
    method: &str,
    host: Option<&str>,
    path: &str,
    raw_query: Option<&str>,
    headers: &HeaderMap,
) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    plugin_name.hash(&mut hasher);
    method.hash(&mut hasher);
    host.unwrap_or("").hash(&mut hasher);
    path.hash(&mut hasher);
    raw_query.unwrap_or("").hash(&mut hasher);
    for name in FINGERPRINT_HEADERS {
        let value = headers.get(*name).and_then(|v| v.to_str().ok()).unwrap_or("");
        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_requests_produce_identical_fingerprints() {
        let headers = HeaderMap::new();
        let a = fingerprint("interface-auth", "GET", Some("api.example.com"), "/v1/x", None, &headers);
        let b = fingerprint("interface-auth", "GET", Some("api.example.com"), "/v1/x", None, &headers);
        assert_eq!(a, b);
    }

    #[test]
    fn different_paths_produce_different_fingerprints() {
        let headers = HeaderMap::new();
        let a = fingerprint("interface-auth", "GET", Some("h"), "/a", None, &headers);
        let b = fingerprint("interface-auth", "GET", Some("h"), "/b", None, &headers);
        assert_ne!(a, b);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = PluginResultCache::new(Duration::from_millis(1));
        cache.put(42, HashMap::new());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(42).is_none());
    }
}
