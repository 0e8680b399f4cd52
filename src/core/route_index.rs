//! Route matching engine (C4).
//!
//! Exact and prefix routes are indexed into a `matchit` trie for O(path length) lookup;
//! regex and wildcard routes, along with anything the trie fails to resolve, fall back to
//! a priority-ordered linear scan. A bounded LRU remembers, per literal request path, which
//! route last matched - but a cache hit is only ever returned after re-validating the
//! route's non-path predicates (host/method/headers/query) against the current request,
//! since those can vary request-to-request even when the path is identical.

use std::{num::NonZeroUsize, sync::Mutex};

use lru::LruCache;
use matchit::Router as MatchitRouter;
use pingora_error::{ErrorType, OrErr, Result};
use pingora_http::RequestHeader;
use regex::Regex;

use crate::config::{self, MatchType, Route};
use crate::utils::request::get_query_value;

use super::chain::PluginChain;
use std::sync::Arc;

const PATH_CACHE_CAPACITY: usize = 1024;

/// A route fully bound to its compiled path matcher and its plugin chain.
pub struct ProxyRoute {
    pub config: Route,
    path_regex: Option<Regex>,
    pub chain: Arc<PluginChain>,
}

impl ProxyRoute {
    pub fn new(config: Route, chain: Arc<PluginChain>) -> Result<Self> {
        let path_regex = match config.r#match.r#type {
            MatchType::Regex => Some(
                Regex::new(&config.r#match.path)
                    .or_err(ErrorType::ReadError, "invalid regex route pattern")?,
            ),
            MatchType::Wildcard => Some(
                Regex::new(&config::wildcard_to_anchored_regex(&config.r#match.path))
                    .or_err(ErrorType::ReadError, "invalid wildcard route pattern")?,
            ),
            MatchType::Exact | MatchType::Prefix => None,
        };
        Ok(Self {
            config,
            path_regex,
            chain,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn path_matches(&self, path: &str) -> bool {
        match self.config.r#match.r#type {
            MatchType::Exact => path == self.config.r#match.path,
            MatchType::Prefix => {
                let prefix = self.config.r#match.path.trim_end_matches('/');
                if prefix.is_empty() {
                    true
                } else {
                    path == prefix || path.starts_with(&format!("{prefix}/"))
                }
            }
            MatchType::Regex | MatchType::Wildcard => self
                .path_regex
                .as_ref()
                .map(|re| re.is_match(path))
                .unwrap_or(false),
        }
    }

    /// Checks every non-path predicate. Used by the trie fast path, the linear fallback,
    /// and to re-validate an LRU path-cache hit.
    pub fn predicates_match(&self, req: &RequestHeader) -> bool {
        let m = &self.config.r#match;

        if let Some(expected_host) = &m.host {
            match crate::utils::request::get_request_host(req) {
                Some(host) if host.eq_ignore_ascii_case(expected_host) => {}
                _ => return false,
            }
        }

        if !m.method.is_empty() && !m.method.contains(&req.method) {
            return false;
        }

        for (name, value) in &m.headers {
            match req.headers.get(name).and_then(|v| v.to_str().ok()) {
                Some(actual) if actual == value => {}
                _ => return false,
            }
        }

        for (name, value) in &m.query_params {
            match get_query_value(req, name) {
                Some(actual) if actual == value => {}
                _ => return false,
            }
        }

        true
    }

    pub fn matches(&self, req: &RequestHeader) -> bool {
        self.path_matches(req.uri.path()) && self.predicates_match(req)
    }
}

fn insert_into_trie(trie: &mut MatchitRouter<Vec<Arc<ProxyRoute>>>, pattern: &str, route: Arc<ProxyRoute>) {
    if let Ok(existing) = trie.at_mut(pattern) {
        existing.value.push(route);
        return;
    }
    let _ = trie.insert(pattern, vec![route]);
}

pub struct RouteIndex {
    trie: MatchitRouter<Vec<Arc<ProxyRoute>>>,
    priority_list: Vec<Arc<ProxyRoute>>,
    cache: Mutex<LruCache<String, Arc<ProxyRoute>>>,
}

impl RouteIndex {
    pub fn build(routes: Vec<Arc<ProxyRoute>>) -> Self {
        let mut trie: MatchitRouter<Vec<Arc<ProxyRoute>>> = MatchitRouter::new();

        for route in &routes {
            match route.config.r#match.r#type {
                MatchType::Exact => {
                    insert_into_trie(&mut trie, &route.config.r#match.path, route.clone());
                }
                MatchType::Prefix => {
                    let trimmed = route.config.r#match.path.trim_end_matches('/');
                    let bare = if trimmed.is_empty() { "/" } else { trimmed };
                    insert_into_trie(&mut trie, bare, route.clone());
                    let catch_all = if trimmed.is_empty() {
                        "/{*gatewayrs_tail}".to_string()
                    } else {
                        format!("{trimmed}/{{*gatewayrs_tail}}")
                    };
                    insert_into_trie(&mut trie, &catch_all, route.clone());
                }
                MatchType::Regex | MatchType::Wildcard => {
                    // Not trie-addressable; resolved only via the priority-ordered scan.
                }
            }
        }

        let mut priority_list = routes;
        priority_list.sort_by(|a, b| b.config.r#match.priority.cmp(&a.config.r#match.priority));

        Self {
            trie,
            priority_list,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(PATH_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        }
    }

    /// The trie only resolves to the single most *structurally specific* node for a given
    /// path (e.g. the deepest registered `prefix` catch-all), which is not necessarily the
    /// node holding the highest-`priority` route - two overlapping `prefix` routes at
    /// different depths (`/api` vs. `/api/v2`) live at different trie nodes, so the trie
    /// alone cannot compare them. The trie candidate is therefore always reconciled against
    /// `linear_candidate`'s full priority-ordered scan before either is returned, keeping
    /// the higher-priority of the two (spec §4.1: "the selected route has the highest
    /// priority among all whose predicates are satisfied").
    pub fn match_request(&self, req: &RequestHeader) -> Option<Arc<ProxyRoute>> {
        let path = req.uri.path();

        if let Some(route) = self.cache_lookup(path) {
            if route.predicates_match(req) {
                return Some(route);
            }
        }

        let trie_candidate = self.trie_lookup(path, req);
        let linear_candidate = self.linear_lookup(req);

        let best = match (trie_candidate, linear_candidate) {
            (Some(t), Some(l)) => {
                if l.config.r#match.priority > t.config.r#match.priority {
                    Some(l)
                } else {
                    Some(t)
                }
            }
            (t, None) => t,
            (None, l) => l,
        };

        if let Some(route) = &best {
            self.cache_store(path, route.clone());
        }
        best
    }

    fn cache_lookup(&self, path: &str) -> Option<Arc<ProxyRoute>> {
        self.cache.lock().expect("route cache poisoned").get(path).cloned()
    }

    fn cache_store(&self, path: &str, route: Arc<ProxyRoute>) {
        self.cache
            .lock()
            .expect("route cache poisoned")
            .put(path.to_string(), route);
    }

    fn trie_lookup(&self, path: &str, req: &RequestHeader) -> Option<Arc<ProxyRoute>> {
        let matched = self.trie.at(path).ok()?;
        matched
            .value
            .iter()
            .filter(|route| route.predicates_match(req))
            .max_by_key(|route| route.config.r#match.priority)
            .cloned()
    }

    /// Full priority-ordered scan, authoritative for `regex`/`wildcard` routes and now also
    /// consulted (and reconciled against) on every `prefix`/`exact` lookup so overlapping
    /// `prefix` routes at different trie depths are compared on priority, not trie
    /// specificity.
    fn linear_lookup(&self, req: &RequestHeader) -> Option<Arc<ProxyRoute>> {
        self.priority_list.iter().find(|route| route.matches(req)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatchType, RouteMatch, Target};
    use std::collections::HashMap;

    fn route(name: &str, r#type: MatchType, path: &str, priority: i32) -> Arc<ProxyRoute> {
        let cfg = Route {
            name: name.to_string(),
            r#match: RouteMatch {
                r#type,
                path: path.to_string(),
                priority,
                host: None,
                method: vec![],
                headers: HashMap::new(),
                query_params: HashMap::new(),
            },
            target: Target {
                url: "http://127.0.0.1:9000".to_string(),
                timeout_ms: 5000,
                retries: 0,
            },
            plugins: vec![],
            response: None,
        };
        Arc::new(ProxyRoute::new(cfg, Arc::new(PluginChain::new(vec![]))).unwrap())
    }

    fn request(path: &str) -> RequestHeader {
        RequestHeader::build("GET", path.as_bytes(), None).unwrap()
    }

    #[test]
    fn exact_beats_prefix_in_the_trie() {
        let exact = route("exact", MatchType::Exact, "/api/health", 0);
        let prefix = route("prefix", MatchType::Prefix, "/api", 0);
        let index = RouteIndex::build(vec![exact.clone(), prefix.clone()]);

        let req = request("/api/health");
        let matched = index.match_request(&req).unwrap();
        assert_eq!(matched.name(), "exact");

        let req = request("/api/other");
        let matched = index.match_request(&req).unwrap();
        assert_eq!(matched.name(), "prefix");
    }

    #[test]
    fn wildcard_routes_are_resolved_through_the_fallback_scan() {
        let wildcard = route("wild", MatchType::Wildcard, "/files/*.png", 0);
        let index = RouteIndex::build(vec![wildcard]);

        let req = request("/files/cat.png");
        assert!(index.match_request(&req).is_some());

        let req = request("/files/cat.jpg");
        assert!(index.match_request(&req).is_none());
    }

    #[test]
    fn higher_priority_wins_among_overlapping_regex_routes() {
        let low = route("low", MatchType::Regex, "^/v[0-9]+/x$", 1);
        let high = route("high", MatchType::Regex, "^/v1/x$", 10);
        let index = RouteIndex::build(vec![low, high]);

        let req = request("/v1/x");
        let matched = index.match_request(&req).unwrap();
        assert_eq!(matched.name(), "high");
    }

    #[test]
    fn higher_priority_prefix_wins_even_when_trie_resolves_to_a_deeper_node() {
        // `/api/v2` is the structurally more specific trie node for `/api/v2/x`, but
        // `/api`'s declared priority (100) is higher than `/api/v2`'s (1) - the higher
        // priority route must win regardless of which node the trie itself resolves to.
        let shallow_high_priority = route("shallow", MatchType::Prefix, "/api", 100);
        let deep_low_priority = route("deep", MatchType::Prefix, "/api/v2", 1);
        let index = RouteIndex::build(vec![shallow_high_priority, deep_low_priority]);

        let req = request("/api/v2/x");
        let matched = index.match_request(&req).unwrap();
        assert_eq!(matched.name(), "shallow");
    }
}
