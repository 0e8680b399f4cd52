use std::{collections::HashMap, sync::Arc};

use pingora_proxy::Session;

use crate::core::route_index::ProxyRoute;
use crate::utils::request::get_req_header_value;

/// Per-request state threaded through every `ProxyHttp` phase.
///
/// `vars` is the general-purpose scratch space plugins use to pass data forward to later
/// phases of the same request (rate-limit quota headers, the plugin-result cache payload,
/// the auth principal, etc). Keys published by the plugin-result cache are always prefixed
/// `plugin_result_<name>` so a cache hit can restore exactly the keys a fresh run would have
/// produced without guessing at plugin-specific state.
pub struct ProxyContext {
    /// The route this request matched, set in `request_filter`. `None` means the
    /// dispatcher already answered with a 404 and no further phase should touch it.
    pub route: Option<Arc<ProxyRoute>>,
    vars: HashMap<String, String>,
    /// Upstream connection attempts made so far, used by the retry budget in
    /// `fail_to_connect`.
    pub tries: u32,
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self {
            route: None,
            vars: HashMap::new(),
            tries: 0,
        }
    }
}

impl ProxyContext {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    /// All context keys currently published, with their values. Used by the plugin-result
    /// cache to snapshot what a plugin run produced and to restore it on a later hit.
    pub fn vars_with_prefix(&self, prefix: &str) -> HashMap<String, String> {
        self.vars
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn extend_vars(&mut self, entries: HashMap<String, String>) {
        self.vars.extend(entries);
    }

    /// CORS headers that should be layered onto whatever final response this request gets,
    /// regardless of which plugin (or the dispatcher itself) produces it - spec §4.10 applies
    /// CORS decoration unconditionally to every non-preflight request for the route, not only
    /// ones that make it all the way to `response_filter`. `None` if no route is bound yet,
    /// the route has no CORS plugin, the request has no `Origin` header, or the origin isn't
    /// allowed.
    pub fn cors_response_headers(&self, session: &Session) -> Option<Vec<(String, String)>> {
        let route = self.route.as_ref()?;
        let origin = get_req_header_value(session.req_header(), "Origin")?;
        route.chain.cors_response_headers(origin)
    }
}
