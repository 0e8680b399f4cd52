//! Single-target upstream dispatch (C6).
//!
//! Multi-backend load balancing, service discovery and health checking are explicitly out
//! of scope: a route's `target` names exactly one upstream, and this module's job is
//! limited to turning it into an `HttpPeer`, rewriting the request on its way out, and
//! deciding whether a failed connection attempt deserves a retry.

use std::time::Duration;

use http::Uri;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError, OrErr, Result};
use pingora_http::RequestHeader;

use crate::config::{MatchType, Target};
use crate::core::ProxyRoute;

/// Builds the `HttpPeer` a request should be proxied to, per the route's `target.url`.
///
/// `target.url` must be a full `http://` or `https://` origin (`internal://` targets never
/// reach this function - they're answered directly by the dispatcher).
pub fn peer_for(target: &Target) -> Result<Box<HttpPeer>> {
    let uri: Uri = target
        .url
        .parse()
        .or_err_with(InternalError, || format!("invalid target url: {}", target.url))?;

    let tls = uri.scheme_str() == Some("https");
    let host = uri
        .host()
        .ok_or_else(|| Error::explain(InternalError, format!("target url has no host: {}", target.url)))?
        .to_string();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

    let address = format!("{host}:{port}");
    let mut peer = Box::new(HttpPeer::new(&address, tls, host));
    let timeout = Duration::from_millis(target.timeout_ms);
    peer.options.connection_timeout = Some(timeout);
    peer.options.read_timeout = Some(timeout);
    peer.options.write_timeout = Some(timeout);
    Ok(peer)
}

/// Strips the matched route prefix from the request path when the route is a `prefix`
/// match on anything other than `/`, then sets `X-Forwarded-Host`/`X-Origin-Host` and
/// rewrites the `Host` header to the upstream's own host.
pub fn rewrite_upstream_request(route: &ProxyRoute, upstream_request: &mut RequestHeader) -> Result<()> {
    let m = &route.config.r#match;

    if m.r#type == MatchType::Prefix && m.path != "/" {
        let prefix = m.path.trim_end_matches('/');
        let path = upstream_request.uri.path();
        let stripped = path.strip_prefix(prefix).unwrap_or(path);
        let stripped = if stripped.is_empty() { "/" } else { stripped };

        let new_path_and_query = match upstream_request.uri.query() {
            Some(q) => format!("{stripped}?{q}"),
            None => stripped.to_string(),
        };
        let uri: Uri = new_path_and_query
            .parse()
            .or_err_with(InternalError, || format!("failed to rewrite path: {new_path_and_query}"))?;
        upstream_request.set_uri(uri);
    }

    if let Some(host) = upstream_request
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    {
        upstream_request.insert_header("x-forwarded-host", &host)?;
    }

    let target_uri: Uri = route.config.target.url.parse().ok().unwrap_or_default();
    if let Some(upstream_host) = target_uri.host() {
        upstream_request.insert_header("x-origin-host", upstream_host)?;
        upstream_request.insert_header(http::header::HOST, upstream_host)?;
    }

    Ok(())
}

/// `true` iff a fresh attempt against the target should be made after a failed connection,
/// per spec §4.4: only idempotent methods are retried, and never beyond `target.retries`.
pub fn should_retry(method: &http::Method, target: &Target, tries: u32) -> bool {
    if tries >= target.retries {
        return false;
    }
    matches!(
        *method,
        http::Method::GET | http::Method::HEAD | http::Method::OPTIONS | http::Method::PUT | http::Method::DELETE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::{InternalResponse, Route, RouteMatch};
    use crate::core::{PluginChain, ProxyRoute};
    use pingora_http::RequestHeader;
    use std::sync::Arc;

    fn route(match_type: MatchType, path: &str, target_url: &str) -> ProxyRoute {
        let cfg = Route {
            name: "r".to_string(),
            r#match: RouteMatch {
                r#type: match_type,
                path: path.to_string(),
                priority: 0,
                host: None,
                method: vec![],
                headers: HashMap::new(),
                query_params: HashMap::new(),
            },
            target: Target {
                url: target_url.to_string(),
                timeout_ms: 5000,
                retries: 1,
            },
            plugins: vec![],
            response: None::<InternalResponse>,
        };
        ProxyRoute::new(cfg, Arc::new(PluginChain::new(vec![]))).unwrap()
    }

    #[test]
    fn peer_defaults_to_port_80_for_plain_http() {
        let target = Target {
            url: "http://upstream.internal".to_string(),
            timeout_ms: 1000,
            retries: 0,
        };
        let peer = peer_for(&target).unwrap();
        assert_eq!(peer._address.to_string(), "upstream.internal:80");
    }

    #[test]
    fn prefix_routes_strip_their_matched_prefix() {
        let route = route(MatchType::Prefix, "/api", "http://upstream:9000");
        let mut req = RequestHeader::build("GET", b"/api/widgets?x=1", None).unwrap();
        rewrite_upstream_request(&route, &mut req).unwrap();
        assert_eq!(req.uri.path(), "/widgets");
        assert_eq!(req.uri.query(), Some("x=1"));
    }

    #[test]
    fn exact_routes_leave_the_path_untouched() {
        let route = route(MatchType::Exact, "/health", "http://upstream:9000");
        let mut req = RequestHeader::build("GET", b"/health", None).unwrap();
        rewrite_upstream_request(&route, &mut req).unwrap();
        assert_eq!(req.uri.path(), "/health");
    }

    #[test]
    fn retries_are_bounded_by_the_configured_limit() {
        let target = Target {
            url: "http://u".to_string(),
            timeout_ms: 1000,
            retries: 2,
        };
        assert!(should_retry(&http::Method::GET, &target, 0));
        assert!(should_retry(&http::Method::GET, &target, 1));
        assert!(!should_retry(&http::Method::GET, &target, 2));
    }

    #[test]
    fn non_idempotent_methods_are_never_retried() {
        let target = Target {
            url: "http://u".to_string(),
            timeout_ms: 1000,
            retries: 5,
        };
        assert!(!should_retry(&http::Method::POST, &target, 0));
    }
}
