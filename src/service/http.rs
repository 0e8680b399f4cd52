//! The `ProxyHttp` implementation: the dispatcher (C5) wired into pingora's request
//! lifecycle, plus the reverse-proxy engine (C6) hooks that rewrite the outbound request
//! and decide on retries.
//!
//! Per spec §4.3, a request's path is: match a route, run its plugin chain, then either
//! answer it internally or forward it upstream. `request_filter` is the pingora phase that
//! can short-circuit, so that is where routing and the plugin chain both happen; everything
//! after (`upstream_peer` onward) only runs for requests the chain let through to a real
//! upstream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::core::{ConfigStore, ProxyContext, ProxyError};
use crate::proxy::upstream::{peer_for, rewrite_upstream_request, should_retry};

/// The built-in health endpoint (spec §6): bypasses route matching and the plugin chain
/// entirely.
const HEALTH_CHECK_PATH: &str = "/gatewaygo/health";

/// The gateway's `ProxyHttp` service. Holds only a handle to the hot-reloadable config
/// store (C1) - everything else a request needs (routes, chains, plugin instances) is
/// reached through the snapshot loaded at the start of the request.
pub struct HttpService {
    store: Arc<ConfigStore>,
}

impl HttpService {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    async fn write_health_check(session: &mut Session) -> Result<()> {
        let body = br#"{"status":"ok"}"#.to_vec();
        let mut resp = ResponseHeader::build(StatusCode::OK, None)?;
        resp.insert_header(http::header::CONTENT_TYPE, "application/json")?;
        resp.insert_header(http::header::CONTENT_LENGTH, body.len().to_string())?;
        session.write_response_header(Box::new(resp), false).await?;
        session
            .write_response_body(Some(Bytes::from(body)), true)
            .await?;
        Ok(())
    }

    /// Writes the route's declared `internal://` response (spec §3/§4.3 step 5), falling
    /// back to a plain 200 if the route somehow lacks one (schema validation should already
    /// have rejected that config, but the dispatcher still has to answer *something*).
    /// `cors_headers` carries the route's CORS decoration, if any (spec §4.10 applies to
    /// every non-preflight response for the route, internal ones included).
    async fn write_internal_response(
        session: &mut Session,
        response: Option<&crate::config::InternalResponse>,
        cors_headers: Option<&[(String, String)]>,
    ) -> Result<()> {
        let (status, content, content_type) = match response {
            Some(r) => (r.status, r.content.as_str(), r.content_type.as_str()),
            None => (200, "gateway-go is running", "text/plain"),
        };
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        let body = content.as_bytes().to_vec();
        let mut resp = ResponseHeader::build(status, None)?;
        resp.insert_header(http::header::CONTENT_TYPE, content_type)?;
        resp.insert_header(http::header::CONTENT_LENGTH, body.len().to_string())?;
        if let Some(headers) = cors_headers {
            for (name, value) in headers {
                resp.insert_header(name.clone(), value.clone())?;
            }
        }
        session.write_response_header(Box::new(resp), false).await?;
        session
            .write_response_body(Some(Bytes::from(body)), true)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyHttp for HttpService {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    /// The dispatcher (C5): match a route, run its chain, and either answer the request
    /// directly (health check, no-match, internal response, plugin short-circuit/failure)
    /// or let it fall through to `upstream_peer`.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let req = session.req_header();
        if req.method == Method::GET && req.uri.path() == HEALTH_CHECK_PATH {
            Self::write_health_check(session).await?;
            return Ok(true);
        }

        let snapshot = self.store.load();
        let route = match snapshot.route_index.match_request(req) {
            Some(route) => route,
            None => {
                ProxyError::RouteMiss.write_to(session).await?;
                return Ok(true);
            }
        };

        ctx.route = Some(route.clone());

        match route.chain.request_filter(session, ctx).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => {
                let cors_headers = ctx.cors_response_headers(session);
                ProxyError::Internal(e.to_string())
                    .write_to_with_headers(session, cors_headers.as_deref())
                    .await?;
                return Ok(true);
            }
        }

        if route.config.target.is_internal() {
            let cors_headers = ctx.cors_response_headers(session);
            Self::write_internal_response(
                session,
                route.config.response.as_ref(),
                cors_headers.as_deref(),
            )
            .await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn request_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(route) = ctx.route.clone() else {
            return Ok(());
        };
        route
            .chain
            .request_body_filter(session, body, end_of_stream, ctx)
            .await
    }

    /// The reverse-proxy engine (C6): turn the matched route's single target into the
    /// `HttpPeer` pingora should connect to.
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let route = ctx
            .route
            .as_ref()
            .ok_or_else(|| Box::<Error>::from(ProxyError::Internal("no route bound to context".into())))?;
        peer_for(&route.config.target)
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(route) = ctx.route.clone() else {
            return Ok(());
        };
        route
            .chain
            .upstream_request_filter(session, upstream_request, ctx)
            .await?;
        rewrite_upstream_request(&route, upstream_request)
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(route) = ctx.route.clone() else {
            return Ok(());
        };
        route
            .chain
            .response_filter(session, upstream_response, ctx)
            .await
    }

    fn response_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        if let Some(route) = ctx.route.clone() {
            route
                .chain
                .response_body_filter(session, body, end_of_stream, ctx)?;
        }
        Ok(None)
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        if let Some(route) = ctx.route.clone() {
            route.chain.logging(session, e, ctx).await;
        }
    }

    /// Called when establishing the upstream connection fails. Per spec §4.4, a retry is
    /// only granted for idempotent methods, within `target.retries`, and without an overall
    /// budget beyond that (the per-route `timeout_ms` already bounds each individual try via
    /// the peer's connect/read/write timeouts set in `peer_for`).
    fn fail_to_connect(
        &self,
        session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        let Some(route) = ctx.route.as_ref() else {
            return e;
        };

        let method = session.req_header().method.clone();
        if should_retry(&method, &route.config.target, ctx.tries) {
            ctx.tries += 1;
            e.set_retry(true);
        }
        e
    }
}
