use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pingora_error::{Error, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::Session;

use super::context::ProxyContext;

/// A gateway policy plugin.
///
/// Plugins are bound into an ordered chain per route (C3) and run through each phase in
/// ascending `AvailablePlugin.order` (spec §4.2) - a property of the route's config, not of
/// the plugin type, so it is resolved once when the chain is built
/// (`core::Snapshot::build`) rather than exposed on this trait. `request_filter` is the
/// only phase that can short-circuit the request: it decides whether the request continues
/// down the chain, is answered directly by the plugin, or fails the request outright.
///
/// Implementations that publish context keys prefixed `plugin_result_<name>` from
/// `request_filter` and return `Ok(false)` become eligible for the chain's per-plugin
/// result cache (see `core::plugin_cache`); such plugins must not key their decision on
/// the request body, since the cache fingerprint never looks at it.
#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    /// Unique plugin name, matched against `AvailablePlugin.name` and `Route.plugins`.
    fn name(&self) -> &str;

    /// Inspect/validate the incoming request and its headers.
    ///
    /// * `Ok(true)` - a response was written to the session; the proxy should stop here.
    /// * `Ok(false)` - continue to the next plugin / to upstream dispatch.
    /// * `Err(_)` - the request failed; the dispatcher turns this into an error response.
    async fn request_filter(
        &self,
        _session: &mut Session,
        _ctx: &mut ProxyContext,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Observe (and optionally rewrite) a chunk of the request body as it streams in.
    async fn request_body_filter(
        &self,
        _session: &mut Session,
        _body: &mut Option<Bytes>,
        _end_of_stream: bool,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Modify the request just before it is sent to the upstream.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        _upstream_request: &mut RequestHeader,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Observe/modify the upstream response header before it goes to the client. This is
    /// the phase the circuit breaker and CORS plugins use to see the final response status
    /// and to inject headers respectively.
    async fn response_filter(
        &self,
        _session: &mut Session,
        _upstream_response: &mut ResponseHeader,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Observe/modify a chunk of the response body as it streams out.
    fn response_body_filter(
        &self,
        _session: &mut Session,
        _body: &mut Option<Bytes>,
        _end_of_stream: bool,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once the request is fully finished (success or failure). Used for metrics,
    /// access logging, and any idle-eviction bookkeeping.
    async fn logging(&self, _session: &mut Session, _e: Option<&Error>, _ctx: &mut ProxyContext) {}

    /// Called when this plugin instance is retired during a config reload (its name+config
    /// did not match any plugin in the new snapshot). Default is a no-op; plugins holding
    /// background resources (e.g. a janitor task) override this to release them.
    fn stop(&self) {}

    /// CORS response headers this plugin wants applied to the final response for `origin`,
    /// if any (spec §4.10: "continue" applies unconditionally to every non-preflight
    /// response for the route, not only ones that reach `response_filter`). Only the CORS
    /// plugin overrides this; every other plugin keeps the default so the chain/dispatcher
    /// can decorate a response with CORS headers no matter which plugin (or the dispatcher
    /// itself) ultimately produced it.
    fn cors_response_headers(&self, _origin: &str) -> Option<Vec<(String, String)>> {
        None
    }
}

/// Plugin factory signature used by the static registry in `crate::plugin`.
pub type PluginCreateFn = fn(serde_json::Value) -> Result<Arc<dyn ProxyPlugin>>;
