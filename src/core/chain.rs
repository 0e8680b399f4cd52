use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pingora_error::{Error, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::Session;

use super::context::ProxyContext;
use super::plugin::ProxyPlugin;
use super::plugin_cache::{fingerprint, PluginResultCache};

/// An ordered, bound set of plugins for one route (C3).
///
/// `plugins` must already be in execution order (ascending `AvailablePlugin.order`, ties
/// broken by declaration order in the route's plugin list - spec §4.2); ordering is
/// resolved by the caller (`core::Snapshot::build`) from config that this type has no
/// access to, so `PluginChain` itself never reorders its plugins.
///
/// `request_filter` is the only phase wrapped with the result cache: a hit restores the
/// context keys the last successful (continuing) run published and skips calling the
/// plugin again this request. All other phases always run every plugin unconditionally,
/// since the cache only ever models "did request_filter's access-control decision change".
pub struct PluginChain {
    plugins: Vec<Arc<dyn ProxyPlugin>>,
    cache: PluginResultCache,
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn ProxyPlugin>>) -> Self {
        Self {
            plugins,
            cache: PluginResultCache::default(),
        }
    }

    pub fn plugins(&self) -> &[Arc<dyn ProxyPlugin>] {
        &self.plugins
    }

    /// CORS headers for `origin`, sourced from whichever plugin in this chain is the CORS
    /// plugin (there is at most one per route). `None` if the route has no CORS plugin or
    /// the origin is not allowed.
    pub fn cors_response_headers(&self, origin: &str) -> Option<Vec<(String, String)>> {
        self.plugins
            .iter()
            .find_map(|plugin| plugin.cors_response_headers(origin))
    }

    async fn run_one_request_filter(
        &self,
        plugin: &Arc<dyn ProxyPlugin>,
        session: &mut Session,
        ctx: &mut ProxyContext,
    ) -> Result<bool> {
        let prefix = format!("plugin_result_{}", plugin.name());
        let fp = {
            let req = session.req_header();
            fingerprint(
                plugin.name(),
                req.method.as_str(),
                req.uri.host(),
                req.uri.path(),
                req.uri.query(),
                &req.headers,
            )
        };

        if let Some(payload) = self.cache.get(fp) {
            ctx.extend_vars(payload);
            return Ok(false);
        }

        let outcome = plugin.request_filter(session, ctx).await?;
        if !outcome {
            let payload = ctx.vars_with_prefix(&prefix);
            if !payload.is_empty() {
                self.cache.put(fp, payload);
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl ProxyPlugin for PluginChain {
    fn name(&self) -> &str {
        "plugin-chain"
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        for plugin in &self.plugins {
            if self.run_one_request_filter(plugin, session, ctx).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn request_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in &self.plugins {
            plugin
                .request_body_filter(session, body, end_of_stream, ctx)
                .await?;
        }
        Ok(())
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in &self.plugins {
            plugin
                .upstream_request_filter(session, upstream_request, ctx)
                .await?;
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in &self.plugins {
            plugin
                .response_filter(session, upstream_response, ctx)
                .await?;
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in &self.plugins {
            plugin.response_body_filter(session, body, end_of_stream, ctx)?;
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut ProxyContext) {
        for plugin in &self.plugins {
            plugin.logging(session, e, ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedPlugin(&'static str);

    #[async_trait]
    impl ProxyPlugin for NamedPlugin {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn chain_preserves_the_order_it_was_built_with() {
        // Ordering (ascending `AvailablePlugin.order`, ties broken by declaration order)
        // is resolved by the caller before `PluginChain::new` is called - see
        // `core::Snapshot::build` - the chain itself never reorders its plugins.
        let first = Arc::new(NamedPlugin("first"));
        let second = Arc::new(NamedPlugin("second"));
        let chain = PluginChain::new(vec![first.clone(), second.clone()]);
        assert_eq!(chain.plugins()[0].name(), "first");
        assert_eq!(chain.plugins()[1].name(), "second");
    }
}
