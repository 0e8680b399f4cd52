pub mod circuit_breaker;
pub mod consistency;
pub mod cors;
pub mod interface_auth;
pub mod ip_whitelist;
pub mod rate_limit;

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::core::PluginCreateFn;

/// Global registry mapping plugin names to their factory functions.
///
/// Chain position is not a property of the plugin type: it comes from each route's
/// `AvailablePlugin.order` in the config (ascending, ties broken by declaration order in
/// the route's plugin list - spec §4.2), resolved when a route's chain is built
/// (`core::Snapshot::build`).
static PLUGIN_BUILDER_REGISTRY: Lazy<HashMap<&'static str, PluginCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, PluginCreateFn)> = vec![
        (
            circuit_breaker::PLUGIN_NAME,
            circuit_breaker::create_circuit_breaker_plugin,
        ),
        (
            consistency::PLUGIN_NAME,
            consistency::create_consistency_plugin,
        ),
        (
            interface_auth::PLUGIN_NAME,
            interface_auth::create_interface_auth_plugin,
        ),
        (
            ip_whitelist::PLUGIN_NAME,
            ip_whitelist::create_ip_whitelist_plugin,
        ),
        (rate_limit::PLUGIN_NAME, rate_limit::create_rate_limit_plugin),
        (cors::PLUGIN_NAME, cors::create_cors_plugin),
    ];
    arr.into_iter().collect()
});

/// The full plugin factory registry, for building/rebuilding an entire config snapshot
/// (`core::Snapshot::build`) rather than a single named plugin.
pub fn registry() -> &'static HashMap<&'static str, PluginCreateFn> {
    &PLUGIN_BUILDER_REGISTRY
}
