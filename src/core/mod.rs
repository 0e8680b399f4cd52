//! Core gateway abstractions: the plugin contract and its execution chain, the route
//! matching engine, the plugin registry, and the hot-reloadable config snapshot.

pub mod chain;
pub mod context;
pub mod error;
pub mod plugin;
pub mod plugin_cache;
pub mod registry;
pub mod reload;
pub mod route_index;
pub mod snapshot;

pub use chain::PluginChain;
pub use context::ProxyContext;
pub use error::ProxyError;
pub use plugin::{PluginCreateFn, ProxyPlugin};
pub use registry::build_plugin;
pub use reload::ReloadWorker;
pub use route_index::{ProxyRoute, RouteIndex};
pub use snapshot::{ConfigStore, Snapshot};
