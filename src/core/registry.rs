use std::{collections::HashMap, sync::Arc};

use pingora::OkOrErr;
use pingora_error::{ErrorType::ReadError, Result};
use serde_json::Value as JsonValue;

use crate::config::AvailablePlugin;

use super::plugin::{PluginCreateFn, ProxyPlugin};

/// Looks up `name` in the static plugin registry (`crate::plugin::PLUGIN_BUILDER_REGISTRY`)
/// and builds an instance from `cfg`. Fails for unknown plugin names.
pub fn build_plugin(
    registry: &HashMap<&'static str, PluginCreateFn>,
    name: &str,
    cfg: JsonValue,
) -> Result<Arc<dyn ProxyPlugin>> {
    let builder = registry.get(name).or_err(ReadError, "unknown plugin type")?;
    builder(cfg)
}

/// A previously-built plugin instance plus the config it was built from, kept around so a
/// config reload can decide whether to reuse it.
pub type PluginInstance = (JsonValue, Arc<dyn ProxyPlugin>);

/// Builds the full `AvailablePlugin` set for a new snapshot.
///
/// Per spec §5, a reload must preserve in-memory plugin state (rate limiter buckets,
/// circuit breaker windows, nonce replay stores, ...) across a reload when a plugin's
/// name and config are unchanged, and must only construct fresh instances, calling
/// `stop()` on whatever they replace, for plugins whose config actually changed.
pub fn build_available_plugins(
    registry: &HashMap<&'static str, PluginCreateFn>,
    available: &[AvailablePlugin],
    previous: Option<&HashMap<String, PluginInstance>>,
) -> Result<(HashMap<String, PluginInstance>, Vec<Arc<dyn ProxyPlugin>>)> {
    let mut built = HashMap::with_capacity(available.len());
    let mut retired = Vec::new();

    for plugin_cfg in available.iter().filter(|p| p.enabled) {
        let reused = previous
            .and_then(|prev| prev.get(&plugin_cfg.name))
            .filter(|(cfg, _)| *cfg == plugin_cfg.config);

        let instance = match reused {
            Some((cfg, instance)) => (cfg.clone(), instance.clone()),
            None => {
                let instance = build_plugin(registry, &plugin_cfg.name, plugin_cfg.config.clone())?;
                (plugin_cfg.config.clone(), instance)
            }
        };
        built.insert(plugin_cfg.name.clone(), instance);
    }

    if let Some(prev) = previous {
        for (name, (_, instance)) in prev.iter() {
            if built
                .get(name)
                .map(|(_, new_instance)| !Arc::ptr_eq(new_instance, instance))
                .unwrap_or(true)
            {
                retired.push(instance.clone());
            }
        }
    }

    Ok((built, retired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopPlugin(&'static str);

    #[async_trait]
    impl ProxyPlugin for NoopPlugin {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn test_registry() -> HashMap<&'static str, PluginCreateFn> {
        let mut map: HashMap<&'static str, PluginCreateFn> = HashMap::new();
        map.insert("noop", |_cfg| Ok(Arc::new(NoopPlugin("noop"))));
        map
    }

    #[test]
    fn unchanged_config_reuses_the_same_instance() {
        let registry = test_registry();
        let available = vec![AvailablePlugin {
            name: "noop".to_string(),
            enabled: true,
            order: 0,
            config: JsonValue::Null,
        }];

        let (first, retired) = build_available_plugins(&registry, &available, None).unwrap();
        assert!(retired.is_empty());

        let (second, retired) =
            build_available_plugins(&registry, &available, Some(&first)).unwrap();
        assert!(retired.is_empty());
        assert!(Arc::ptr_eq(&first["noop"].1, &second["noop"].1));
    }

    #[test]
    fn changed_config_retires_the_old_instance() {
        let registry = test_registry();
        let v1 = vec![AvailablePlugin {
            name: "noop".to_string(),
            enabled: true,
            order: 0,
            config: JsonValue::Null,
        }];
        let v2 = vec![AvailablePlugin {
            name: "noop".to_string(),
            enabled: true,
            order: 0,
            config: JsonValue::Bool(true),
        }];

        let (first, _) = build_available_plugins(&registry, &v1, None).unwrap();
        let (second, retired) = build_available_plugins(&registry, &v2, Some(&first)).unwrap();
        assert_eq!(retired.len(), 1);
        assert!(!Arc::ptr_eq(&first["noop"].1, &second["noop"].1));
    }
}
