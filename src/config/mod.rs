use std::{
    collections::{HashMap, HashSet},
    fs,
};

use http::Method;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_with::{serde_as, DisplayFromStr};
use validator::{Validate, ValidationError};

/// Root configuration structure: the Pingora framework config plus the gateway's own
/// server/log/plugins/routes sections (spec §6).
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_route_plugins"))]
pub struct Config {
    /// Pingora framework configuration (workers, daemonization, etc). Not part of the
    /// declarative gateway config; defaults apply when omitted from the YAML file.
    #[serde(default)]
    pub pingora: ServerConf,

    #[serde(default)]
    pub server: Server,

    #[serde(default)]
    pub log: Log,

    #[validate(nested)]
    #[serde(default)]
    pub plugins: PluginsSection,

    #[validate(nested)]
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Config {
    /// Loads configuration from YAML file with comprehensive validation.
    ///
    /// Synchronous loading is intentional - configuration should be validated
    /// at startup before any async operations begin.
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        log::debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    /// Main configuration loading entry point that combines file config with CLI overrides.
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    /// Parses YAML configuration string with comprehensive validation.
    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        log::trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        log::trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file validation failed")?;

        Self::validate_unique_route_names(&conf.routes)
            .or_err_with(FileReadError, || "Route name validation failed")?;

        Self::validate_unique_plugin_names(&conf.plugins.available)
            .or_err_with(FileReadError, || "Plugin name validation failed")?;

        Ok(conf)
    }

    /// Serializes configuration back to YAML, e.g. for `-t` diagnostics or debugging.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| {
            log::error!("Failed to serialize config to YAML: {e}");
            String::new()
        })
    }

    /// Applies CLI option overrides to loaded configuration.
    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_unique_route_names(routes: &[Route]) -> Result<()> {
        let mut names = HashSet::new();
        for route in routes {
            if !names.insert(route.name.as_str()) {
                return Error::e_explain(
                    FileReadError,
                    format!("Duplicate route name found: {}", route.name),
                );
            }
        }
        Ok(())
    }

    fn validate_unique_plugin_names(plugins: &[AvailablePlugin]) -> Result<()> {
        let mut names = HashSet::new();
        for plugin in plugins {
            if !names.insert(plugin.name.as_str()) {
                return Error::e_explain(
                    FileReadError,
                    format!("Duplicate available-plugin name found: {}", plugin.name),
                );
            }
        }
        Ok(())
    }

    /// Schema invariant from spec §3: every plugin name referenced by a route must exist
    /// in `plugins.available` and be enabled. A reload built from an invalid config must
    /// fail closed (caller keeps serving the previous snapshot).
    fn validate_route_plugins(&self) -> std::result::Result<(), ValidationError> {
        let enabled: HashSet<&str> = self
            .plugins
            .available
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.name.as_str())
            .collect();

        for route in &self.routes {
            for plugin_name in &route.plugins {
                if !enabled.contains(plugin_name.as_str()) {
                    let mut err = ValidationError::new("unknown_or_disabled_route_plugin");
                    err.add_param("route".into(), &route.name);
                    err.add_param("plugin".into(), plugin_name);
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}

/// `server` section of the config file (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Server {
    #[serde(default = "Server::default_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: ServerMode,
    #[serde(default = "Server::default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "Server::default_write_timeout")]
    pub write_timeout: u64,
    #[serde(default = "Server::default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "Server::default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            mode: ServerMode::default(),
            read_timeout: Self::default_read_timeout(),
            write_timeout: Self::default_write_timeout(),
            max_header_bytes: Self::default_max_header_bytes(),
            graceful_shutdown_timeout: Self::default_graceful_shutdown_timeout(),
        }
    }
}

impl Server {
    fn default_port() -> u16 {
        8080
    }
    fn default_read_timeout() -> u64 {
        30_000
    }
    fn default_write_timeout() -> u64 {
        30_000
    }
    fn default_max_header_bytes() -> usize {
        8192
    }
    fn default_graceful_shutdown_timeout() -> u64 {
        10_000
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Debug,
    #[default]
    Release,
}

/// `log` section of the config file (spec §6). Out-of-core (§1) collaborator: consumed
/// only by the `logging` module.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[serde(default = "Log::default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "Log::default_output")]
    pub output: String,
    #[serde(default = "Log::default_max_size")]
    pub max_size: u64,
    #[serde(default = "Log::default_max_age")]
    pub max_age: u64,
    #[serde(default = "Log::default_max_backups")]
    pub max_backups: u32,
    #[serde(default)]
    pub compress: bool,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            output: Self::default_output(),
            max_size: Self::default_max_size(),
            max_age: Self::default_max_age(),
            max_backups: Self::default_max_backups(),
            compress: false,
        }
    }
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }
    fn default_output() -> String {
        "/var/log/gateway/gateway.log".to_string()
    }
    fn default_max_size() -> u64 {
        100
    }
    fn default_max_age() -> u64 {
        7
    }
    fn default_max_backups() -> u32 {
        5
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `plugins` section of the config file (spec §3 `AvailablePlugin`, C2 Plugin Registry).
#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
pub struct PluginsSection {
    #[validate(nested)]
    #[serde(default)]
    pub available: Vec<AvailablePlugin>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct AvailablePlugin {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default = "AvailablePlugin::default_enabled")]
    pub enabled: bool,
    /// Smaller values execute earlier in the chain (spec §3).
    #[serde(default)]
    pub order: i32,
    #[serde(default = "AvailablePlugin::default_config")]
    pub config: JsonValue,
}

impl AvailablePlugin {
    fn default_enabled() -> bool {
        true
    }

    /// An empty object, not `Value::Null` - every plugin's own config struct derives
    /// `Deserialize` with `#[serde(default)]` fields throughout, which only round-trips
    /// through an empty map, not a JSON null (a plugin declared with no `config:` key at
    /// all must still build with all-default settings).
    fn default_config() -> JsonValue {
        JsonValue::Object(serde_json::Map::new())
    }
}

/// A `routes[]` entry (spec §3 `Route`).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Route::validate_internal_response"))]
pub struct Route {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(nested)]
    pub r#match: RouteMatch,

    #[validate(nested)]
    pub target: Target,

    #[serde(default)]
    pub plugins: Vec<String>,

    #[validate(nested)]
    pub response: Option<InternalResponse>,
}

impl Route {
    fn validate_internal_response(&self) -> std::result::Result<(), ValidationError> {
        if self.target.url.starts_with("internal://") && self.response.is_none() {
            return Err(ValidationError::new(
                "internal_route_requires_response",
            ));
        }
        Ok(())
    }
}

/// `match` sub-section of a route (spec §3 `RouteMatch`).
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct RouteMatch {
    pub r#type: MatchType,

    #[validate(length(min = 1))]
    pub path: String,

    #[serde(default)]
    pub priority: i32,

    pub host: Option<String>,

    #[serde(default)]
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub method: Vec<Method>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub query_params: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Prefix,
    Regex,
    Wildcard,
}

/// `target` sub-section of a route (spec §3 `Route.target`).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Target {
    #[validate(length(min = 1))]
    pub url: String,

    #[serde(default = "Target::default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retries: u32,
}

impl Target {
    fn default_timeout_ms() -> u64 {
        5_000
    }

    /// `true` for routes whose response is synthesized by the gateway itself
    /// (spec §3, §4.3 step 5; no outbound HTTP call is ever made for these).
    pub fn is_internal(&self) -> bool {
        self.url.starts_with("internal://")
    }
}

/// `response` sub-section of a route, used only when `target.url` is `internal://...`.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct InternalResponse {
    #[serde(default = "InternalResponse::default_status")]
    pub status: u16,
    #[serde(default)]
    pub content: String,
    #[serde(default = "InternalResponse::default_content_type")]
    pub content_type: String,
}

impl InternalResponse {
    fn default_status() -> u16 {
        200
    }
    fn default_content_type() -> String {
        "text/plain".to_string()
    }
}

/// Translates a `wildcard` route pattern (`*` globs) into an anchored regex, per spec §4.1.
pub fn wildcard_to_anchored_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    // `regex::escape` also escapes the `*` we want to treat as a glob; undo that escape
    // before re-expanding to `.*`.
    let translated = escaped.replace(r"\*", ".*");
    format!("^{translated}$")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_print_default_yaml() {
        init_log();
        let conf = Config::default();
        println!("{}", conf.to_yaml());
    }

    #[test]
    fn test_load_minimal_file() {
        init_log();
        let conf_str = r#"
server:
  port: 8080

plugins:
  available:
    - name: cors
      order: 10

routes:
  - name: health
    match:
      type: exact
      path: /health
      priority: 100
    target:
      url: "internal://default"
    response:
      status: 200
      content: "ok"
      content_type: "text/plain"
  - name: api
    match:
      type: prefix
      path: /api
      priority: 90
    target:
      url: "http://upstream:80"
      timeout_ms: 2000
      retries: 2
    plugins: [cors]
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(2, conf.routes.len());
        assert_eq!(1, conf.plugins.available.len());
        assert!(conf.routes[0].target.is_internal());
    }

    #[test]
    fn test_internal_route_requires_response() {
        init_log();
        let conf_str = r#"
routes:
  - name: health
    match:
      type: exact
      path: /health
      priority: 100
    target:
      url: "internal://default"
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_route_references_unknown_plugin() {
        init_log();
        let conf_str = r#"
routes:
  - name: api
    match:
      type: prefix
      path: /api
      priority: 1
    target:
      url: "http://upstream:80"
    plugins: [does-not-exist]
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_route_references_disabled_plugin() {
        init_log();
        let conf_str = r#"
plugins:
  available:
    - name: cors
      enabled: false

routes:
  - name: api
    match:
      type: prefix
      path: /api
      priority: 1
    target:
      url: "http://upstream:80"
    plugins: [cors]
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_duplicate_route_names() {
        init_log();
        let conf_str = r#"
routes:
  - name: api
    match:
      type: prefix
      path: /api
      priority: 1
    target:
      url: "http://upstream:80"
  - name: api
    match:
      type: prefix
      path: /other
      priority: 1
    target:
      url: "http://upstream:81"
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_wildcard_to_anchored_regex() {
        assert_eq!(wildcard_to_anchored_regex("/foo/*"), "^/foo/.*$");
        assert_eq!(wildcard_to_anchored_regex("/a.b/*"), r"^/a\.b/.*$");
    }
}
