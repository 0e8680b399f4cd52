//! Cross-origin resource sharing plugin (C12).

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::core::{ProxyContext, ProxyPlugin};
use crate::utils::request::get_req_header_value;

pub const PLUGIN_NAME: &str = "cors";

pub fn create_cors_plugin(cfg: JsonValue) -> Result<Arc<dyn ProxyPlugin>> {
    let raw: RawConfig =
        serde_json::from_value(cfg).or_err_with(ReadError, || "invalid cors plugin config")?;

    let origin_regexes = raw
        .allow_origins_by_regex
        .iter()
        .map(|pattern| Regex::new(pattern).or_err_with(ReadError, || format!("invalid cors origin regex: {pattern}")))
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(PluginCors {
        allow_origins: raw.allow_origins,
        origin_regexes,
        allow_methods: raw.allow_methods,
        allow_headers: raw.allow_headers,
        expose_headers: raw.expose_headers,
        max_age: raw.max_age,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
struct RawConfig {
    /// Exact origin strings, or `"*"` to allow any origin.
    #[serde(default = "RawConfig::default_star")]
    allow_origins: String,
    #[serde(default)]
    allow_origins_by_regex: Vec<String>,
    #[serde(default = "RawConfig::default_star")]
    allow_methods: String,
    #[serde(default = "RawConfig::default_star")]
    allow_headers: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expose_headers: Option<String>,
    #[serde(default = "RawConfig::default_max_age")]
    max_age: i32,
}

impl RawConfig {
    fn default_star() -> String {
        "*".to_string()
    }

    fn default_max_age() -> i32 {
        5
    }
}

pub struct PluginCors {
    allow_origins: String,
    origin_regexes: Vec<Regex>,
    allow_methods: String,
    allow_headers: String,
    expose_headers: Option<String>,
    max_age: i32,
}

impl PluginCors {
    fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.allow_origins == "*" {
            return true;
        }
        if self.allow_origins.split(',').map(str::trim).any(|o| o == origin) {
            return true;
        }
        self.origin_regexes.iter().any(|re| re.is_match(origin))
    }

    /// Headers this plugin would apply to a non-preflight response for `origin` - the same
    /// pair `response_filter` sets on an upstream response, generalized so any final
    /// response for the route (a plugin denial, an internal response, a dispatcher error)
    /// can be decorated the same way regardless of where it's written from.
    fn headers_for_origin(&self, origin: &str) -> Option<Vec<(String, String)>> {
        if !self.is_origin_allowed(origin) {
            return None;
        }
        let mut headers = vec![("access-control-allow-origin".to_string(), origin.to_string())];
        if let Some(expose) = &self.expose_headers {
            headers.push(("access-control-expose-headers".to_string(), expose.clone()));
        }
        Some(headers)
    }

    fn apply_headers(&self, resp: &mut ResponseHeader, origin: &str) -> Result<()> {
        resp.insert_header("access-control-allow-origin", origin)?;
        resp.insert_header("access-control-allow-methods", self.allow_methods.as_str())?;
        resp.insert_header("access-control-allow-headers", self.allow_headers.as_str())?;
        if let Some(expose) = &self.expose_headers {
            resp.insert_header("access-control-expose-headers", expose)?;
        }
        resp.insert_header("access-control-max-age", self.max_age.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl ProxyPlugin for PluginCors {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn request_filter(&self, session: &mut Session, _ctx: &mut ProxyContext) -> Result<bool> {
        if session.req_header().method != Method::OPTIONS {
            return Ok(false);
        }

        let origin = get_req_header_value(session.req_header(), "Origin").map(|o| o.to_string());
        let allowed = origin.as_deref().map(|o| self.is_origin_allowed(o)).unwrap_or(false);

        let mut resp = if allowed {
            let mut resp = ResponseHeader::build(StatusCode::OK, None)?;
            self.apply_headers(&mut resp, origin.as_deref().unwrap())?;
            resp
        } else {
            ResponseHeader::build(StatusCode::FORBIDDEN, None)?
        };

        resp.insert_header("content-length", "0")?;
        session.write_response_header(Box::new(resp), true).await?;
        Ok(true)
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        let Some(origin) = get_req_header_value(session.req_header(), "Origin") else {
            return Ok(());
        };
        if !self.is_origin_allowed(origin) {
            return Ok(());
        }

        upstream_response.insert_header("access-control-allow-origin", origin)?;
        if let Some(expose) = &self.expose_headers {
            upstream_response.insert_header("access-control-expose-headers", expose)?;
        }
        Ok(())
    }

    fn cors_response_headers(&self, origin: &str) -> Option<Vec<(String, String)>> {
        self.headers_for_origin(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(allow_origins: &str, regexes: &[&str]) -> PluginCors {
        PluginCors {
            allow_origins: allow_origins.to_string(),
            origin_regexes: regexes.iter().map(|r| Regex::new(r).unwrap()).collect(),
            allow_methods: "GET,POST".to_string(),
            allow_headers: "*".to_string(),
            expose_headers: None,
            max_age: 5,
        }
    }

    #[test]
    fn star_allows_any_origin() {
        let plugin = plugin("*", &[]);
        assert!(plugin.is_origin_allowed("https://example.com"));
    }

    #[test]
    fn exact_list_only_allows_listed_origins() {
        let plugin = plugin("https://a.com,https://b.com", &[]);
        assert!(plugin.is_origin_allowed("https://a.com"));
        assert!(!plugin.is_origin_allowed("https://c.com"));
    }

    #[test]
    fn regex_entries_match_subdomains() {
        let plugin = plugin("https://a.com", &[r"^https://.*\.test\.com$"]);
        assert!(plugin.is_origin_allowed("https://x.test.com"));
        assert!(!plugin.is_origin_allowed("https://test.com"));
    }
}
