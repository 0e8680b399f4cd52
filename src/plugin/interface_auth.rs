use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use http::StatusCode;
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use pingora_proxy::Session;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::core::{ProxyContext, ProxyPlugin};
use crate::utils::request::{get_request_host, get_req_header_value};
use crate::utils::response::ResponseBuilder;

pub const PLUGIN_NAME: &str = "interface-auth";
const AUTH_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates the interface auth plugin (C9): a path whitelist (exact + wildcard regex)
/// checked first, then a bearer-token callout to an external validator for everything else.
pub fn create_interface_auth_plugin(cfg: JsonValue) -> Result<Arc<dyn ProxyPlugin>> {
    #[derive(Deserialize)]
    struct RawConfig {
        #[serde(default)]
        whitelist: Vec<String>,
        auth_api: String,
    }

    let raw: RawConfig = serde_json::from_value(cfg)
        .or_err_with(ReadError, || "invalid interface auth plugin config")?;

    let mut exact = Vec::new();
    let mut regexes = Vec::new();
    for pattern in raw.whitelist {
        if pattern.contains('*') {
            let translated = format!("^{}$", regex::escape(&pattern).replace(r"\*", ".*"));
            let re = Regex::new(&translated)
                .or_err_with(ReadError, || format!("invalid whitelist pattern: {pattern}"))?;
            regexes.push(re);
        } else {
            exact.push(pattern);
        }
    }

    Ok(Arc::new(PluginInterfaceAuth {
        auth_api: raw.auth_api,
        exact,
        regexes,
        client: reqwest::Client::builder()
            .timeout(AUTH_CALL_TIMEOUT)
            .build()
            .or_err(ReadError, "failed to build interface auth http client")?,
    }))
}

pub struct PluginInterfaceAuth {
    auth_api: String,
    exact: Vec<String>,
    regexes: Vec<Regex>,
    client: reqwest::Client,
}

impl PluginInterfaceAuth {
    fn is_whitelisted(&self, path: &str) -> bool {
        self.exact.iter().any(|p| p == path) || self.regexes.iter().any(|re| re.is_match(path))
    }
}

#[async_trait]
impl ProxyPlugin for PluginInterfaceAuth {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        let path = session.req_header().uri.path().to_string();

        if self.is_whitelisted(&path) {
            ctx.set("plugin_result_interface_auth", "whitelist");
            return Ok(false);
        }

        let token = match get_req_header_value(session.req_header(), "Authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                let cors_headers = ctx.cors_response_headers(session);
                ResponseBuilder::send_proxy_error(
                    session,
                    StatusCode::UNAUTHORIZED,
                    Some("missing or invalid bearer token"),
                    cors_headers.as_deref(),
                )
                .await?;
                return Ok(true);
            }
        };

        let host = get_request_host(session.req_header()).unwrap_or_default();
        let url = format!("http://{host}{}/{token}", self.auth_api);

        let outcome = self.client.get(&url).send().await;
        let body = match outcome {
            Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
            _ => {
                let cors_headers = ctx.cors_response_headers(session);
                ResponseBuilder::send_proxy_error(
                    session,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some("interface auth callout failed"),
                    cors_headers.as_deref(),
                )
                .await?;
                return Ok(true);
            }
        };

        match body.trim() {
            "false" => {
                ctx.set("plugin_result_interface_auth", "success");
                Ok(false)
            }
            "true" => {
                let cors_headers = ctx.cors_response_headers(session);
                ResponseBuilder::send_proxy_error(
                    session,
                    StatusCode::FORBIDDEN,
                    Some("interface auth denied the request"),
                    cors_headers.as_deref(),
                )
                .await?;
                Ok(true)
            }
            _ => {
                let cors_headers = ctx.cors_response_headers(session);
                ResponseBuilder::send_proxy_error(
                    session,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some("interface auth returned an unexpected response"),
                    cors_headers.as_deref(),
                )
                .await?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(whitelist: &[&str]) -> PluginInterfaceAuth {
        let mut exact = Vec::new();
        let mut regexes = Vec::new();
        for pattern in whitelist {
            if pattern.contains('*') {
                let translated = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
                regexes.push(Regex::new(&translated).unwrap());
            } else {
                exact.push(pattern.to_string());
            }
        }
        PluginInterfaceAuth {
            auth_api: "/auth".to_string(),
            exact,
            regexes,
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn exact_whitelist_entries_match_only_themselves() {
        let plugin = plugin(&["/info"]);
        assert!(plugin.is_whitelisted("/info"));
        assert!(!plugin.is_whitelisted("/info/extra"));
    }

    #[test]
    fn wildcard_whitelist_entries_match_the_subtree() {
        let plugin = plugin(&["/verification/*"]);
        assert!(plugin.is_whitelisted("/verification/abc"));
        assert!(!plugin.is_whitelisted("/other"));
    }
}
