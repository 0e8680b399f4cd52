use std::{collections::HashSet, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use http::StatusCode;
use ipnetwork::IpNetwork;
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use pingora_proxy::Session;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::core::{ProxyContext, ProxyPlugin};
use crate::utils::request::get_client_ip;
use crate::utils::response::ResponseBuilder;

pub const PLUGIN_NAME: &str = "ip-whitelist";

/// Creates the IP whitelist plugin (C10). An empty whitelist allows everything; otherwise
/// a request is admitted iff the client IP matches an exact entry or falls inside a CIDR.
pub fn create_ip_whitelist_plugin(cfg: JsonValue) -> Result<Arc<dyn ProxyPlugin>> {
    #[derive(Deserialize)]
    struct RawConfig {
        #[serde(default)]
        whitelist: Vec<String>,
    }

    let raw: RawConfig = serde_json::from_value(cfg)
        .or_err_with(ReadError, || "invalid ip whitelist plugin config")?;

    let mut exact = HashSet::new();
    let mut networks = Vec::new();
    for entry in raw.whitelist {
        if entry.contains('/') {
            let network = entry
                .parse::<IpNetwork>()
                .or_err_with(ReadError, || format!("invalid CIDR entry: {entry}"))?;
            networks.push(network);
        } else {
            let addr = entry
                .parse::<IpAddr>()
                .or_err_with(ReadError, || format!("invalid IP entry: {entry}"))?;
            exact.insert(addr);
        }
    }

    Ok(Arc::new(PluginIpWhitelist { exact, networks }))
}

pub struct PluginIpWhitelist {
    exact: HashSet<IpAddr>,
    networks: Vec<IpNetwork>,
}

impl PluginIpWhitelist {
    fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.exact.is_empty() && self.networks.is_empty() {
            return true;
        }
        self.exact.contains(&ip) || self.networks.iter().any(|n| n.contains(ip))
    }
}

#[async_trait]
impl ProxyPlugin for PluginIpWhitelist {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        let ip = get_client_ip(session).parse::<IpAddr>().ok();

        let allowed = match ip {
            Some(ip) => self.is_allowed(ip),
            None => false,
        };

        if allowed {
            return Ok(false);
        }

        let cors_headers = ctx.cors_response_headers(session);
        ResponseBuilder::send_proxy_error(
            session,
            StatusCode::FORBIDDEN,
            Some("client IP is not whitelisted"),
            cors_headers.as_deref(),
        )
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_whitelist_allows_everything() {
        let plugin = PluginIpWhitelist {
            exact: HashSet::new(),
            networks: Vec::new(),
        };
        assert!(plugin.is_allowed("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn exact_entry_matches_only_itself() {
        let mut exact = HashSet::new();
        exact.insert("10.0.0.1".parse::<IpAddr>().unwrap());
        let plugin = PluginIpWhitelist {
            exact,
            networks: Vec::new(),
        };
        assert!(plugin.is_allowed("10.0.0.1".parse().unwrap()));
        assert!(!plugin.is_allowed("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn cidr_entry_matches_the_whole_range() {
        let plugin = PluginIpWhitelist {
            exact: HashSet::new(),
            networks: vec!["192.168.1.0/24".parse().unwrap()],
        };
        assert!(plugin.is_allowed("192.168.1.42".parse().unwrap()));
        assert!(!plugin.is_allowed("192.168.2.1".parse().unwrap()));
    }
}
