use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use dashmap::DashMap;
use http::StatusCode;
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use pingora_proxy::Session;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use validator::Validate;

use crate::core::{ProxyContext, ProxyPlugin};
use crate::utils::request::get_client_ip;
use crate::utils::response::ResponseBuilder;

pub const PLUGIN_NAME: &str = "rate-limit";

const IDLE_EVICTION: Duration = Duration::from_secs(5 * 60);
const JANITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Creates a token-bucket rate limiter plugin (C7): lazy refill on each request, keyed by
/// either the client IP or the request path, with idle buckets evicted by a background
/// janitor every five minutes.
pub fn create_rate_limit_plugin(cfg: JsonValue) -> Result<Arc<dyn ProxyPlugin>> {
    let config: PluginConfig =
        serde_json::from_value(cfg).or_err_with(ReadError, || "invalid rate limit plugin config")?;
    config
        .validate()
        .or_err_with(ReadError, || "invalid rate limit plugin config")?;

    Ok(Arc::new(PluginRateLimit::new(config)))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RateLimitKey {
    ClientIp,
    Path,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct PluginConfig {
    key_type: RateLimitKey,
    /// Tokens replenished per second.
    #[validate(range(min = 0.0))]
    rate: f64,
    /// Maximum number of tokens a bucket can hold (the burst size).
    #[validate(range(min = 1))]
    capacity: u64,
    #[serde(default = "PluginConfig::default_rejected_code")]
    rejected_code: u16,
}

impl PluginConfig {
    fn default_rejected_code() -> u16 {
        429
    }
}

struct BucketState {
    tokens: f64,
    last_refill_ns: u64,
    last_used_ns: AtomicU64,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

pub struct PluginRateLimit {
    config: PluginConfig,
    buckets: Arc<DashMap<String, Mutex<BucketState>>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl PluginRateLimit {
    fn new(config: PluginConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(DashMap::new()),
            janitor: Mutex::new(None),
        }
    }

    /// Spawns the eviction janitor on first use rather than from `new()`: plugin instances
    /// are built while assembling a config snapshot, which can happen before the process
    /// has entered pingora's own tokio runtime (e.g. the very first snapshot in `main`), and
    /// `tokio::spawn` outside a runtime panics. `request_filter` always runs inside it.
    fn ensure_janitor(&self) {
        let mut guard = self.janitor.lock().expect("janitor handle poisoned");
        if guard.is_none() {
            *guard = Some(spawn_janitor(self.buckets.clone()));
        }
    }

    fn key_for(&self, session: &mut Session) -> String {
        match self.config.key_type {
            RateLimitKey::ClientIp => get_client_ip(session),
            RateLimitKey::Path => session.req_header().uri.path().to_string(),
        }
    }

    /// Lazily refills the bucket for `key` and attempts to consume one token. Uses
    /// entry-or-insert on the concurrent map (a double-checked-locking insert: the first
    /// caller to observe a missing key wins the race to create it) followed by a per-bucket
    /// mutex for the refill/consume step.
    fn try_consume(&self, key: &str) -> bool {
        let now = now_ns();

        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(BucketState {
                tokens: self.config.capacity as f64,
                last_refill_ns: now,
                last_used_ns: AtomicU64::new(now),
            })
        });

        let mut bucket = entry.lock().expect("rate limit bucket poisoned");
        let elapsed_sec = (now.saturating_sub(bucket.last_refill_ns)) as f64 / 1_000_000_000.0;
        let new_tokens = (elapsed_sec * self.config.rate).floor();
        let refilled = bucket.tokens + new_tokens;
        bucket.tokens = refilled.min(self.config.capacity as f64);
        bucket.last_refill_ns = now;
        bucket.last_used_ns.store(now, Ordering::Relaxed);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

fn spawn_janitor(buckets: Arc<DashMap<String, Mutex<BucketState>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            interval.tick().await;
            let now = now_ns();
            buckets.retain(|_, bucket| {
                let last_used = bucket.lock().expect("rate limit bucket poisoned").last_used_ns.load(Ordering::Relaxed);
                Duration::from_nanos(now.saturating_sub(last_used)) < IDLE_EVICTION
            });
        }
    })
}

#[async_trait]
impl ProxyPlugin for PluginRateLimit {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        self.ensure_janitor();
        let key = self.key_for(session);

        if self.try_consume(&key) {
            return Ok(false);
        }

        session.set_keepalive(None);
        let cors_headers = ctx.cors_response_headers(session);
        ResponseBuilder::send_proxy_error(
            session,
            StatusCode::from_u16(self.config.rejected_code)
                .unwrap_or(StatusCode::TOO_MANY_REQUESTS),
            Some("rate limit exceeded"),
            cors_headers.as_deref(),
        )
        .await?;
        Ok(true)
    }

    fn stop(&self) {
        if let Some(handle) = self.janitor.lock().expect("janitor handle poisoned").take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: f64, capacity: u64) -> PluginConfig {
        PluginConfig {
            key_type: RateLimitKey::ClientIp,
            rate,
            capacity,
            rejected_code: 429,
        }
    }

    #[tokio::test]
    async fn admits_up_to_capacity_then_denies() {
        let plugin = PluginRateLimit::new(config(0.0, 1));
        assert!(plugin.try_consume("k"));
        assert!(!plugin.try_consume("k"));
        plugin.stop();
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_buckets() {
        let plugin = PluginRateLimit::new(config(0.0, 1));
        assert!(plugin.try_consume("a"));
        assert!(plugin.try_consume("b"));
        plugin.stop();
    }
}
