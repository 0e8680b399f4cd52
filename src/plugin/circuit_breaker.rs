//! Sliding-window circuit breaker (C8).
//!
//! Response-status observation is plumbed through pingora's native `logging` phase rather
//! than a hand-rolled response-writer wrapper: by the time `logging` runs, the session
//! already exposes the final response status (via `Session::response_written()`) and any
//! terminal error, which is exactly the signal the breaker needs to record an outcome.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use dashmap::DashMap;
use pingora_error::{Error, ErrorType::ReadError, OrErr, Result};
use pingora_proxy::Session;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use validator::Validate;

use crate::core::{ProxyContext, ProxyError, ProxyPlugin};

pub const PLUGIN_NAME: &str = "circuit-breaker";
const WINDOW_BUCKETS: usize = 10;
const IDLE_EVICTION: Duration = Duration::from_secs(30 * 60);
const JANITOR_INTERVAL: Duration = Duration::from_secs(30 * 60);

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

pub fn create_circuit_breaker_plugin(cfg: JsonValue) -> Result<Arc<dyn ProxyPlugin>> {
    let config: PluginConfig = serde_json::from_value(cfg)
        .or_err_with(ReadError, || "invalid circuit breaker plugin config")?;
    config
        .validate()
        .or_err_with(ReadError, || "invalid circuit breaker plugin config")?;
    Ok(Arc::new(PluginCircuitBreaker::new(config)))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct PluginConfig {
    /// Failure percentage threshold (0-100) that trips closed -> open.
    #[validate(range(min = 0, max = 100))]
    failure_threshold: u32,
    /// Success percentage threshold (0-100) that trips half-open -> closed.
    #[validate(range(min = 0, max = 100))]
    success_threshold: u32,
    /// Sliding window length in seconds, split into `WINDOW_BUCKETS` sub-buckets.
    #[validate(range(min = 1))]
    window_size: u64,
    /// Seconds an open breaker waits before allowing a half-open probe.
    #[validate(range(min = 1))]
    recovery_timeout: u64,
    /// Number of concurrent probe requests allowed while half-open.
    #[validate(range(min = 1))]
    half_open_quota: i64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Bucket {
    started_at_ns: u64,
    failures: u64,
    successes: u64,
}

/// Ring of sub-buckets covering `window_size` seconds total.
struct SlidingWindow {
    buckets: Mutex<VecDeque<Bucket>>,
    bucket_span_ns: u64,
    window_ns: u64,
}

impl SlidingWindow {
    fn new(window_size_secs: u64) -> Self {
        let window_ns = window_size_secs * 1_000_000_000;
        Self {
            buckets: Mutex::new(VecDeque::new()),
            bucket_span_ns: (window_ns / WINDOW_BUCKETS as u64).max(1),
            window_ns,
        }
    }

    fn record(&self, now: u64, failure: bool) {
        let mut buckets = self.buckets.lock().expect("breaker window poisoned");
        self.evict_stale(&mut buckets, now);

        let needs_new_bucket = match buckets.back() {
            Some(b) => now.saturating_sub(b.started_at_ns) >= self.bucket_span_ns,
            None => true,
        };
        if needs_new_bucket {
            buckets.push_back(Bucket {
                started_at_ns: now,
                failures: 0,
                successes: 0,
            });
            if buckets.len() > WINDOW_BUCKETS {
                buckets.pop_front();
            }
        }

        let current = buckets.back_mut().expect("bucket just inserted");
        if failure {
            current.failures += 1;
        } else {
            current.successes += 1;
        }
    }

    fn evict_stale(&self, buckets: &mut VecDeque<Bucket>, now: u64) {
        while let Some(front) = buckets.front() {
            if now.saturating_sub(front.started_at_ns) > self.window_ns {
                buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(failures, successes)` currently within the window.
    fn counts(&self, now: u64) -> (u64, u64) {
        let mut buckets = self.buckets.lock().expect("breaker window poisoned");
        self.evict_stale(&mut buckets, now);
        buckets
            .iter()
            .fold((0u64, 0u64), |(f, s), b| (f + b.failures, s + b.successes))
    }

    fn failure_ratio(&self, now: u64) -> f64 {
        let (failures, successes) = self.counts(now);
        let total = failures + successes;
        if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        }
    }
}

struct BreakerEntry {
    state: Mutex<State>,
    window: SlidingWindow,
    opened_at_ns: AtomicU64,
    half_open_quota: AtomicI64,
    last_used_ns: AtomicU64,
}

impl BreakerEntry {
    fn new(window_size: u64) -> Self {
        Self {
            state: Mutex::new(State::Closed),
            window: SlidingWindow::new(window_size),
            opened_at_ns: AtomicU64::new(0),
            half_open_quota: AtomicI64::new(0),
            last_used_ns: AtomicU64::new(now_ns()),
        }
    }
}

pub struct PluginCircuitBreaker {
    config: PluginConfig,
    breakers: Arc<DashMap<String, Arc<BreakerEntry>>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl PluginCircuitBreaker {
    fn new(config: PluginConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(DashMap::new()),
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
            *guard = Some(spawn_janitor(self.breakers.clone()));
        }
    }

    fn key_for(&self, session: &mut Session, ctx: &ProxyContext) -> String {
        ctx.route
            .as_ref()
            .map(|r| r.config.target.url.clone())
            .unwrap_or_else(|| session.req_header().uri.path().to_string())
    }

    fn entry_for(&self, key: &str) -> Arc<BreakerEntry> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(BreakerEntry::new(self.config.window_size)))
            .clone()
    }

    /// Returns `true` if the request may proceed.
    fn admit(&self, entry: &BreakerEntry) -> bool {
        entry.last_used_ns.store(now_ns(), Ordering::Relaxed);
        let now = now_ns();
        let mut state = entry.state.lock().expect("breaker state poisoned");

        match *state {
            State::Closed => true,
            State::Open => {
                let opened_at = entry.opened_at_ns.load(Ordering::Acquire);
                let elapsed = Duration::from_nanos(now.saturating_sub(opened_at));
                if elapsed >= Duration::from_secs(self.config.recovery_timeout) {
                    *state = State::HalfOpen;
                    entry
                        .half_open_quota
                        .store(self.config.half_open_quota, Ordering::SeqCst);
                    entry.half_open_quota.fetch_sub(1, Ordering::SeqCst) > 0
                } else {
                    false
                }
            }
            State::HalfOpen => entry.half_open_quota.fetch_sub(1, Ordering::SeqCst) > 0,
        }
    }

    fn record_outcome(&self, key: &str, failure: bool) {
        let entry = self.entry_for(key);
        let now = now_ns();
        entry.window.record(now, failure);

        let mut state = entry.state.lock().expect("breaker state poisoned");
        let ratio = entry.window.failure_ratio(now);

        match *state {
            State::Closed => {
                if ratio * 100.0 >= self.config.failure_threshold as f64 {
                    *state = State::Open;
                    entry.opened_at_ns.store(now, Ordering::Release);
                }
            }
            State::HalfOpen => {
                if !failure && ratio * 100.0 < self.config.success_threshold as f64 {
                    *state = State::Closed;
                } else if failure && entry.half_open_quota.load(Ordering::SeqCst) <= 0 {
                    *state = State::Open;
                    entry.opened_at_ns.store(now, Ordering::Release);
                }
            }
            State::Open => {}
        }
    }
}

fn spawn_janitor(breakers: Arc<DashMap<String, Arc<BreakerEntry>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            interval.tick().await;
            let now = now_ns();
            breakers.retain(|_, entry| {
                let last_used = entry.last_used_ns.load(Ordering::Relaxed);
                Duration::from_nanos(now.saturating_sub(last_used)) < IDLE_EVICTION
            });
        }
    })
}

#[async_trait]
impl ProxyPlugin for PluginCircuitBreaker {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        self.ensure_janitor();
        let key = self.key_for(session, ctx);
        let entry = self.entry_for(&key);

        if self.admit(&entry) {
            ctx.set("circuit_breaker_key", key);
            Ok(false)
        } else {
            let cors_headers = ctx.cors_response_headers(session);
            ProxyError::UpstreamUnavailable(format!("circuit open for {key}"))
                .write_to_with_headers(session, cors_headers.as_deref())
                .await?;
            Ok(true)
        }
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut ProxyContext) {
        let Some(key) = ctx.get("circuit_breaker_key").map(|s| s.to_string()) else {
            return;
        };

        let failure = e.is_some()
            || session
                .response_written()
                .map(|resp| resp.status.as_u16() >= 500)
                .unwrap_or(false);

        self.record_outcome(&key, failure);
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

    fn config() -> PluginConfig {
        PluginConfig {
            failure_threshold: 50,
            success_threshold: 50,
            window_size: 10,
            recovery_timeout: 1,
            half_open_quota: 2,
        }
    }

    #[tokio::test]
    async fn opens_after_failure_ratio_crosses_threshold() {
        let plugin = PluginCircuitBreaker::new(config());
        for _ in 0..5 {
            plugin.record_outcome("u", true);
        }
        let entry = plugin.entry_for("u");
        assert!(!plugin.admit(&entry));
        plugin.stop();
    }

    #[tokio::test]
    async fn stays_closed_while_healthy() {
        let plugin = PluginCircuitBreaker::new(config());
        for _ in 0..5 {
            plugin.record_outcome("u", false);
        }
        let entry = plugin.entry_for("u");
        assert!(plugin.admit(&entry));
        plugin.stop();
    }

    #[tokio::test]
    async fn zero_requests_report_zero_failure_ratio() {
        let plugin = PluginCircuitBreaker::new(config());
        let entry = plugin.entry_for("fresh");
        assert_eq!(entry.window.failure_ratio(now_ns()), 0.0);
        assert!(plugin.admit(&entry));
        plugin.stop();
    }
}
