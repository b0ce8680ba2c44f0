//! Fixed-policy request limiting over a pluggable counter store.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RateLimitSettings;
use crate::utils::error::AppError;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Counts hits per key within a window.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Counts one hit for `key` and returns the number of hits in the
    /// current window, this one included. Stores may leave a hit above
    /// `limit` uncounted.
    async fn hit(&self, key: &str, window: Duration, limit: u64) -> Result<u64, RateLimitError>;
}

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Admitted hits for one key, with the window they were counted in.
#[derive(Default)]
struct Window {
    span: Duration,
    hits: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while self
            .hits
            .front()
            .is_some_and(|first| now.duration_since(*first) >= self.span)
        {
            self.hits.pop_front();
        }
    }
}

struct Windows {
    keys: HashMap<String, Window>,
    last_sweep: Instant,
}

/// Process-local sliding window. Resets on restart and is not shared
/// between instances. Only admitted hits are kept, and keys with no hit
/// left in their window are dropped.
pub struct MemoryCounterStore {
    windows: Mutex<Windows>,
    sweep_interval: Duration,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(Windows {
                keys: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// How often idle keys are looked for.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().keys.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit(&self, key: &str, window: Duration, limit: u64) -> Result<u64, RateLimitError> {
        let now = Instant::now();
        let mut windows = self.lock();

        if now.duration_since(windows.last_sweep) >= self.sweep_interval {
            windows.keys.retain(|_, entry| {
                entry.prune(now);
                !entry.hits.is_empty()
            });
            windows.last_sweep = now;
        }

        let entry = windows.keys.entry(key.to_string()).or_default();
        entry.span = window;
        entry.prune(now);
        let count = entry.hits.len() as u64 + 1;
        if count <= limit {
            entry.hits.push_back(now);
        } else if entry.hits.is_empty() {
            windows.keys.remove(key);
        }
        Ok(count)
    }
}

/// Fixed window shared through Redis: `INCR`, plus `EXPIRE` on the first hit.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self { connection })
    }
}

#[async_trait::async_trait]
impl CounterStore for RedisCounterStore {
    async fn hit(&self, key: &str, window: Duration, _limit: u64) -> Result<u64, RateLimitError> {
        let mut connection = self.connection.clone();
        let count: u64 = connection.incr(key, 1u64).await?;
        if count == 1 {
            let seconds = i64::try_from(window.as_secs().max(1)).unwrap_or(i64::MAX);
            let _: () = connection.expire(key, seconds).await?;
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    name: &'static str,
    policy: RateLimitSettings,
    counters: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(name: &'static str, policy: RateLimitSettings, counters: Arc<dyn CounterStore>) -> Self {
        Self {
            name,
            policy,
            counters,
        }
    }

    /// Counts a request from `client`. Counter failures let the request through.
    pub async fn check(&self, client: &str) -> RateDecision {
        let key = format!("rate_limit:{}:{}", self.name, client);
        match self
            .counters
            .hit(&key, self.policy.window, self.policy.max_requests)
            .await {
            Ok(count) => RateDecision {
                allowed: count <= self.policy.max_requests,
                limit: self.policy.max_requests,
                remaining: self.policy.max_requests.saturating_sub(count),
            },
            Err(e) => {
                warn!(limiter = self.name, error = %e, "Rate limit counter unavailable, allowing request");
                RateDecision {
                    allowed: true,
                    limit: self.policy.max_requests,
                    remaining: self.policy.max_requests,
                }
            }
        }
    }
}

fn client_key(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    forwarded_for(request.headers()).unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn set_headers(headers: &mut HeaderMap, decision: RateDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
}

/// Middleware for `axum::middleware::from_fn_with_state`.
pub async fn limit_requests(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_key(&request);
    let decision = limiter.check(&client).await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        debug!(limiter = limiter.name, %client, "Rate limit exceeded");
        AppError::RateLimited("Too many requests, please try again later".to_string())
            .into_response()
    };
    set_headers(response.headers_mut(), decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenCounter;

    #[async_trait::async_trait]
    impl CounterStore for BrokenCounter {
        async fn hit(
            &self,
            _key: &str,
            _window: Duration,
            _limit: u64,
        ) -> Result<u64, RateLimitError> {
            Err(RateLimitError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }
    }

    fn policy(max_requests: u64) -> RateLimitSettings {
        RateLimitSettings {
            max_requests,
            window: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_limiter_blocks_after_max_requests() {
        let limiter = RateLimiter::new("test", policy(2), Arc::new(MemoryCounterStore::new()));

        let first = limiter.check("10.0.0.1").await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert!(limiter.check("10.0.0.1").await.allowed);

        let third = limiter.check("10.0.0.1").await;
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);

        assert!(limiter.check("10.0.0.2").await.allowed);
    }

    #[tokio::test]
    async fn test_memory_window_slides() {
        let counters = MemoryCounterStore::new();
        let window = Duration::from_millis(30);
        assert_eq!(counters.hit("k", window, 10).await.unwrap(), 1);
        assert_eq!(counters.hit("k", window, 10).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.hit("k", window, 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_hits_do_not_extend_the_block() {
        let counters = MemoryCounterStore::new();
        let window = Duration::from_millis(300);
        assert_eq!(counters.hit("k", window, 1).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counters.hit("k", window, 1).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Only the first, admitted hit was counted, and it has left the window.
        assert_eq!(counters.hit("k", window, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_idle_keys_are_swept() {
        let counters = MemoryCounterStore::new().with_sweep_interval(Duration::ZERO);
        let window = Duration::from_millis(20);
        counters.hit("10.0.0.1", window, 5).await.unwrap();
        counters.hit("10.0.0.2", window, 5).await.unwrap();
        assert_eq!(counters.tracked_keys(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        counters.hit("10.0.0.3", window, 5).await.unwrap();
        assert_eq!(counters.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_counter_failure_fails_open() {
        let limiter = RateLimiter::new("test", policy(1), Arc::new(BrokenCounter));
        for _ in 0..3 {
            assert!(limiter.check("10.0.0.1").await.allowed);
        }
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(forwarded_for(&headers).as_deref(), Some("203.0.113.9"));
        assert_eq!(forwarded_for(&HeaderMap::new()), None);
    }
}
