//! Per-provider request rate limiting.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A direct rate limiter for one code-host connection.
#[derive(Clone)]
pub struct ApiRateLimiter {
    inner: Arc<GovernorRateLimiter>
}

impl ApiRateLimiter {
    /// `requests_per_second` of 0 is treated as 1.
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_second(rps)))
        }
    }

    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }
}

/// Lazily created limiters keyed by provider URN.
pub struct RateLimiterRegistry {
    default_rps: u32,
    overrides: HashMap<String, u32>,
    limiters: Mutex<HashMap<String, ApiRateLimiter>>
}

impl RateLimiterRegistry {
    pub fn new(default_rps: u32) -> Self {
        Self {
            default_rps,
            overrides: HashMap::new(),
            limiters: Mutex::new(HashMap::new())
        }
    }

    pub fn with_override(mut self, urn: impl Into<String>, rps: u32) -> Self {
        self.overrides.insert(urn.into(), rps);
        self
    }

    pub fn get(&self, urn: &str) -> ApiRateLimiter {
        self.limiters
            .lock()
            .entry(urn.to_string())
            .or_insert_with(|| {
                let rps = self.overrides.get(urn).copied().unwrap_or(self.default_rps);
                ApiRateLimiter::new(rps)
            })
            .clone()
    }

    /// Waits until the provider identified by `urn` may be called again.
    pub async fn wait(&self, urn: &str) {
        let limiter = self.get(urn);
        limiter.wait().await;
    }
}
