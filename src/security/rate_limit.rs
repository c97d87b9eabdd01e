//! Fixed-window rate limiting.
//!
//! The limiter only decides; surfacing the decision to clients is the job of
//! [`crate::http::response`]. Each decision is attached to the request's
//! extensions before the handler runs and mirrored onto the response's
//! extensions on the way out, including for rejected requests. Outer
//! middleware can also plant a [`DecisionSlot`] to read the decision when an
//! inner layer replaces the response.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

use crate::config::RateLimitConfig;
use crate::observability::metrics;

/// A rate limiter's verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Quota ceiling for the window.
    pub limit: u64,
    /// Quota left in the window.
    pub remaining: u64,
    /// When the window resets.
    pub reset_time: SystemTime,
    /// Hits consumed in the window. May exceed `limit`.
    pub current: u64,
}

impl RateLimitDecision {
    /// Build a decision from a hit count, deriving `remaining`.
    pub fn new(limit: u64, current: u64, reset_time: SystemTime) -> Self {
        Self {
            limit,
            remaining: limit.saturating_sub(current),
            reset_time,
            current,
        }
    }

    /// Whether the current hit is over quota.
    pub fn is_exceeded(&self) -> bool {
        self.current > self.limit
    }
}

/// Write-once cell for the decision made on one request.
#[derive(Debug, Clone, Default)]
pub struct DecisionSlot(Arc<OnceLock<RateLimitDecision>>);

impl DecisionSlot {
    pub fn get(&self) -> Option<RateLimitDecision> {
        self.0.get().copied()
    }

    fn record(&self, decision: RateLimitDecision) {
        let _ = self.0.set(decision);
    }
}

struct Window {
    started: Instant,
    reset_time: SystemTime,
    hits: u64,
}

impl Window {
    fn new(len: Duration) -> Self {
        Self {
            started: Instant::now(),
            reset_time: SystemTime::now() + len,
            hits: 0,
        }
    }
}

/// Counts hits per client key inside fixed windows.
pub struct FixedWindowLimiter {
    windows: DashMap<String, Window>,
    max_requests: u64,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, Duration::from_secs(config.window_secs))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one hit for `key` and return the resulting decision.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::new(self.window));

        if entry.started.elapsed() >= self.window {
            *entry = Window::new(self.window);
        }
        entry.hits += 1;

        RateLimitDecision::new(self.max_requests, entry.hits, entry.reset_time)
    }

    /// Drop windows that have already expired. Returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let mut pruned = 0;
        self.windows.retain(|_, window| {
            let live = window.started.elapsed() < self.window;
            pruned += usize::from(!live);
            live
        });
        pruned
    }

    /// Number of tracked clients.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Client key: peer IP when the server was started with connect info.
pub fn client_key(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware function for fixed-window rate limiting.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<FixedWindowLimiter>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&request);
    let decision = limiter.check(&key);
    if let Some(slot) = request.extensions().get::<DecisionSlot>() {
        slot.record(decision);
    }
    request.extensions_mut().insert(decision);

    let mut response = if decision.is_exceeded() {
        tracing::debug!(client = %key, current = decision.current, "Rate limit exceeded");
        metrics::record_rate_limited();
        (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response()
    } else {
        next.run(request).await
    };

    response.extensions_mut().insert(decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_counts_down() {
        let limiter = FixedWindowLimiter::new(3, Duration::from_secs(60));

        let first = limiter.check("10.0.0.1");
        assert_eq!((first.current, first.remaining), (1, 2));
        limiter.check("10.0.0.1");
        let third = limiter.check("10.0.0.1");
        assert_eq!((third.current, third.remaining), (3, 0));
        assert!(!third.is_exceeded());

        let fourth = limiter.check("10.0.0.1");
        assert_eq!((fourth.current, fourth.remaining), (4, 0));
        assert!(fourth.is_exceeded());
        assert_eq!(fourth.reset_time, first.reset_time);
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_secs(60));
        limiter.check("a");
        assert!(limiter.check("a").is_exceeded());
        assert!(!limiter.check("b").is_exceeded());
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_window_resets() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_millis(20));
        limiter.check("a");
        assert!(limiter.check("a").is_exceeded());

        std::thread::sleep(Duration::from_millis(30));
        let fresh = limiter.check("a");
        assert_eq!(fresh.current, 1);
        assert!(!fresh.is_exceeded());
    }

    #[test]
    fn test_prune_expired() {
        let limiter = FixedWindowLimiter::new(5, Duration::from_millis(10));
        limiter.check("a");
        limiter.check("b");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(limiter.prune_expired(), 2);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_prune_while_clients_arrive() {
        let limiter = Arc::new(FixedWindowLimiter::new(5, Duration::from_secs(600)));

        let writer = {
            let limiter = Arc::clone(&limiter);
            std::thread::spawn(move || {
                for i in 0..20_000 {
                    limiter.check(&format!("c{i}"));
                }
            })
        };

        let mut pruned = 0;
        while !writer.is_finished() {
            pruned += limiter.prune_expired();
        }
        writer.join().unwrap();

        assert_eq!(pruned, 0);
        assert_eq!(limiter.tracked_clients(), 20_000);
    }

    #[test]
    fn test_slot_keeps_first_decision() {
        let slot = DecisionSlot::default();
        assert_eq!(slot.get(), None);

        let reset = SystemTime::now();
        slot.clone().record(RateLimitDecision::new(10, 1, reset));
        slot.record(RateLimitDecision::new(10, 2, reset));
        assert_eq!(slot.get().map(|d| d.current), Some(1));
    }

    #[test]
    fn test_client_key_without_connect_info() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_key(&req), "unknown");
    }
}
