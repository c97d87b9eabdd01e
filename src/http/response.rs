//! Rate limit signaling on responses.
//!
//! # Responsibilities
//! - Translate a [`RateLimitDecision`] into `X-RateLimit-*` response headers
//! - Add `X-RateLimit-Warning` near the quota and `Retry-After` once it is spent
//! - Log warnings as a client approaches its quota, alerts once it is spent
//!
//! # Design Decisions
//! - Absent decision means the route is not limited: nothing is written
//! - Purely additive: never changes status or body, never fails
//! - `remaining` is reported as the limiter computed it, even when `current`
//!   overshoots `limit`; `Retry-After` never goes below 0

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header::{self, IntoHeaderName},
        HeaderMap, HeaderValue, Request,
    },
    middleware::Next,
    response::Response,
};

use crate::config::SignalingConfig;
use crate::http::request::id_of;
use crate::security::rate_limit::{DecisionSlot, RateLimitDecision};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
pub const X_RATELIMIT_USED: &str = "x-ratelimit-used";
pub const X_RATELIMIT_WARNING: &str = "x-ratelimit-warning";

/// Request details included in rate limit log events.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub client: Option<SocketAddr>,
    pub path: String,
    pub user_agent: Option<String>,
    pub correlation_id: String,
}

impl RequestMeta {
    pub fn from_request(request: &Request<Body>) -> Self {
        Self {
            client: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            path: request.uri().path().to_string(),
            user_agent: request
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            correlation_id: id_of(request.extensions()).to_string(),
        }
    }
}

/// Writes rate limit headers and emits rate limit log events.
#[derive(Debug, Clone)]
pub struct RateLimitSignaler {
    header_warning_threshold: u64,
    log_warning_threshold: u64,
}

impl Default for RateLimitSignaler {
    fn default() -> Self {
        Self::from_config(&SignalingConfig::default())
    }
}

impl RateLimitSignaler {
    pub fn new(header_warning_threshold: u64, log_warning_threshold: u64) -> Self {
        Self {
            header_warning_threshold,
            log_warning_threshold,
        }
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self::new(config.header_warning_threshold, config.log_warning_threshold)
    }

    /// Annotate `headers` with the decision's state.
    pub fn annotate(&self, decision: Option<&RateLimitDecision>, headers: &mut HeaderMap) {
        self.annotate_at(decision, headers, SystemTime::now());
    }

    /// [`annotate`](Self::annotate) against an explicit clock.
    pub fn annotate_at(
        &self,
        decision: Option<&RateLimitDecision>,
        headers: &mut HeaderMap,
        now: SystemTime,
    ) {
        let Some(decision) = decision else {
            return;
        };
        let remaining = decision.remaining;

        set_number(headers, X_RATELIMIT_LIMIT, decision.limit);
        set_number(headers, X_RATELIMIT_REMAINING, remaining);
        set_number(headers, X_RATELIMIT_RESET, epoch_secs_ceil(decision.reset_time));
        set_number(headers, X_RATELIMIT_USED, decision.current);

        if remaining == 0 {
            let retry_after = retry_after_secs(decision.reset_time, now);
            set_number(headers, header::RETRY_AFTER, retry_after);
            set_text(
                headers,
                X_RATELIMIT_WARNING,
                format!("Rate limit exceeded: retry after {retry_after} seconds"),
            );
        } else if remaining <= self.header_warning_threshold {
            set_text(
                headers,
                X_RATELIMIT_WARNING,
                format!(
                    "Rate limit nearly reached: {remaining} of {} requests remaining",
                    decision.limit
                ),
            );
        }
    }

    /// Log the decision when the client is close to, or past, its quota.
    pub fn log_status(&self, decision: Option<&RateLimitDecision>, meta: &RequestMeta) {
        let Some(decision) = decision else {
            return;
        };
        let remaining = decision.remaining;
        if remaining > self.log_warning_threshold {
            return;
        }

        let client = meta
            .client
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let reset = humantime::format_rfc3339_seconds(decision.reset_time);
        let user_agent = meta.user_agent.as_deref().unwrap_or("unknown");

        tracing::warn!(
            target: "rate_limit",
            client = %client,
            path = %meta.path,
            limit = decision.limit,
            remaining,
            current = decision.current,
            reset = %reset,
            user_agent = %user_agent,
            correlation_id = %meta.correlation_id,
            "Rate limit approaching"
        );

        if remaining == 0 {
            tracing::error!(
                target: "rate_limit",
                alert = true,
                client = %client,
                path = %meta.path,
                limit = decision.limit,
                remaining,
                current = decision.current,
                reset = %reset,
                user_agent = %user_agent,
                correlation_id = %meta.correlation_id,
                "Rate limit exhausted"
            );
        }
    }
}

fn epoch_secs_ceil(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(ceil_secs)
        .unwrap_or(0)
}

/// Whole seconds until `reset`, rounded up; 0 once it has passed.
fn retry_after_secs(reset: SystemTime, now: SystemTime) -> u64 {
    reset.duration_since(now).map(ceil_secs).unwrap_or(0)
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

fn set_number<K: IntoHeaderName>(headers: &mut HeaderMap, name: K, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}

fn set_text<K: IntoHeaderName>(headers: &mut HeaderMap, name: K, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

/// Middleware that surfaces the rate limiter's decision. Install it outside
/// the limiter and any timeout so rejected and timed-out requests are
/// annotated too.
pub async fn signal_middleware(
    State(signaler): State<Arc<RateLimitSignaler>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let meta = RequestMeta::from_request(&request);
    let slot = DecisionSlot::default();
    request.extensions_mut().insert(slot.clone());
    let mut response = next.run(request).await;

    let decision = response
        .extensions()
        .get::<RateLimitDecision>()
        .copied()
        .or_else(|| slot.get());
    signaler.annotate(decision.as_ref(), response.headers_mut());
    signaler.log_status(decision.as_ref(), &meta);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::Level;
    use tracing_subscriber::layer::{self, SubscriberExt};
    use tracing_subscriber::Layer;

    fn decision(limit: u64, current: u64, reset_in: Duration, now: SystemTime) -> RateLimitDecision {
        RateLimitDecision::new(limit, current, now + reset_in)
    }

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_exhausted_quota() {
        let now = SystemTime::now();
        let d = decision(100, 100, Duration::from_millis(30_000), now);
        let mut headers = HeaderMap::new();

        RateLimitSignaler::default().annotate_at(Some(&d), &mut headers, now);

        assert_eq!(header(&headers, X_RATELIMIT_LIMIT), Some("100"));
        assert_eq!(header(&headers, X_RATELIMIT_REMAINING), Some("0"));
        assert_eq!(header(&headers, X_RATELIMIT_USED), Some("100"));
        assert_eq!(header(&headers, "retry-after"), Some("30"));
        assert!(headers.contains_key(X_RATELIMIT_WARNING));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = SystemTime::now();
        let d = decision(10, 10, Duration::from_millis(1_200), now);
        let mut headers = HeaderMap::new();

        RateLimitSignaler::default().annotate_at(Some(&d), &mut headers, now);
        assert_eq!(header(&headers, "retry-after"), Some("2"));
    }

    #[test]
    fn test_plenty_remaining() {
        let now = SystemTime::now();
        let d = decision(100, 50, Duration::from_secs(30), now);
        let mut headers = HeaderMap::new();

        RateLimitSignaler::default().annotate_at(Some(&d), &mut headers, now);

        assert_eq!(header(&headers, X_RATELIMIT_REMAINING), Some("50"));
        assert!(!headers.contains_key("retry-after"));
        assert!(!headers.contains_key(X_RATELIMIT_WARNING));
    }

    #[test]
    fn test_warning_threshold() {
        let now = SystemTime::now();
        let signaler = RateLimitSignaler::default();

        let mut headers = HeaderMap::new();
        signaler.annotate_at(Some(&decision(100, 90, Duration::from_secs(5), now)), &mut headers, now);
        assert!(headers.contains_key(X_RATELIMIT_WARNING));
        assert!(!headers.contains_key("retry-after"));

        let mut headers = HeaderMap::new();
        signaler.annotate_at(Some(&decision(100, 89, Duration::from_secs(5), now)), &mut headers, now);
        assert!(!headers.contains_key(X_RATELIMIT_WARNING));
    }

    #[test]
    fn test_remaining_is_reported_as_given() {
        let now = SystemTime::now();
        let d = RateLimitDecision {
            limit: 10,
            remaining: 3,
            reset_time: now + Duration::from_secs(30),
            current: 14,
        };
        let mut headers = HeaderMap::new();

        RateLimitSignaler::default().annotate_at(Some(&d), &mut headers, now);

        assert_eq!(header(&headers, X_RATELIMIT_REMAINING), Some("3"));
        assert_eq!(header(&headers, X_RATELIMIT_USED), Some("14"));
        assert!(!headers.contains_key("retry-after"));
        assert_eq!(
            header(&headers, X_RATELIMIT_WARNING),
            Some("Rate limit nearly reached: 3 of 10 requests remaining")
        );
    }

    #[test]
    fn test_retry_after_never_negative() {
        let now = SystemTime::now();
        let d = RateLimitDecision::new(10, 14, now - Duration::from_secs(5));
        let mut headers = HeaderMap::new();

        RateLimitSignaler::default().annotate_at(Some(&d), &mut headers, now);

        assert_eq!(header(&headers, X_RATELIMIT_REMAINING), Some("0"));
        assert_eq!(header(&headers, "retry-after"), Some("0"));
    }

    #[test]
    fn test_reset_is_ceiled_epoch_seconds() {
        let reset = UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        let d = RateLimitDecision::new(10, 1, reset);
        let mut headers = HeaderMap::new();

        RateLimitSignaler::default().annotate_at(Some(&d), &mut headers, UNIX_EPOCH);
        assert_eq!(header(&headers, X_RATELIMIT_RESET), Some("1700000001"));
    }

    #[test]
    fn test_missing_decision_is_noop() {
        let mut headers = HeaderMap::new();
        let signaler = RateLimitSignaler::default();
        signaler.annotate(None, &mut headers);
        signaler.log_status(None, &RequestMeta::default());
        assert!(headers.is_empty());
    }

    /// Collects rate limit events with their fields rendered as strings.
    #[derive(Clone, Default)]
    struct CaptureLayer {
        events: Arc<Mutex<Vec<CapturedEvent>>>,
    }

    #[derive(Debug, Clone)]
    struct CapturedEvent {
        level: Level,
        fields: HashMap<String, String>,
    }

    impl CapturedEvent {
        fn field(&self, name: &str) -> Option<&str> {
            self.fields.get(name).map(String::as_str)
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for CaptureLayer {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: layer::Context<'_, S>) {
            if event.metadata().target() != "rate_limit" {
                return;
            }
            let mut visitor = FieldVisitor::default();
            event.record(&mut visitor);
            self.events.lock().unwrap().push(CapturedEvent {
                level: *event.metadata().level(),
                fields: visitor.0,
            });
        }
    }

    #[derive(Default)]
    struct FieldVisitor(HashMap<String, String>);

    impl Visit for FieldVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    fn logged(remaining: u64) -> Vec<CapturedEvent> {
        let limit = 100;
        let reset = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let d = RateLimitDecision::new(limit, limit - remaining, reset);
        let meta = RequestMeta {
            client: Some("127.0.0.1:4000".parse().unwrap()),
            path: "/api/posts".into(),
            user_agent: Some("test-agent".into()),
            correlation_id: "abc".into(),
        };

        let capture = CaptureLayer::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        tracing::subscriber::with_default(subscriber, || {
            RateLimitSignaler::default().log_status(Some(&d), &meta);
        });

        let events = capture.events.lock().unwrap().clone();
        events
    }

    #[test]
    fn test_log_status_quiet_above_threshold() {
        assert!(logged(6).is_empty());
    }

    #[test]
    fn test_log_status_warns_near_quota() {
        let events = logged(5);
        assert_eq!(events.len(), 1);

        let warn = &events[0];
        assert_eq!(warn.level, Level::WARN);
        assert_eq!(warn.field("client"), Some("127.0.0.1"));
        assert_eq!(warn.field("path"), Some("/api/posts"));
        assert_eq!(warn.field("limit"), Some("100"));
        assert_eq!(warn.field("remaining"), Some("5"));
        assert_eq!(warn.field("current"), Some("95"));
        assert_eq!(warn.field("reset"), Some("2023-11-14T22:13:20Z"));
        assert_eq!(warn.field("user_agent"), Some("test-agent"));
        assert_eq!(warn.field("correlation_id"), Some("abc"));
        assert_eq!(warn.field("alert"), None);
    }

    #[test]
    fn test_log_status_alerts_when_exhausted() {
        let events = logged(0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, Level::WARN);

        let alert = &events[1];
        assert_eq!(alert.level, Level::ERROR);
        assert_eq!(alert.field("alert"), Some("true"));
        assert_eq!(alert.field("remaining"), Some("0"));
        assert_eq!(alert.field("current"), Some("100"));
        assert_eq!(alert.field("reset"), Some("2023-11-14T22:13:20Z"));
        assert_eq!(alert.field("correlation_id"), Some("abc"));
    }
}
