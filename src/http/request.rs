//! Request correlation.
//!
//! # Responsibilities
//! - Resolve a correlation id per inbound request (client supplied or fresh UUID v4)
//! - Reject malformed or oversized client ids before they reach headers or logs
//! - Record when the request started so handlers can report elapsed time
//! - Echo the id on the response under both header conventions
//!
//! # Design Decisions
//! - Correlation added as early as possible (outermost layer after tracing)
//! - The context lives in request extensions, owned by that request only
//! - Accessors never fail: a missing context reads as `"unknown"` / 0 ms

use std::fmt;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{header::HeaderName, Extensions, HeaderMap, HeaderValue, Request, Response};
use futures_util::future::BoxFuture;
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

/// Primary correlation header.
pub const X_CORRELATION_ID: &str = "x-correlation-id";

/// Alias header read as a fallback and echoed alongside the primary one.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Returned by [`id_of`] when no context was attached.
pub const UNKNOWN_ID: &str = "unknown";

const MAX_ID_LEN: usize = 64;

/// A validated correlation identifier matching `^[A-Za-z0-9_-]{1,64}$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Validate a candidate id. Returns `None` when it does not conform.
    pub fn parse(candidate: &str) -> Option<Self> {
        let valid = !candidate.is_empty()
            && candidate.len() <= MAX_ID_LEN
            && candidate
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| Self(candidate.to_string()))
    }

    /// A fresh random id in hyphenated UUID v4 form.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Take the first non-empty correlation header on the request, primary
    /// before alias; generate a fresh id when none is present or it is invalid.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let present = |name: &str| headers.get(name).filter(|value| !value.is_empty());
        let candidate = present(X_CORRELATION_ID).or_else(|| present(X_REQUEST_ID));

        match candidate {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(Self::parse)
                .unwrap_or_else(|| {
                    tracing::debug!("Discarding malformed correlation id");
                    Self::generate()
                }),
            None => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn header_value(&self) -> HeaderValue {
        // The charset is a subset of visible ASCII, so this cannot fail.
        HeaderValue::from_str(&self.0).unwrap_or_else(|_| HeaderValue::from_static(UNKNOWN_ID))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-request correlation state. Immutable once attached.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    id: CorrelationId,
    started_at: Instant,
}

impl CorrelationContext {
    pub fn new(id: CorrelationId) -> Self {
        Self {
            id,
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Milliseconds since the request was attached.
    pub fn elapsed_millis(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Write the id under both correlation headers.
    pub fn stamp(&self, headers: &mut HeaderMap) {
        let value = self.id.header_value();
        headers.insert(HeaderName::from_static(X_CORRELATION_ID), value.clone());
        headers.insert(HeaderName::from_static(X_REQUEST_ID), value);
    }
}

/// Resolve the correlation id for `request`, store the context in its
/// extensions and normalize both inbound headers to the resolved id.
pub fn attach<B>(request: &mut Request<B>) -> CorrelationContext {
    let ctx = CorrelationContext::new(CorrelationId::from_headers(request.headers()));
    ctx.stamp(request.headers_mut());
    request.extensions_mut().insert(ctx.clone());
    ctx
}

/// The correlation id stored in `extensions`, or `"unknown"`.
pub fn id_of(extensions: &Extensions) -> &str {
    extensions
        .get::<CorrelationContext>()
        .map(|ctx| ctx.id.as_str())
        .unwrap_or(UNKNOWN_ID)
}

/// Milliseconds since the request started, or 0 without a context.
pub fn elapsed_millis(extensions: &Extensions) -> u64 {
    extensions
        .get::<CorrelationContext>()
        .map(CorrelationContext::elapsed_millis)
        .unwrap_or(0)
}

/// Correlation accessors on requests.
pub trait CorrelationExt {
    fn correlation_id(&self) -> &str;
    fn elapsed_millis(&self) -> u64;
}

impl<B> CorrelationExt for Request<B> {
    fn correlation_id(&self) -> &str {
        id_of(self.extensions())
    }

    fn elapsed_millis(&self) -> u64 {
        elapsed_millis(self.extensions())
    }
}

/// Layer that attaches a [`CorrelationContext`] to every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationLayer;

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationService { inner }
    }
}

/// Service produced by [`CorrelationLayer`].
#[derive(Debug, Clone)]
pub struct CorrelationService<S> {
    inner: S,
}

impl<S, B, ResBody> Service<Request<B>> for CorrelationService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: 'static,
    ResBody: 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        let ctx = attach(&mut request);
        let span = tracing::info_span!(
            "request",
            correlation_id = %ctx.id(),
            method = %request.method(),
            path = %request.uri().path(),
        );
        let future = {
            let _enter = span.enter();
            self.inner.call(request)
        };

        Box::pin(
            async move {
                let mut response = future.await?;
                ctx.stamp(response.headers_mut());
                tracing::debug!(
                    status = response.status().as_u16(),
                    elapsed_ms = ctx.elapsed_millis(),
                    "Request completed"
                );
                Ok(response)
            }
            .instrument(span),
        )
    }
}
