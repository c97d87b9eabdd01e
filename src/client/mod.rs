//! Calling-side HTTP client.
//!
//! Every call goes through a [`Coalescer`] keyed by
//! [`operation_key`](crate::coalesce::operation_key) over the resolved URL, so
//! a double-submitted request reaches the server once and both callers get the
//! same response. Clients for different servers can share one coalescer.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::coalesce::{operation_key, Coalescer};
use crate::http::request::{X_CORRELATION_ID, X_REQUEST_ID};
use crate::http::response::{
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, X_RATELIMIT_USED,
    X_RATELIMIT_WARNING,
};

/// Errors returned by [`ApiClient`]. Cloneable so one failure can be handed
/// to every coalesced caller.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Transport(Arc<reqwest::Error>),
    #[error("could not serialize request body: {0}")]
    Body(Arc<serde_json::Error>),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(Arc::new(err))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Body(Arc::new(err))
    }
}

/// Rate limit state advertised by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    /// Epoch seconds.
    pub reset: Option<u64>,
    pub used: Option<u64>,
    pub retry_after: Option<Duration>,
    pub warning: Option<String>,
}

impl RateLimitInfo {
    /// Read the `X-RateLimit-*` family; `None` when the server sent none.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let info = Self {
            limit: parse_number(headers, X_RATELIMIT_LIMIT),
            remaining: parse_number(headers, X_RATELIMIT_REMAINING),
            reset: parse_number(headers, X_RATELIMIT_RESET),
            used: parse_number(headers, X_RATELIMIT_USED),
            retry_after: parse_number(headers, "retry-after").map(Duration::from_secs),
            warning: header_str(headers, X_RATELIMIT_WARNING).map(str::to_string),
        };
        (info != Self::default()).then_some(info)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_number(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.trim().parse().ok())
}

/// A response as seen by every caller that shared the request.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
    pub correlation_id: Option<String>,
    pub rate_limit: Option<RateLimitInfo>,
}

impl ApiResponse {
    fn from_parts(status: u16, headers: &HeaderMap, body: String) -> Self {
        Self {
            status,
            body,
            correlation_id: header_str(headers, X_CORRELATION_ID)
                .or_else(|| header_str(headers, X_REQUEST_ID))
                .map(str::to_string),
            rate_limit: RateLimitInfo::from_headers(headers),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// HTTP client with request coalescing.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    coalescer: Coalescer<ApiResponse, ClientError>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_client(base_url, Client::new())
    }

    /// Use a preconfigured reqwest client (default headers, timeouts).
    pub fn with_client(base_url: &str, client: Client) -> Result<Self, ClientError> {
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            coalescer: Coalescer::new(),
        })
    }

    /// Share an existing coalescer, typically one per process.
    pub fn with_coalescer(mut self, coalescer: Coalescer<ApiResponse, ClientError>) -> Self {
        self.coalescer = coalescer;
        self
    }

    pub fn coalescer(&self) -> &Coalescer<ApiResponse, ClientError> {
        &self.coalescer
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ClientError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ClientError> {
        self.request(Method::DELETE, path, None).await
    }

    pub async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ClientError> {
        let body = serde_json::to_value(body)?;
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put_json<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ClientError> {
        let body = serde_json::to_value(body)?;
        self.request(Method::PUT, path, Some(body)).await
    }

    /// Send a request, joining an identical one already in flight.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<ApiResponse, ClientError> {
        let url = self.base_url.join(path)?;
        let key = operation_key(method.as_str(), url.as_str(), body.as_ref());
        let client = self.client.clone();

        self.coalescer
            .execute(key, move || async move {
                let mut request = client.request(method, url);
                if let Some(body) = &body {
                    request = request.json(body);
                }

                let response = request.send().await?;
                let status = response.status().as_u16();
                let headers = response.headers().clone();
                let text = response.text().await?;
                Ok::<_, ClientError>(ApiResponse::from_parts(status, &headers, text))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_rate_limit_info_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from_static("100"));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from_static("1700000000"));
        headers.insert(X_RATELIMIT_USED, HeaderValue::from_static("101"));
        headers.insert("retry-after", HeaderValue::from_static("30"));
        headers.insert(X_RATELIMIT_WARNING, HeaderValue::from_static("slow down"));

        let info = RateLimitInfo::from_headers(&headers).unwrap();
        assert_eq!(info.limit, Some(100));
        assert_eq!(info.remaining, Some(0));
        assert_eq!(info.reset, Some(1_700_000_000));
        assert_eq!(info.used, Some(101));
        assert_eq!(info.retry_after, Some(Duration::from_secs(30)));
        assert_eq!(info.warning.as_deref(), Some("slow down"));
    }

    #[test]
    fn test_no_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_ID, HeaderValue::from_static("abc"));
        assert_eq!(RateLimitInfo::from_headers(&headers), None);

        let response = ApiResponse::from_parts(200, &headers, String::new());
        assert_eq!(response.correlation_id.as_deref(), Some("abc"));
        assert!(response.is_success());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(ApiClient::new("not a url"), Err(ClientError::Url(_))));
    }

    #[test]
    fn test_key_uses_resolved_url() {
        let a = Url::parse("http://a.test/").unwrap();
        let b = Url::parse("http://b.test/").unwrap();
        let key = |base: &Url, path: &str| {
            operation_key("GET", base.join(path).unwrap().as_str(), None)
        };

        assert_ne!(key(&a, "/api/who"), key(&b, "/api/who"));
        assert_eq!(key(&a, "api/who"), key(&a, "/api/who"));
    }

    #[tokio::test]
    async fn test_transport_error_is_returned() {
        // Nothing listens on port 9 (discard) in the test environment.
        let client = ApiClient::new("http://127.0.0.1:9/").unwrap();
        let result = client.get("/api/echo").await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(client.coalescer().pending_count(), 0);
    }
}
