//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware stack)
//!     → request.rs (resolve correlation id, start clock)
//!     → security::rate_limit (decide, attach decision)
//!     → handler
//!     → response.rs (X-RateLimit-* / Retry-After, rate limit logs)
//!     → request.rs (echo correlation id) → client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{
    attach, elapsed_millis, id_of, CorrelationContext, CorrelationExt, CorrelationId,
    CorrelationLayer, X_CORRELATION_ID, X_REQUEST_ID,
};
pub use response::{signal_middleware, RateLimitSignaler, RequestMeta};
pub use server::HttpServer;
