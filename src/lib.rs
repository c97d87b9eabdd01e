//! Request lifecycle layer: correlation ids, rate limit signaling and
//! calling-side request coalescing.

pub mod client;
pub mod coalesce;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use client::ApiClient;
pub use coalesce::Coalescer;
pub use config::LifecycleConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
