//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (count hit per client IP, attach decision)
//!     → 429 when over quota, otherwise pass to handler
//! ```
//!
//! Body size limits are enforced by `tower_http` in the server stack.

pub mod rate_limit;

pub use rate_limit::{rate_limit_middleware, FixedWindowLimiter, RateLimitDecision};
