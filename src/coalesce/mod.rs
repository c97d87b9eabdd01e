//! Request coalescing for the calling side.
//!
//! # Data Flow
//! ```text
//! caller builds key (key.rs: METHOD:path:canonical-body)
//!     → coalescer.rs (join in-flight outcome or start a new one)
//!     → operation runs once; every joined caller gets the same Result
//!     → entry removed on settlement, before waiters observe it
//! ```
//!
//! # Design Decisions
//! - One `Coalescer` per process is a deployment choice, not a global:
//!   build it once and clone the handle into call sites
//! - Check-then-insert happens under a single map shard lock
//! - Cancelling detaches future callers only; the operation keeps running

pub mod coalescer;
pub mod key;

pub use coalescer::Coalescer;
pub use key::{canonical_json, operation_key, operation_key_for};
