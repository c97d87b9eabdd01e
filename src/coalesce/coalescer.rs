//! Single-flight execution per key.
//!
//! # Invariants
//! - At most one map entry per key; check-then-insert happens under the
//!   key's shard lock, so two callers can never both start an operation
//! - The operation runs on its own task from the moment it starts. Dropping
//!   every waiter or cancelling the key never stops it
//! - An entry is removed exactly once, when its operation settles, and only
//!   if it is still the entry that operation registered
//! - Removal happens before any waiter observes the outcome, so a call made
//!   after settlement always runs fresh

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

use crate::observability::metrics;

type OperationFuture<T, E> = BoxFuture<'static, Result<T, E>>;

/// Outcome handed to every caller of one in-flight operation.
pub type SharedOutcome<T, E> = Shared<OperationFuture<T, E>>;

struct PendingOperation<T, E> {
    generation: u64,
    outcome: SharedOutcome<T, E>,
}

struct Inner<T, E> {
    pending: DashMap<String, PendingOperation<T, E>>,
    generation: AtomicU64,
}

impl<T, E> Inner<T, E> {
    fn settle(&self, key: &str, generation: u64) {
        self.pending
            .remove_if(key, |_, pending| pending.generation == generation);
    }
}

/// Removes the entry when the operation finishes, panics included, or when
/// its task is dropped unfinished.
struct SettleGuard<T, E> {
    inner: Weak<Inner<T, E>>,
    key: String,
    generation: u64,
}

impl<T, E> Drop for SettleGuard<T, E> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.settle(&self.key, self.generation);
        }
    }
}

/// Coalesces concurrent calls that share a key into one execution.
///
/// Cloning is cheap and every clone shares the same pending map.
pub struct Coalescer<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Coalescer<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Run `operation` under `key`, or join the execution already in flight.
    ///
    /// `operation` is not called when a pending outcome exists. Otherwise it
    /// is spawned onto the current Tokio runtime right away, so it completes
    /// even if the returned outcome is never awaited. Its error is handed to
    /// every joined caller unchanged.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn execute<F, Fut>(&self, key: impl Into<String>, operation: F) -> SharedOutcome<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = key.into();

        let (outcome, task) = match self.inner.pending.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                tracing::debug!(key = %key, "Joining in-flight operation");
                metrics::record_coalesced();
                return occupied.get().outcome.clone();
            }
            Entry::Vacant(vacant) => {
                let (pending, task) = self.prepare(key, operation);
                let outcome = pending.outcome.clone();
                vacant.insert(pending);
                (outcome, task)
            }
        };

        // Spawned after the shard lock is released: settling takes that lock.
        tokio::spawn(task);
        outcome
    }

    fn prepare<F, Fut>(&self, key: String, operation: F) -> (PendingOperation<T, E>, BoxFuture<'static, ()>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, generation, "Starting operation");
        metrics::record_execution();

        let guard = SettleGuard {
            inner: Arc::downgrade(&self.inner),
            key,
            generation,
        };
        let (tx, rx) = oneshot::channel();

        let task = async move {
            let result = AssertUnwindSafe(async move { operation().await })
                .catch_unwind()
                .await;
            drop(guard);
            let _ = tx.send(result);
        }
        .boxed();

        let outcome = async move {
            match rx.await {
                Ok(Ok(result)) => result,
                Ok(Err(payload)) => panic::resume_unwind(payload),
                Err(_) => panic!("coalesced operation was dropped before it finished"),
            }
        }
        .boxed()
        .shared();

        (PendingOperation { generation, outcome }, task)
    }

    /// Stop coalescing new calls for `key`. Existing waiters still receive the
    /// original outcome and the operation keeps running.
    pub fn cancel(&self, key: &str) -> bool {
        self.inner.pending.remove(key).is_some()
    }

    /// [`cancel`](Self::cancel) for every key.
    pub fn cancel_all(&self) {
        self.inner.pending.clear();
    }

    /// Number of keys with an operation in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}
