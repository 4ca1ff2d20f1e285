//! Concurrency limiter: `ConcurrencyLimiter`
//!
//! Handler-slot flow control for the Flow engine.
//!
//! Design principle (generalized from the teacher crate's byte-counted
//! `BytePermits`):
//! - Backpressure here scales with **concurrently running handler workers**,
//!   not bytes.
//! - One Flow invocation should not starve every other Flow sharing the same
//!   `Flow` instance.
//! - Pluggable: `Unlimited` (no cap) -> `Bounded` (semaphore) -> future policies.
//!
//! Usage:
//! ```rust,ignore
//! let permit = limiter.acquire(ctx.cancelled()).await?;
//! handler.serve(req, res).await?;
//! drop(permit); // releases automatically
//! ```

use std::sync::Arc;

use async_lock::{Semaphore, SemaphoreGuardArc};
use futures::FutureExt;

use crate::context::Cancelled;
use crate::error::{CalqueError, Result};

/// Handler-slot permit trait.
///
/// Implementations control how many handler workers may run `serve`
/// concurrently across a `Flow` instance.
#[async_trait::async_trait]
pub trait ConcurrencyLimiter: Send + Sync {
    /// Acquire one handler-worker slot.
    ///
    /// Blocks (yielding to the executor) while the cap is saturated. Returns
    /// `Err(CalqueError::Cancelled)` if `cancelled` resolves first, per §4.5's
    /// "Semaphore acquisition order" rule: the wait must be interruptible by
    /// context cancellation so a saturated Flow cannot hold cancelled
    /// requests.
    async fn acquire(&self, cancelled: Cancelled<'_>) -> Result<Permit>;
}

/// RAII permit guard. Releases the slot (if any) when dropped.
pub enum Permit {
    /// No concurrency cap is in effect; holding this variant costs nothing.
    Unlimited,
    /// A semaphore slot, released when dropped.
    Bounded(SemaphoreGuardArc),
}

/// No cap: every `acquire` succeeds immediately.
///
/// Used when `FlowConfig::max_concurrent` is `MaxConcurrent::Unlimited`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedLimiter;

#[async_trait::async_trait]
impl ConcurrencyLimiter for UnlimitedLimiter {
    async fn acquire(&self, _cancelled: Cancelled<'_>) -> Result<Permit> {
        Ok(Permit::Unlimited)
    }
}

/// Fixed-capacity cap backed by `async_lock::Semaphore`.
///
/// Used for `MaxConcurrent::Fixed(n)` and `MaxConcurrent::Auto`, the latter
/// resolved to a concrete `n` by `FlowConfig::resolve_max_concurrent`.
pub struct BoundedLimiter {
    sem: Arc<Semaphore>,
}

impl BoundedLimiter {
    /// Create a limiter with `capacity` concurrent slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; a zero-capacity semaphore can never be
    /// acquired, which would deadlock every Flow invocation.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedLimiter capacity must be non-zero");
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
        }
    }
}

#[async_trait::async_trait]
impl ConcurrencyLimiter for BoundedLimiter {
    async fn acquire(&self, mut cancelled: Cancelled<'_>) -> Result<Permit> {
        futures::select! {
            guard = self.sem.clone().acquire_arc().fuse() => Ok(Permit::Bounded(guard)),
            () = (&mut cancelled).fuse() => {
                tracing::trace!("concurrency slot acquire cancelled");
                Err(CalqueError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn unlimited_always_succeeds() {
        let limiter = UnlimitedLimiter;
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = Context::background();
            let _p1 = limiter.acquire(ctx.cancelled()).await.unwrap();
            let _p2 = limiter.acquire(ctx.cancelled()).await.unwrap();
        });
    }

    #[test]
    fn bounded_limits_concurrency() {
        let limiter = BoundedLimiter::new(1);
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = Context::background();
            let first = limiter.acquire(ctx.cancelled()).await.unwrap();
            // A second acquire on a saturated, uncancelled context must not
            // resolve; race it against a cancellation to prove it blocks.
            let (cancel, cancelled) = Context::background().with_cancel();
            cancel.cancel();
            let second = limiter.acquire(cancelled.cancelled()).await;
            assert!(matches!(second, Err(CalqueError::Cancelled)));
            drop(first);
        });
    }
}
