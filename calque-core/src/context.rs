//! Request context: cancellation, deadline, and a small fixed set of typed
//! values (`MetadataBus`, an opaque logger, trace id, request id).
//!
//! Modeled on the teacher crate's habit of pairing a command channel with a
//! cheaply-clonable handle (`UserCmd`/`SocketEvent` senders in `actor.rs`),
//! adapted here into a cancellation broadcast: many concurrent workers each
//! need their own `Cancelled` future without consuming a shared channel item.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use event_listener::{Event, EventListener};
use parking_lot::Mutex;

use crate::bus::MetadataBus;
use crate::error::CalqueError;

/// Opaque structured-logger slot. The core never calls this itself; it
/// exists purely so collaborator crates (prompt templates, memory stores,
/// rate limiters, ...) have a stable place to stash a structured logger in
/// the context. See §6: "Context accessors ... for a structured logger
/// (opaque to the core)."
pub trait CoreLogger: Send + Sync {
    /// Emit a single log line. `level` is a free-form string (e.g. "info",
    /// "warn") since the core has no opinion on logging-crate levels.
    fn log(&self, level: &str, message: &str);
}

struct CancelInner {
    flag: AtomicBool,
    event: Event,
    reason: Mutex<Option<CalqueError>>,
}

impl CancelInner {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            event: Event::new(),
            reason: Mutex::new(None),
        }
    }

    fn cancel_with(&self, reason: CalqueError) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.event.notify(usize::MAX);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A handle that can cancel every `Context` derived from the same root.
///
/// Dropping a `CancelHandle` does not cancel the context; only an explicit
/// `cancel()` (or a deadline elapsing) does.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    /// Cancel the context. Idempotent: the first call wins and records the
    /// reason every later `Cancelled` future observes.
    pub fn cancel(&self) {
        self.inner.cancel_with(CalqueError::Cancelled);
    }
}

/// A future that resolves once the owning context is cancelled (explicitly
/// or via deadline). Every Flow suspension point (§5) races its real
/// operation against one of these with `futures::select!`.
pub struct Cancelled<'a> {
    inner: &'a Arc<CancelInner>,
    listener: Option<EventListener>,
}

impl std::future::Future for Cancelled<'_> {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        let this = self.get_mut();
        loop {
            if this.inner.is_cancelled() {
                return std::task::Poll::Ready(());
            }
            match this.listener.as_mut() {
                None => this.listener = Some(this.inner.event.listen()),
                Some(listener) => {
                    match std::pin::Pin::new(listener).poll(cx) {
                        std::task::Poll::Ready(()) => {
                            this.listener = None;
                            // Re-check the flag; a spurious notify (from a
                            // *different* cancel_with caller racing us) must
                            // not be reported as cancellation.
                        }
                        std::task::Poll::Pending => return std::task::Poll::Pending,
                    }
                }
            }
        }
    }
}

/// Immutable request context: `(cancellation, deadline, values)` per §3.
///
/// Cloning a `Context` is cheap (it clones a handful of `Arc`s). Derived
/// contexts (`with_bus`, `with_logger`, ...) share the same cancellation
/// state as their parent — cancelling a derived context cancels the root
/// and vice versa, matching Go's `context.Context` composition model this
/// crate's handlers are most often ported from.
#[derive(Clone)]
pub struct Context {
    cancel: Arc<CancelInner>,
    bus: Option<Arc<MetadataBus>>,
    logger: Option<Arc<dyn CoreLogger>>,
    trace_id: Option<Arc<str>>,
    request_id: Option<Arc<str>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("has_bus", &self.bus.is_some())
            .field("trace_id", &self.trace_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl Context {
    /// A fresh, never-cancelled context with no values set. Analogous to
    /// Go's `context.Background()`; callers typically build on top of this
    /// with `with_bus` / `with_cancel` / `with_deadline`.
    #[must_use]
    pub fn background() -> Self {
        Self {
            cancel: Arc::new(CancelInner::new()),
            bus: None,
            logger: None,
            trace_id: None,
            request_id: None,
        }
    }

    /// Attach (or replace) the `MetadataBus` reachable through this context.
    #[must_use]
    pub fn with_bus(&self, bus: Arc<MetadataBus>) -> Self {
        let mut ctx = self.clone();
        ctx.bus = Some(bus);
        ctx
    }

    /// Attach an opaque structured logger.
    #[must_use]
    pub fn with_logger(&self, logger: Arc<dyn CoreLogger>) -> Self {
        let mut ctx = self.clone();
        ctx.logger = Some(logger);
        ctx
    }

    /// Attach a trace id.
    #[must_use]
    pub fn with_trace_id(&self, trace_id: impl Into<Arc<str>>) -> Self {
        let mut ctx = self.clone();
        ctx.trace_id = Some(trace_id.into());
        ctx
    }

    /// Attach a request id.
    #[must_use]
    pub fn with_request_id(&self, request_id: impl Into<Arc<str>>) -> Self {
        let mut ctx = self.clone();
        ctx.request_id = Some(request_id.into());
        ctx
    }

    /// Derive a context plus a `CancelHandle` that cancels it (and every
    /// context cloned/derived from it).
    #[must_use]
    pub fn with_cancel(&self) -> (CancelHandle, Self) {
        let ctx = self.clone();
        let handle = CancelHandle {
            inner: ctx.cancel.clone(),
        };
        (handle, ctx)
    }

    /// Derive a context that cancels itself with `DeadlineExceeded` after
    /// `timeout` elapses, unless cancelled sooner for another reason.
    ///
    /// Spawns a `compio` timer task that holds only a weak-free clone of the
    /// cancellation state; the task exits as soon as the context is
    /// cancelled by any means, so it never outlives a fast `run`.
    #[must_use]
    pub fn with_deadline(&self, timeout: Duration) -> Self {
        let ctx = self.clone();
        let cancel = ctx.cancel.clone();
        compio::runtime::spawn(async move {
            futures::select! {
                () = compio::time::sleep(timeout).fuse() => {
                    cancel.cancel_with(CalqueError::DeadlineExceeded(timeout));
                }
                () = wait_cancelled(&cancel).fuse() => {}
            }
        })
        .detach();
        ctx
    }

    /// A future that resolves once this context is cancelled.
    #[must_use]
    pub fn cancelled(&self) -> Cancelled<'_> {
        Cancelled {
            inner: &self.cancel,
            listener: None,
        }
    }

    /// `true` if this context has already been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The error to report for a cancelled operation: the specific reason
    /// (e.g. `DeadlineExceeded`) if one was recorded, else `Cancelled`.
    #[must_use]
    pub fn cancellation_error(&self) -> CalqueError {
        self.cancel
            .reason
            .lock()
            .as_ref()
            .map_or(CalqueError::Cancelled, CalqueError::duplicate)
    }

    /// The `MetadataBus` reachable through this context, if any.
    #[must_use]
    pub fn bus(&self) -> Option<&Arc<MetadataBus>> {
        self.bus.as_ref()
    }

    /// The opaque structured logger, if any.
    #[must_use]
    pub fn logger(&self) -> Option<&Arc<dyn CoreLogger>> {
        self.logger.as_ref()
    }

    /// The trace id, if any.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// The request id, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

async fn wait_cancelled(inner: &Arc<CancelInner>) {
    Cancelled {
        inner,
        listener: None,
    }
    .await;
}

use futures::FutureExt as _;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_not_cancelled() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn cancel_handle_cancels_all_derived_contexts() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (handle, ctx) = Context::background().with_cancel();
            let derived = ctx.with_trace_id("abc");
            assert!(!derived.is_cancelled());
            handle.cancel();
            assert!(derived.is_cancelled());
            assert!(ctx.is_cancelled());
            derived.cancelled().await;
        });
    }

    #[test]
    fn deadline_cancels_with_deadline_exceeded() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = Context::background().with_deadline(Duration::from_millis(10));
            ctx.cancelled().await;
            assert!(matches!(
                ctx.cancellation_error(),
                CalqueError::DeadlineExceeded(_)
            ));
        });
    }

    #[test]
    fn values_round_trip() {
        let ctx = Context::background()
            .with_trace_id("trace-1")
            .with_request_id("req-1");
        assert_eq!(ctx.trace_id(), Some("trace-1"));
        assert_eq!(ctx.request_id(), Some("req-1"));
        assert!(ctx.bus().is_none());
    }
}
