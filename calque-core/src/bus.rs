//! `MetadataBus`: a concurrent key/value store paired with a bounded event
//! stream, shared by every handler in a `Flow` invocation via the `Context`.
//!
//! Grounded on the teacher crate's `inproc::INPROC_REGISTRY` (`inproc.rs`): a
//! `DashMap`-backed concurrent table that many callers mutate directly,
//! paired here with a channel-based event fan-out, since handlers in a chain
//! need both a shared table and an ordered stream, not just the table alone.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use event_listener::Event;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::context::Cancelled;
use crate::error::{CalqueError, Result};

/// A value stored in, or carried as an event over, a `MetadataBus`.
///
/// A small closed set rather than `Box<dyn Any>`: handlers across a chain
/// are written independently and need a value they can match on without
/// downcasting.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes, e.g. a partial decode result or a binary attachment.
    Bytes(Bytes),
    /// A signed integer (token counts, status codes, retry counters, ...).
    Int(i64),
    /// A floating-point value (scores, latencies, temperatures, ...).
    Float(f64),
    /// A boolean flag.
    Bool(bool),
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A single event pushed onto the bus's shared stream.
///
/// Distinct from the key/value store: the store holds the latest value for
/// a key, while events are an ordered log every handler downstream can
/// observe once (e.g. "token produced", "retrying upstream call").
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEvent {
    /// The event's key, usually naming the handler or signal that produced
    /// it (not required to match any key in the store).
    pub key: String,
    /// The event's payload.
    pub value: MetadataValue,
}

impl MetadataEvent {
    /// Build an event from any `Into<MetadataValue>` payload.
    pub fn new(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Concurrent key/value store plus bounded event stream, shared by every
/// handler in a Flow invocation.
///
/// All methods are usable from any number of concurrent handler workers
/// without external synchronization. `close()` is idempotent: it may be
/// called by any handler, any number of times, from any worker, and every
/// operation after the first `close()` observes `CalqueError::BusClosed`
/// (store reads remain available — only the event stream and further
/// writes are cut off).
pub struct MetadataBus {
    store: DashMap<String, MetadataValue>,
    events_tx: Mutex<Option<flume::Sender<MetadataEvent>>>,
    events_rx: flume::Receiver<MetadataEvent>,
    closed: AtomicBool,
    /// Notified on `close()` so a `send` parked on a full buffer wakes up
    /// even though dropping our own sender clone does not touch whatever
    /// clone that `send` is blocked on.
    closed_event: Event,
}

impl MetadataBus {
    /// Create a bus whose event stream holds at most `buffer` unread events
    /// before `send` blocks (see `FlowConfig::metadata_bus_buffer`).
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        let (events_tx, events_rx) = flume::bounded(buffer.max(1));
        Self {
            store: DashMap::new(),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx,
            closed: AtomicBool::new(false),
            closed_event: Event::new(),
        }
    }

    /// Resolves once `close()` has run. Mirrors `context.rs`'s `Cancelled`:
    /// check the flag, register a listener, re-check (closing the
    /// register/check race), then wait.
    async fn closed_signal(&self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let listener = self.closed_event.listen();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            listener.await;
        }
    }

    fn sender(&self) -> Option<flume::Sender<MetadataEvent>> {
        self.events_tx.lock().clone()
    }

    /// Set (or overwrite) a key in the store.
    pub fn set(&self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.store.insert(key.into(), value.into());
    }

    /// Read the current value of a key, if set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<MetadataValue> {
        self.store.get(key).map(|entry| entry.value().clone())
    }

    /// Remove a key from the store, returning its prior value if any.
    pub fn remove(&self, key: &str) -> Option<MetadataValue> {
        self.store.remove(key).map(|(_, value)| value)
    }

    /// Snapshot of all keys currently in the store.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.store.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Read `key` as text. Returns `(default, false)` if the key is unset or
    /// holds a non-text value.
    #[must_use]
    pub fn get_text(&self, key: &str) -> (String, bool) {
        match self.get(key) {
            Some(MetadataValue::Text(text)) => (text, true),
            _ => (String::new(), false),
        }
    }

    /// Read `key` as an integer. Returns `(0, false)` if the key is unset or
    /// holds a non-integer value.
    #[must_use]
    pub fn get_int(&self, key: &str) -> (i64, bool) {
        match self.get(key) {
            Some(MetadataValue::Int(n)) => (n, true),
            _ => (0, false),
        }
    }

    /// Read `key` as a boolean. Returns `(false, false)` if the key is unset
    /// or holds a non-boolean value.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> (bool, bool) {
        match self.get(key) {
            Some(MetadataValue::Bool(b)) => (b, true),
            _ => (false, false),
        }
    }

    /// True once `close()` has been called (by this or any other handle).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push an event, blocking (yielding to the executor) while the event
    /// stream is full. Returns `BusClosed` if the bus is already closed, or
    /// if `close()` runs or `cancelled` resolves before space frees up.
    ///
    /// Racing against `closed_event` (not just the channel's own disconnect)
    /// matters here: dropping our held sender clone in `close()` does not
    /// wake a *different* sender clone already parked in `send_async` on a
    /// full buffer, since flume only wakes blocked senders when every
    /// receiver drops or space frees up.
    pub async fn send(&self, event: MetadataEvent, mut cancelled: Cancelled<'_>) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(CalqueError::BusClosed);
        };
        futures::select! {
            result = tx.send_async(event).fuse() => {
                result.map_err(|_| CalqueError::BusClosed)
            }
            () = (&mut cancelled).fuse() => Err(CalqueError::Cancelled),
            () = self.closed_signal().fuse() => Err(CalqueError::BusClosed),
        }
    }

    /// Push an event without waiting; fails immediately if the stream is
    /// full or the bus is closed, rather than blocking the caller.
    pub fn send_non_blocking(&self, event: MetadataEvent) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(CalqueError::BusClosed);
        };
        tx.try_send(event).map_err(|_| CalqueError::BusClosed)
    }

    /// Receive the next event, blocking until one arrives, the bus closes
    /// with nothing left queued, or `cancelled` resolves first.
    ///
    /// Deliberately does not race `closed_event` directly: flume's own
    /// receiver already yields every already-buffered event before
    /// reporting disconnection, and racing an independent close signal here
    /// could non-deterministically discard a queued event instead of
    /// draining it.
    pub async fn receive(&self, mut cancelled: Cancelled<'_>) -> Result<MetadataEvent> {
        futures::select! {
            result = self.events_rx.recv_async().fuse() => {
                result.map_err(|_| CalqueError::BusClosed)
            }
            () = (&mut cancelled).fuse() => Err(CalqueError::Cancelled),
        }
    }

    /// Receive the next already-queued event without waiting.
    ///
    /// Returns `Ok(None)` if the stream is empty but still open, and
    /// `Err(BusClosed)` once it is both empty and closed.
    pub fn try_receive(&self) -> Result<Option<MetadataEvent>> {
        match self.events_rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(CalqueError::BusClosed),
        }
    }

    /// Close the bus. Idempotent: later calls are no-ops. Already-queued
    /// events remain readable via `receive`/`try_receive` until drained;
    /// after that, both return `BusClosed`. The store is unaffected — reads
    /// via `get`/`keys` keep working after close.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("metadata bus closed");
        // Dropping the held sender lets `recv_async`/`try_recv` observe
        // disconnection once every in-flight `send` finishes and the queue
        // drains, without needing every handler to drop its own clone.
        self.events_tx.lock().take();
        // Wake every `send` parked on a full buffer; see `send`'s doc comment.
        self.closed_event.notify(usize::MAX);
    }
}
