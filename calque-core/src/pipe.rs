//! `PipePair`: a single-producer/single-consumer byte channel between two
//! adjacent handlers in a chain, with blocking backpressure and propagated
//! close/error in either direction.
//!
//! Grounded on two teacher pieces: the rendezvous-channel plumbing of
//! `inproc.rs` (paired endpoints over a bounded channel) for the transport,
//! and the RAII terminal-state tracking of `poison.rs`'s `PoisonGuard` for
//! close-with-error — the peer learns *why* the pipe ended, not just that
//! it did. Partial-read buffering reuses `buffer::SegmentedBuffer`
//! unchanged.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::buffer::SegmentedBuffer;
use crate::context::Cancelled;
use crate::error::{CalqueError, Result};
use crate::handler::{Sink, Source};

enum PipeFrame {
    Data(Bytes),
    Eof,
}

struct Shared {
    writer_closed: Mutex<Option<Arc<CalqueError>>>,
    reader_closed: Mutex<Option<Arc<CalqueError>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            writer_closed: Mutex::new(None),
            reader_closed: Mutex::new(None),
        }
    }

    fn record_writer_close(&self, reason: Option<CalqueError>) {
        let mut slot = self.writer_closed.lock();
        if slot.is_none() {
            *slot = reason.map(Arc::new);
        }
    }

    fn record_reader_close(&self, reason: Option<CalqueError>) {
        let mut slot = self.reader_closed.lock();
        if slot.is_none() {
            *slot = reason.map(Arc::new);
        }
    }

    fn reader_close_error(&self) -> Option<Arc<CalqueError>> {
        self.reader_closed.lock().clone()
    }

    fn writer_close_error(&self) -> Option<Arc<CalqueError>> {
        self.writer_closed.lock().clone()
    }
}

fn to_owned_error(arc: &CalqueError) -> CalqueError {
    arc.duplicate()
}

/// Create a connected `(PipeWriter, PipeReader)` pair.
///
/// `capacity` bounds how many unread frames may queue before `write` blocks
/// (yielding to the executor) — the mechanism behind the crate's streaming
/// memory bound: a slow downstream handler applies backpressure all the way
/// to the producer instead of letting buffered data grow without limit.
#[must_use]
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    tracing::trace!(capacity, "pipe opened");
    let (tx, rx) = flume::bounded(capacity.max(1));
    let shared = Arc::new(Shared::new());
    (
        PipeWriter {
            tx: Some(tx),
            shared: shared.clone(),
        },
        PipeReader {
            rx,
            shared,
            buffer: SegmentedBuffer::new(),
            eof: false,
        },
    )
}

/// The write half of a pipe. Dropping it without calling `close` or
/// `close_with_error` closes the pipe with no recorded reason, which the
/// reader observes as a plain end-of-stream.
pub struct PipeWriter {
    tx: Option<flume::Sender<PipeFrame>>,
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Write one chunk, blocking while the pipe is full.
    ///
    /// Returns the number of bytes accepted (always `data.len()` on
    /// success — this pipe never partially accepts a chunk). A zero-length
    /// `data` is a no-op that neither blocks nor produces a frame the
    /// reader observes.
    pub async fn write(&self, data: Bytes, mut cancelled: Cancelled<'_>) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if let Some(reason) = self.shared.reader_close_error() {
            return Err(to_owned_error(&reason));
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(CalqueError::PipeClosed);
        };
        let len = data.len();
        futures::select! {
            result = tx.send_async(PipeFrame::Data(data)).fuse() => {
                result.map(|()| len).map_err(|_| {
                    self.shared
                        .reader_close_error()
                        .map_or(CalqueError::PipeClosed, |reason| to_owned_error(&reason))
                })
            }
            () = (&mut cancelled).fuse() => Err(CalqueError::Cancelled),
        }
    }

    /// Close the write end cleanly. The reader drains any buffered data,
    /// then sees end-of-stream (`Ok(None)` from `read`). Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Best-effort: if the reader already closed, there is nothing
            // left to deliver `Eof` to, and that is not an error here.
            let _ = tx.try_send(PipeFrame::Eof);
        }
    }

    /// Close the write end with an error. The reader's next `read` past any
    /// buffered data returns this error instead of a clean end-of-stream.
    /// Idempotent — only the first call's error is recorded.
    pub fn close_with_error(&mut self, err: CalqueError) {
        tracing::trace!(error = %err, "pipe writer closed with error");
        self.shared.record_writer_close(Some(err));
        self.tx.take();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// The read half of a pipe.
pub struct PipeReader {
    rx: flume::Receiver<PipeFrame>,
    shared: Arc<Shared>,
    buffer: SegmentedBuffer,
    eof: bool,
}

impl PipeReader {
    /// Read up to `max` bytes.
    ///
    /// Returns `Ok(Some(chunk))` with `1..=max` bytes, `Ok(None)` at a clean
    /// end-of-stream, or the writer's `close_with_error` reason (or
    /// `Cancelled`) otherwise. A chunk may be shorter than `max`; callers
    /// wanting an exact size should use `read_exact`.
    pub async fn read(&mut self, max: usize, mut cancelled: Cancelled<'_>) -> Result<Option<Bytes>> {
        if max == 0 {
            return Ok(Some(Bytes::new()));
        }
        loop {
            if !self.buffer.is_empty() {
                let take = self.buffer.len().min(max);
                return Ok(self.buffer.take_bytes(take));
            }
            if self.eof {
                return match self.shared.writer_close_error() {
                    Some(reason) => Err(to_owned_error(&reason)),
                    None => Ok(None),
                };
            }
            futures::select! {
                frame = self.rx.recv_async().fuse() => {
                    match frame {
                        Ok(PipeFrame::Data(chunk)) => self.buffer.push(chunk),
                        Ok(PipeFrame::Eof) | Err(_) => self.eof = true,
                    }
                }
                () = (&mut cancelled).fuse() => return Err(CalqueError::Cancelled),
            }
        }
    }

    /// Read exactly `n` bytes, looping over `read` until satisfied.
    ///
    /// If the stream ends (cleanly or with an error) before `n` bytes are
    /// available, returns that error; a clean end-of-stream short of `n`
    /// bytes is reported as `CalqueError::PipeClosed`.
    pub async fn read_exact(&mut self, n: usize, cancelled: &impl Fn() -> Cancelled<'_>) -> Result<Bytes> {
        let mut collected = SegmentedBuffer::new();
        let mut remaining = n;
        while remaining > 0 {
            match self.read(remaining, cancelled()).await? {
                Some(chunk) => {
                    remaining -= chunk.len();
                    collected.push(chunk);
                }
                None => return Err(CalqueError::PipeClosed),
            }
        }
        Ok(collected.take_bytes(n).unwrap_or_default())
    }

    /// Close the read end, optionally with an error the writer's next
    /// `write` will observe. Idempotent. Unblocks a writer currently
    /// blocked on a full pipe by dropping this reader's receiver handle.
    pub fn close(&mut self, err: Option<CalqueError>) {
        self.shared.record_reader_close(err);
        let (_, disconnected) = flume::bounded(0);
        self.rx = disconnected;
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close(None);
    }
}

#[async_trait::async_trait]
impl Source for PipeReader {
    async fn read(&mut self, max: usize, cancelled: Cancelled<'_>) -> Result<Option<Bytes>> {
        Self::read(self, max, cancelled).await
    }
}

#[async_trait::async_trait]
impl Sink for PipeWriter {
    async fn write(&mut self, data: Bytes, cancelled: Cancelled<'_>) -> Result<usize> {
        Self::write(self, data, cancelled).await
    }

    async fn close(&mut self) -> Result<()> {
        Self::close(self);
        Ok(())
    }
}

/// A `PipeWriter` shared between a handler worker's `Response` and the Flow
/// itself, so the Flow can close the pipe's write end after a handler's
/// `serve` returns (§4.5 step 5) no matter what the handler did with its
/// own clone.
#[derive(Clone)]
pub struct SharedWriter(Arc<async_lock::Mutex<PipeWriter>>);

impl SharedWriter {
    /// Wrap a `PipeWriter` for sharing between a handler and its Flow.
    #[must_use]
    pub fn new(writer: PipeWriter) -> Self {
        Self(Arc::new(async_lock::Mutex::new(writer)))
    }

    /// Close the write end cleanly. See `PipeWriter::close`.
    pub async fn close(&self) {
        self.0.lock().await.close();
    }

    /// Close the write end with an error. See `PipeWriter::close_with_error`.
    pub async fn close_with_error(&self, err: CalqueError) {
        self.0.lock().await.close_with_error(err);
    }
}

#[async_trait::async_trait]
impl Sink for SharedWriter {
    async fn write(&mut self, data: Bytes, cancelled: Cancelled<'_>) -> Result<usize> {
        self.0.lock().await.write(data, cancelled).await
    }

    async fn close(&mut self) -> Result<()> {
        Self::close(self).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn write_then_read_round_trips() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (writer, mut reader) = pipe(4);
            let ctx = Context::background();
            let written = writer
                .write(Bytes::from_static(b"hello"), ctx.cancelled())
                .await
                .unwrap();
            assert_eq!(written, 5);
            let chunk = reader.read(16, ctx.cancelled()).await.unwrap();
            assert_eq!(chunk, Some(Bytes::from_static(b"hello")));
        });
    }

    #[test]
    fn read_splits_across_max() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (writer, mut reader) = pipe(4);
            let ctx = Context::background();
            writer.write(Bytes::from_static(b"abcdef"), ctx.cancelled()).await.unwrap();
            let first = reader.read(3, ctx.cancelled()).await.unwrap().unwrap();
            let second = reader.read(3, ctx.cancelled()).await.unwrap().unwrap();
            assert_eq!(&first[..], b"abc");
            assert_eq!(&second[..], b"def");
        });
    }

    #[test]
    fn close_reports_clean_eof() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (mut writer, mut reader) = pipe(4);
            writer.close();
            let ctx = Context::background();
            let result = reader.read(16, ctx.cancelled()).await.unwrap();
            assert_eq!(result, None);
        });
    }

    #[test]
    fn close_with_error_propagates_to_reader() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (mut writer, mut reader) = pipe(4);
            writer.close_with_error(CalqueError::BusClosed);
            let ctx = Context::background();
            let err = reader.read(16, ctx.cancelled()).await.unwrap_err();
            assert!(matches!(err, CalqueError::BusClosed));
        });
    }

    #[test]
    fn reader_close_fails_writer() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (writer, mut reader) = pipe(4);
            reader.close(Some(CalqueError::PipeClosed));
            let ctx = Context::background();
            let err = writer.write(Bytes::from_static(b"x"), ctx.cancelled()).await;
            assert!(err.is_err());
        });
    }

    #[test]
    fn read_exact_accumulates_across_writes() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (writer, mut reader) = pipe(4);
            let ctx = Context::background();
            writer.write(Bytes::from_static(b"ab"), ctx.cancelled()).await.unwrap();
            writer.write(Bytes::from_static(b"cd"), ctx.cancelled()).await.unwrap();
            let got = reader.read_exact(4, &|| ctx.cancelled()).await.unwrap();
            assert_eq!(&got[..], b"abcd");
        });
    }

    #[test]
    fn no_byte_lost_or_duplicated_across_many_writes() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (writer, mut reader) = pipe(64);
            let ctx = Context::background();
            let mut expected = Vec::new();
            for i in 0u8..50 {
                let chunk = vec![i; 17];
                expected.extend_from_slice(&chunk);
                writer.write(Bytes::from(chunk), ctx.cancelled()).await.unwrap();
            }
            drop(writer);
            let mut got = Vec::new();
            while let Some(chunk) = reader.read(64, ctx.cancelled()).await.unwrap() {
                got.extend_from_slice(&chunk);
            }
            assert_eq!(got, expected);
        });
    }
}
