//! Converter adapters: translate heterogeneous caller-provided values to a
//! byte `Source`, and heterogeneous caller-provided destinations to a byte
//! `Sink` (or a buffered assignment).
//!
//! Per the design note on polymorphism, input/output kinds are represented
//! as two small tagged enums rather than via structural typing — the same
//! choice the teacher makes for its own `SocketType`/`EndpointKind` enums
//! rather than duck-typed traits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::context::Context;
use crate::error::{CalqueError, Result};
use crate::handler::{Sink, Source};

/// Capability for a caller type that can hand over a `Source` on demand,
/// without the core needing to know its concrete type.
pub trait ToSource: Send {
    /// Produce the byte source this value represents.
    fn to_source(self: Box<Self>) -> Box<dyn Source>;
}

/// Capability for a caller type that can stream-consume a `Source` itself
/// (e.g. a server-sent-event encoder). Returns a boxed future rather than
/// using `async_trait` because the receiver is `Box<Self>`.
pub trait FromSource: Send {
    /// Drain `source` into this destination, streaming as bytes arrive.
    fn from_source(
        self: Box<Self>,
        source: Box<dyn Source>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// A caller-provided input value, normalized to one of four kinds.
pub enum Input {
    /// UTF-8 text, encoded to bytes with no intermediate copy beyond the
    /// `String`'s own buffer.
    Text(String),
    /// A byte sequence, used directly with no copy.
    Bytes(Bytes),
    /// An already byte-producing source, used as-is.
    Source(Box<dyn Source>),
    /// A caller type exposing `ToSource`.
    Custom(Box<dyn ToSource>),
}

/// A byte-sequence-backed `Source`, produced directly (no copy) from a
/// `Bytes` the caller already owns, or from a `String`'s bytes.
struct BytesSource(Option<Bytes>);

impl BytesSource {
    fn new(bytes: Bytes) -> Self {
        Self(if bytes.is_empty() { None } else { Some(bytes) })
    }
}

#[async_trait::async_trait]
impl Source for BytesSource {
    async fn read(
        &mut self,
        max: usize,
        _cancelled: crate::context::Cancelled<'_>,
    ) -> Result<Option<Bytes>> {
        let Some(bytes) = self.0.take() else {
            return Ok(None);
        };
        if bytes.len() <= max {
            Ok(Some(bytes))
        } else {
            let rest = bytes.slice(max..);
            let head = bytes.slice(..max);
            self.0 = Some(rest);
            Ok(Some(head))
        }
    }
}

/// Convert a caller-provided `Input` to a byte source.
pub fn convert_input(input: Input) -> Box<dyn Source> {
    match input {
        Input::Text(text) => Box::new(BytesSource::new(Bytes::from(text.into_bytes()))),
        Input::Bytes(bytes) => Box::new(BytesSource::new(bytes)),
        Input::Source(source) => source,
        Input::Custom(custom) => custom.to_source(),
    }
}

/// A sink that discards everything written to it without buffering.
///
/// This is what backs the `Output::Discard` kind (§4.2): "MUST NOT buffer;
/// prevents memory blow-up on long streams with no consumer."
struct DiscardSink;

#[async_trait::async_trait]
impl Sink for DiscardSink {
    async fn write(&mut self, data: Bytes, _cancelled: crate::context::Cancelled<'_>) -> Result<usize> {
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A cheaply-clonable handle to a buffer an `Output` variant will fill in
/// once the Flow finishes. Stands in for the "buffer pointer" the source
/// spec describes, since Rust has no equivalent of an out-parameter that
/// survives across a spawned async task.
pub struct OutputCell<T>(Arc<Mutex<Option<T>>>);

impl<T> Clone for OutputCell<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for OutputCell<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }
}

impl<T> OutputCell<T> {
    /// An empty cell, to be filled once `run` completes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, value: T) {
        *self.0.lock() = Some(value);
    }

    /// Take the filled value. Returns `None` if `run` has not completed or
    /// this output kind was never selected.
    pub fn take(&self) -> Option<T> {
        self.0.lock().take()
    }
}

impl<T: Clone> OutputCell<T> {
    /// Read the filled value without consuming it.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.0.lock().clone()
    }
}

/// A caller-provided output destination, normalized to one of six kinds.
pub enum Output {
    /// Discard everything, without buffering (§4.2).
    Discard,
    /// A byte-consuming sink; bytes are copied to it as they arrive.
    Sink(Box<dyn Sink>),
    /// A caller type exposing `FromSource`, driven directly (no pre-read).
    Custom(Box<dyn FromSource>),
    /// Fully read, then assign as text. Buffered by contract: the value is
    /// returned by value, so the whole payload must be collected first.
    TextBuffer(OutputCell<String>),
    /// Fully read, then assign as bytes. Buffered by contract.
    BytesBuffer(OutputCell<Bytes>),
    /// Fully read, then assign a readable `Source` over the buffered
    /// bytes. Documented as incompatible with live streaming: the call
    /// must return before the caller can read from the assigned source.
    SourceBuffer(OutputCell<Box<dyn Source>>),
}

/// Drain `source` into `output`, streaming wherever the output kind allows
/// it. Used by the Flow's output-consume worker (§4.5 step 7) and by the
/// zero-handler fast path for kinds that don't short-circuit.
pub async fn convert_output(output: Output, mut source: Box<dyn Source>, ctx: &Context) -> Result<()> {
    match output {
        Output::Discard => {
            let mut sink = DiscardSink;
            drain(source.as_mut(), &mut sink, ctx).await
        }
        Output::Sink(mut sink) => {
            let result = drain(source.as_mut(), sink.as_mut(), ctx).await;
            // Close errors are non-fatal (§7 PipeClose); only report the
            // drain error, if any.
            let _ = sink.close().await;
            result
        }
        Output::Custom(custom) => custom.from_source(source).await,
        Output::TextBuffer(cell) => {
            let bytes = read_all(source.as_mut(), ctx).await?;
            cell.set(String::from_utf8_lossy(&bytes).into_owned());
            Ok(())
        }
        Output::BytesBuffer(cell) => {
            let bytes = read_all(source.as_mut(), ctx).await?;
            cell.set(bytes);
            Ok(())
        }
        Output::SourceBuffer(cell) => {
            let bytes = read_all(source.as_mut(), ctx).await?;
            cell.set(Box::new(BytesSource::new(bytes)));
            Ok(())
        }
    }
}

async fn drain(source: &mut dyn Source, sink: &mut dyn Sink, ctx: &Context) -> Result<()> {
    loop {
        match source.read(64 * 1024, ctx.cancelled()).await? {
            Some(chunk) => {
                let mut remaining = chunk;
                while !remaining.is_empty() {
                    let accepted = sink.write(remaining.clone(), ctx.cancelled()).await?;
                    if accepted == 0 {
                        return Err(CalqueError::PipeClosed);
                    }
                    remaining = remaining.slice(accepted..);
                }
            }
            None => return Ok(()),
        }
    }
}

async fn read_all(source: &mut dyn Source, ctx: &Context) -> Result<Bytes> {
    let mut collected = crate::buffer::SegmentedBuffer::new();
    loop {
        match source.read(64 * 1024, ctx.cancelled()).await? {
            Some(chunk) => collected.push(chunk),
            None => break,
        }
    }
    let len = collected.len();
    Ok(collected.take_bytes(len).unwrap_or_default())
}

/// Zero-handler fast path (§4.2): for matching input/output kinds, pass the
/// value through without building a pipe topology. Takes `input`/`output`
/// by value (rather than by reference) because the source↔source arm must
/// move a `Box<dyn Source>` straight into the output cell, and a boxed
/// trait object cannot be cloned out of a shared reference. Returns
/// `Err((input, output))`, handing both back unchanged, if no fast path
/// applied so the caller can fall through to the general streaming path.
#[allow(clippy::type_complexity)]
pub async fn try_fast_path(input: Input, output: Output) -> std::result::Result<Result<()>, (Input, Output)> {
    match (input, output) {
        (Input::Text(text), Output::TextBuffer(cell)) => {
            cell.set(text);
            Ok(Ok(()))
        }
        (Input::Bytes(bytes), Output::BytesBuffer(cell)) => {
            // Byte-sequence -> byte-sequence MUST copy to avoid aliasing
            // between caller input and caller output (§4.2).
            cell.set(Bytes::copy_from_slice(&bytes));
            Ok(Ok(()))
        }
        (Input::Source(source), Output::SourceBuffer(cell)) => {
            // Hand the source straight to the cell: no read, no copy. This
            // is what keeps a handler-less source -> source Flow lazy
            // instead of buffering the whole stream via `read_all`.
            cell.set(source);
            Ok(Ok(()))
        }
        (input, output) => Err((input, output)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn text_input_converts_to_source() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = Context::background();
            let mut source = convert_input(Input::Text("hi".into()));
            let chunk = source.read(16, ctx.cancelled()).await.unwrap();
            assert_eq!(chunk, Some(Bytes::from_static(b"hi")));
        });
    }

    #[test]
    fn bytes_source_splits_on_max() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = Context::background();
            let mut source = convert_input(Input::Bytes(Bytes::from_static(b"abcdef")));
            let first = source.read(3, ctx.cancelled()).await.unwrap().unwrap();
            let second = source.read(3, ctx.cancelled()).await.unwrap().unwrap();
            assert_eq!(&first[..], b"abc");
            assert_eq!(&second[..], b"def");
        });
    }

    #[test]
    fn discard_output_never_buffers_and_succeeds() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = Context::background();
            let source = convert_input(Input::Bytes(Bytes::from(vec![0u8; 4096])));
            convert_output(Output::Discard, source, &ctx).await.unwrap();
        });
    }

    #[test]
    fn text_buffer_output_collects_full_payload() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = Context::background();
            let source = convert_input(Input::Text("hello".into()));
            let cell = OutputCell::new();
            convert_output(Output::TextBuffer(cell.clone()), source, &ctx)
                .await
                .unwrap();
            assert_eq!(cell.take(), Some("hello".to_string()));
        });
    }

    #[test]
    fn fast_path_copies_bytes_without_aliasing() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let original = Bytes::from_static(b"abc");
            let input = Input::Bytes(original.clone());
            let cell = OutputCell::new();
            let output = Output::BytesBuffer(cell.clone());
            let handled = try_fast_path(input, output).await;
            assert!(handled.expect("fast path should match").is_ok());
            let copied = cell.take().unwrap();
            assert_eq!(copied, original);
            assert_ne!(copied.as_ptr(), original.as_ptr());
        });
    }

    #[test]
    fn fast_path_hands_source_straight_through_without_reading() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = Context::background();
            let source: Box<dyn Source> = convert_input(Input::Bytes(Bytes::from_static(b"xyz")));
            let input = Input::Source(source);
            let cell = OutputCell::new();
            let output = Output::SourceBuffer(cell.clone());
            let handled = try_fast_path(input, output).await;
            assert!(handled.expect("fast path should match").is_ok());
            let mut handed_back = cell.take().expect("source should be set");
            let chunk = handed_back.read(16, ctx.cancelled()).await.unwrap();
            assert_eq!(chunk, Some(Bytes::from_static(b"xyz")));
        });
    }

    #[test]
    fn fast_path_misses_hand_input_and_output_back_unchanged() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let input = Input::Text("hi".into());
            let cell = OutputCell::new();
            let output = Output::BytesBuffer(cell);
            let missed = try_fast_path(input, output).await;
            assert!(matches!(missed, Err((Input::Text(_), Output::BytesBuffer(_)))));
        });
    }
}
