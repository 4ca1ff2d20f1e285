//! The Handler contract: the uniform interface every middleware in a chain
//! implements, and that `Flow` composes.
//!
//! Grounded on the teacher's `actor.rs`: a small async trait at the seam
//! between "a thing with private state" and "a thing the runtime drives",
//! with a lightweight function-adapter alongside it (mirroring how
//! `monocoque-core` lets a bare closure stand in for a full actor in
//! tests).

use bytes::Bytes;
use std::future::Future;

use crate::buffer::SegmentedBuffer;
use crate::context::{Cancelled, Context};
use crate::error::{CalqueError, Result};

/// A lazy, finite, non-restartable byte producer.
///
/// `PipeReader` is the Flow's own implementation; input adapters (§`convert`)
/// provide others (a fixed byte slice, a caller-supplied source, ...).
#[async_trait::async_trait]
pub trait Source: Send {
    /// Read up to `max` bytes. `Ok(None)` signals a clean end-of-stream.
    async fn read(&mut self, max: usize, cancelled: Cancelled<'_>) -> Result<Option<Bytes>>;
}

/// A lazy byte consumer. Blocking on `write` conveys backpressure to the
/// caller.
#[async_trait::async_trait]
pub trait Sink: Send {
    /// Write one chunk, returning the number of bytes accepted.
    async fn write(&mut self, data: Bytes, cancelled: Cancelled<'_>) -> Result<usize>;

    /// Signal that no more data is coming. Errors from `close` are
    /// ordinarily non-fatal to a Flow (see §7 `PipeClose`), but sinks with
    /// their own flush semantics (e.g. a file) may still surface one.
    async fn close(&mut self) -> Result<()>;
}

/// Immutable carrier for a handler's input: the request context and a
/// byte source. "Immutable" describes the tuple `(ctx, source)` itself —
/// reading from `source` advances it, as with any finite stream.
pub struct Request {
    ctx: Context,
    source: Box<dyn Source>,
}

impl Request {
    /// Build a request from a context and a boxed source.
    #[must_use]
    pub fn new(ctx: Context, source: Box<dyn Source>) -> Self {
        Self { ctx, source }
    }

    /// The request's context.
    #[must_use]
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Direct access to the underlying source, for handlers that stream
    /// rather than buffer.
    pub fn source_mut(&mut self) -> &mut dyn Source {
        self.source.as_mut()
    }

    /// Decompose into `(ctx, source)`. Used by `Flow`'s own `Handler` impl
    /// to re-run a nested Flow as a plain source/sink pair (§4.5: "Flow is
    /// itself a Handler ... enabling nesting").
    #[must_use]
    pub fn into_parts(self) -> (Context, Box<dyn Source>) {
        (self.ctx, self.source)
    }

    /// Fully consume the input into one contiguous `Bytes` buffer.
    ///
    /// Per §4.4, streaming handlers should avoid this and read from
    /// `source_mut` directly to preserve constant-memory behavior; this
    /// helper exists for middleware that must see the whole payload (e.g.
    /// a prompt template).
    pub async fn read_all(&mut self) -> Result<Bytes> {
        let mut collected = SegmentedBuffer::new();
        loop {
            match self.source.read(64 * 1024, self.ctx.cancelled()).await? {
                Some(chunk) => collected.push(chunk),
                None => break,
            }
        }
        let len = collected.len();
        Ok(collected.take_bytes(len).unwrap_or_default())
    }

    /// Fully consume the input as UTF-8 text. Invalid UTF-8 is replaced
    /// with the Unicode replacement character, matching the teacher's
    /// general preference for lossy decoding over panicking in
    /// best-effort diagnostic paths.
    pub async fn read_all_text(&mut self) -> Result<String> {
        let bytes = self.read_all().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Carrier for a handler's output: a byte sink.
pub struct Response {
    sink: Box<dyn Sink>,
}

impl Response {
    /// Build a response from a boxed sink.
    #[must_use]
    pub fn new(sink: Box<dyn Sink>) -> Self {
        Self { sink }
    }

    /// Direct access to the underlying sink, for handlers that stream
    /// rather than buffer.
    pub fn sink_mut(&mut self) -> &mut dyn Sink {
        self.sink.as_mut()
    }

    /// Decompose into the underlying sink. See `Request::into_parts`.
    #[must_use]
    pub fn into_sink(self) -> Box<dyn Sink> {
        self.sink
    }

    /// Write an entire buffer, looping over `Sink::write` until every byte
    /// is accepted.
    pub async fn write_all(&mut self, mut data: Bytes, ctx: &Context) -> Result<()> {
        while !data.is_empty() {
            let accepted = self.sink.write(data.clone(), ctx.cancelled()).await?;
            if accepted == 0 {
                return Err(CalqueError::PipeClosed);
            }
            data = data.slice(accepted..);
        }
        Ok(())
    }

    /// Write UTF-8 text.
    pub async fn write_text(&mut self, text: impl Into<String>, ctx: &Context) -> Result<()> {
        self.write_all(Bytes::from(text.into().into_bytes()), ctx).await
    }
}

/// Middleware unit: `serve(Request, Response) -> Result<()>`.
///
/// Stateless with respect to the Flow that runs it — a `Handler` may hold
/// private state across invocations (a cache, a rate limiter's counters)
/// but must not assume anything about its position in, or the identity of,
/// the chain that calls it.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Consume `req`, produce into `res`.
    async fn serve(&self, req: Request, res: Response) -> Result<()>;
}

#[async_trait::async_trait]
impl<H: Handler + ?Sized> Handler for std::sync::Arc<H> {
    async fn serve(&self, req: Request, res: Response) -> Result<()> {
        (**self).serve(req, res).await
    }
}

/// Adapter letting a bare async function satisfy the `Handler` contract.
/// Built by `Flow::append_fn`.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Request, Response) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    /// Wrap `f` as a `Handler`.
    #[must_use]
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request, Response) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn serve(&self, req: Request, res: Response) -> Result<()> {
        (self.f)(req, res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;

    #[test]
    fn read_all_collects_every_chunk() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (writer, reader) = pipe(4);
            let ctx = Context::background();
            writer.write(Bytes::from_static(b"ab"), ctx.cancelled()).await.unwrap();
            writer.write(Bytes::from_static(b"cd"), ctx.cancelled()).await.unwrap();
            drop(writer);
            let mut req = Request::new(ctx, Box::new(reader));
            let all = req.read_all().await.unwrap();
            assert_eq!(&all[..], b"abcd");
        });
    }

    #[test]
    fn fn_handler_runs_closure() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (writer, reader) = pipe(4);
            let (out_writer, mut out_reader) = pipe(4);
            let ctx = Context::background();
            writer.write(Bytes::from_static(b"hi"), ctx.cancelled()).await.unwrap();
            drop(writer);
            let handler = FnHandler::new(|mut req: Request, mut res: Response| async move {
                let ctx = req.ctx().clone();
                let data = req.read_all().await?;
                res.write_all(data, &ctx).await
            });
            let req = Request::new(ctx.clone(), Box::new(reader));
            let res = Response::new(Box::new(out_writer));
            handler.serve(req, res).await.unwrap();
            let got = out_reader.read(16, ctx.cancelled()).await.unwrap();
            assert_eq!(got, Some(Bytes::from_static(b"hi")));
        });
    }
}
