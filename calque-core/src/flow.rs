//! The Flow engine: builds the pipe topology, spawns one concurrent worker
//! per handler, enforces concurrency caps, consumes the final sink, and
//! surfaces the first failure.
//!
//! Grounded on the teacher's `pubsub::Hub` run loop for the "spawn workers,
//! race a command channel against completion" shape, and on `router.rs`'s
//! ordered-stage composition for chaining handlers one after another.
//! Concurrency capping reuses `concurrency::ConcurrencyLimiter`.

use std::sync::Arc;

use futures::FutureExt;

use crate::bus::MetadataBus;
use crate::concurrency::{BoundedLimiter, ConcurrencyLimiter, UnlimitedLimiter};
use crate::context::Context;
use crate::convert::{convert_input, convert_output, try_fast_path, Input, Output};
use crate::error::{CalqueError, Result};
use crate::handler::{FnHandler, Handler, Request, Response};
use crate::pipe::{pipe, SharedWriter};

/// Default multiplier applied to available hardware parallelism in
/// `MaxConcurrent::Auto` mode, when `FlowConfig::cpu_multiplier` is left at
/// its non-positive sentinel. Chosen to match the source's documented
/// default (§3).
pub const DEFAULT_CPU_MULTIPLIER: usize = 50;

/// Default `MetadataBus` event-stream capacity, used when
/// `FlowConfig::metadata_bus_buffer` is left at its non-positive sentinel.
pub const DEFAULT_BUS_BUFFER: usize = 100;

/// Capacity of each inter-handler pipe, in frames (not bytes). The
/// specification leaves this implementation-defined (§9 Open Questions:
/// "tuning is implementation-local"); one frame is enough to satisfy the
/// blocking-backpressure and FIFO invariants without adding a second,
/// harder-to-reason-about buffering layer on top of the bounded channel.
pub const PIPE_CAPACITY: usize = 1;

/// Concurrency cap for a `Flow`'s handler workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaxConcurrent {
    /// No cap.
    #[default]
    Unlimited,
    /// Derived from `num_cpus::get() * cpu_multiplier`.
    Auto,
    /// A fixed number of concurrent handler-worker slots.
    Fixed(usize),
}

/// Builder for a `Flow`'s fixed configuration. Per §3, `cpuMultiplier` and
/// `metadataBusBuffer` use `0` as the "apply the documented default"
/// sentinel, since both are otherwise required to be positive.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    max_concurrent: MaxConcurrent,
    cpu_multiplier: usize,
    metadata_bus_buffer: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_concurrent: MaxConcurrent::Unlimited,
            cpu_multiplier: 0,
            metadata_bus_buffer: 0,
        }
    }
}

impl FlowConfig {
    /// Start from the defaults: unlimited concurrency, default CPU
    /// multiplier, default bus buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency cap.
    #[must_use]
    pub fn max_concurrent(mut self, max_concurrent: MaxConcurrent) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the `AUTO`-mode CPU multiplier. `0` restores the default.
    #[must_use]
    pub fn cpu_multiplier(mut self, cpu_multiplier: usize) -> Self {
        self.cpu_multiplier = cpu_multiplier;
        self
    }

    /// Set the `MetadataBus` event-stream capacity. `0` restores the
    /// default.
    #[must_use]
    pub fn metadata_bus_buffer(mut self, metadata_bus_buffer: usize) -> Self {
        self.metadata_bus_buffer = metadata_bus_buffer;
        self
    }

    fn resolved_bus_buffer(&self) -> usize {
        if self.metadata_bus_buffer == 0 {
            DEFAULT_BUS_BUFFER
        } else {
            self.metadata_bus_buffer
        }
    }

    fn resolved_max_concurrent(&self) -> Option<usize> {
        match self.max_concurrent {
            MaxConcurrent::Unlimited => None,
            MaxConcurrent::Fixed(n) => Some(n.max(1)),
            MaxConcurrent::Auto => {
                let multiplier = if self.cpu_multiplier == 0 {
                    DEFAULT_CPU_MULTIPLIER
                } else {
                    self.cpu_multiplier
                };
                Some(num_cpus::get().max(1) * multiplier)
            }
        }
    }
}

/// Ordered composition of `Handler`s, itself a `Handler` (§4.5, §9: "Flow
/// is a Handler by implementing the Handler contract, not by any
/// inheritance relation").
///
/// The handler list is fixed at construction time via `append`/
/// `append_fn`; `run` treats it as frozen for the duration of one
/// invocation, matching §3's "once run begins, the handler list is
/// treated as frozen."
pub struct Flow {
    handlers: Vec<Arc<dyn Handler>>,
    config: FlowConfig,
    limiter: Arc<dyn ConcurrencyLimiter>,
}

impl Flow {
    /// Build an empty Flow with the given configuration.
    #[must_use]
    pub fn new(config: FlowConfig) -> Self {
        let limiter: Arc<dyn ConcurrencyLimiter> = match config.resolved_max_concurrent() {
            Some(capacity) => Arc::new(BoundedLimiter::new(capacity)),
            None => Arc::new(UnlimitedLimiter),
        };
        Self {
            handlers: Vec::new(),
            config,
            limiter,
        }
    }

    /// Append a handler to the chain.
    #[must_use]
    pub fn append(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Append a bare async function as a handler.
    #[must_use]
    pub fn append_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.append(FnHandler::new(f))
    }

    /// Number of handlers currently in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no handlers have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the chain: convert `input`, stream it through every handler
    /// concurrently, and drain the result into `output`.
    ///
    /// Implements §4.5's nine-step contract. See the module docs for the
    /// worker topology.
    pub async fn run(&self, ctx: Context, input: Input, output: Output) -> Result<()> {
        let (ctx, created_bus) = if ctx.bus().is_some() {
            (ctx, false)
        } else {
            let bus = Arc::new(MetadataBus::new(self.config.resolved_bus_buffer()));
            (ctx.with_bus(bus), true)
        };

        let result = self.run_with_bus(&ctx, input, output).await;

        if created_bus {
            if let Some(bus) = ctx.bus() {
                bus.close();
            }
        }

        result
    }

    async fn run_with_bus(&self, ctx: &Context, input: Input, output: Output) -> Result<()> {
        if self.handlers.is_empty() {
            let (input, output) = match try_fast_path(input, output).await {
                Ok(result) => return result,
                Err((input, output)) => (input, output),
            };
            let source = convert_input(input);
            return convert_output(output, source, ctx).await;
        }

        let n = self.handlers.len();
        let (input_writer, input_reader) = pipe(PIPE_CAPACITY);
        let (err_tx, err_rx) = flume::bounded::<CalqueError>(1);

        let mut tasks = Vec::with_capacity(n + 1);

        // Step 6: input-copy worker.
        {
            let mut source = convert_input(input);
            let mut writer = input_writer;
            let ctx = ctx.clone();
            let err_tx = err_tx.clone();
            tasks.push(compio::runtime::spawn(async move {
                loop {
                    match source.read(64 * 1024, ctx.cancelled()).await {
                        Ok(Some(chunk)) => {
                            if let Err(e) = writer.write(chunk, ctx.cancelled()).await {
                                writer.close_with_error(e.duplicate());
                                let _ = err_tx.try_send(e);
                                break;
                            }
                        }
                        Ok(None) => {
                            writer.close();
                            break;
                        }
                        Err(e) => {
                            writer.close_with_error(e.duplicate());
                            if err_tx.try_send(e).is_err() {
                                tracing::debug!("secondary input-copy error dropped after first error won");
                            }
                            break;
                        }
                    }
                }
            }));
        }

        // Step 4 + 5: build the pipe topology and spawn one worker per
        // handler, handler `i` reading from the previous stage's reader
        // and writing to its own pipe.
        let mut prev_reader = Some(input_reader);
        let mut final_reader = None;
        for (i, handler) in self.handlers.iter().cloned().enumerate() {
            let (writer, reader) = pipe(PIPE_CAPACITY);
            let shared_writer = SharedWriter::new(writer);
            let flow_side_writer = shared_writer.clone();
            let req_reader = prev_reader
                .take()
                .expect("each handler stage consumes exactly one reader");
            if i + 1 == n {
                final_reader = Some(reader);
            } else {
                prev_reader = Some(reader);
            }

            let limiter = self.limiter.clone();
            let ctx = ctx.clone();
            let err_tx = err_tx.clone();

            tasks.push(compio::runtime::spawn(async move {
                tracing::trace!(handler = i, "waiting for concurrency slot");
                let permit = match limiter.acquire(ctx.cancelled()).await {
                    Ok(permit) => permit,
                    Err(e) => {
                        tracing::trace!(handler = i, "cancelled while waiting for concurrency slot");
                        flow_side_writer.close_with_error(e.duplicate()).await;
                        let _ = err_tx.try_send(e);
                        return;
                    }
                };

                tracing::trace!(handler = i, "handler running");
                let req = Request::new(ctx.clone(), Box::new(req_reader));
                let res = Response::new(Box::new(shared_writer));
                let served = handler.serve(req, res).await;
                drop(permit);
                tracing::trace!(handler = i, "handler exited");

                match served {
                    Ok(()) => flow_side_writer.close().await,
                    Err(e) => {
                        flow_side_writer.close_with_error(e.duplicate()).await;
                        if err_tx.try_send(e).is_err() {
                            // Another worker's error already won the
                            // rendezvous (§9: "first one wins by design").
                            // This one is not the `run` return value, only
                            // logged as a secondary failure.
                            tracing::debug!(handler = i, "secondary handler error dropped after first error won");
                        }
                    }
                }
            }));
        }

        let final_reader = final_reader.expect("n >= 1 guarantees a final pipe reader");

        // Step 7: output-consume worker, racing the handler chain so that
        // streaming sinks observe bytes as they are produced.
        let output_task = {
            let ctx = ctx.clone();
            compio::runtime::spawn(async move { convert_output(output, Box::new(final_reader), &ctx).await })
        };

        // Step 8: block on the first of context cancellation, first
        // handler/input error, or every worker completing.
        let workers_done = futures::future::join_all(tasks).fuse();
        futures::pin_mut!(workers_done);
        let mut cancelled = ctx.cancelled();
        let flow_error = futures::select! {
            () = (&mut cancelled).fuse() => Some(ctx.cancellation_error()),
            received = err_rx.recv_async().fuse() => received.ok(),
            _ = workers_done => None,
        };

        // Step 9: always wait for the output worker before returning, so
        // the caller never observes a partially-written sink.
        let output_result = output_task.await;

        match flow_error {
            Some(e) => Err(e),
            None => output_result,
        }
    }
}

#[async_trait::async_trait]
impl Handler for Flow {
    async fn serve(&self, req: Request, res: Response) -> Result<()> {
        let (ctx, source) = req.into_parts();
        let sink = res.into_sink();
        self.run(ctx, Input::Source(source), Output::Sink(sink)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::OutputCell;
    use bytes::Bytes;

    fn upper_handler() -> impl Handler {
        FnHandler::new(|mut req: Request, mut res: Response| async move {
            let ctx = req.ctx().clone();
            let text = req.read_all_text().await?;
            res.write_text(text.to_uppercase(), &ctx).await
        })
    }

    fn prefix_handler(prefix: &'static str) -> impl Handler {
        FnHandler::new(move |mut req: Request, mut res: Response| async move {
            let ctx = req.ctx().clone();
            let text = req.read_all_text().await?;
            res.write_text(format!("{prefix}{text}"), &ctx).await
        })
    }

    fn suffix_handler(suffix: &'static str) -> impl Handler {
        FnHandler::new(move |mut req: Request, mut res: Response| async move {
            let ctx = req.ctx().clone();
            let text = req.read_all_text().await?;
            res.write_text(format!("{text}{suffix}"), &ctx).await
        })
    }

    #[test]
    fn empty_flow_text_to_text_buffer() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let flow = Flow::new(FlowConfig::new());
            let cell = OutputCell::new();
            flow.run(
                Context::background(),
                Input::Text("hello".into()),
                Output::TextBuffer(cell.clone()),
            )
            .await
            .unwrap();
            assert_eq!(cell.take(), Some("hello".to_string()));
        });
    }

    #[test]
    fn three_stage_chain_composes_in_order() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let flow = Flow::new(FlowConfig::new())
                .append(upper_handler())
                .append(prefix_handler("PRE:"))
                .append(suffix_handler(":SUF"));
            let cell = OutputCell::new();
            flow.run(
                Context::background(),
                Input::Text("hello world".into()),
                Output::TextBuffer(cell.clone()),
            )
            .await
            .unwrap();
            assert_eq!(cell.take(), Some("PRE:HELLO WORLD:SUF".to_string()));
        });
    }

    #[test]
    fn handler_error_is_returned_and_buffer_has_partial_write() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let failing = FnHandler::new(|mut req: Request, mut res: Response| async move {
                let ctx = req.ctx().clone();
                let text = req.read_all_text().await?;
                res.write_text(text, &ctx).await?;
                Err(CalqueError::handler(std::io::Error::other("boom")))
            });
            let flow = Flow::new(FlowConfig::new()).append(failing);
            let cell = OutputCell::new();
            let err = flow
                .run(
                    Context::background(),
                    Input::Text("x".into()),
                    Output::TextBuffer(cell.clone()),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, CalqueError::Handler(_)));
            assert_eq!(cell.take(), Some("x".to_string()));
        });
    }

    #[test]
    fn deadline_exceeded_is_returned_for_a_blocking_handler() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let blocking = FnHandler::new(|req: Request, _res: Response| async move {
                // A well-behaved handler checks cancellation on its own
                // blocking operations rather than looping forever.
                req.ctx().cancelled().await;
                Err(CalqueError::Cancelled)
            });
            let flow = Flow::new(FlowConfig::new()).append(blocking);
            let cell = OutputCell::new();
            let ctx = Context::background().with_deadline(std::time::Duration::from_millis(10));
            let err = flow
                .run(ctx, Input::Text("x".into()), Output::TextBuffer(cell.clone()))
                .await
                .unwrap_err();
            assert!(err.is_cancellation());
        });
    }

    #[test]
    fn null_output_discards_without_buffering() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let identity = FnHandler::new(|mut req: Request, mut res: Response| async move {
                let ctx = req.ctx().clone();
                loop {
                    match req.source_mut().read(4096, ctx.cancelled()).await? {
                        Some(chunk) => res.sink_mut().write(chunk, ctx.cancelled()).await.map(|_| ())?,
                        None => break,
                    }
                }
                Ok(())
            });
            let flow = Flow::new(FlowConfig::new()).append(identity);
            let payload = Bytes::from(vec![7u8; 1024 * 1024]);
            flow.run(Context::background(), Input::Bytes(payload), Output::Discard)
                .await
                .unwrap();
        });
    }

    #[test]
    fn nested_flow_runs_as_a_handler() {
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let inner = Flow::new(FlowConfig::new()).append(upper_handler());
            let outer = Flow::new(FlowConfig::new())
                .append(inner)
                .append(suffix_handler("!"));
            let cell = OutputCell::new();
            outer
                .run(Context::background(), Input::Text("hi".into()), Output::TextBuffer(cell.clone()))
                .await
                .unwrap();
            assert_eq!(cell.take(), Some("HI!".to_string()));
        });
    }
}
