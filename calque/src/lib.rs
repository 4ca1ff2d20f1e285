//! # Calque
//!
//! A streaming middleware-composition framework: chain async handlers that
//! read bytes in and write bytes out, wire them together with backpressured
//! pipes, and share out-of-band state through a metadata bus.
//!
//! ## Architecture
//!
//! Calque is structured as a thin facade over its runtime-agnostic core:
//!
//! - **`calque-core`**: pipes, the Handler contract, input/output adapters,
//!   the metadata bus, cancellation/deadlines, and the `Flow` engine
//! - **`calque`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use calque::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let flow = Flow::new(FlowConfig::new())
//!     .append_fn(|mut req: Request, mut res: Response| async move {
//!         let ctx = req.ctx().clone();
//!         let text = req.read_all_text().await?;
//!         res.write_text(text.to_uppercase(), &ctx).await
//!     });
//!
//! let ctx = Context::background();
//! let out = OutputCell::<Bytes>::new();
//! flow.run(ctx, Input::Text("hello".into()), Output::BytesBuffer(out.clone()))
//!     .await?;
//! assert_eq!(out.get().unwrap(), Bytes::from_static(b"HELLO"));
//! # Ok(())
//! # }
//! ```
//!
//! A `Flow` is itself a `Handler`, so chains nest: build a sub-pipeline once
//! and `append` it into a larger one like any other middleware.
//!
//! ## Performance
//!
//! - **Zero-copy where possible**: `bytes::Bytes` for refcounted buffers;
//!   the single-handler fast path (§ no intermediate pipes) only copies when
//!   the spec requires it (`Bytes` input into a `BytesBuffer` output)
//! - **Backpressured pipes**: each stage's output pipe blocks the writer
//!   when the next stage hasn't caught up — bounded memory regardless of
//!   chain length
//! - **Runtime-agnostic**: built on `compio`, no hard dependency on a
//!   particular executor beyond what `compio` itself requires

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives

// Re-export core types
pub use bytes::Bytes;

pub use calque_core::bus::{MetadataBus, MetadataEvent, MetadataValue};
pub use calque_core::concurrency::{ConcurrencyLimiter, Permit};
pub use calque_core::context::{CancelHandle, Cancelled, Context, CoreLogger};
pub use calque_core::convert::{FromSource, Input, Output, OutputCell, ToSource};
pub use calque_core::error::{CalqueError, Result};
pub use calque_core::flow::{Flow, FlowConfig, MaxConcurrent};
pub use calque_core::handler::{FnHandler, Handler, Request, Response, Sink, Source};
pub use calque_core::pipe::{pipe, PipeReader, PipeWriter, SharedWriter};

/// Everything needed to build and run a `Flow`, in one `use`.
pub mod prelude {
    pub use crate::{
        CalqueError, CancelHandle, Cancelled, ConcurrencyLimiter, Context, CoreLogger, FnHandler,
        FromSource, Flow, FlowConfig, Handler, Input, MaxConcurrent, MetadataBus, MetadataEvent,
        MetadataValue, Output, OutputCell, Permit, PipeReader, PipeWriter, Request, Response,
        Result, SharedWriter, Sink, Source, ToSource,
    };
    pub use bytes::Bytes;
}

/// Development helpers (benches/tests)
pub mod dev_tracing;
