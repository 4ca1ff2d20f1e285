//! Calque Core
//!
//! The runtime-agnostic core of a streaming middleware-composition
//! framework: handler chaining, byte pipes, input/output conversion, and a
//! process-internal metadata sideband. See each module for its piece:
//! - Cancellation, deadline, and typed values (`context`)
//! - Single-producer/single-consumer byte pipes (`pipe`)
//! - The Handler contract and `Request`/`Response` carriers (`handler`)
//! - Input/output adapters (`convert`)
//! - The concurrent key/value + event-stream sideband (`bus`)
//! - Handler-slot concurrency capping (`concurrency`)
//! - The Flow engine that ties the above together (`flow`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

mod buffer;
pub mod bus;
pub mod concurrency;
pub mod context;
pub mod convert;
pub mod error;
pub mod flow;
pub mod handler;
pub mod pipe;

/// A small prelude to make downstream crates ergonomic. Kept minimal to
/// avoid API lock-in.
pub mod prelude {
    pub use crate::bus::{MetadataBus, MetadataEvent, MetadataValue};
    pub use crate::concurrency::{ConcurrencyLimiter, Permit};
    pub use crate::context::{CancelHandle, Cancelled, Context, CoreLogger};
    pub use crate::convert::{FromSource, Input, Output, OutputCell, ToSource};
    pub use crate::error::{CalqueError, Result};
    pub use crate::flow::{Flow, FlowConfig, MaxConcurrent};
    pub use crate::handler::{FnHandler, Handler, Request, Response, Sink, Source};
    pub use crate::pipe::{pipe, PipeReader, PipeWriter, SharedWriter};
}
