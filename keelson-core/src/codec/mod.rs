//! Codec pipelines.
//!
//! A pipeline is a chain of encoder/decoder stages between typed values.
//! Stages never talk to sockets directly: they receive a [`PipelineContext`]
//! whose `next` continuation feeds the following stage, and whose state
//! surface (backed by the session blackboard) lets a decoder carry partial
//! input across reads.

mod pipeline;

pub use pipeline::{link, Decoder, Encoder, Linked, Pass, Pipeline};

use std::any::Any;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::error::Result;

/// Per-session state surface passed through every pipeline call.
pub trait Context {
    /// Load a value from the session blackboard.
    fn load(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Store a value on the session blackboard.
    fn store(&self, key: &str, value: Arc<dyn Any + Send + Sync>);

    /// Erase a value from the session blackboard.
    fn delete(&self, key: &str);

    /// Allocate an empty buffer from the session pool.
    fn alloc(&self) -> Buffer;

    /// Close the owning session.
    fn close(&self) -> Result<()>;
}

/// A [`Context`] with a continuation into the next pipeline stage.
pub trait PipelineContext<T>: Context {
    /// Hand `value` to the next stage.
    ///
    /// A stage may call this zero or more times per invocation.
    fn next(&mut self, value: T) -> Result<()>;
}
