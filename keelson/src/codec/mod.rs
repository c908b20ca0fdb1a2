//! Reference codecs and the pipeline vocabulary.
//!
//! Re-exports the stage traits from the core crate alongside two small
//! demonstration pipelines: [`NullString`] for the stream transport and
//! [`TextFrame`] for the framed transport.

mod nullstring;
mod textframe;

pub use keelson_core::codec::{link, Context, Decoder, Encoder, Linked, Pass, Pipeline, PipelineContext};
pub use nullstring::NullString;
pub use textframe::TextFrame;
