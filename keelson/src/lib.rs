//! # Keelson
//!
//! A reusable foundation for concurrent network services, built from three
//! tightly coupled pieces:
//!
//! - **The loop** ([`Loop`]): a cooperative scheduler that multiplexes many
//!   logical tasks onto one application thread, offloading blocking calls to
//!   helper threads. User callbacks never need locks against each other.
//! - **The buffer** ([`Buffer`] / [`BufferPool`]): a pooled chained-chunk
//!   byte stream with both copy and zero-copy access.
//! - **The session + pipeline** ([`StreamSession`], [`FramedSession`],
//!   [`codec`]): per-connection reader/writer helper threads whose decoded
//!   values are funnelled back to the loop and dispatched to user callbacks
//!   through composable encoder/decoder stages.
//!
//! ## Architecture
//!
//! - **`keelson-core`**: loop, buffers, pipelines, locker, config, runtime
//! - **`keelson-net`**: stream and framed transports (sessions, servers,
//!   connectors)
//! - **`keelson`**: public API surface (this crate) plus reference codecs
//!
//! ## Quick start
//!
//! A null-terminated-string echo server:
//!
//! ```rust,no_run
//! use keelson::codec::NullString;
//! use keelson::{bootstrap, start_loop, Callbacks, Config, Options};
//! use keelson::{Session, StreamServer, StreamSession};
//!
//! fn main() -> keelson::Result<()> {
//!     let lp = start_loop();
//!     lp.execute(|| {
//!         let server = StreamServer::<String, String>::new(
//!             Options::default(),
//!             NullString,
//!             Callbacks::new().on_message(
//!                 |session: &StreamSession<String, String>, input: String| {
//!                     session.send(input)
//!                 },
//!             ),
//!         );
//!         server.start("127.0.0.1:8888")
//!     })?;
//!     bootstrap(Config::empty())
//! }
//! ```

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

// Re-export core types
pub use keelson_core::blackboard::Blackboard;
pub use keelson_core::buffer::{Buffer, BufferPool};
pub use keelson_core::config::{Config, Value};
pub use keelson_core::error::{Error, Result};
pub use keelson_core::event::{Event, Subscription};
pub use keelson_core::event_loop::{
    in_loop, is_in_loop, poll, start_loop, start_loop_with, sync, ErrorHook, Loop,
};
pub use keelson_core::locker::{lock, LockGuard};
pub use keelson_core::runtime::{bootstrap, shutdown};

// Re-export transports
pub use keelson_net::{
    Callbacks, Frame, FrameKind, FramedConnector, FramedServer, FramedSession, Headers,
    ListenerHandler, Options, Session, SessionHandler, State, StreamConnector, StreamServer,
    StreamSession,
};

// Re-export dependencies user code needs at the API boundary
pub use bytes::Bytes;
pub use flume;

pub mod codec;
pub mod trace;
