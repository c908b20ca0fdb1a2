//! Keelson transports.
//!
//! Long-lived bidirectional sessions on top of the cooperative loop:
//!
//! - [`stream`]: byte-stream TCP transport; decoders see monotonically
//!   appended bytes in a pooled [`keelson_core::Buffer`].
//! - [`framed`]: message-framed TCP transport with an open handshake
//!   carrying a path and headers; decoders see whole [`frame::Frame`]s.
//!
//! Each session owns a reader, a writer and a cleanup helper thread. The
//! helpers never touch user-visible state: decoded values travel through a
//! bounded channel and are dispatched to [`SessionHandler::on_message`]
//! under a loop coroutine, so handler code is effectively single-threaded.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod frame;
pub mod framed;
pub mod handshake;
pub mod options;
mod session;
pub mod stream;

pub use frame::{Frame, FrameKind};
pub use framed::{FramedConnector, FramedServer, FramedSession};
pub use handshake::Headers;
pub use options::Options;
pub use stream::{StreamConnector, StreamServer, StreamSession};

use keelson_core::error::{Error, Result};
use tracing::error;

/// Server lifecycle states, transitioned under atomic CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl State {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// A bidirectional connection bound to a loop.
pub trait Session: Send + Sync {
    /// The outbound application value type accepted by [`Session::send`].
    type Output;

    /// Idempotent idle → running transition; spawns the helper threads.
    fn start(&self) -> Result<()>;

    /// Idempotent running → closing transition; signals the reader and lets
    /// the natural teardown path run.
    fn close(&self) -> Result<()>;

    /// Enqueue one outbound value without blocking.
    ///
    /// Fails with [`Error::Disconnected`] unless the session is running and
    /// with [`Error::Busy`] when the outbound queue is full.
    fn send(&self, output: Self::Output) -> Result<()>;

    fn connected(&self) -> bool;

    fn started(&self) -> bool;
}

/// Callbacks delivered on the session's loop.
pub trait SessionHandler<S: Session, In>: Send + Sync {
    /// One decoded inbound value, in socket-receive order.
    fn on_message(&self, session: &S, input: In) -> Result<()>;

    /// Delivered exactly once per started session, after the last
    /// `on_message` and before the socket is released.
    fn on_close(&self, _session: &S) -> Result<()> {
        Ok(())
    }

    /// A protocol-level codec failure; the session keeps running.
    fn on_error(&self, _session: &S, err: Error) {
        error!(error = %err, "unhandled session error");
    }
}

/// Callbacks for listening endpoints.
pub trait ListenerHandler<S: Session, In>: SessionHandler<S, In> {
    /// A freshly accepted session; the default starts it.
    fn on_accept(&self, session: &S) -> Result<()> {
        session.start()
    }
}

type MessageFn<S, In> = Box<dyn Fn(&S, In) -> Result<()> + Send + Sync>;
type SessionFn<S> = Box<dyn Fn(&S) -> Result<()> + Send + Sync>;
type ErrorFn<S> = Box<dyn Fn(&S, Error) + Send + Sync>;

/// Closure-based handler, for callers who don't want a handler type.
///
/// Unset callbacks fall back to the trait defaults; in particular an unset
/// accept callback starts the session.
pub struct Callbacks<S, In> {
    message: Option<MessageFn<S, In>>,
    accept: Option<SessionFn<S>>,
    close: Option<SessionFn<S>>,
    error: Option<ErrorFn<S>>,
}

impl<S, In> Default for Callbacks<S, In> {
    fn default() -> Self {
        Self {
            message: None,
            accept: None,
            close: None,
            error: None,
        }
    }
}

impl<S, In> Callbacks<S, In> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_message(mut self, f: impl Fn(&S, In) -> Result<()> + Send + Sync + 'static) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_accept(mut self, f: impl Fn(&S) -> Result<()> + Send + Sync + 'static) -> Self {
        self.accept = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_close(mut self, f: impl Fn(&S) -> Result<()> + Send + Sync + 'static) -> Self {
        self.close = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&S, Error) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl<S: Session, In> SessionHandler<S, In> for Callbacks<S, In> {
    fn on_message(&self, session: &S, input: In) -> Result<()> {
        match &self.message {
            Some(f) => f(session, input),
            None => Ok(()),
        }
    }

    fn on_close(&self, session: &S) -> Result<()> {
        match &self.close {
            Some(f) => f(session),
            None => Ok(()),
        }
    }

    fn on_error(&self, session: &S, err: Error) {
        match &self.error {
            Some(f) => f(session, err),
            None => error!(error = %err, "unhandled session error"),
        }
    }
}

impl<S: Session, In> ListenerHandler<S, In> for Callbacks<S, In> {
    fn on_accept(&self, session: &S) -> Result<()> {
        match &self.accept {
            Some(f) => f(session),
            None => session.start(),
        }
    }
}
