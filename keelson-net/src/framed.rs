//! Message-framed TCP transport.
//!
//! Connections open with the [`crate::handshake`] exchange, after which the
//! wire carries whole [`Frame`]s. The reader helper hands each complete
//! frame to the decoder pipeline in one call, so framed decoders never see
//! partial input; the writer helper turns each outbound value into frames
//! written atomically.

use std::any::Any;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use keelson_core::buffer::{Buffer, BufferPool};
use keelson_core::codec::{Context, Decoder, Encoder, PipelineContext};
use keelson_core::error::{Error, Result};
use keelson_core::event_loop::{in_loop, poll};
use keelson_core::Loop;

use crate::frame::{read_frame, write_frame, Frame};
use crate::handshake::{self, Headers};
use crate::options::Options;
use crate::session::Core;
use crate::stream::{accept_retryable, bind_listener};
use crate::{ListenerHandler, Session, SessionHandler, State};

const RETRY_DELAY: Duration = Duration::from_millis(1);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type FramedEncoder<Out> = dyn Encoder<Frame, Out>;
type FramedDecoder<In> = dyn Decoder<Frame, In>;
type FramedSessionHandler<In, Out> = dyn SessionHandler<FramedSession<In, Out>, In>;
type FramedListenerHandler<In, Out> = dyn ListenerHandler<FramedSession<In, Out>, In>;

struct Inner<In, Out> {
    core: Core<In, Out>,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    path: String,
    headers: Headers,
    encoder: Arc<FramedEncoder<Out>>,
    decoder: Arc<FramedDecoder<In>>,
    handler: Arc<FramedSessionHandler<In, Out>>,
}

/// One framed connection. Cloning shares the same session.
pub struct FramedSession<In, Out> {
    inner: Arc<Inner<In, Out>>,
}

impl<In, Out> Clone for FramedSession<In, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<In, Out> FramedSession<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    fn new(
        owner: Loop,
        stream: TcpStream,
        path: String,
        headers: Headers,
        options: Options,
        pool: BufferPool,
        encoder: Arc<FramedEncoder<Out>>,
        decoder: Arc<FramedDecoder<In>>,
        handler: Arc<FramedSessionHandler<In, Out>>,
    ) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            inner: Arc::new(Inner {
                core: Core::new(owner, options, pool),
                stream,
                peer,
                path,
                headers,
                encoder,
                decoder,
                handler,
            }),
        }
    }

    /// The request path negotiated at handshake.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// The request headers negotiated at handshake.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    fn schedule_dispatch(&self) {
        if self.inner.core.begin_dispatch() {
            let session = self.clone();
            let _ = self
                .inner
                .core
                .owner
                .execute(move || session.pump_messages());
        }
    }

    fn pump_messages(&self) -> Result<()> {
        self.inner.core.finish_dispatch();
        while let Ok(input) = self.inner.core.inbound_rx.try_recv() {
            if let Err(err) = self.inner.handler.on_message(self, input) {
                self.schedule_dispatch();
                return Err(err);
            }
        }
        Ok(())
    }

    fn post_error(&self, err: Error) {
        let session = self.clone();
        let _ = self.inner.core.owner.execute(move || {
            session.inner.handler.on_error(&session, err);
            Ok(())
        });
    }
}

impl<In, Out> Session for FramedSession<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    type Output = Out;

    fn start(&self) -> Result<()> {
        if self.inner.core.owner.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.inner.core.begin_start() {
            return Ok(());
        }
        debug!(peer = ?self.inner.peer, path = %self.inner.path, "framed session starting");
        self.inner.core.owner.retain();
        {
            let session = self.clone();
            self.inner.core.owner.on_cancel(move || {
                let _ = session.close();
            });
        }

        let (quit_tx, quit_rx) = flume::bounded::<()>(1);
        let reader = {
            let session = self.clone();
            thread::Builder::new()
                .name("keelson-read".into())
                .spawn(move || read_pump(&session, quit_tx))
                .expect("failed to spawn session reader thread")
        };
        let writer = {
            let session = self.clone();
            thread::Builder::new()
                .name("keelson-write".into())
                .spawn(move || write_pump(&session, &quit_rx))
                .expect("failed to spawn session writer thread")
        };
        {
            let session = self.clone();
            thread::Builder::new()
                .name("keelson-cleanup".into())
                .spawn(move || cleanup(&session, reader, writer))
                .expect("failed to spawn session cleanup thread")
        };
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.inner.core.begin_close() {
            debug!(peer = ?self.inner.peer, "framed session closing");
            let _ = self.inner.stream.shutdown(Shutdown::Read);
        }
        Ok(())
    }

    fn send(&self, output: Out) -> Result<()> {
        self.inner.core.send(output)
    }

    fn connected(&self) -> bool {
        self.inner.core.connected()
    }

    fn started(&self) -> bool {
        self.inner.core.started()
    }
}

struct ReadContext<'a, In, Out> {
    session: &'a FramedSession<In, Out>,
}

impl<In, Out> Context for ReadContext<'_, In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn load(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.session.inner.core.values.load_any(key)
    }

    fn store(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.session.inner.core.values.store_any(key, value);
    }

    fn delete(&self, key: &str) {
        self.session.inner.core.values.delete(key);
    }

    fn alloc(&self) -> Buffer {
        self.session.inner.core.pool.buffer()
    }

    fn close(&self) -> Result<()> {
        self.session.close()
    }
}

impl<In, Out> PipelineContext<In> for ReadContext<'_, In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn next(&mut self, value: In) -> Result<()> {
        self.session.inner.core.push_inbound(value);
        self.session.schedule_dispatch();
        Ok(())
    }
}

struct WriteContext<'a, In, Out> {
    session: &'a FramedSession<In, Out>,
}

impl<In, Out> Context for WriteContext<'_, In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn load(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.session.inner.core.values.load_any(key)
    }

    fn store(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.session.inner.core.values.store_any(key, value);
    }

    fn delete(&self, key: &str) {
        self.session.inner.core.values.delete(key);
    }

    fn alloc(&self) -> Buffer {
        self.session.inner.core.pool.buffer()
    }

    fn close(&self) -> Result<()> {
        self.session.close()
    }
}

impl<In, Out> PipelineContext<Frame> for WriteContext<'_, In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn next(&mut self, value: Frame) -> Result<()> {
        let inner = &self.session.inner;
        write_frame(
            &mut (&inner.stream),
            &value,
            inner.core.options.max_frame,
        )
        .map_err(Error::from)
    }
}

fn read_pump<In, Out>(session: &FramedSession<In, Out>, quit: flume::Sender<()>)
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let inner = &session.inner;
    let keep_alive = inner.core.options.keep_alive;
    loop {
        if let Some(idle) = keep_alive {
            let _ = inner.stream.set_read_timeout(Some(idle));
        }
        let result = read_frame(&mut (&inner.stream), inner.core.options.max_frame);
        if keep_alive.is_some() {
            let _ = inner.stream.set_read_timeout(None);
        }
        match result {
            Ok(None) => {
                debug!(peer = ?inner.peer, "peer closed the framed stream");
                break;
            }
            Ok(Some(mut frame)) => {
                let mut cx = ReadContext { session };
                if let Err(err) = inner.decoder.decode(&mut cx, &mut frame) {
                    session.post_error(err);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => thread::sleep(RETRY_DELAY),
            Err(e) => {
                debug!(peer = ?inner.peer, error = %e, "framed read ended");
                break;
            }
        }
    }
    drop(quit);
}

fn write_pump<In, Out>(session: &FramedSession<In, Out>, quit: &flume::Receiver<()>)
where
    In: Send + 'static,
    Out: Send + 'static,
{
    enum Next<T> {
        Value(T),
        Quit,
    }

    let inner = &session.inner;
    loop {
        let next = flume::Selector::new()
            .recv(&inner.core.outbound_rx, |result| match result {
                Ok(value) => Next::Value(value),
                Err(_) => Next::Quit,
            })
            .recv(quit, |_| Next::Quit)
            .wait();
        let output = match next {
            Next::Value(value) => value,
            Next::Quit => break,
        };
        let mut cx = WriteContext { session };
        if let Err(err) = inner.encoder.encode(&mut cx, output) {
            if err.is_io() {
                debug!(peer = ?inner.peer, error = %err, "framed write ended");
                let _ = inner.stream.shutdown(Shutdown::Read);
                break;
            }
            session.post_error(err);
        }
    }
}

fn cleanup<In, Out>(session: &FramedSession<In, Out>, reader: JoinHandle<()>, writer: JoinHandle<()>)
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let _ = reader.join();
    let _ = writer.join();
    session.inner.core.force_closing();
    let finished = session.clone();
    session.inner.core.owner.finish(move || {
        let result = finished.inner.handler.on_close(&finished);
        let _ = finished.inner.stream.shutdown(Shutdown::Both);
        result
    });
    debug!(peer = ?session.inner.peer, "framed session cleaned up");
}

struct ServerInner<In, Out> {
    options: Options,
    state: AtomicU8,
    pool: BufferPool,
    encoder: Arc<FramedEncoder<Out>>,
    decoder: Arc<FramedDecoder<In>>,
    session_handler: Arc<FramedSessionHandler<In, Out>>,
    listener_handler: Arc<FramedListenerHandler<In, Out>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Listening endpoint producing [`FramedSession`]s.
pub struct FramedServer<In, Out> {
    inner: Arc<ServerInner<In, Out>>,
}

impl<In, Out> Clone for FramedServer<In, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<In, Out> FramedServer<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new<P, H>(options: Options, pipeline: P, handler: H) -> Self
    where
        P: Encoder<Frame, Out> + Decoder<Frame, In> + 'static,
        H: ListenerHandler<FramedSession<In, Out>, In> + 'static,
    {
        let pipeline = Arc::new(pipeline);
        let handler = Arc::new(handler);
        let pool = BufferPool::new(options.buffer_size);
        Self {
            inner: Arc::new(ServerInner {
                options,
                state: AtomicU8::new(State::Stopped as u8),
                pool,
                encoder: pipeline.clone(),
                decoder: pipeline,
                session_handler: handler.clone(),
                listener_handler: handler,
                accept_thread: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Bind `address` and start accepting; handshakes run on short-lived
    /// per-connection threads so the accept loop never blocks on a slow
    /// peer.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a loop coroutine.
    pub fn start(&self, address: &str) -> Result<()> {
        let owner = in_loop();
        if !self.transition(State::Stopped, State::Running) {
            return Ok(());
        }
        if let Some(handle) = self.inner.accept_thread.lock().take() {
            // wait out an accept thread that stopped on its own
            let _ = handle.join();
        }
        let listener = match bind_listener(address) {
            Ok(listener) => listener,
            Err(e) => {
                self.transition(State::Running, State::Stopped);
                return Err(e.into());
            }
        };
        *self.inner.local_addr.lock() = listener.local_addr().ok();
        debug!(address, "framed server listening");

        let handle = {
            let server = self.clone();
            let owner = owner.clone();
            thread::Builder::new()
                .name("keelson-accept".into())
                .spawn(move || accept_loop(&server, &listener, &owner))
                .expect("failed to spawn accept thread")
        };
        *self.inner.accept_thread.lock() = Some(handle);
        {
            let server = self.clone();
            owner.on_cancel(move || server.stop());
        }
        Ok(())
    }

    /// Stop accepting and wait for the accept thread to exit. Idempotent.
    pub fn stop(&self) {
        if !self.transition(State::Running, State::Stopping) {
            return;
        }
        debug!("framed server stopping");
        if let Some(handle) = self.inner.accept_thread.lock().take() {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn accept_loop<In, Out>(server: &FramedServer<In, Out>, listener: &TcpListener, owner: &Loop)
where
    In: Send + 'static,
    Out: Send + 'static,
{
    loop {
        if server.state() != State::Running {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let _ = stream.set_nonblocking(false);
                server.inner.options.apply(&stream);
                debug!(%peer, "accepted framed connection");
                let server = server.clone();
                let owner = owner.clone();
                let spawned = thread::Builder::new()
                    .name("keelson-handshake".into())
                    .spawn(move || greet(&server, stream, &owner));
                if spawned.is_err() {
                    warn!("failed to spawn handshake thread");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(RETRY_DELAY),
            Err(e) if accept_retryable(&e) => {
                warn!(error = %e, "accept backing off");
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
    if server.transition(State::Stopping, State::Stopped)
        || server.transition(State::Running, State::Stopped)
    {
        debug!("framed server stopped");
    }
}

/// Server side of the open handshake, run off the accept thread.
fn greet<In, Out>(server: &FramedServer<In, Out>, stream: TcpStream, owner: &Loop)
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
    match handshake::read_request(&mut (&stream)) {
        Ok((path, headers)) => {
            if handshake::send_response(&mut (&stream), true).is_err() {
                return;
            }
            let _ = stream.set_read_timeout(None);
            let inner = &server.inner;
            let session = FramedSession::new(
                owner.clone(),
                stream,
                path,
                headers,
                inner.options.clone(),
                inner.pool.clone(),
                inner.encoder.clone(),
                inner.decoder.clone(),
                inner.session_handler.clone(),
            );
            let handler = inner.listener_handler.clone();
            let _ = owner.execute(move || handler.on_accept(&session));
        }
        Err(e) => {
            debug!(error = %e, "framed handshake rejected");
            let _ = handshake::send_response(&mut (&stream), false);
        }
    }
}

/// Dialing endpoint producing [`FramedSession`]s.
pub struct FramedConnector<In, Out> {
    options: Options,
    encoder: Arc<FramedEncoder<Out>>,
    decoder: Arc<FramedDecoder<In>>,
    handler: Arc<FramedSessionHandler<In, Out>>,
}

impl<In, Out> FramedConnector<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new<P, H>(options: Options, pipeline: P, handler: H) -> Self
    where
        P: Encoder<Frame, Out> + Decoder<Frame, In> + 'static,
        H: SessionHandler<FramedSession<In, Out>, In> + 'static,
    {
        let pipeline = Arc::new(pipeline);
        Self {
            options,
            encoder: pipeline.clone(),
            decoder: pipeline,
            handler: Arc::new(handler),
        }
    }

    /// Dial `"host:port/path"` and complete the open handshake on a
    /// transient helper thread, awaiting the socket from the calling loop
    /// coroutine.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a loop coroutine.
    pub fn connect(&self, address: &str, headers: Headers) -> Result<FramedSession<In, Out>> {
        let owner = in_loop();
        let (authority, path) = split_address(address);
        let (tx, rx) = flume::bounded(1);
        {
            let authority = authority.to_string();
            let path = path.to_string();
            let request_headers = headers.clone();
            thread::Builder::new()
                .name("keelson-dial".into())
                .spawn(move || {
                    let dial = || -> std::io::Result<TcpStream> {
                        let stream = TcpStream::connect(authority.as_str())?;
                        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
                        handshake::send_request(&mut (&stream), &path, &request_headers)?;
                        handshake::read_response(&mut (&stream))?;
                        stream.set_read_timeout(None)?;
                        Ok(stream)
                    };
                    let _ = tx.send(dial());
                })
                .expect("failed to spawn dial thread");
        }
        let stream = poll(&rx)??;
        self.options.apply(&stream);
        debug!(address, "framed connection established");
        Ok(FramedSession::new(
            owner,
            stream,
            path.to_string(),
            headers,
            self.options.clone(),
            BufferPool::new(self.options.buffer_size),
            self.encoder.clone(),
            self.decoder.clone(),
            self.handler.clone(),
        ))
    }
}

/// Split `"host:port/path"` into authority and path; the path defaults to
/// `/`.
fn split_address(address: &str) -> (&str, &str) {
    match address.find('/') {
        Some(index) => (&address[..index], &address[index..]),
        None => (address, "/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_splitting() {
        assert_eq!(split_address("127.0.0.1:9000/feed"), ("127.0.0.1:9000", "/feed"));
        assert_eq!(split_address("127.0.0.1:9000"), ("127.0.0.1:9000", "/"));
        assert_eq!(split_address("host:1/a/b"), ("host:1", "/a/b"));
    }
}
