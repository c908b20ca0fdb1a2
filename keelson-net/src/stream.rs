//! Byte-stream TCP transport.
//!
//! The reader helper reserves the tail of a pooled buffer, reads the socket
//! straight into it, and runs the decoder pipeline over the accumulated
//! bytes; whatever the decoder leaves behind is the partial tail of the next
//! read. The writer helper pops one outbound value at a time and runs the
//! encoder pipeline with a context that drains encoded buffers to the
//! socket.

use std::any::Any;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use keelson_core::buffer::{Buffer, BufferPool};
use keelson_core::codec::{Context, Decoder, Encoder, PipelineContext};
use keelson_core::error::{Error, Result};
use keelson_core::event_loop::{in_loop, poll};
use keelson_core::Loop;

use crate::options::Options;
use crate::session::Core;
use crate::{ListenerHandler, Session, SessionHandler, State};

const RETRY_DELAY: Duration = Duration::from_millis(1);

type StreamEncoder<Out> = dyn Encoder<Buffer, Out>;
type StreamDecoder<In> = dyn Decoder<Buffer, In>;
type StreamSessionHandler<In, Out> = dyn SessionHandler<StreamSession<In, Out>, In>;
type StreamListenerHandler<In, Out> = dyn ListenerHandler<StreamSession<In, Out>, In>;

struct Inner<In, Out> {
    core: Core<In, Out>,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    encoder: Arc<StreamEncoder<Out>>,
    decoder: Arc<StreamDecoder<In>>,
    handler: Arc<StreamSessionHandler<In, Out>>,
}

/// One byte-stream connection. Cloning shares the same session.
pub struct StreamSession<In, Out> {
    inner: Arc<Inner<In, Out>>,
}

impl<In, Out> Clone for StreamSession<In, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<In, Out> StreamSession<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn new(
        owner: Loop,
        stream: TcpStream,
        options: Options,
        pool: BufferPool,
        encoder: Arc<StreamEncoder<Out>>,
        decoder: Arc<StreamDecoder<In>>,
        handler: Arc<StreamSessionHandler<In, Out>>,
    ) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            inner: Arc::new(Inner {
                core: Core::new(owner, options, pool),
                stream,
                peer,
                encoder,
                decoder,
                handler,
            }),
        }
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Queue the message-drain executor unless one is already in flight.
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

    /// Drain every available inbound value in one loop turn.
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

impl<In, Out> Session for StreamSession<In, Out>
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
        debug!(peer = ?self.inner.peer, "stream session starting");
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
            debug!(peer = ?self.inner.peer, "stream session closing");
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
    session: &'a StreamSession<In, Out>,
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
    session: &'a StreamSession<In, Out>,
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

impl<In, Out> PipelineContext<Buffer> for WriteContext<'_, In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Drain one encoded buffer to the socket, retrying interrupted writes.
    fn next(&mut self, value: Buffer) -> Result<()> {
        let mut buffer = value;
        let stream = &self.session.inner.stream;
        loop {
            if buffer.is_empty() {
                break;
            }
            let written = {
                let slice = buffer.begin_read()?;
                if slice.is_empty() {
                    None
                } else {
                    Some((&*stream).write(slice))
                }
            };
            match written {
                None => {
                    buffer.end_read(0)?;
                    break;
                }
                Some(Ok(n)) => buffer.end_read(n)?,
                Some(Err(e)) if e.kind() == ErrorKind::Interrupted => {
                    buffer.end_read(0)?;
                    thread::sleep(RETRY_DELAY);
                }
                Some(Err(e)) => {
                    buffer.end_read(0)?;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

fn read_pump<In, Out>(session: &StreamSession<In, Out>, quit: flume::Sender<()>)
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let inner = &session.inner;
    let keep_alive = inner.core.options.keep_alive;
    let mut buffer = inner.core.pool.buffer();
    loop {
        if let Some(idle) = keep_alive {
            let _ = inner.stream.set_read_timeout(Some(idle));
        }
        let result = match buffer.begin_write() {
            Ok(slice) => (&inner.stream).read(slice),
            Err(_) => break,
        };
        if keep_alive.is_some() {
            let _ = inner.stream.set_read_timeout(None);
        }
        match result {
            Ok(0) => {
                let _ = buffer.end_write(0);
                debug!(peer = ?inner.peer, "peer closed the stream");
                break;
            }
            Ok(n) => {
                if buffer.end_write(n).is_err() {
                    break;
                }
                let mut cx = ReadContext { session };
                if let Err(err) = inner.decoder.decode(&mut cx, &mut buffer) {
                    session.post_error(err);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                let _ = buffer.end_write(0);
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => {
                let _ = buffer.end_write(0);
                debug!(peer = ?inner.peer, error = %e, "stream read ended");
                break;
            }
        }
    }
    // dropping our end of the quit channel unblocks the writer
    drop(quit);
}

fn write_pump<In, Out>(session: &StreamSession<In, Out>, quit: &flume::Receiver<()>)
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
                debug!(peer = ?inner.peer, error = %err, "stream write ended");
                let _ = inner.stream.shutdown(Shutdown::Read);
                break;
            }
            session.post_error(err);
        }
    }
}

/// Join both pumps, then deliver `on_close` and release the socket.
fn cleanup<In, Out>(session: &StreamSession<In, Out>, reader: JoinHandle<()>, writer: JoinHandle<()>)
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
    debug!(peer = ?session.inner.peer, "stream session cleaned up");
}

struct ServerInner<In, Out> {
    options: Options,
    state: AtomicU8,
    pool: BufferPool,
    encoder: Arc<StreamEncoder<Out>>,
    decoder: Arc<StreamDecoder<In>>,
    session_handler: Arc<StreamSessionHandler<In, Out>>,
    listener_handler: Arc<StreamListenerHandler<In, Out>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Listening endpoint producing [`StreamSession`]s.
pub struct StreamServer<In, Out> {
    inner: Arc<ServerInner<In, Out>>,
}

impl<In, Out> Clone for StreamServer<In, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<In, Out> StreamServer<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Build a server from a wire pipeline and a listener handler.
    ///
    /// All accepted sessions share one buffer pool sized by
    /// `options.buffer_size`.
    pub fn new<P, H>(options: Options, pipeline: P, handler: H) -> Self
    where
        P: Encoder<Buffer, Out> + Decoder<Buffer, In> + 'static,
        H: ListenerHandler<StreamSession<In, Out>, In> + 'static,
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

    /// Bind `address` and start accepting.
    ///
    /// Must be called from a loop coroutine; accepted sessions are bound to
    /// that loop, and cancelling it stops the server. Returns `Ok` without
    /// effect when the server is already running.
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
        debug!(address, "stream server listening");

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
        debug!("stream server stopping");
        if let Some(handle) = self.inner.accept_thread.lock().take() {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// The address actually bound, once running.
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

fn accept_loop<In, Out>(server: &StreamServer<In, Out>, listener: &TcpListener, owner: &Loop)
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let inner = &server.inner;
    loop {
        if server.state() != State::Running {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let _ = stream.set_nonblocking(false);
                inner.options.apply(&stream);
                debug!(%peer, "accepted stream connection");
                let session = StreamSession::new(
                    owner.clone(),
                    stream,
                    inner.options.clone(),
                    inner.pool.clone(),
                    inner.encoder.clone(),
                    inner.decoder.clone(),
                    inner.session_handler.clone(),
                );
                let handler = inner.listener_handler.clone();
                let _ = owner.execute(move || handler.on_accept(&session));
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
    if server.transition(State::Stopping, State::Stopped) || server.transition(State::Running, State::Stopped)
    {
        debug!("stream server stopped");
    }
}

/// Errors worth a brief backoff instead of giving the listener up.
pub(crate) fn accept_retryable(e: &std::io::Error) -> bool {
    if matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
    ) {
        return true;
    }
    // ENFILE / EMFILE: the process or system file table is full
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(23 | 24)) {
        return true;
    }
    false
}

/// Bind a nonblocking listener with `SO_REUSEADDR` so restarts do not trip
/// over lingering sockets.
pub(crate) fn bind_listener(address: &str) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "address resolved to nothing"))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Dialing endpoint producing [`StreamSession`]s.
pub struct StreamConnector<In, Out> {
    options: Options,
    encoder: Arc<StreamEncoder<Out>>,
    decoder: Arc<StreamDecoder<In>>,
    handler: Arc<StreamSessionHandler<In, Out>>,
}

impl<In, Out> StreamConnector<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new<P, H>(options: Options, pipeline: P, handler: H) -> Self
    where
        P: Encoder<Buffer, Out> + Decoder<Buffer, In> + 'static,
        H: SessionHandler<StreamSession<In, Out>, In> + 'static,
    {
        let pipeline = Arc::new(pipeline);
        Self {
            options,
            encoder: pipeline.clone(),
            decoder: pipeline,
            handler: Arc::new(handler),
        }
    }

    /// Dial `address` on a transient helper thread, awaiting the socket from
    /// the calling loop coroutine.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a loop coroutine.
    pub fn connect(&self, address: &str) -> Result<StreamSession<In, Out>> {
        let owner = in_loop();
        let (tx, rx) = flume::bounded(1);
        {
            let address = address.to_string();
            thread::Builder::new()
                .name("keelson-dial".into())
                .spawn(move || {
                    let _ = tx.send(TcpStream::connect(address.as_str()));
                })
                .expect("failed to spawn dial thread");
        }
        let stream = poll(&rx)??;
        self.options.apply(&stream);
        debug!(address, "stream connection established");
        Ok(StreamSession::new(
            owner,
            stream,
            self.options.clone(),
            BufferPool::new(self.options.buffer_size),
            self.encoder.clone(),
            self.decoder.clone(),
            self.handler.clone(),
        ))
    }
}
