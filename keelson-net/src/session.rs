//! Transport-independent session state.
//!
//! Both transports share the same per-connection skeleton: an atomic state
//! word with CAS discipline, bounded inbound/outbound channels, a per-session
//! blackboard and the dispatch-deduplication flag. The transport modules add
//! their pumps on top.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use keelson_core::blackboard::Blackboard;
use keelson_core::buffer::BufferPool;
use keelson_core::error::{Error, Result};
use keelson_core::Loop;

use crate::options::Options;

pub(crate) const IDLE: u8 = 0;
pub(crate) const RUNNING: u8 = 1;
pub(crate) const CLOSING: u8 = 2;

pub(crate) struct Core<In, Out> {
    pub(crate) owner: Loop,
    pub(crate) options: Options,
    pub(crate) values: Blackboard,
    pub(crate) pool: BufferPool,
    state: AtomicU8,
    dispatching: AtomicBool,
    inbound_tx: flume::Sender<In>,
    pub(crate) inbound_rx: flume::Receiver<In>,
    outbound_tx: flume::Sender<Out>,
    pub(crate) outbound_rx: flume::Receiver<Out>,
}

impl<In, Out> Core<In, Out> {
    pub(crate) fn new(owner: Loop, options: Options, pool: BufferPool) -> Self {
        let (inbound_tx, inbound_rx) = flume::bounded(options.max_read_packet);
        let (outbound_tx, outbound_rx) = flume::bounded(options.max_write_packet);
        Self {
            owner,
            options,
            values: Blackboard::new(),
            pool,
            state: AtomicU8::new(IDLE),
            dispatching: AtomicBool::new(false),
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        }
    }

    pub(crate) fn begin_start(&self) -> bool {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cleanup is the only caller: the session is closing whether or not
    /// `close` ever ran.
    pub(crate) fn force_closing(&self) {
        self.state.store(CLOSING, Ordering::Release);
    }

    pub(crate) fn connected(&self) -> bool {
        self.state.load(Ordering::Acquire) != CLOSING
    }

    pub(crate) fn started(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    pub(crate) fn send(&self, output: Out) -> Result<()> {
        if !self.started() {
            return Err(Error::Disconnected);
        }
        match self.outbound_tx.try_send(output) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(Error::Busy),
            Err(flume::TrySendError::Disconnected(_)) => Err(Error::Disconnected),
        }
    }

    /// Blocking push from the reader helper; stalls when dispatch is behind.
    pub(crate) fn push_inbound(&self, input: In) {
        let _ = self.inbound_tx.send(input);
    }

    /// Claim the right to queue the dispatch executor. At most one dispatch
    /// executor is in flight per session; the executor re-arms by calling
    /// [`Core::finish_dispatch`] on entry and draining the inbound queue.
    pub(crate) fn begin_dispatch(&self) -> bool {
        self.dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_dispatch(&self) {
        self.dispatching.store(false, Ordering::Release);
    }
}
