//! The cooperative loop.
//!
//! A [`Loop`] multiplexes many logical tasks onto one application thread.
//! Executors queued with [`Loop::execute`] run one at a time on a pool of
//! worker threads standing in for coroutines: each worker parks on a
//! zero-capacity rendezvous channel and is handed one executor per wake.
//! From the perspective of user callbacks execution is single-threaded; no
//! synchronization between callbacks on the same loop is ever needed.
//!
//! A coroutine suspends only at the end of an executor and inside [`poll`],
//! [`sync`] and the cooperative locker. While suspended it releases the loop
//! so other executors can run, and re-queues a continuation at the head of
//! the queue once its wait completes, so a resuming coroutine returns to the
//! loop ahead of new work.
//!
//! Blocking work never runs on the loop: [`poll`] parks the coroutine on a
//! channel fed by a helper thread, and [`sync`] runs an arbitrary blocking
//! call after releasing the loop, catching panics on the way.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::blackboard::Blackboard;
use crate::error::{Error, Result};
use crate::runtime;

/// A unit of work scheduled onto a loop. Immutable once queued.
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A link in the loop's error chain: return `None` to swallow the error,
/// `Some` to pass it (possibly transformed) down the chain.
pub type ErrorHook = Box<dyn Fn(Error) -> Option<Error> + Send + Sync>;

const OFF_LOOP: &str = "can only be called from a loop coroutine";

/// Process-wide map from native thread id to the loop coroutine running on
/// it, for affinity checks.
static REGISTRY: Lazy<DashMap<ThreadId, Entry>> = Lazy::new(DashMap::new);

#[derive(Clone)]
struct Entry {
    shared: Weak<Shared>,
    co: Arc<Coroutine>,
    signals: flume::Receiver<Wake>,
}

enum Wake {
    Run(Task),
    Resume,
    Exit,
}

enum Job {
    Task(Task),
    Resume(Arc<Coroutine>),
    Cancel,
    Shutdown,
}

struct Coroutine {
    id: usize,
    thread: ThreadId,
    signal: flume::Sender<Wake>,
}

struct TaskQueue {
    jobs: Mutex<VecDeque<Job>>,
    ready: Condvar,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn push_back(&self, job: Job) {
        self.jobs.lock().push_back(job);
        self.ready.notify_one();
    }

    fn push_front(&self, job: Job) {
        self.jobs.lock().push_front(job);
        self.ready.notify_one();
    }

    fn pop(&self) -> Job {
        let mut jobs = self.jobs.lock();
        loop {
            if let Some(job) = jobs.pop_front() {
                return job;
            }
            self.ready.wait(&mut jobs);
        }
    }
}

pub(crate) struct Shared {
    queue: TaskQueue,
    cancelled: AtomicBool,
    draining: AtomicBool,
    pending: AtomicUsize,
    values: Blackboard,
    free: Mutex<Vec<Arc<Coroutine>>>,
    current: Mutex<Option<ThreadId>>,
    unpark_tx: flume::Sender<()>,
    park_rx: flume::Receiver<()>,
    hooks: Vec<ErrorHook>,
    cancel_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    next_worker: AtomicUsize,
}

impl Shared {
    fn current(&self) -> Option<ThreadId> {
        *self.current.lock()
    }

    fn set_current(&self, thread: ThreadId) {
        *self.current.lock() = Some(thread);
    }

    fn clear_current(&self) {
        *self.current.lock() = None;
    }

    fn park(&self) {
        let _ = self.park_rx.recv();
    }

    fn unpark(&self) {
        let _ = self.unpark_tx.send(());
    }

    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.queue.push_back(Job::Cancel);
        }
    }

    fn put_free(&self, co: Arc<Coroutine>) {
        self.free.lock().push(co);
    }

    /// Pass an executor failure through the user error chain; escalate what
    /// survives by cancelling this loop and reporting to the runtime.
    fn escalate(&self, err: Error) {
        let mut err = Some(err);
        for hook in &self.hooks {
            match err.take().map(|e| hook(e)) {
                Some(Some(e)) => err = Some(e),
                _ => break,
            }
        }
        if let Some(err) = err {
            warn!(error = %err, "executor error escaped the error chain");
            self.cancel();
            runtime::report(err);
        }
    }

    fn release_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1
            && self.draining.load(Ordering::Acquire)
        {
            self.queue.push_back(Job::Shutdown);
        }
    }
}

/// Handle to a cooperative loop. Cloning shares the same loop.
#[derive(Clone)]
pub struct Loop {
    shared: Arc<Shared>,
}

impl Loop {
    /// Queue an executor at the back of the loop.
    ///
    /// Never suspends the caller; may be called from any thread. Fails with
    /// [`Error::Cancelled`] once the loop has been cancelled.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.shared.queue.push_back(Job::Task(Box::new(task)));
        Ok(())
    }

    /// Request shutdown: running executors finish, the drain obligations
    /// registered with [`Loop::retain`] are waited out, then the coroutine
    /// pool is recycled and the dispatcher exits. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Store a value in the loop-scoped key/value map.
    ///
    /// A value stored inside an executor is visible to every later executor
    /// on this loop.
    pub fn store<T: std::any::Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.shared.values.store(key, value);
    }

    /// Load a value from the loop-scoped key/value map.
    #[must_use]
    pub fn load<T: std::any::Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.shared.values.load(key)
    }

    /// Remove a value from the loop-scoped key/value map.
    pub fn delete(&self, key: &str) {
        self.shared.values.delete(key);
    }

    /// Register a hook to run when the loop is cancelled.
    ///
    /// Transports register hooks that close their sessions and stop their
    /// servers so one `cancel` drains the whole loop. Registering on an
    /// already-cancelled loop runs the hook immediately.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.shared.cancel_hooks.lock();
            if !self.is_cancelled() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Record a drain obligation: the loop will not finish shutting down
    /// until a matching [`Loop::finish`] task has run.
    pub fn retain(&self) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Queue a final executor for a resource registered with
    /// [`Loop::retain`].
    ///
    /// Unlike [`Loop::execute`] this is accepted even while the loop is
    /// draining after `cancel`, so close callbacks are always delivered;
    /// the obligation is released after the task runs.
    pub fn finish<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared.queue.push_back(Job::Task(Box::new(move || {
            let result = task();
            shared.release_one();
            result
        })));
    }
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PartialEq for Loop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Loop {}

/// Start a loop with no error chain.
#[must_use]
pub fn start_loop() -> Loop {
    start_loop_with(Vec::new())
}

/// Start a loop with an error chain consulted for every executor failure.
#[must_use]
pub fn start_loop_with(hooks: Vec<ErrorHook>) -> Loop {
    let (unpark_tx, park_rx) = flume::bounded(0);
    let shared = Arc::new(Shared {
        queue: TaskQueue::new(),
        cancelled: AtomicBool::new(false),
        draining: AtomicBool::new(false),
        pending: AtomicUsize::new(0),
        values: Blackboard::new(),
        free: Mutex::new(Vec::new()),
        current: Mutex::new(None),
        unpark_tx,
        park_rx,
        hooks,
        cancel_hooks: Mutex::new(Vec::new()),
        next_worker: AtomicUsize::new(0),
    });
    runtime::loop_started(&shared);
    {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("keelson-loop".into())
            .spawn(move || dispatch(&shared))
            .expect("failed to spawn loop dispatcher thread");
    }
    debug!("loop started");
    Loop { shared }
}

/// The loop this thread's coroutine belongs to, or `None` when called from
/// outside a loop coroutine.
#[must_use]
pub fn is_in_loop() -> Option<Loop> {
    let entry = current_entry()?;
    let shared = entry.shared.upgrade()?;
    Some(Loop { shared })
}

/// The loop this thread's coroutine belongs to.
///
/// # Panics
///
/// Panics when called from outside a loop coroutine; calling loop APIs off
/// the loop is a programmer bug.
#[must_use]
pub fn in_loop() -> Loop {
    is_in_loop().expect(OFF_LOOP)
}

/// Yield the loop and park the current coroutine on `rx`.
///
/// Other executors run while this coroutine waits; when a value arrives the
/// coroutine re-queues itself at the head of the loop and resumes. A closed
/// channel surfaces [`Error::ChannelClosed`].
///
/// # Panics
///
/// Panics when called from outside a loop coroutine.
pub fn poll<T>(rx: &flume::Receiver<T>) -> Result<T> {
    suspend(|| rx.recv()).map_err(|_| Error::ChannelClosed)
}

/// Yield the loop and run an arbitrary blocking call on this coroutine's
/// thread, resuming on the loop once it returns.
///
/// Panics inside the call are caught and surfaced as [`Error::Panicked`].
///
/// # Panics
///
/// Panics when called from outside a loop coroutine.
pub fn sync<T>(f: impl FnOnce() -> T) -> Result<T> {
    suspend(|| panic::catch_unwind(AssertUnwindSafe(f))).map_err(Error::panicked)
}

/// Release the loop, run `wait`, then re-queue a head-of-line continuation
/// and park until the dispatcher hands control back.
pub(crate) fn suspend<R>(wait: impl FnOnce() -> R) -> R {
    let entry = current_entry().expect(OFF_LOOP);
    let shared = entry.shared.upgrade().expect(OFF_LOOP);

    shared.clear_current();
    shared.unpark();

    let value = wait();

    shared.queue.push_front(Job::Resume(Arc::clone(&entry.co)));
    match entry.signals.recv() {
        Ok(Wake::Resume) => {}
        // the dispatcher is gone; continue without a loop to return to
        Ok(_) | Err(_) => warn!(worker = entry.co.id, "resumed without a dispatcher"),
    }
    value
}

fn current_entry() -> Option<Entry> {
    let entry = REGISTRY.get(&thread::current().id())?.clone();
    let shared = entry.shared.upgrade()?;
    if shared.current() != Some(entry.co.thread) {
        return None;
    }
    Some(entry)
}

fn dispatch(shared: &Arc<Shared>) {
    loop {
        match shared.queue.pop() {
            Job::Task(task) => {
                let co = get_free(shared);
                shared.set_current(co.thread);
                trace!(worker = co.id, "dispatch executor");
                if co.signal.send(Wake::Run(task)).is_ok() {
                    shared.park();
                }
            }
            Job::Resume(co) => {
                shared.set_current(co.thread);
                trace!(worker = co.id, "resume coroutine");
                if co.signal.send(Wake::Resume).is_ok() {
                    shared.park();
                }
            }
            Job::Cancel => {
                let hooks = std::mem::take(&mut *shared.cancel_hooks.lock());
                debug!(hooks = hooks.len(), "loop cancelling");
                for hook in hooks {
                    hook();
                }
                shared.draining.store(true, Ordering::Release);
                if shared.pending.load(Ordering::Acquire) == 0 {
                    break;
                }
            }
            Job::Shutdown => break,
        }
    }

    // recycle the idle coroutine pool
    loop {
        let co = shared.free.lock().pop();
        match co {
            Some(co) => {
                if co.signal.send(Wake::Exit).is_ok() {
                    shared.park();
                }
            }
            None => break,
        }
    }
    runtime::loop_finished();
    debug!("loop drained");
}

fn get_free(shared: &Arc<Shared>) -> Arc<Coroutine> {
    if let Some(co) = shared.free.lock().pop() {
        return co;
    }
    spawn_worker(shared)
}

fn spawn_worker(shared: &Arc<Shared>) -> Arc<Coroutine> {
    let id = shared.next_worker.fetch_add(1, Ordering::Relaxed);
    let (boot_tx, boot_rx) = flume::bounded(1);
    let owner = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("keelson-worker-{id}"))
        .spawn(move || {
            let (signal_tx, signal_rx) = flume::bounded(0);
            let co = Arc::new(Coroutine {
                id,
                thread: thread::current().id(),
                signal: signal_tx,
            });
            REGISTRY.insert(
                co.thread,
                Entry {
                    shared: Arc::downgrade(&owner),
                    co: Arc::clone(&co),
                    signals: signal_rx.clone(),
                },
            );
            let _ = boot_tx.send(Arc::clone(&co));
            worker_loop(&owner, &co, &signal_rx);
            REGISTRY.remove(&co.thread);
            shared_exit(&owner);
        })
        .expect("failed to spawn loop worker thread");
    boot_rx.recv().expect("loop worker failed to report in")
}

fn worker_loop(shared: &Arc<Shared>, co: &Arc<Coroutine>, signals: &flume::Receiver<Wake>) {
    while let Ok(wake) = signals.recv() {
        match wake {
            Wake::Run(task) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                    .unwrap_or_else(|payload| Err(Error::panicked(payload)));
                if let Err(err) = outcome {
                    shared.escalate(err);
                }
                shared.put_free(Arc::clone(co));
                shared.unpark();
            }
            Wake::Resume => trace!(worker = co.id, "stray resume signal"),
            Wake::Exit => break,
        }
    }
}

fn shared_exit(shared: &Arc<Shared>) {
    trace!("loop worker exiting");
    shared.unpark();
}
