//! Process runtime: loop registry, cancellation and the error funnel.
//!
//! Every loop registers here when started and signs off when its dispatcher
//! drains. [`bootstrap`] is the application's front door: it parks the main
//! thread until either every loop has drained (clean exit) or some loop
//! escalates an error, in which case every peer loop is cancelled before the
//! error is returned.

use std::sync::{Arc, Weak};
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event_loop::Shared;

static RUNTIME: Lazy<Runtime> = Lazy::new(Runtime::new);

struct Runtime {
    loops: Mutex<Vec<Weak<Shared>>>,
    active: Mutex<usize>,
    idle: Condvar,
    funnel_tx: flume::Sender<Error>,
    funnel_rx: flume::Receiver<Error>,
    config: Mutex<Config>,
}

impl Runtime {
    fn new() -> Self {
        let (funnel_tx, funnel_rx) = flume::unbounded();
        Self {
            loops: Mutex::new(Vec::new()),
            active: Mutex::new(0),
            idle: Condvar::new(),
            funnel_tx,
            funnel_rx,
            config: Mutex::new(Config::empty()),
        }
    }

    fn wait_idle(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.idle.wait(&mut active);
        }
    }
}

pub(crate) fn loop_started(shared: &Arc<Shared>) {
    let mut loops = RUNTIME.loops.lock();
    loops.retain(|weak| weak.strong_count() > 0);
    loops.push(Arc::downgrade(shared));
    *RUNTIME.active.lock() += 1;
}

pub(crate) fn loop_finished() {
    let mut active = RUNTIME.active.lock();
    *active = active.saturating_sub(1);
    if *active == 0 {
        RUNTIME.idle.notify_all();
    }
}

/// Funnel an unswallowed loop error to whoever is blocked in [`bootstrap`].
pub(crate) fn report(err: Error) {
    let _ = RUNTIME.funnel_tx.send(err);
}

/// Cancel every live loop in the process.
pub fn shutdown() {
    let loops: Vec<Arc<Shared>> = {
        let mut registered = RUNTIME.loops.lock();
        registered.retain(|weak| weak.strong_count() > 0);
        registered.iter().filter_map(Weak::upgrade).collect()
    };
    debug!(loops = loops.len(), "shutdown requested");
    for shared in loops {
        shared.cancel();
    }
}

/// The process configuration installed by [`bootstrap`].
#[must_use]
pub fn config() -> Config {
    RUNTIME.config.lock().clone()
}

/// Install `config` as the process configuration and block until the
/// application winds down.
///
/// Returns `Ok(())` once every loop has drained. If a loop escalates an
/// error through its error chain, every peer loop is cancelled, the drain is
/// awaited, and the error is returned.
pub fn bootstrap(config: Config) -> Result<()> {
    *RUNTIME.config.lock() = config;

    // stale errors from a previous bootstrap belong to that run
    while RUNTIME.funnel_rx.try_recv().is_ok() {}

    let (done_tx, done_rx) = flume::bounded(1);
    thread::Builder::new()
        .name("keelson-bootstrap".into())
        .spawn(move || {
            RUNTIME.wait_idle();
            let _ = done_tx.send(());
        })
        .expect("failed to spawn bootstrap watcher thread");

    let failure = flume::Selector::new()
        .recv(&RUNTIME.funnel_rx, |result| result.ok())
        .recv(&done_rx, |_| None)
        .wait();

    match failure {
        None => Ok(()),
        Some(err) => {
            warn!(error = %err, "bootstrap failed, cancelling peer loops");
            shutdown();
            RUNTIME.wait_idle();
            Err(err)
        }
    }
}
