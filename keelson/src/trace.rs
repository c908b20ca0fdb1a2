//! Tracing setup for the runtime's thread zoo.
//!
//! One logical application thread is really many named native threads: the
//! dispatcher (`keelson-loop`), its coroutine workers (`keelson-worker-N`),
//! and the per-session pumps (`keelson-read`, `keelson-write`,
//! `keelson-cleanup`, plus `keelson-accept` and the transient
//! `keelson-dial` / `keelson-handshake` helpers). Loop and session
//! lifecycles only read coherently when every log line says which of those
//! threads produced it, so the subscriber installed here tags events with
//! their thread name.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber used by the demos and tests.
///
/// `RUST_LOG` wins when set; otherwise `fallback` supplies the filter
/// directives, for example `"info"` or `"keelson_net=debug"`. Returns
/// `false` when a global subscriber was already installed, in which case
/// nothing changes.
pub fn init(fallback: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
        .is_ok()
}
