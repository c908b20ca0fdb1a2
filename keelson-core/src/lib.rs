//! Keelson Core
//!
//! Runtime-agnostic building blocks for cooperative network services:
//! - Cooperative loop: one logical application thread per [`Loop`],
//!   executors, `poll`/`sync` suspension, affinity tracking (`event_loop`)
//! - Pooled chained byte buffers with zero-copy reservations (`buffer`)
//! - Composable encoder/decoder pipelines (`codec`)
//! - Cooperative keyed locks (`locker`)
//! - Multi-listener delegates (`event`)
//! - Hierarchical typed configuration (`config`)
//! - Process runtime: bootstrap, shutdown, error funnel (`runtime`)
//! - Shared typed key/value store (`blackboard`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod blackboard;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod locker;
pub mod runtime;

pub use blackboard::Blackboard;
pub use buffer::{Buffer, BufferPool};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, Subscription};
pub use event_loop::{
    in_loop, is_in_loop, poll, start_loop, start_loop_with, sync, ErrorHook, Loop,
};
pub use locker::{lock, LockGuard};
pub use runtime::{bootstrap, shutdown};
