//! Cooperative work-queue scheduler.
//!
//! Work is expressed as jobs attached to work queues; a service owns the
//! work queues and hands runnable jobs to whatever threads drive it. The
//! library never creates threads on its own behalf unless asked
//! ([`WorkqService::with_threads`]); any thread can make progress by
//! calling [`WorkqService::aid`] or [`Workq::aid`], and dedicated workers
//! are just threads doing that in a loop through the [`threadpool`]
//! binding.
//!
//! Ordering guarantees are deliberately narrow: within one work queue that
//! is not held in parallel mode, at most one job runs at a time and serial
//! jobs run in activation order. Across work queues nothing is promised.
//!
//! ```
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let service = workq::WorkqService::new();
//! let wq = service.new_workq();
//!
//! let counter = Arc::new(AtomicU32::new(0));
//! let job = wq
//!     .new_job(workq::JobType::empty(), {
//!         let counter = Arc::clone(&counter);
//!         move || {
//!             counter.fetch_add(1, Ordering::Relaxed);
//!         }
//!     })
//!     .unwrap();
//!
//! job.activate(workq::Activate::empty());
//! // No worker threads here; drive the service ourselves.
//! while service.aid(16) {}
//! assert_eq!(counter.load(Ordering::Relaxed), 1);
//! ```
//!
//! Jobs must not panic: a panic unwinds through the worker loop and, for
//! pool-driven services, poisons the pool. Code that needs to capture
//! failures belongs in a future-backed job (see the `promise` crate),
//! which catches them by design.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

use std::fmt;

mod job;
mod refs;
mod service;
mod stack;
pub mod threadpool;
#[allow(clippy::module_inception)]
mod workq;

pub use job::{Activate, JobHandle, JobType};
pub use service::{ServiceHandle, WorkqService};
pub use stack::{workq_switch, PopState};
pub use threadpool::{threadpool_attach, Threadpool};
pub use workq::{RunMode, Workq, WorkqHandle};

/// Errors from job construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NewJobError {
    /// `ONCE` and `PERSIST` are mutually exclusive.
    ConflictingFlags,
    /// A coroutine job needs at least one body.
    EmptyCoroutine,
}

impl fmt::Display for NewJobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NewJobError::ConflictingFlags => {
                write!(f, "cannot create a persistent job that only runs once")
            }
            NewJobError::EmptyCoroutine => write!(f, "coroutine job without bodies"),
        }
    }
}

impl std::error::Error for NewJobError {}

/// Errors from [`workq_switch`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SwitchError {
    /// The requested exclusive hold is already held by an enclosing frame
    /// on this thread; blocking would never resolve.
    Deadlock,
    /// Switching requires an active workq invocation; otherwise there is
    /// no frame whose end could restore the previous state.
    OutsideWorkq,
}

impl fmt::Display for SwitchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchError::Deadlock => write!(f, "workq deadlock detected"),
            SwitchError::OutsideWorkq => {
                write!(f, "workq switch requires an active workq invocation")
            }
        }
    }
}

impl std::error::Error for SwitchError {}

/// Errors from binding clients and services together.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// This side is already bound to a counterpart.
    AlreadyAttached,
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::AlreadyAttached => write!(f, "already attached"),
        }
    }
}

impl std::error::Error for AttachError {}
