//! Promises and futures over the work-queue scheduler.
//!
//! Unlike the futures of an async runtime, these are plain shared-state
//! cells: a [`Promise`] is fulfilled at most once with a value or a
//! [`Failure`], and a [`Future`] observes that outcome by waiting, by
//! polling ([`Future::wait_for`]) or through callbacks. Deferred futures
//! ([`async_lazy`]) evaluate on whichever thread first demands the result;
//! workq-backed futures ([`async_on`] and friends) evaluate as one-shot
//! jobs, with failures (including panics in the body) captured into the
//! outcome instead of unwinding a worker.
//!
//! ```
//! let p = promise::Promise::new();
//! let f = p.get_future().unwrap();
//! p.set_value(42).unwrap();
//! assert_eq!(f.get().unwrap(), 42);
//! ```
//!
//! Deferred evaluation stays put until demanded:
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let ran = Arc::new(AtomicBool::new(false));
//! let f = promise::async_lazy({
//!     let ran = Arc::clone(&ran);
//!     move || {
//!         ran.store(true, Ordering::Relaxed);
//!         7
//!     }
//! });
//! assert!(!ran.load(Ordering::Relaxed));
//! assert_eq!(f.get().unwrap(), 7);
//! assert!(ran.load(Ordering::Relaxed));
//! ```

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

use std::fmt;
use std::sync::Arc;

mod combine;
mod convert;
mod future;
mod launch;
mod sort;
mod state;
mod task;

pub use combine::{combine, combine_on};
pub use convert::{callback, callback_shared, convert, convert_shared, PromiseStart};
pub use future::{Future, Promise, SharedFuture};
pub use launch::{
    async_apply, async_apply_lazy, async_lazy, async_on, async_promise, async_service,
    FutureSet, Launch, Startable,
};
pub use sort::{merge_sort, quick_sort};
pub use task::PackagedTask;

/// Why a future carries no value.
#[derive(Clone, Debug)]
pub enum Failure {
    /// Every promise reference dropped without delivering.
    BrokenPromise,
    /// A body panicked; the payload's message, if it had one.
    Panic(Arc<str>),
    /// An explicitly reported failure.
    Message(Arc<str>),
}

impl Failure {
    pub fn message(msg: impl Into<Arc<str>>) -> Failure {
        Failure::Message(msg.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Failure {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Arc::from(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Arc::from(s.as_str())
        } else {
            Arc::from("panic payload of unknown type")
        };
        Failure::Panic(msg)
    }

    pub fn is_broken_promise(&self) -> bool {
        matches!(self, Failure::BrokenPromise)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Failure::Panic(_))
    }
}

impl PartialEq for Failure {
    fn eq(&self, other: &Failure) -> bool {
        match (self, other) {
            (Failure::BrokenPromise, Failure::BrokenPromise) => true,
            (Failure::Panic(a), Failure::Panic(b)) => a == b,
            (Failure::Message(a), Failure::Message(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Failure {}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::BrokenPromise => write!(f, "broken promise"),
            Failure::Panic(msg) => write!(f, "panicked: {msg}"),
            Failure::Message(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Failure {}

/// API-misuse errors on promises, futures and tasks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PromiseError {
    /// The object no longer refers to a shared state.
    NoState,
    /// The one future of this state was already handed out.
    AlreadyRetrieved,
    /// The state already holds an outcome.
    AlreadySatisfied,
}

impl fmt::Display for PromiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromiseError::NoState => write!(f, "no state"),
            PromiseError::AlreadyRetrieved => write!(f, "future already retrieved"),
            PromiseError::AlreadySatisfied => write!(f, "promise already satisfied"),
        }
    }
}

impl std::error::Error for PromiseError {}

/// Result of a bounded wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FutureStatus {
    Ready,
    Timeout,
    /// The future is lazily deferred; nothing will happen until a
    /// synchronous start.
    Deferred,
}
