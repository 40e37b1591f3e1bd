//! Combinators: futures that become ready when all their inputs are.
//!
//! The output is a deferred state gated by an `n + 1` counter — one per
//! input plus one for the output's own start. Starting the output starts
//! every input; each input that becomes ready drops a gate; when the last
//! gate falls, the combining function runs with the output promise and the
//! (all ready) input futures.

use workq::WorkqHandle;

use crate::launch::{job_state, lazy_state, FutureSet, Launch, PassPromiseBody};
use crate::{Future, Promise};

/// Combine `futures` through `f`. `f` receives the output promise and the
/// input futures once every input is ready; with zero inputs it runs as
/// soon as the output is started. A panic in `f` fails the output.
pub fn combine<R, A, F>(f: F, futures: A) -> Future<R>
where
    R: Send + 'static,
    A: FutureSet,
    F: FnOnce(Promise<R>, A) + Send + 'static,
{
    let state = lazy_state(Box::new(PassPromiseBody::new(futures, f)));
    Future::from_state(state)
}

/// As [`combine`], but the combining function runs as a job on `wq`.
pub fn combine_on<R, A, F>(wq: &WorkqHandle, launch: Launch, f: F, futures: A) -> Future<R>
where
    R: Send + 'static,
    A: FutureSet,
    F: FnOnce(Promise<R>, A) + Send + 'static,
{
    job_state(wq, launch, Box::new(PassPromiseBody::new(futures, f)))
}
