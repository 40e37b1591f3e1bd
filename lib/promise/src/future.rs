//! The public promise/future handles.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::state::{SharedState, Tag};
use crate::{Failure, FutureStatus, PromiseError};

/// The producing half: fulfilled at most once with a value or a failure.
///
/// Promises may be cloned (all clones feed the same future); when the last
/// clone drops without delivering, the future observes
/// [`Failure::BrokenPromise`].
pub struct Promise<T: Send + 'static> {
    state: Arc<SharedState<T>>,
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        let state = SharedState::new(false);
        state.add_promise_ref();
        Self { state }
    }

    pub(crate) fn from_state(state: Arc<SharedState<T>>) -> Self {
        state.add_promise_ref();
        Self { state }
    }

    /// The consuming half. Each promise hands out exactly one future.
    pub fn get_future(&self) -> Result<Future<T>, PromiseError> {
        if !self.state.mark_shared() {
            return Err(PromiseError::AlreadyRetrieved);
        }
        Ok(Future {
            state: Some(self.state.clone()),
        })
    }

    pub fn set_value(&self, value: T) -> Result<(), PromiseError> {
        self.state.fulfill(Ok(value))
    }

    pub fn set_failure(&self, failure: Failure) -> Result<(), PromiseError> {
        self.state.fulfill(Err(failure))
    }
}

impl<T: Send + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.state.add_promise_ref();
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        self.state.remove_promise_ref();
    }
}

impl<T: Send + 'static> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("ready", &self.state.is_ready())
            .finish()
    }
}

/// The consuming half of a promise (or an async launch). Single-owner;
/// [`Future::get`] consumes it.
pub struct Future<T: Send + 'static> {
    state: Option<Arc<SharedState<T>>>,
}

impl<T: Send + 'static> Future<T> {
    pub(crate) fn from_state(state: Arc<SharedState<T>>) -> Self {
        Self { state: Some(state) }
    }

    pub(crate) fn state(&self) -> &Arc<SharedState<T>> {
        self.state.as_ref().expect("future has no state")
    }

    pub(crate) fn into_state(mut self) -> Arc<SharedState<T>> {
        self.state.take().expect("future has no state")
    }

    pub fn valid(&self) -> bool {
        self.state.is_some()
    }

    /// Start deferred evaluation without waiting for the result.
    pub fn start(&self) {
        self.state().start_deferred(false);
    }

    /// Wait for and take the outcome. Panics if called on an invalid
    /// (moved-from) future.
    pub fn get(mut self) -> Result<T, Failure> {
        let state = self.state.take().expect("get() on an invalid future");
        state.wait();
        state.take_value()
    }

    pub fn wait(&self) {
        self.state().wait();
    }

    pub fn wait_for(&self, d: Duration) -> FutureStatus {
        self.wait_until(Instant::now() + d)
    }

    pub fn wait_until(&self, deadline: Instant) -> FutureStatus {
        match self.state().wait_until(deadline) {
            Tag::ReadyValue | Tag::ReadyFailure => FutureStatus::Ready,
            Tag::UninitDeferred => FutureStatus::Deferred,
            _ => FutureStatus::Timeout,
        }
    }

    /// Convert into a shareable, cloneable future.
    pub fn share(self) -> SharedFuture<T> {
        SharedFuture {
            state: Some(self.into_state()),
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("valid", &self.valid())
            .finish()
    }
}

/// A cloneable future; every holder observes the same outcome by clone.
pub struct SharedFuture<T: Send + 'static> {
    state: Option<Arc<SharedState<T>>>,
}

impl<T: Send + 'static> SharedFuture<T> {
    pub(crate) fn from_state(state: Arc<SharedState<T>>) -> Self {
        Self { state: Some(state) }
    }

    pub(crate) fn state(&self) -> &Arc<SharedState<T>> {
        self.state.as_ref().expect("shared future has no state")
    }

    pub fn valid(&self) -> bool {
        self.state.is_some()
    }

    pub fn start(&self) {
        self.state().start_deferred(false);
    }

    pub fn wait(&self) {
        self.state().wait();
    }

    pub fn wait_for(&self, d: Duration) -> FutureStatus {
        self.wait_until(Instant::now() + d)
    }

    pub fn wait_until(&self, deadline: Instant) -> FutureStatus {
        match self.state().wait_until(deadline) {
            Tag::ReadyValue | Tag::ReadyFailure => FutureStatus::Ready,
            Tag::UninitDeferred => FutureStatus::Deferred,
            _ => FutureStatus::Timeout,
        }
    }

    pub fn get(&self) -> Result<T, Failure>
    where
        T: Clone,
    {
        let state = self.state();
        state.wait();
        state.clone_value()
    }
}

impl<T: Send + 'static> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> From<Future<T>> for SharedFuture<T> {
    fn from(f: Future<T>) -> Self {
        f.share()
    }
}

impl<T: Send + 'static> std::fmt::Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFuture")
            .field("valid", &self.valid())
            .finish()
    }
}
