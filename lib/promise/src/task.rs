//! Packaged tasks: a callable that fulfills its future when invoked. The
//! invoker supplies the thread; no work queue is involved.

use std::sync::Arc;

use crate::launch::capture;
use crate::state::SharedState;
use crate::{Future, PromiseError};

pub struct PackagedTask<A, R: Send + 'static> {
    state: Option<Arc<SharedState<R>>>,
    #[allow(clippy::type_complexity)]
    f: Option<Box<dyn FnOnce(A) -> R + Send>>,
}

impl<A, R: Send + 'static> PackagedTask<A, R> {
    pub fn new(f: impl FnOnce(A) -> R + Send + 'static) -> Self {
        Self {
            state: Some(SharedState::new(false)),
            f: Some(Box::new(f)),
        }
    }

    /// True until the task has been invoked (or reset into invalidity).
    pub fn valid(&self) -> bool {
        self.state.is_some()
    }

    pub fn get_future(&self) -> Result<Future<R>, PromiseError> {
        let state = self.state.as_ref().ok_or(PromiseError::NoState)?;
        if !state.mark_shared() {
            return Err(PromiseError::AlreadyRetrieved);
        }
        Ok(Future::from_state(state.clone()))
    }

    /// Run the task body and fulfill the future. Consumes the task's
    /// validity; a second call reports `NoState`.
    pub fn call(&mut self, args: A) -> Result<(), PromiseError> {
        let state = self.state.take().ok_or(PromiseError::NoState)?;
        let f = self.f.take().ok_or(PromiseError::NoState)?;
        let _ = state.fulfill(capture(move || f(args)));
        Ok(())
    }
}

impl<A, R: Send + 'static> std::fmt::Debug for PackagedTask<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackagedTask")
            .field("valid", &self.valid())
            .finish()
    }
}
