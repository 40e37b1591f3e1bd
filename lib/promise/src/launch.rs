//! Launching deferred and asynchronous evaluations.
//!
//! Every launch builds a deferred shared state around a body:
//!
//! * [`async_lazy`] — evaluation on the starting/waiting thread;
//! * [`async_on`] / [`async_apply`] / [`async_promise`] — evaluation as a
//!   ONCE job on a work queue, with the state pinned alive from start to
//!   completion;
//! * argument futures (an [`FutureSet`] tuple) are started along with the
//!   body and gate it through the state's `need_resolution` counter, so
//!   the body only runs once every input is ready.
//!
//! Bodies capture panics and store them as [`Failure::Panic`]; they never
//! unwind into the scheduler.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use workq::{JobType, ServiceHandle, WorkqHandle};

use crate::state::{DeferredBody, SharedState};
use crate::{Failure, Future, Promise, SharedFuture};

bitflags::bitflags! {
    /// Launch mode bits for workq-backed evaluation.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Launch: u32 {
        /// Do not auto-start; evaluation waits for the consumer.
        const DEFER = 0x1;
        /// Allow inline execution on the activating thread.
        const AID = 0x2;
        /// Run as a parallel job.
        const PARALLEL = 0x4;
    }
}

impl Launch {
    /// The default: auto-started, single-threaded, aid permitted.
    pub const DFL: Launch = Launch::AID;
}

pub(crate) fn capture<R>(f: impl FnOnce() -> R) -> Result<R, Failure> {
    catch_unwind(AssertUnwindSafe(f)).map_err(Failure::from_panic)
}

/// A future that can participate as a deferred-body argument.
pub trait Startable: Send + 'static {
    type Value: Send + 'static;

    fn start_sync(&self);
    fn register(
        &self,
        cb: fn(Weak<dyn Any + Send + Sync>),
        weak: &Weak<dyn Any + Send + Sync>,
        counter: &AtomicUsize,
    );
    /// Extract the outcome; only called once the future is ready.
    fn take(self) -> Result<Self::Value, Failure>;
}

impl<T: Send + 'static> Startable for Future<T> {
    type Value = T;

    fn start_sync(&self) {
        self.state().start_deferred(false);
    }

    fn register(
        &self,
        cb: fn(Weak<dyn Any + Send + Sync>),
        weak: &Weak<dyn Any + Send + Sync>,
        counter: &AtomicUsize,
    ) {
        counter.fetch_add(1, Ordering::Acquire);
        self.state().register_dependant(cb, weak.clone());
    }

    fn take(self) -> Result<T, Failure> {
        self.get()
    }
}

impl<T: Clone + Send + 'static> Startable for SharedFuture<T> {
    type Value = T;

    fn start_sync(&self) {
        self.state().start_deferred(false);
    }

    fn register(
        &self,
        cb: fn(Weak<dyn Any + Send + Sync>),
        weak: &Weak<dyn Any + Send + Sync>,
        counter: &AtomicUsize,
    ) {
        counter.fetch_add(1, Ordering::Acquire);
        self.state().register_dependant(cb, weak.clone());
    }

    fn take(self) -> Result<T, Failure> {
        self.get()
    }
}

/// A tuple of startable futures used as deferred-body arguments.
pub trait FutureSet: Send + 'static {
    type Values: Send + 'static;

    fn start_all(&self);
    fn register_all(
        &self,
        cb: fn(Weak<dyn Any + Send + Sync>),
        weak: &Weak<dyn Any + Send + Sync>,
        counter: &AtomicUsize,
    );
    fn resolve(self) -> Result<Self::Values, Failure>;
}

impl FutureSet for () {
    type Values = ();

    fn start_all(&self) {}
    fn register_all(
        &self,
        _cb: fn(Weak<dyn Any + Send + Sync>),
        _weak: &Weak<dyn Any + Send + Sync>,
        _counter: &AtomicUsize,
    ) {
    }
    fn resolve(self) -> Result<(), Failure> {
        Ok(())
    }
}

macro_rules! future_set_tuple {
    ($($f:ident : $idx:tt),+) => {
        impl<$($f: Startable),+> FutureSet for ($($f,)+) {
            type Values = ($($f::Value,)+);

            fn start_all(&self) {
                $(self.$idx.start_sync();)+
            }

            fn register_all(
                &self,
                cb: fn(Weak<dyn Any + Send + Sync>),
                weak: &Weak<dyn Any + Send + Sync>,
                counter: &AtomicUsize,
            ) {
                $(self.$idx.register(cb, weak, counter);)+
            }

            fn resolve(self) -> Result<Self::Values, Failure> {
                Ok(($(self.$idx.take()?,)+))
            }
        }
    };
}

future_set_tuple!(F0: 0);
future_set_tuple!(F0: 0, F1: 1);
future_set_tuple!(F0: 0, F1: 1, F2: 2);
future_set_tuple!(F0: 0, F1: 1, F2: 2, F3: 3);

/// Body: plain function of resolved argument values.
pub(crate) struct ApplyBody<R, A, F> {
    args: Option<A>,
    f: Option<F>,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<R, A, F> ApplyBody<R, A, F> {
    pub(crate) fn new(args: A, f: F) -> Self {
        Self {
            args: Some(args),
            f: Some(f),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<R, A, F> DeferredBody<R> for ApplyBody<R, A, F>
where
    R: Send + 'static,
    A: FutureSet,
    F: FnOnce(A::Values) -> R + Send + 'static,
{
    fn start_args(&mut self) {
        if let Some(args) = &self.args {
            args.start_all();
        }
    }

    fn register_args(
        &mut self,
        cb: fn(Weak<dyn Any + Send + Sync>),
        weak: &Weak<dyn Any + Send + Sync>,
        counter: &AtomicUsize,
    ) {
        if let Some(args) = &self.args {
            args.register_all(cb, weak, counter);
        }
    }

    fn invoke(mut self: Box<Self>, state: &Arc<SharedState<R>>) {
        let args = self.args.take().expect("deferred body invoked twice");
        let f = self.f.take().expect("deferred body invoked twice");
        let outcome = match args.resolve() {
            Ok(values) => capture(move || f(values)),
            Err(e) => Err(e),
        };
        let _ = state.fulfill(outcome);
    }
}

/// Body: function receiving the output promise instead of returning.
pub(crate) struct PassPromiseBody<R, A, F> {
    args: Option<A>,
    f: Option<F>,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<R, A, F> PassPromiseBody<R, A, F> {
    pub(crate) fn new(args: A, f: F) -> Self {
        Self {
            args: Some(args),
            f: Some(f),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<R, A, F> DeferredBody<R> for PassPromiseBody<R, A, F>
where
    R: Send + 'static,
    A: FutureSet,
    F: FnOnce(Promise<R>, A) + Send + 'static,
{
    fn start_args(&mut self) {
        if let Some(args) = &self.args {
            args.start_all();
        }
    }

    fn register_args(
        &mut self,
        cb: fn(Weak<dyn Any + Send + Sync>),
        weak: &Weak<dyn Any + Send + Sync>,
        counter: &AtomicUsize,
    ) {
        if let Some(args) = &self.args {
            args.register_all(cb, weak, counter);
        }
    }

    fn invoke(mut self: Box<Self>, state: &Arc<SharedState<R>>) {
        let args = self.args.take().expect("deferred body invoked twice");
        let f = self.f.take().expect("deferred body invoked twice");
        let promise = Promise::from_state(state.clone());
        // Held across the call so a panic's unwind (which drops the body's
        // promise) cannot turn into a broken promise before the panic
        // itself is recorded.
        let guard = promise.clone();
        if let Err(failure) = capture(move || f(promise, args)) {
            // The body may already have delivered through its promise (or
            // handed it on); only record the panic if nothing else won.
            state.fulfill_failure_if_unset(failure);
        }
        drop(guard);
    }
}

/// Build a lazy (thread-of-the-consumer) deferred state.
pub(crate) fn lazy_state<R: Send + 'static>(
    body: Box<dyn DeferredBody<R>>,
) -> Arc<SharedState<R>> {
    let state = SharedState::new(true);
    state.install_deferred(body);
    state.register_arg_dependants();
    state
}

/// Build a workq-job-backed deferred state.
pub(crate) fn job_state<R: Send + 'static>(
    wq: &WorkqHandle,
    launch: Launch,
    body: Box<dyn DeferredBody<R>>,
) -> Future<R> {
    let state = lazy_state(body);

    let mut jtype = JobType::ONCE | JobType::NO_AID;
    if launch.contains(Launch::AID) {
        jtype -= JobType::NO_AID;
    }
    if launch.contains(Launch::PARALLEL) {
        jtype |= JobType::PARALLEL;
    }

    let weak = Arc::downgrade(&state);
    let job = wq
        .new_job(jtype, move || {
            if let Some(state) = weak.upgrade() {
                state.invoke_deferred_now();
                state.clear_pin();
            }
        })
        .expect("job flags validated by construction");
    state.install_job(job);

    if !launch.contains(Launch::DEFER) {
        state.start_deferred(true);
    }
    Future::from_state(state)
}

/// A future evaluated lazily: the body runs when the future is started,
/// waited on, or consumed.
pub fn async_lazy<R, F>(f: F) -> Future<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let state = lazy_state(Box::new(ApplyBody::new((), move |()| f())));
    Future::from_state(state)
}

/// Lazy evaluation over argument futures: starts and resolves `args`
/// before applying `f`.
pub fn async_apply_lazy<R, A, F>(args: A, f: F) -> Future<R>
where
    R: Send + 'static,
    A: FutureSet,
    F: FnOnce(A::Values) -> R + Send + 'static,
{
    let state = lazy_state(Box::new(ApplyBody::new(args, f)));
    Future::from_state(state)
}

/// Evaluate `f` as a job on `wq`.
pub fn async_on<R, F>(wq: &WorkqHandle, launch: Launch, f: F) -> Future<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    job_state(wq, launch, Box::new(ApplyBody::new((), move |()| f())))
}

/// Evaluate `f` over resolved argument futures as a job on `wq`.
pub fn async_apply<R, A, F>(wq: &WorkqHandle, launch: Launch, args: A, f: F) -> Future<R>
where
    R: Send + 'static,
    A: FutureSet,
    F: FnOnce(A::Values) -> R + Send + 'static,
{
    job_state(wq, launch, Box::new(ApplyBody::new(args, f)))
}

/// Run `f` with the output promise as a job on `wq` (for bodies that
/// deliver asynchronously rather than by return value).
pub fn async_promise<R, F>(wq: &WorkqHandle, launch: Launch, f: F) -> Future<R>
where
    R: Send + 'static,
    F: FnOnce(Promise<R>) + Send + 'static,
{
    job_state(
        wq,
        launch,
        Box::new(PassPromiseBody::new((), move |p, ()| f(p))),
    )
}

/// As [`async_on`], on a fresh work queue of `service`.
pub fn async_service<R, F>(service: &ServiceHandle, launch: Launch, f: F) -> Future<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    async_on(&service.new_workq(), launch, f)
}
