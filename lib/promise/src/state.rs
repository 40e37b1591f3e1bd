//! The shared state cell behind every promise/future pair.
//!
//! A state is a write-once value-or-failure cell plus the machinery that
//! fires when it becomes ready: a single unshared ready callback, a chain
//! of shared-future callbacks, and a vector of type-erased dependants.
//! Setter paths serialize on a coarse spin lock; the terminal transition is
//! a release store of the state tag, and dispatch happens outside every
//! lock so callbacks may install further callbacks.
//!
//! Deferred states additionally hold their (not yet started) body. A
//! deferred body may depend on argument futures; an atomic
//! `need_resolution` counter gates the body behind the self-start plus one
//! registered dependant per argument. Work-queue-backed states redirect the
//! body through a ONCE job and pin themselves alive from start to
//! completion.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use lockfree::sync::UnsafeCell;
use workq::{Activate, JobHandle};

use crate::{Failure, Future, PromiseError, SharedFuture};

/// State tags; `Ready*` are terminal.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum Tag {
    Uninit = 0,
    UninitDeferred = 1,
    UninitConvert = 2,
    ReadyValue = 3,
    ReadyFailure = 4,
}

impl Tag {
    fn from_u8(v: u8) -> Tag {
        match v {
            0 => Tag::Uninit,
            1 => Tag::UninitDeferred,
            2 => Tag::UninitConvert,
            3 => Tag::ReadyValue,
            4 => Tag::ReadyFailure,
            _ => unreachable!("corrupt state tag"),
        }
    }

    pub(crate) fn is_ready(self) -> bool {
        matches!(self, Tag::ReadyValue | Tag::ReadyFailure)
    }
}

/// Type-erased dependant notification: a plain fn pointer plus a weak
/// handle it can downcast. Kept as a pair (rather than a boxed closure) so
/// registration never allocates per dependant beyond the vector slot.
pub(crate) type DependantFn = fn(Weak<dyn Any + Send + Sync>);
type Dependant = (DependantFn, Weak<dyn Any + Send + Sync>);

fn noop_dependant(_: Weak<dyn Any + Send + Sync>) {}

struct SharedCbNode<T: Send + 'static> {
    f: Box<dyn FnOnce(SharedFuture<T>) + Send>,
    chain: Option<Box<SharedCbNode<T>>>,
}

struct Callbacks<T: Send + 'static> {
    ready_cb: Option<Box<dyn FnOnce(Future<T>) + Send>>,
    shared_cbs: Option<Box<SharedCbNode<T>>>,
    dependants: Vec<Dependant>,
}

/// A deferred body waiting inside a state.
pub(crate) trait DeferredBody<T: Send + 'static>: Send {
    /// Start any argument futures (called once, after `clear_deferred`).
    fn start_args(&mut self);

    /// Register one dependant per argument future against `counter`.
    fn register_args(
        &mut self,
        cb: DependantFn,
        weak: &Weak<dyn Any + Send + Sync>,
        counter: &AtomicUsize,
    );

    /// Produce the outcome. Must fulfill `state` (directly or by handing
    /// its promise on); panics are the implementation's to capture.
    fn invoke(self: Box<Self>, state: &Arc<SharedState<T>>);
}

/// Forwarding half of a converter chain (see `convert.rs`): started when
/// the (convert-tagged) target is started.
pub(crate) trait ConverterStart: Send + Sync {
    fn start_deferred(&self, async_: bool);
}

pub(crate) struct SharedState<T: Send + 'static> {
    tag: AtomicU8,
    /// Coarse spin lock serializing setter paths.
    lck: AtomicBool,
    /// Set once a future has been handed out.
    shared: AtomicBool,
    start_deferred_called: AtomicBool,
    start_deferred_async: AtomicBool,
    promise_refs: AtomicUsize,
    /// Written once under `lck` before the ready transition; immutable
    /// after. Unshared `get` moves the value out under `lck`.
    value: UnsafeCell<Option<Result<T, Failure>>>,
    cbs: Mutex<Callbacks<T>>,
    convert: Mutex<Option<Arc<dyn ConverterStart>>>,
    deferred: Mutex<Option<Box<dyn DeferredBody<T>>>>,
    /// Gate on the deferred body: 1 for the self-start plus 1 per
    /// unresolved argument future.
    need_resolution: AtomicUsize,
    /// For workq-backed states: the ONCE job that runs the body.
    wq_job: Mutex<Option<JobHandle>>,
    /// Keeps a started workq-backed state alive until its body ran.
    self_pin: Mutex<Option<Arc<SharedState<T>>>>,
    weak_self: Mutex<Weak<SharedState<T>>>,
}

// SAFETY: the value cell is guarded by the tag/lock protocol described on
// the field; everything else is atomics and mutexes.
unsafe impl<T: Send> Send for SharedState<T> {}
unsafe impl<T: Send> Sync for SharedState<T> {}

impl<T: Send + 'static> SharedState<T> {
    pub(crate) fn new(deferred: bool) -> Arc<Self> {
        let state = Arc::new(SharedState {
            tag: AtomicU8::new(if deferred {
                Tag::UninitDeferred as u8
            } else {
                Tag::Uninit as u8
            }),
            lck: AtomicBool::new(false),
            shared: AtomicBool::new(false),
            start_deferred_called: AtomicBool::new(false),
            start_deferred_async: AtomicBool::new(false),
            promise_refs: AtomicUsize::new(0),
            value: UnsafeCell::new(None),
            cbs: Mutex::new(Callbacks {
                ready_cb: None,
                shared_cbs: None,
                dependants: Vec::new(),
            }),
            convert: Mutex::new(None),
            deferred: Mutex::new(None),
            need_resolution: AtomicUsize::new(1),
            wq_job: Mutex::new(None),
            self_pin: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
        });
        *state.weak_self.lock().unwrap() = Arc::downgrade(&state);
        state
    }

    pub(crate) fn tag(&self) -> Tag {
        Tag::from_u8(self.tag.load(Ordering::Relaxed))
    }

    pub(crate) fn is_ready(&self) -> bool {
        Tag::from_u8(self.tag.load(Ordering::Acquire)).is_ready()
    }

    fn lock(&self) {
        let mut spincount = 0u32;
        loop {
            if self
                .lck
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            spincount += 1;
            if spincount > 40 {
                std::thread::yield_now();
            }
        }
    }

    fn unlock(&self) {
        let was = self.lck.swap(false, Ordering::Release);
        debug_assert!(was);
    }

    /// Claim the one future this state may hand out.
    pub(crate) fn mark_shared(&self) -> bool {
        self.shared
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn add_promise_ref(&self) {
        self.promise_refs.fetch_add(1, Ordering::Acquire);
    }

    pub(crate) fn remove_promise_ref(self: &Arc<Self>) {
        if self.promise_refs.fetch_sub(1, Ordering::Release) == 1
            && self.tag() == Tag::Uninit
        {
            // The last promise died without delivering.
            log::debug!("promise dropped unfulfilled; delivering broken promise");
            let _ = self.fulfill(Err(Failure::BrokenPromise));
        }
    }

    /// Store the outcome and run the terminal transition. Fails with
    /// `AlreadySatisfied` if the state is not (or no longer) `Uninit`.
    pub(crate) fn fulfill(self: &Arc<Self>, outcome: Result<T, Failure>) -> Result<(), PromiseError> {
        self.lock();
        if self.tag() != Tag::Uninit {
            self.unlock();
            return Err(PromiseError::AlreadySatisfied);
        }
        let ready_tag = if outcome.is_ok() {
            Tag::ReadyValue
        } else {
            Tag::ReadyFailure
        };
        self.value.with_mut(|v| {
            // SAFETY: tag is Uninit and we hold the setter lock; no reader
            // touches the cell before the ready transition below.
            unsafe { *v = Some(outcome) };
        });
        let old = self.tag.swap(ready_tag as u8, Ordering::Release);
        debug_assert_eq!(old, Tag::Uninit as u8);
        self.unlock();

        self.invoke_ready_cb();
        Ok(())
    }

    /// Like [`Self::fulfill`] with a failure, but quietly loses the race
    /// against an existing outcome (used by panic capture in bodies that
    /// may already have delivered through their promise).
    pub(crate) fn fulfill_failure_if_unset(self: &Arc<Self>, failure: Failure) {
        let _ = self.fulfill(Err(failure));
    }

    /// Block (spin-yield) until ready; triggers synchronous deferred
    /// evaluation first.
    pub(crate) fn wait(self: &Arc<Self>) {
        self.start_deferred(false);
        while !self.is_ready() {
            std::thread::yield_now();
        }
    }

    /// Bounded wait: ready, still-deferred, or deadline reached.
    pub(crate) fn wait_until(self: &Arc<Self>, deadline: Instant) -> Tag {
        self.start_deferred(true);
        loop {
            let tag = Tag::from_u8(self.tag.load(Ordering::Acquire));
            if tag.is_ready() || tag == Tag::UninitDeferred {
                return tag;
            }
            if Instant::now() >= deadline {
                return tag;
            }
            std::thread::yield_now();
        }
    }

    /// Move the outcome out (unshared consumption).
    pub(crate) fn take_value(&self) -> Result<T, Failure> {
        debug_assert!(self.is_ready());
        self.lock();
        let v = self.value.with_mut(|v| {
            // SAFETY: ready is terminal and we hold the setter lock; the
            // single unshared future is the only mover.
            unsafe { (*v).take() }
        });
        self.unlock();
        v.expect("future value consumed twice")
    }

    /// Read the outcome by clone (shared consumption).
    pub(crate) fn clone_value(&self) -> Result<T, Failure>
    where
        T: Clone,
    {
        debug_assert!(self.is_ready());
        self.value.with(|v| {
            // SAFETY: ready is terminal; the cell is immutable now (shared
            // futures never take).
            unsafe { (*v).as_ref() }
                .expect("shared future value missing")
                .clone()
        })
    }

    /// Idempotent deferred start. A synchronous request supersedes an
    /// earlier async-only one.
    pub(crate) fn start_deferred(self: &Arc<Self>, async_: bool) {
        self.start_deferred_called.store(true, Ordering::Relaxed);
        if async_ {
            self.start_deferred_async.store(true, Ordering::Relaxed);
        }
        self.do_start_deferred(async_);
    }

    pub(crate) fn get_start_deferred(&self) -> (bool, bool) {
        (
            self.start_deferred_called.load(Ordering::Relaxed),
            self.start_deferred_async.load(Ordering::Relaxed),
        )
    }

    fn clear_deferred(&self) -> bool {
        self.tag
            .compare_exchange(
                Tag::UninitDeferred as u8,
                Tag::Uninit as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn clear_convert(&self) -> bool {
        self.tag
            .compare_exchange(
                Tag::UninitConvert as u8,
                Tag::Uninit as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn mark_convert_present(&self) {
        let ok = self
            .tag
            .compare_exchange(
                Tag::Uninit as u8,
                Tag::UninitConvert as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok();
        debug_assert!(ok, "converter installed on a non-uninit state");
    }

    pub(crate) fn set_converter(&self, conv: Arc<dyn ConverterStart>) {
        let old = self.convert.lock().unwrap().replace(conv);
        debug_assert!(old.is_none(), "second converter installed");
    }

    fn do_start_deferred(self: &Arc<Self>, async_: bool) {
        if self.tag() == Tag::UninitDeferred {
            // Workq-backed bodies always take the synchronous path: the
            // "async" part is the job activation itself. Pin ourselves so
            // the job outlives every caller.
            let is_wq = self.wq_job.lock().unwrap().is_some();
            let async_ = async_ && !is_wq;
            if is_wq {
                let pin = self.clone();
                *self.self_pin.lock().unwrap() = Some(pin);
            }

            if !async_ && self.clear_deferred() {
                {
                    let mut deferred = self.deferred.lock().unwrap();
                    if let Some(body) = deferred.as_mut() {
                        body.start_args();
                    }
                }
                self.arg_resolved();
            }
            return;
        }

        // Not deferred (anymore): forward to a converter, if any.
        let conv = self.convert.lock().unwrap().clone();
        if let Some(conv) = conv {
            conv.start_deferred(async_);
        }
    }

    /// One gate dropped (self-start or an argument became ready).
    pub(crate) fn arg_resolved(self: &Arc<Self>) {
        if self.need_resolution.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.invoke_deferred();
        }
    }

    /// All gates down: run the body — directly, or via the wrapped job.
    fn invoke_deferred(self: &Arc<Self>) {
        let job = self.wq_job.lock().unwrap().clone();
        if let Some(job) = job {
            job.activate(Activate::IMMED);
            return;
        }
        self.invoke_deferred_now();
    }

    /// Run the body on this thread (the job body for workq-backed states).
    pub(crate) fn invoke_deferred_now(self: &Arc<Self>) {
        let body = self.deferred.lock().unwrap().take();
        if let Some(body) = body {
            body.invoke(self);
        }
    }

    pub(crate) fn clear_pin(&self) {
        *self.self_pin.lock().unwrap() = None;
    }

    /// Attach the deferred body. Construction-time only.
    pub(crate) fn install_deferred(&self, body: Box<dyn DeferredBody<T>>) {
        let old = self.deferred.lock().unwrap().replace(body);
        debug_assert!(old.is_none());
    }

    /// Attach the backing job. Construction-time only.
    pub(crate) fn install_job(&self, job: JobHandle) {
        let old = self.wq_job.lock().unwrap().replace(job);
        debug_assert!(old.is_none());
    }

    /// Register each argument future of the installed body.
    pub(crate) fn register_arg_dependants(self: &Arc<Self>) {
        let weak = self.as_any_weak();
        let mut deferred = self.deferred.lock().unwrap();
        if let Some(body) = deferred.as_mut() {
            body.register_args(arg_ready_cb::<T>, &weak, &self.need_resolution);
        }
    }

    pub(crate) fn as_any_weak(self: &Arc<Self>) -> Weak<dyn Any + Send + Sync> {
        let arc: Arc<dyn Any + Send + Sync> = self.clone();
        Arc::downgrade(&arc)
    }

    /// Register a dependant in one shot.
    pub(crate) fn register_dependant(&self, f: DependantFn, arg: Weak<dyn Any + Send + Sync>) {
        let mut cbs = self.cbs.lock().unwrap();
        if self.is_ready() {
            drop(cbs);
            f(arg);
        } else {
            cbs.dependants.push((f, arg));
        }
    }

    /// Two-phase registration: reserve a slot now, fill it in later. If
    /// the state went ready in between, commit runs the callback inline.
    pub(crate) fn register_dependant_begin(&self) -> Option<usize> {
        let mut cbs = self.cbs.lock().unwrap();
        if self.is_ready() {
            return None;
        }
        let placeholder: Weak<dyn Any + Send + Sync> = Weak::<()>::new();
        cbs.dependants.push((noop_dependant as DependantFn, placeholder));
        Some(cbs.dependants.len() - 1)
    }

    pub(crate) fn register_dependant_commit(
        &self,
        idx: Option<usize>,
        f: DependantFn,
        arg: Weak<dyn Any + Send + Sync>,
    ) {
        let mut cbs = self.cbs.lock().unwrap();
        match idx {
            Some(idx) if !self.is_ready() => {
                cbs.dependants[idx] = (f, arg);
            }
            _ => {
                drop(cbs);
                f(arg);
            }
        }
    }

    /// Install the single unshared ready callback; runs inline when
    /// already ready.
    pub(crate) fn install_callback(
        self: &Arc<Self>,
        cb: Box<dyn FnOnce(Future<T>) + Send>,
    ) {
        let mut cbs = self.cbs.lock().unwrap();
        if self.is_ready() {
            drop(cbs);
            cb(Future::from_state(self.clone()));
        } else {
            debug_assert!(cbs.ready_cb.is_none(), "second unshared ready callback");
            cbs.ready_cb = Some(cb);
        }
    }

    /// Install a shared ready callback (chained; each gets its own shared
    /// future copy).
    pub(crate) fn install_shared_callback(
        self: &Arc<Self>,
        cb: Box<dyn FnOnce(SharedFuture<T>) + Send>,
    ) {
        let mut cbs = self.cbs.lock().unwrap();
        if self.is_ready() {
            drop(cbs);
            cb(SharedFuture::from_state(self.clone()));
        } else {
            let chain = cbs.shared_cbs.take();
            cbs.shared_cbs = Some(Box::new(SharedCbNode { f: cb, chain }));
        }
    }

    /// Fire everything installed, exactly once each, outside the lock.
    fn invoke_ready_cb(self: &Arc<Self>) {
        let (ready_cb, mut shared_cbs, dependants) = {
            let mut cbs = self.cbs.lock().unwrap();
            (
                cbs.ready_cb.take(),
                cbs.shared_cbs.take(),
                std::mem::take(&mut cbs.dependants),
            )
        };

        if let Some(cb) = ready_cb {
            cb(Future::from_state(self.clone()));
        }
        while let Some(node) = shared_cbs {
            (node.f)(SharedFuture::from_state(self.clone()));
            shared_cbs = node.chain;
        }
        for (f, arg) in dependants {
            f(arg);
        }
    }
}

/// Dependant callback a deferred body registers on its argument futures.
fn arg_ready_cb<T: Send + 'static>(weak: Weak<dyn Any + Send + Sync>) {
    let Some(any) = weak.upgrade() else {
        return;
    };
    if let Ok(state) = any.downcast::<SharedState<T>>() {
        state.arg_resolved();
    }
}

impl<T: Send + 'static> Drop for SharedState<T> {
    fn drop(&mut self) {
        debug_assert!(!self.lck.load(Ordering::Relaxed));
    }
}
