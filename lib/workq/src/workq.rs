//! The work queue: per-queue serialization of jobs.
//!
//! A queue is either run-locked exclusively (`Single`) or shared
//! (`Parallel`); the two never overlap except through the deliberate
//! downgrade a picker performs when the job it popped turns out to be
//! `PARALLEL`. Serial jobs live on the serial run queue only; parallel
//! jobs live on both, so both kinds of holders can find them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lockfree::list::{List, ListAdapter, ListHook};
use lockfree::refcount::RefPtr;

use crate::job::{
    coroutine_body, once_body, single_body, Activate, Job, JobHandle, JobType, ParallelRunqAdapter,
    RunqAdapter,
};
use crate::refs::{ExtMgr, IntMgr, LifeCounts, Shared};
use crate::service::ServiceHandle;
use crate::stack::{FrameGuard, RunLock};
use crate::NewJobError;

/// How a work queue is currently held.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    Single,
    Parallel,
}

pub struct Workq {
    life: LifeCounts,
    /// Membership in the service's run queue of pending work queues.
    pub(crate) runq_hook: ListHook,
    service: ServiceHandle,
    runq: List<RunqAdapter>,
    p_runq: List<ParallelRunqAdapter>,
    single_lock: AtomicBool,
    parallel_count: AtomicUsize,
}

pub(crate) type WorkqIntRef = RefPtr<Workq, IntMgr>;

impl Shared for Workq {
    fn life(&self) -> &LifeCounts {
        &self.life
    }

    unsafe fn retire(ptr: *const Workq) {
        // Work queues are destroyed lazily: one may still sit on the
        // service run queue, and the next attempt to run it releases the
        // last internal reference, which performs the free.
        // SAFETY: live per retire contract.
        let wq = unsafe { &*ptr };
        let guard = WorkqIntRef::new(wq);
        wq.life.mark_suicide();
        drop(guard);
    }
}

impl Workq {
    pub(crate) fn new(service: ServiceHandle) -> WorkqHandle {
        let wq = Box::into_raw(Box::new(Workq {
            life: LifeCounts::new(),
            runq_hook: ListHook::new(),
            service,
            runq: List::new(),
            p_runq: List::new(),
            single_lock: AtomicBool::new(false),
            parallel_count: AtomicUsize::new(0),
        }));
        // SAFETY: adopting the initial public reference.
        WorkqHandle {
            inner: unsafe { RefPtr::from_raw(wq) },
        }
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.service
    }

    pub(crate) fn serial_runq(&self) -> &List<RunqAdapter> {
        &self.runq
    }

    pub(crate) fn parallel_runq(&self) -> &List<ParallelRunqAdapter> {
        &self.p_runq
    }

    /// Create a job on this queue.
    pub fn new_job(
        &self,
        jtype: JobType,
        f: impl Fn() + Send + Sync + 'static,
    ) -> Result<JobHandle, NewJobError> {
        let job = Job::new(self.handle(), jtype, single_body(f))?;
        Ok(JobHandle::from_ref(job))
    }

    /// Create a coroutine-style job: the bodies may run concurrently on
    /// distinct worker threads each time the job runs.
    pub fn new_coroutine_job(
        &self,
        jtype: JobType,
        fns: Vec<Box<dyn Fn() + Send + Sync>>,
    ) -> Result<JobHandle, NewJobError> {
        match fns.len() {
            0 => Err(NewJobError::EmptyCoroutine),
            // A single body needs no fan-out machinery.
            1 => {
                let mut fns = fns;
                let f = fns.pop().unwrap();
                let job = Job::new(self.handle(), jtype, single_body(move || f()))?;
                Ok(JobHandle::from_ref(job))
            }
            _ => {
                let job = Job::new(self.handle(), jtype, coroutine_body(fns))?;
                Ok(JobHandle::from_ref(job))
            }
        }
    }

    /// Run `f` exactly once, as soon as a worker gets to it. The job keeps
    /// itself alive until it has run.
    pub fn once(&self, f: impl FnOnce() + Send + 'static) -> Result<(), NewJobError> {
        let job = Job::new(
            self.handle(),
            JobType::ONCE,
            crate::job::Body::Single(once_body(f)),
        )?;
        let handle = JobHandle::from_ref(job);
        handle.job().set_self_ref(handle.clone());
        handle.activate(Activate::empty());
        Ok(())
    }

    /// Coroutine variant of [`Self::once`].
    pub fn once_coroutine(
        &self,
        fns: Vec<Box<dyn Fn() + Send + Sync>>,
    ) -> Result<(), NewJobError> {
        let handle = self.new_coroutine_job(JobType::ONCE, fns)?;
        handle.job().set_self_ref(handle.clone());
        handle.activate(Activate::empty());
        Ok(())
    }

    /// Opportunistically run up to `n` jobs from this queue on the calling
    /// thread. True iff at least one job ran.
    pub fn aid(&self, n: usize) -> bool {
        let mut i = 0;
        while i < n {
            let mut rlck = RunLock::new();
            if !rlck.lock_workq(WorkqIntRef::new(self)) {
                break;
            }
            rlck.commit();
            let job = rlck.job().expect("locked run lock without job");
            let _frame = FrameGuard::push(rlck);
            job.run();
            i += 1;
        }
        i > 0
    }

    fn handle(&self) -> WorkqHandle {
        WorkqHandle {
            inner: RefPtr::new(self),
        }
    }

    /// Enqueue an activated job and flag this queue to the service.
    pub(crate) fn job_to_runq(&self, job: RefPtr<Job, IntMgr>) {
        let mut activated = false;
        if job.jtype().contains(JobType::PARALLEL) && self.p_runq.push_back(job.clone()) {
            activated = true;
        }
        if self.runq.push_back(job) {
            activated = true;
        }

        if activated {
            self.service.wq_to_runq(WorkqIntRef::new(self));
        }
    }

    /// Acquire a run lock: exclusive if free, shared otherwise.
    pub(crate) fn lock_run(&self) -> RunMode {
        if !self.single_lock.swap(true, Ordering::Acquire) {
            return RunMode::Single;
        }
        self.parallel_count.fetch_add(1, Ordering::Acquire);
        RunMode::Parallel
    }

    /// Acquire a shared run lock unconditionally.
    pub(crate) fn lock_run_parallel(&self) -> RunMode {
        self.parallel_count.fetch_add(1, Ordering::Acquire);
        RunMode::Parallel
    }

    pub(crate) fn unlock_run(&self, mode: RunMode) {
        match mode {
            RunMode::Single => {
                let was = self.single_lock.swap(false, Ordering::Release);
                debug_assert!(was);
            }
            RunMode::Parallel => {
                let old = self.parallel_count.fetch_sub(1, Ordering::Release);
                debug_assert!(old > 0);
            }
        }
    }

    /// Exclusive → shared, for a picker that found a parallel job while
    /// holding the queue exclusively. Never fails.
    pub(crate) fn lock_run_downgrade(&self, mode: RunMode) -> RunMode {
        if let RunMode::Single = mode {
            self.parallel_count.fetch_add(1, Ordering::Acquire);
            let was = self.single_lock.swap(false, Ordering::Release);
            debug_assert!(was);
        }
        RunMode::Parallel
    }

}

impl Drop for Workq {
    fn drop(&mut self) {
        debug_assert!(!self.single_lock.load(Ordering::Relaxed));
        debug_assert_eq!(self.parallel_count.load(Ordering::Relaxed), 0);
    }
}

/// Reference-counted public handle to a work queue. Derefs to [`Workq`].
pub struct WorkqHandle {
    inner: RefPtr<Workq, ExtMgr>,
}

impl WorkqHandle {
    /// The work queue the calling thread is currently running a job on.
    pub fn current() -> Option<WorkqHandle> {
        crate::stack::current_workq()
    }
}

impl std::ops::Deref for WorkqHandle {
    type Target = Workq;

    fn deref(&self) -> &Workq {
        &self.inner
    }
}

impl Clone for WorkqHandle {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for WorkqHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkqHandle").finish_non_exhaustive()
    }
}

/// A public handle for a queue reached through internal references
/// (top-of-stack introspection, switch bookkeeping).
pub(crate) fn handle_from(wq: &Workq) -> WorkqHandle {
    WorkqHandle {
        inner: RefPtr::new(wq),
    }
}

/// Adapter for the service's run queue of work queues.
pub(crate) struct WqRunqAdapter;

// SAFETY: hook/elem_of invert each other over Workq.runq_hook; IntMgr keeps
// queues alive while listed (destruction is lazy via suicide).
unsafe impl ListAdapter for WqRunqAdapter {
    type Elem = Workq;
    type Mgr = IntMgr;

    fn hook(elem: &Workq) -> &ListHook {
        &elem.runq_hook
    }

    unsafe fn elem_of(hook: *const ListHook) -> *const Workq {
        // SAFETY: caller passes a Workq's runq_hook.
        unsafe { hook.byte_sub(std::mem::offset_of!(Workq, runq_hook)).cast() }
    }
}
