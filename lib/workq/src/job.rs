//! Jobs: the unit of work a work queue schedules.
//!
//! A job's lifecycle is a single atomic bitset: `activate` sets `ACTIVE`
//! and enqueues, `lock_run` transitions an active job to `RUNNING`
//! (clearing `ACTIVE` unless the job is `PERSIST`), and `unlock_run`
//! re-enqueues when the job was re-activated mid-run. A `ONCE` job sets
//! `HAS_RUN` on its first transition and never runs again.
//!
//! Jobs are owned publicly through [`JobHandle`] and internally by run
//! queues and run locks (see [`crate::refs`]). Dropping the last handle
//! from inside the job's own run body is legal: the retire step detects
//! the self-frame and defers the free to the worker's way out.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use lockfree::list::{ListAdapter, ListHook};
use lockfree::refcount::RefPtr;

use crate::refs::{ExtMgr, IntMgr, LifeCounts, Shared};
use crate::stack::{self, FrameGuard, RunLock};
use crate::workq::WorkqHandle;
use crate::NewJobError;

bitflags::bitflags! {
    /// Static properties of a job, fixed at construction.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct JobType: u32 {
        /// Runs at most once, ever.
        const ONCE = 0x0001;
        /// Stays active across runs until explicitly deactivated.
        const PERSIST = 0x0002;
        /// May run on multiple threads at once (on a parallel-locked queue).
        const PARALLEL = 0x0004;
        /// Never executed inline by an `ACT_IMMED` activation.
        const NO_AID = 0x0010;
    }
}

bitflags::bitflags! {
    /// Activation options.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Activate: u32 {
        /// Try to run the job inline on the activating thread.
        const IMMED = 0x0001;
    }
}

const STATE_RUNNING: u32 = 0x0001;
const STATE_HAS_RUN: u32 = 0x0002;
const STATE_ACTIVE: u32 = 0x0004;

/// Inline execution is disabled beyond this aid-stack depth, bounding
/// activation recursion.
pub(crate) const ACT_IMMED_MAX_STACK: usize = 64;

pub(crate) type JobFn = Box<dyn Fn() + Send + Sync>;

pub(crate) enum Body {
    Single(JobFn),
    Coroutine(CoState),
}

/// State of a coroutine-style job: N sub-bodies claimed by index, run by
/// however many workers choose to participate.
pub(crate) struct CoState {
    fns: Vec<JobFn>,
    /// Next sub-body to claim; past `fns.len()` means exhausted.
    idx: AtomicUsize,
    /// One sentinel for the published run plus one per active participant.
    pub(crate) runcount: AtomicUsize,
    /// The job's own run lock, stolen from the publishing frame and
    /// restored by the last participant.
    pub(crate) stolen: Mutex<Option<RunLock>>,
}

pub struct Job {
    life: LifeCounts,
    jtype: JobType,
    state: AtomicU32,
    run_gen: AtomicU32,
    wq: WorkqHandle,
    /// Membership in the owning queue's serial run queue.
    pub(crate) run_hook: ListHook,
    /// Membership in the owning queue's parallel run queue.
    pub(crate) par_hook: ListHook,
    /// Membership in the service's co-runnable run queue.
    pub(crate) co_hook: ListHook,
    body: Body,
    /// A ONCE job created by `once()` keeps itself alive until it runs.
    self_ref: Mutex<Option<JobHandle>>,
}

pub(crate) type JobIntRef = RefPtr<Job, IntMgr>;

impl Shared for Job {
    fn life(&self) -> &LifeCounts {
        &self.life
    }

    unsafe fn retire(ptr: *const Job) {
        // SAFETY: last public reference; internal references may remain.
        let job = unsafe { &*ptr };

        // Take the job out of the scheduler.
        job.wq.serial_runq().erase(job);
        job.wq.parallel_runq().erase(job);
        job.deactivate();

        if stack::current_thread_runs(job) {
            // Destroyed from inside its own run body: the worker's internal
            // reference performs the free on unwind.
            job.life.mark_suicide();
            return;
        }

        job.life.wait_unreferenced();
        // SAFETY: fully unlinked, deactivated, no references left.
        unsafe { Job::free(ptr) };
    }
}

impl Job {
    pub(crate) fn new(
        wq: WorkqHandle,
        jtype: JobType,
        body: Body,
    ) -> Result<RefPtr<Job, ExtMgr>, NewJobError> {
        if jtype.contains(JobType::ONCE | JobType::PERSIST) {
            return Err(NewJobError::ConflictingFlags);
        }
        let job = Box::into_raw(Box::new(Job {
            life: LifeCounts::new(),
            jtype,
            state: AtomicU32::new(0),
            run_gen: AtomicU32::new(0),
            wq,
            run_hook: ListHook::new(),
            par_hook: ListHook::new(),
            co_hook: ListHook::new(),
            body,
            self_ref: Mutex::new(None),
        }));
        // SAFETY: adopting the initial public reference.
        Ok(unsafe { RefPtr::from_raw(job) })
    }

    pub(crate) fn jtype(&self) -> JobType {
        self.jtype
    }

    pub(crate) fn workq(&self) -> &WorkqHandle {
        &self.wq
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Relaxed) & STATE_RUNNING != 0
    }

    /// Mark active and enqueue; optionally try to run inline.
    pub(crate) fn activate(&self, flags: Activate) {
        let old = self.state.fetch_or(STATE_ACTIVE, Ordering::Relaxed);
        if old & (STATE_RUNNING | STATE_ACTIVE) == 0 {
            self.wq.job_to_runq(JobIntRef::new(self));
        }

        if flags.contains(Activate::IMMED) && !self.jtype.contains(JobType::NO_AID) {
            if stack::depth() >= ACT_IMMED_MAX_STACK {
                return;
            }
            let mut rlck = RunLock::new();
            if rlck.lock_job(self) {
                rlck.commit();
                let _frame = FrameGuard::push(rlck);
                self.run();
            }
        }
    }

    /// Clear `ACTIVE`. If the job is mid-run on another thread, wait for
    /// that run to finish; from inside the job's own run this returns
    /// immediately.
    pub(crate) fn deactivate(&self) {
        let gen = self.run_gen.load(Ordering::Relaxed);
        let mut s = self.state.fetch_and(!STATE_ACTIVE, Ordering::Release);

        if s & STATE_RUNNING != 0 && stack::current_thread_runs(self) {
            return;
        }

        while s & STATE_RUNNING != 0 && gen == self.run_gen.load(Ordering::Relaxed) {
            std::thread::yield_now();
            s = self.state.load(Ordering::Relaxed);
        }
    }

    /// Try to take the run lock: active, not running, and (for ONCE jobs)
    /// never run before. Bumps the run generation on success.
    pub(crate) fn lock_run(&self) -> bool {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            if s & STATE_ACTIVE == 0 || s & STATE_RUNNING != 0 {
                return false;
            }
            if self.jtype.contains(JobType::ONCE) && s & STATE_HAS_RUN != 0 {
                return false;
            }

            let mut ns = s | STATE_RUNNING | STATE_HAS_RUN;
            if !self.jtype.contains(JobType::PERSIST) {
                ns &= !STATE_ACTIVE;
            }
            match self
                .state
                .compare_exchange_weak(s, ns, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.run_gen.fetch_add(1, Ordering::Acquire);
                    return true;
                }
                Err(cur) => s = cur,
            }
        }
    }

    /// Release the run lock; a job re-activated during its run goes back
    /// on the run queue.
    pub(crate) fn unlock_run(&self) {
        let s = self.state.fetch_and(!STATE_RUNNING, Ordering::Release);
        debug_assert!(s & STATE_RUNNING != 0);
        if self.jtype.contains(JobType::ONCE) {
            return;
        }
        if s & STATE_ACTIVE != 0 {
            self.wq.job_to_runq(JobIntRef::new(self));
        }
    }

    /// Execute the job body. The caller holds the (committed) run lock in
    /// the top aid-stack frame.
    pub(crate) fn run(&self) {
        if self.jtype.contains(JobType::ONCE) {
            // Break the self-reference before running, so a once-job frees
            // as soon as its run and queue references drain.
            *self.self_ref.lock().unwrap() = None;
        }
        match &self.body {
            Body::Single(f) => f(),
            Body::Coroutine(co) => {
                co.idx.store(0, Ordering::Release);
                self.co_publish(co.fns.len());
            }
        }
    }

    pub(crate) fn set_self_ref(&self, handle: JobHandle) {
        *self.self_ref.lock().unwrap() = Some(handle);
    }

    pub(crate) fn co_state(&self) -> Option<&CoState> {
        match &self.body {
            Body::Coroutine(co) => Some(co),
            Body::Single(_) => None,
        }
    }

    /// Publish this run's sub-bodies: steal our run lock from the current
    /// frame, park it in the job, and enqueue on the service co-runqueue
    /// with `n` wakeups.
    fn co_publish(&self, n: usize) {
        let co = self.co_state().expect("co_publish on a plain job");
        if n == 0 {
            // Nothing to publish; the frame unlocks normally on return.
            return;
        }

        let stolen = stack::steal_lock(self);
        *co.stolen.lock().unwrap() = Some(stolen);
        // The sentinel reference for the published run; dropped by whoever
        // erases us from the co-runqueue. Added (not stored): a straggler
        // from the previous run may still hold its participation count.
        co.runcount.fetch_add(1, Ordering::AcqRel);

        self.wq.service().co_to_runq(JobIntRef::new(self), n);
    }

    /// One participant's share of a published run: claim sub-bodies until
    /// exhausted. True iff at least one was run.
    ///
    /// The caller has entered a participant run lock (see
    /// [`RunLock::lock_co`](crate::stack::RunLock)) as the top frame.
    pub(crate) fn co_run(&self) -> bool {
        let co = self.co_state().expect("co_run on a plain job");

        let mut ran = 0;
        loop {
            let idx = co.idx.fetch_add(1, Ordering::Acquire);
            if idx >= co.fns.len() {
                break;
            }
            (co.fns[idx])();
            ran += 1;
        }

        self.co_release();
        ran > 0
    }

    /// A participant observed exhaustion: take the job off the co-runqueue
    /// (first caller only), drop our participation, and — as the last
    /// participant out — restore the parked run lock to the current frame
    /// so the job unlocks normally.
    fn co_release(&self) {
        let co = self.co_state().expect("co_release on a plain job");

        // Must complete before the run can end: a late erase could race a
        // re-activation's insert and lose it.
        let service = self.wq.service();
        if service.co_runq().erase(self).is_some() {
            // We removed the published run; drop its sentinel.
            let old = co.runcount.fetch_sub(1, Ordering::Release);
            debug_assert!(old > 1);
        }

        let mut participant = stack::steal_lock(self);
        if participant.co_unlock() {
            // Last one out restores the job's own run lock, so the frame
            // we are returning through performs the real unlock.
            if let Some(rlck) = co.stolen.lock().unwrap().take() {
                stack::store_lock(rlck);
            }
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        debug_assert!(!self.is_running());
    }
}

/// Reference-counted public handle to a job.
pub struct JobHandle {
    inner: RefPtr<Job, ExtMgr>,
}

impl JobHandle {
    pub(crate) fn from_ref(inner: RefPtr<Job, ExtMgr>) -> Self {
        Self { inner }
    }

    /// Activate the job; with [`Activate::IMMED`] the job may run inline on
    /// this thread before the call returns.
    pub fn activate(&self, flags: Activate) {
        self.inner.activate(flags);
    }

    /// Deactivate; blocks while the job runs elsewhere (never when called
    /// from the job itself).
    pub fn deactivate(&self) {
        self.inner.deactivate();
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn workq(&self) -> WorkqHandle {
        self.inner.workq().clone()
    }

    pub(crate) fn job(&self) -> &Job {
        &self.inner
    }
}

impl Clone for JobHandle {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("type", &self.inner.jtype)
            .field("running", &self.inner.is_running())
            .finish()
    }
}

/// Wrap a one-shot closure as a reusable job body.
pub(crate) fn once_body(f: impl FnOnce() + Send + 'static) -> JobFn {
    let slot = Mutex::new(Some(f));
    Box::new(move || {
        if let Some(f) = slot.lock().unwrap().take() {
            f();
        }
    })
}

/// Adapter for the serial run queue.
pub(crate) struct RunqAdapter;

// SAFETY: hook/elem_of invert each other over Job.run_hook; IntMgr keeps
// jobs alive while queued, and the retire path fully unlinks before free.
unsafe impl ListAdapter for RunqAdapter {
    type Elem = Job;
    type Mgr = IntMgr;

    fn hook(elem: &Job) -> &ListHook {
        &elem.run_hook
    }

    unsafe fn elem_of(hook: *const ListHook) -> *const Job {
        // SAFETY: caller passes a Job's run_hook.
        unsafe { hook.byte_sub(std::mem::offset_of!(Job, run_hook)).cast() }
    }
}

/// Adapter for the parallel run queue.
pub(crate) struct ParallelRunqAdapter;

// SAFETY: as RunqAdapter, over Job.par_hook.
unsafe impl ListAdapter for ParallelRunqAdapter {
    type Elem = Job;
    type Mgr = IntMgr;

    fn hook(elem: &Job) -> &ListHook {
        &elem.par_hook
    }

    unsafe fn elem_of(hook: *const ListHook) -> *const Job {
        // SAFETY: caller passes a Job's par_hook.
        unsafe { hook.byte_sub(std::mem::offset_of!(Job, par_hook)).cast() }
    }
}

/// Adapter for the service-wide co-runnable queue.
pub(crate) struct CoRunqAdapter;

// SAFETY: as RunqAdapter, over Job.co_hook.
unsafe impl ListAdapter for CoRunqAdapter {
    type Elem = Job;
    type Mgr = IntMgr;

    fn hook(elem: &Job) -> &ListHook {
        &elem.co_hook
    }

    unsafe fn elem_of(hook: *const ListHook) -> *const Job {
        // SAFETY: caller passes a Job's co_hook.
        unsafe { hook.byte_sub(std::mem::offset_of!(Job, co_hook)).cast() }
    }
}

pub(crate) fn single_body(f: impl Fn() + Send + Sync + 'static) -> Body {
    Body::Single(Box::new(f))
}

pub(crate) fn coroutine_body(fns: Vec<JobFn>) -> Body {
    Body::Coroutine(CoState {
        fns,
        idx: AtomicUsize::new(0),
        runcount: AtomicUsize::new(0),
        stolen: Mutex::new(None),
    })
}
