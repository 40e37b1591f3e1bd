//! The work-queue service: the dispatch root worker threads drive.
//!
//! The service keeps a run queue of work queues with pending jobs and a run
//! queue of published co-runnables. [`WorkqService::aid`] is the dispatch
//! loop: co-runnables first (they represent fan-out already in flight),
//! then one job from one work queue, picked with a per-thread cursor that
//! rotates across the queue for approximate round-robin fairness.
//!
//! A thread pool drives the service through its [`TpService`] face, which
//! runs bounded `aid` bursts; wakeups flow the other way through whatever
//! [`TpClient`] was attached.

use std::sync::{Arc, Mutex};

use lockfree::list::List;
use lockfree::refcount::RefPtr;

use crate::job::{CoRunqAdapter, Job, JobIntRef};
use crate::refs::{ExtMgr, IntMgr, LifeCounts, Shared};
use crate::stack::{self, FrameGuard, RunLock};
use crate::threadpool::{
    threadpool_attach, Threadpool, TpClient, TpService, TpServiceProvider,
};
use crate::workq::{Workq, WorkqHandle, WorkqIntRef, WqRunqAdapter};
use crate::AttachError;

/// Units of work one `do_work` call may perform before returning to the
/// worker loop.
const AID_BURST: usize = 32;

pub struct WorkqService {
    life: LifeCounts,
    wq_runq: List<WqRunqAdapter>,
    co_runq: List<CoRunqAdapter>,
    wakeup_cb: Mutex<Option<Arc<dyn TpClient>>>,
    pool: Mutex<Option<Threadpool>>,
}

pub(crate) type ServiceIntRef = RefPtr<WorkqService, IntMgr>;

impl Shared for WorkqService {
    fn life(&self) -> &LifeCounts {
        &self.life
    }

    unsafe fn retire(ptr: *const WorkqService) {
        // SAFETY: live per retire contract.
        let svc = unsafe { &*ptr };

        // Detach the worker binding first: wakeups after this point are
        // no-ops, and parked workers are told to stop pulling us.
        let client = svc.wakeup_cb.lock().unwrap().take();
        if let Some(client) = client {
            client.on_service_detach();
        }
        // Join (or, from a worker, abandon) the internal pool.
        let pool = svc.pool.lock().unwrap().take();
        drop(pool);

        svc.wq_runq.clear();
        svc.co_runq.clear();

        log::debug!("workq service retired");

        // Remaining internal references (worker shims mid-exit, traversals)
        // free the allocation on their way out.
        let guard = ServiceIntRef::new(svc);
        svc.life.mark_suicide();
        drop(guard);
    }
}

impl WorkqService {
    /// A service with no worker threads of its own: drive it with
    /// [`Self::aid`] or attach an external pool via
    /// [`threadpool_attach`].
    pub fn new() -> ServiceHandle {
        let svc = Box::into_raw(Box::new(WorkqService {
            life: LifeCounts::new(),
            wq_runq: List::new(),
            co_runq: List::new(),
            wakeup_cb: Mutex::new(None),
            pool: Mutex::new(None),
        }));
        // SAFETY: adopting the initial public reference.
        ServiceHandle {
            inner: unsafe { RefPtr::from_raw(svc) },
        }
    }

    /// A service driven by `threads` dedicated worker threads.
    pub fn with_threads(threads: usize) -> ServiceHandle {
        let handle = Self::new();
        let pool = Threadpool::new(threads);
        threadpool_attach(&pool, &handle).expect("fresh service failed to attach");
        *handle.pool.lock().unwrap() = Some(pool);
        handle
    }

    pub fn new_workq(&self) -> WorkqHandle {
        Workq::new(self.handle())
    }

    fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            inner: RefPtr::new(self),
        }
    }

    /// No queued work of any kind is currently visible.
    pub fn is_empty(&self) -> bool {
        self.wq_runq.is_empty() && self.co_runq.is_empty()
    }

    /// Perform up to `count` units of work on the calling thread. True iff
    /// at least one unit ran.
    pub fn aid(&self, count: usize) -> bool {
        let mut i = 0;
        'outer: while i < count {
            // Drive co-runnables first: their fan-out is already mid-run.
            let mut hint: Option<*const Job> = None;
            let mut co_ran = false;
            while i < count {
                let Some(co) = self.co_runq.cursor_next(hint) else {
                    break;
                };
                hint = Some(co.as_ptr());
                let rlck = RunLock::lock_co(co.clone());
                let _frame = FrameGuard::push(rlck);
                if co.co_run() {
                    i += 1;
                    co_ran = true;
                }
            }
            if co_ran {
                // Retest: participation may have published more work.
                continue 'outer;
            }

            // One job from one work queue.
            let mut rlck = RunLock::new();
            if !rlck.lock_service(self) {
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

    pub(crate) fn wq_runq(&self) -> &List<WqRunqAdapter> {
        &self.wq_runq
    }

    pub(crate) fn co_runq(&self) -> &List<CoRunqAdapter> {
        &self.co_runq
    }

    /// A work queue gained pending work; list it and wake a worker. A
    /// queue that is already listed needs no fresh wakeup: parking workers
    /// re-check `has_work` before sleeping.
    pub(crate) fn wq_to_runq(&self, wq: WorkqIntRef) {
        if self.wq_runq.push_back(wq) {
            self.wakeup(1);
        }
    }

    /// A co-runnable published `max_threads` sub-bodies.
    pub(crate) fn co_to_runq(&self, co: JobIntRef, max_threads: usize) {
        let inserted = self.co_runq.push_back(co);
        debug_assert!(inserted);
        self.wakeup(max_threads);
    }

    pub(crate) fn wakeup(&self, count: usize) {
        let cb = self.wakeup_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb.wakeup(count);
        }
    }
}

impl Drop for WorkqService {
    fn drop(&mut self) {
        debug_assert_eq!(self.life.int_count(), 0);
    }
}

/// Reference-counted public handle to a service. Derefs to
/// [`WorkqService`].
pub struct ServiceHandle {
    inner: RefPtr<WorkqService, ExtMgr>,
}

impl std::ops::Deref for ServiceHandle {
    type Target = WorkqService;

    fn deref(&self) -> &WorkqService {
        &self.inner
    }
}

impl Clone for ServiceHandle {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle").finish_non_exhaustive()
    }
}

/// The service's face towards a thread pool.
struct ServiceWork {
    svc: ServiceIntRef,
}

impl TpService for ServiceWork {
    fn do_work(&self) -> bool {
        // Refuse recursion: a job driving a pool that drives us again
        // would otherwise wind the stack up without bound.
        let Some(_published) = stack::publish_service(&self.svc) else {
            return false;
        };
        self.svc.aid(AID_BURST)
    }

    fn has_work(&self) -> bool {
        !self.svc.is_empty()
    }

    fn on_client_detach(&self) {
        *self.svc.wakeup_cb.lock().unwrap() = None;
    }
}

impl TpServiceProvider for ServiceHandle {
    fn service_arg(&self) -> Arc<dyn TpService> {
        Arc::new(ServiceWork {
            svc: ServiceIntRef::new(&self.inner),
        })
    }

    fn attach_client(&self, client: Arc<dyn TpClient>) -> Result<(), AttachError> {
        let mut cb = self.wakeup_cb.lock().unwrap();
        if cb.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        *cb = Some(client);
        Ok(())
    }

    fn detach_client(&self) {
        *self.wakeup_cb.lock().unwrap() = None;
    }
}
