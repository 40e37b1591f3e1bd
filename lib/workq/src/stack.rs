//! Per-thread run-lock stack and the switch operation.
//!
//! Every thread executing jobs keeps a stack of [`RunLock`] frames in TLS:
//! one frame per nested job invocation (nesting happens through
//! `ACT_IMMED` inline activation and through aid calls from inside jobs).
//! The stack is what makes re-entrant `deactivate` safe, bounds inline
//! recursion, lets a co-runnable park its run lock for the last participant
//! to restore, and gives [`workq_switch`] the information it needs to
//! detect self-deadlock before blocking.

use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering;

use crate::job::{Job, JobIntRef};
use crate::service::WorkqService;
use crate::workq::{RunMode, Workq, WorkqHandle, WorkqIntRef};
use crate::SwitchError;

/// A structured hold on a work queue and (usually) one locked job.
///
/// A locked, committed lock promises the job will run; destroying a locked
/// but uncommitted lock is a bug.
pub(crate) struct RunLock {
    wq: Option<WorkqIntRef>,
    mode: RunMode,
    job: Option<JobIntRef>,
    job_locked: bool,
    co: Option<JobIntRef>,
    committed: bool,
}

impl RunLock {
    pub(crate) fn new() -> Self {
        Self {
            wq: None,
            mode: RunMode::Single,
            job: None,
            job_locked: false,
            co: None,
            committed: false,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.job_locked && self.job.is_some()
    }

    pub(crate) fn commit(&mut self) {
        debug_assert!(self.is_locked() && !self.committed);
        self.committed = true;
    }

    pub(crate) fn job(&self) -> Option<JobIntRef> {
        self.job.clone()
    }

    fn is_empty(&self) -> bool {
        self.wq.is_none() && self.job.is_none() && self.co.is_none()
    }

    /// Lock a queue and pick one runnable job from it.
    pub(crate) fn lock_workq(&mut self, wq: WorkqIntRef) -> bool {
        debug_assert!(self.is_empty());
        self.committed = false;

        let mut mode = wq.lock_run();
        let mut picked: Option<JobIntRef> = None;

        match mode {
            RunMode::Single => {
                // Busy jobs come off the queue without running; they
                // re-enqueue themselves on unlock if still active.
                while let Some(job) = wq.serial_runq().pop_front() {
                    if job.lock_run() {
                        picked = Some(job);
                        break;
                    }
                }
                if let Some(job) = &picked {
                    if job.jtype().contains(crate::JobType::PARALLEL) {
                        // A parallel job must leave the parallel queue too,
                        // and releases our exclusivity.
                        wq.parallel_runq().erase(job);
                        mode = wq.lock_run_downgrade(mode);
                    }
                }
            }
            RunMode::Parallel => {
                while let Some(job) = wq.parallel_runq().pop_front() {
                    if job.lock_run() {
                        picked = Some(job);
                        break;
                    }
                }
                if let Some(job) = &picked {
                    wq.serial_runq().erase(job);
                }
            }
        }

        let Some(job) = picked else {
            // Probe failed; release quietly. The re-add in `release_wq` is
            // for lock *holders* — a failed probe re-adding the queue would
            // ping-pong against the eraser in `lock_service`.
            wq.unlock_run(mode);
            return false;
        };
        debug_assert!(job.is_running());

        self.wq = Some(wq);
        self.mode = mode;
        self.job_locked = true;
        self.job = Some(job);
        true
    }

    /// Lock one specific job (inline activation, future-backed jobs).
    pub(crate) fn lock_job(&mut self, job: &Job) -> bool {
        debug_assert!(self.is_empty());
        self.committed = false;

        let wq = WorkqIntRef::new(&**job.workq());
        let mode = if job.jtype().contains(crate::JobType::PARALLEL) {
            wq.lock_run_parallel()
        } else {
            let mode = wq.lock_run();
            if mode != RunMode::Single {
                wq.unlock_run(mode);
                return false;
            }
            mode
        };

        if !job.lock_run() {
            wq.unlock_run(mode);
            return false;
        }

        // The job is ours; take it off the run queues.
        wq.serial_runq().erase(job);
        if job.jtype().contains(crate::JobType::PARALLEL) {
            wq.parallel_runq().erase(job);
        }

        self.wq = Some(wq);
        self.mode = mode;
        self.job = Some(JobIntRef::new(job));
        self.job_locked = true;
        true
    }

    /// Acquire a job across the whole service, rotating a per-thread
    /// cursor over the work-queue run queue for approximate round-robin.
    pub(crate) fn lock_service(&mut self, svc: &WorkqService) -> bool {
        let mut hint = cursor_hint(svc);
        let mut wrapped = hint.is_none();

        loop {
            let wq = match svc.wq_runq().cursor_next(hint) {
                Some(wq) => wq,
                None => {
                    if wrapped {
                        return false;
                    }
                    wrapped = true;
                    hint = None;
                    continue;
                }
            };
            hint = Some(wq.as_ptr());
            set_cursor_hint(svc, wq.as_ptr());

            if self.lock_workq(wq.clone()) {
                // Got a job; the queue may stay on the run queue.
                return true;
            }

            // Queue looked empty; drop it from the run queue. Retest
            // afterwards: a job may have been enqueued between our failed
            // lock and the erase, and that activation's own enqueue may
            // have lost against the element still being present.
            svc.wq_runq().erase(&wq);
            if self.lock_workq(wq.clone()) {
                svc.wq_runq().push_back(wq.clone());
                svc.wakeup(1);
                return true;
            }
        }
    }

    /// Enter a published co-runnable as a participant.
    pub(crate) fn lock_co(co: JobIntRef) -> RunLock {
        co.co_state()
            .expect("co lock on a plain job")
            .runcount
            .fetch_add(1, Ordering::Acquire);
        let wq = WorkqIntRef::new(&**co.workq());
        let mode = wq.lock_run_parallel();
        debug_assert_eq!(mode, RunMode::Parallel);
        RunLock {
            wq: Some(wq),
            mode,
            job: None,
            job_locked: false,
            co: Some(co),
            committed: false,
        }
    }

    pub(crate) fn unlock(&mut self) {
        debug_assert!(!self.is_locked() || self.committed);

        if let Some(job) = self.job.take() {
            if self.job_locked {
                job.unlock_run();
            }
            self.job_locked = false;
        }
        if let Some(wq) = self.wq.take() {
            Self::release_wq(&wq, self.mode);
        }
        if let Some(co) = self.co.take() {
            co.co_state()
                .expect("co reference on a plain job")
                .runcount
                .fetch_sub(1, Ordering::Release);
        }
        self.committed = false;
    }

    /// Release only the work-queue part of the lock.
    pub(crate) fn unlock_wq(&mut self) {
        if let Some(wq) = self.wq.take() {
            Self::release_wq(&wq, self.mode);
        }
    }

    fn release_wq(wq: &WorkqIntRef, mode: RunMode) {
        wq.unlock_run(mode);
        // While we held the queue, a competing picker that found it locked
        // may have dropped it from the service run queue. If jobs are still
        // pending, flag the queue again so they cannot strand.
        if !wq.serial_runq().is_empty() || !wq.parallel_runq().is_empty() {
            wq.service().wq_to_runq(WorkqIntRef::new(wq));
        }
    }

    /// Drop our participation in a co-runnable. True iff we were the last
    /// reference on the published run.
    pub(crate) fn co_unlock(&mut self) -> bool {
        let co = self.co.take().expect("co_unlock without co");
        let old = co
            .co_state()
            .expect("co reference on a plain job")
            .runcount
            .fetch_sub(1, Ordering::Release);
        self.unlock();
        old == 1
    }

    /// Exclusive → shared on the held queue.
    pub(crate) fn wq_downgrade(&mut self) {
        let wq = self.wq.as_ref().expect("downgrade without workq");
        debug_assert_eq!(self.mode, RunMode::Single);
        self.mode = wq.lock_run_downgrade(self.mode);
    }

    /// Spin until `wq` is held in exactly `want` mode. The caller has
    /// verified this cannot deadlock.
    fn lock_wq_only(&mut self, wq: &Workq, want: RunMode) {
        debug_assert!(self.wq.is_none());
        loop {
            let got = match want {
                RunMode::Single => wq.lock_run(),
                RunMode::Parallel => wq.lock_run_parallel(),
            };
            if got == want {
                break;
            }
            wq.unlock_run(got);
            std::thread::yield_now();
        }
        self.wq = Some(WorkqIntRef::new(wq));
        self.mode = want;
    }

    fn holds_wq(&self, wq: &Workq) -> bool {
        self.wq
            .as_ref()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), wq))
    }

    fn references(&self, job: &Job) -> bool {
        self.job
            .as_ref()
            .is_some_and(|j| std::ptr::eq(j.as_ptr(), job))
            || self
                .co
                .as_ref()
                .is_some_and(|j| std::ptr::eq(j.as_ptr(), job))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

struct WqTls {
    /// The service currently published by a worker `do_work` (recursion
    /// guard).
    service: Cell<*const WorkqService>,
    stack: RefCell<Vec<RunLock>>,
    /// Per-thread cursor into a service's work-queue run queue: the
    /// service identity plus an opaque (never dereferenced) element hint.
    cursor_svc: Cell<usize>,
    cursor_hint: Cell<usize>,
}

thread_local! {
    static WQ_TLS: WqTls = WqTls {
        service: Cell::new(std::ptr::null()),
        stack: RefCell::new(Vec::new()),
        cursor_svc: Cell::new(0),
        cursor_hint: Cell::new(0),
    };
}

/// Current aid-stack depth on this thread.
pub(crate) fn depth() -> usize {
    WQ_TLS.with(|t| t.stack.borrow().len())
}

/// Is `job` being run (or participated in) by a frame on this thread?
pub(crate) fn current_thread_runs(job: &Job) -> bool {
    WQ_TLS.with(|t| t.stack.borrow().iter().any(|f| f.references(job)))
}

/// The work queue of the innermost frame, if any.
pub(crate) fn current_workq() -> Option<WorkqHandle> {
    WQ_TLS.with(|t| {
        t.stack
            .borrow()
            .iter()
            .rev()
            .find_map(|f| f.wq.as_ref().map(|w| crate::workq::handle_from(w)))
    })
}

/// Move the top frame's lock out (co-runnable publish / participant
/// release). The frame must reference `job`.
pub(crate) fn steal_lock(job: &Job) -> RunLock {
    WQ_TLS.with(|t| {
        let mut stack = t.stack.borrow_mut();
        let top = stack.last_mut().expect("steal_lock outside any frame");
        debug_assert!(top.references(job));
        std::mem::replace(top, RunLock::new())
    })
}

/// Put a lock into the top frame; the displaced (empty) lock is dropped.
pub(crate) fn store_lock(lck: RunLock) {
    let old = WQ_TLS.with(|t| {
        let mut stack = t.stack.borrow_mut();
        let top = stack.last_mut().expect("store_lock outside any frame");
        std::mem::replace(top, lck)
    });
    drop(old);
}

/// An aid-stack frame: pushes on construction, pops (and unlocks) on drop.
pub(crate) struct FrameGuard {
    depth: usize,
}

impl FrameGuard {
    pub(crate) fn push(lck: RunLock) -> FrameGuard {
        WQ_TLS.with(|t| {
            let mut stack = t.stack.borrow_mut();
            stack.push(lck);
            FrameGuard { depth: stack.len() }
        })
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let lck = WQ_TLS.with(|t| {
            let mut stack = t.stack.borrow_mut();
            debug_assert_eq!(stack.len(), self.depth, "aid frames popped out of order");
            stack.pop()
        });
        // Unlock outside the TLS borrow: unlocking may re-enqueue the job
        // and wake workers.
        drop(lck);
    }
}

/// Recursion guard for service `do_work`.
pub(crate) struct ServicePublish;

pub(crate) fn publish_service(svc: &WorkqService) -> Option<ServicePublish> {
    WQ_TLS.with(|t| {
        if !t.service.get().is_null() {
            return None;
        }
        t.service.set(svc);
        Some(ServicePublish)
    })
}

impl Drop for ServicePublish {
    fn drop(&mut self) {
        WQ_TLS.with(|t| t.service.set(std::ptr::null()));
    }
}

fn cursor_hint(svc: &WorkqService) -> Option<*const Workq> {
    WQ_TLS.with(|t| {
        if t.cursor_svc.get() == svc as *const _ as usize && t.cursor_hint.get() != 0 {
            Some(t.cursor_hint.get() as *const Workq)
        } else {
            None
        }
    })
}

fn set_cursor_hint(svc: &WorkqService, wq: *const Workq) {
    WQ_TLS.with(|t| {
        t.cursor_svc.set(svc as *const _ as usize);
        t.cursor_hint.set(wq as usize);
    });
}

/// The run state [`workq_switch`] saves and restores.
#[derive(Clone, Debug)]
pub struct PopState {
    wq: Option<WorkqHandle>,
    mode: RunMode,
}

impl PopState {
    pub fn new(wq: WorkqHandle, mode: RunMode) -> Self {
        Self { wq: Some(wq), mode }
    }

    /// A null target: switching to this releases the current queue lock.
    pub fn released() -> Self {
        Self {
            wq: None,
            mode: RunMode::Single,
        }
    }

    pub fn workq(&self) -> Option<&WorkqHandle> {
        self.wq.as_ref()
    }

    pub fn is_single(&self) -> bool {
        self.wq.is_some() && self.mode == RunMode::Single
    }
}

/// Switch the innermost frame to `dst`, returning the previous state.
///
/// * a released (null) target drops the current queue lock;
/// * the same queue can be downgraded exclusive → shared freely;
/// * acquiring exclusively while an enclosing frame already holds the
///   target exclusively is refused as a deadlock.
pub fn workq_switch(dst: &PopState) -> Result<PopState, SwitchError> {
    WQ_TLS.with(|t| {
        let mut stack = t.stack.borrow_mut();
        let len = stack.len();
        let top = stack.last_mut().ok_or(SwitchError::OutsideWorkq)?;

        let rv = PopState {
            wq: top.wq.as_ref().map(|w| crate::workq::handle_from(w)),
            mode: top.mode,
        };

        let Some(dst_wq) = dst.workq() else {
            top.unlock_wq();
            return Ok(rv);
        };

        if top.holds_wq(dst_wq) {
            if dst.mode == top.mode {
                return Ok(rv);
            }
            if dst.mode == RunMode::Parallel {
                top.wq_downgrade();
                return Ok(rv);
            }
            // Parallel → exclusive on the same queue falls through to the
            // deadlock check below.
        }

        if dst.mode == RunMode::Single {
            for frame in &stack[..len - 1] {
                if frame.mode == RunMode::Single && frame.holds_wq(dst_wq) {
                    log::debug!("workq switch refused: exclusive hold in an enclosing frame");
                    return Err(SwitchError::Deadlock);
                }
            }
        }

        let top = stack.last_mut().expect("frame vanished");
        top.unlock_wq();
        top.lock_wq_only(dst_wq, dst.mode);
        Ok(rv)
    })
}
