//! End-to-end scheduler behaviour, driven both by `aid` on the test thread
//! and by dedicated worker pools.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use workq::{workq_switch, Activate, JobType, PopState, RunMode, WorkqService};

fn drain(service: &workq::ServiceHandle) {
    while service.aid(64) {}
}

/// Jobs on one (serial) work queue run in activation order.
#[test]
fn serial_queue_runs_fifo() {
    let service = WorkqService::new();
    let wq = service.new_workq();

    let order = Arc::new(Mutex::new(Vec::new()));
    let jobs: Vec<_> = (0..4)
        .map(|i| {
            let order = Arc::clone(&order);
            wq.new_job(JobType::empty(), move || {
                order.lock().unwrap().push(i);
            })
            .unwrap()
        })
        .collect();

    for job in &jobs {
        job.activate(Activate::empty());
    }
    drain(&service);

    assert_eq!(*order.lock().unwrap(), [0, 1, 2, 3]);
}

/// `once` bodies run exactly one time each, even when re-driven.
#[test]
fn once_runs_exactly_once() {
    let service = WorkqService::new();
    let wq = service.new_workq();

    let counter = Arc::new(AtomicU32::new(0));
    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        wq.once(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }

    drain(&service);
    drain(&service);
    assert_eq!(counter.load(Ordering::Relaxed), 10);
}

/// A ONCE job ignores re-activation after its first run.
#[test]
fn once_job_second_activation_is_noop() {
    let service = WorkqService::new();
    let wq = service.new_workq();

    let counter = Arc::new(AtomicU32::new(0));
    let job = {
        let counter = Arc::clone(&counter);
        wq.new_job(JobType::ONCE, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap()
    };

    job.activate(Activate::empty());
    drain(&service);
    job.activate(Activate::empty());
    drain(&service);

    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

/// A PERSIST job stays active and keeps running until deactivated.
#[test]
fn persist_job_reruns_until_deactivated() {
    let service = WorkqService::new();
    let wq = service.new_workq();

    let counter = Arc::new(AtomicU32::new(0));
    let job = {
        let counter = Arc::clone(&counter);
        wq.new_job(JobType::PERSIST, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap()
    };

    job.activate(Activate::empty());
    for _ in 0..5 {
        assert!(service.aid(1));
    }
    assert_eq!(counter.load(Ordering::Relaxed), 5);

    job.deactivate();
    let after = counter.load(Ordering::Relaxed);
    drain(&service);
    assert_eq!(counter.load(Ordering::Relaxed), after);
}

#[test]
fn conflicting_flags_rejected() {
    let service = WorkqService::new();
    let wq = service.new_workq();
    let r = wq.new_job(JobType::ONCE | JobType::PERSIST, || {});
    assert_eq!(r.unwrap_err(), workq::NewJobError::ConflictingFlags);

    assert_eq!(
        wq.new_coroutine_job(JobType::empty(), Vec::new()).unwrap_err(),
        workq::NewJobError::EmptyCoroutine
    );
}

/// ACT_IMMED runs the job inline on the activating thread; NO_AID
/// suppresses that.
#[test]
fn act_immed_runs_inline() {
    let service = WorkqService::new();
    let wq = service.new_workq();

    let ran = Arc::new(AtomicBool::new(false));
    let job = {
        let ran = Arc::clone(&ran);
        wq.new_job(JobType::empty(), move || {
            ran.store(true, Ordering::Relaxed);
        })
        .unwrap()
    };
    job.activate(Activate::IMMED);
    assert!(ran.load(Ordering::Relaxed), "IMMED activation did not run inline");

    let ran = Arc::new(AtomicBool::new(false));
    let job = {
        let ran = Arc::clone(&ran);
        wq.new_job(JobType::NO_AID, move || {
            ran.store(true, Ordering::Relaxed);
        })
        .unwrap()
    };
    job.activate(Activate::IMMED);
    assert!(!ran.load(Ordering::Relaxed), "NO_AID job ran inline");
    drain(&service);
    assert!(ran.load(Ordering::Relaxed));
}

/// Inline activation recursion is capped by the aid-stack bound: a long
/// activation chain switches from inline execution to plain enqueueing.
#[test]
fn act_immed_depth_is_bounded() {
    let service = WorkqService::new();
    let wq = service.new_workq();

    const CHAIN: usize = 80;
    let depth = Arc::new(AtomicUsize::new(0));
    let max_depth = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    // Build the chain back to front so each job can activate its successor.
    let mut next: Option<workq::JobHandle> = None;
    for _ in 0..CHAIN {
        let depth = Arc::clone(&depth);
        let max_depth = Arc::clone(&max_depth);
        let ran = Arc::clone(&ran);
        let succ = next.take();
        let job = wq
            .new_job(JobType::empty(), move || {
                let d = depth.fetch_add(1, Ordering::Relaxed) + 1;
                max_depth.fetch_max(d, Ordering::Relaxed);
                ran.fetch_add(1, Ordering::Relaxed);
                if let Some(succ) = &succ {
                    succ.activate(Activate::IMMED);
                }
                depth.fetch_sub(1, Ordering::Relaxed);
            })
            .unwrap();
        next = Some(job);
    }

    next.unwrap().activate(Activate::IMMED);
    drain(&service);

    assert_eq!(ran.load(Ordering::Relaxed), CHAIN);
    // 64 frames of inline recursion at most (plus the slack of the jobs
    // already on the stack when the bound kicks in).
    assert!(max_depth.load(Ordering::Relaxed) <= 65);
    assert!(max_depth.load(Ordering::Relaxed) > 1, "nothing ran inline");
}

/// A non-PARALLEL job never runs on two threads at once.
#[test]
fn serial_job_never_overlaps() {
    let service = WorkqService::with_threads(4);
    let wq = service.new_workq();

    let inside = Arc::new(AtomicU32::new(0));
    let overlap = Arc::new(AtomicBool::new(false));
    let runs = Arc::new(AtomicU32::new(0));

    let job = {
        let inside = Arc::clone(&inside);
        let overlap = Arc::clone(&overlap);
        let runs = Arc::clone(&runs);
        wq.new_job(JobType::PERSIST, move || {
            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                overlap.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_micros(50));
            inside.fetch_sub(1, Ordering::SeqCst);
            runs.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
    };

    job.activate(Activate::empty());
    while runs.load(Ordering::SeqCst) < 20 {
        std::thread::yield_now();
    }
    job.deactivate();

    assert!(!overlap.load(Ordering::SeqCst), "serial job ran concurrently");
}

/// PARALLEL jobs do not serialize their work queue: two of them on the
/// same queue run concurrently on a pool.
#[test]
fn parallel_jobs_share_their_queue() {
    let service = WorkqService::with_threads(4);
    let wq = service.new_workq();

    let inside = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let runs = Arc::new(AtomicU32::new(0));

    let jobs: Vec<_> = (0..2)
        .map(|_| {
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            let runs = Arc::clone(&runs);
            wq.new_job(JobType::PARALLEL | JobType::PERSIST, move || {
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_micros(200));
                inside.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();

    for job in &jobs {
        job.activate(Activate::empty());
    }
    while runs.load(Ordering::SeqCst) < 100 {
        std::thread::yield_now();
    }
    for job in &jobs {
        job.deactivate();
    }

    // With two persistent parallel jobs and 4 workers, some overlap must
    // have been observed. (Strictly speaking this is probabilistic, but
    // 100 runs of 200µs make a miss vanishingly unlikely.)
    assert!(
        peak.load(Ordering::SeqCst) > 1,
        "parallel jobs never overlapped on their queue"
    );
}

/// Deactivating a running job waits for the current run to finish.
#[test]
fn deactivate_waits_for_running_job() {
    let service = WorkqService::with_threads(2);
    let wq = service.new_workq();

    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let job = {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        wq.new_job(JobType::PERSIST, move || {
            started.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            finished.store(true, Ordering::SeqCst);
        })
        .unwrap()
    };

    job.activate(Activate::empty());
    while !started.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    job.deactivate();
    assert!(
        finished.load(Ordering::SeqCst),
        "deactivate returned before the in-flight run completed"
    );
}

/// A job deactivating itself from inside its own body returns immediately.
#[test]
fn self_deactivate_does_not_block() {
    let service = WorkqService::new();
    let wq = service.new_workq();

    let counter = Arc::new(AtomicU32::new(0));
    let slot: Arc<Mutex<Option<workq::JobHandle>>> = Arc::new(Mutex::new(None));
    let job = {
        let counter = Arc::clone(&counter);
        let slot = Arc::clone(&slot);
        wq.new_job(JobType::PERSIST, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            if let Some(me) = &*slot.lock().unwrap() {
                me.deactivate();
            }
        })
        .unwrap()
    };
    *slot.lock().unwrap() = Some(job.clone());

    job.activate(Activate::empty());
    drain(&service);

    assert_eq!(counter.load(Ordering::Relaxed), 1);
    *slot.lock().unwrap() = None;
}

/// Coroutine jobs fan their bodies out; each body runs exactly once per
/// activation.
#[test]
fn coroutine_bodies_each_run_once() {
    let service = WorkqService::with_threads(4);
    let wq = service.new_workq();

    let counts: Arc<Vec<AtomicU32>> = Arc::new((0..8).map(|_| AtomicU32::new(0)).collect());
    let fns: Vec<Box<dyn Fn() + Send + Sync>> = (0..8)
        .map(|i| {
            let counts = Arc::clone(&counts);
            Box::new(move || {
                counts[i].fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn Fn() + Send + Sync>
        })
        .collect();

    let job = wq.new_coroutine_job(JobType::empty(), fns).unwrap();
    job.activate(Activate::empty());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while counts.iter().any(|c| c.load(Ordering::SeqCst) == 0) {
        assert!(std::time::Instant::now() < deadline, "coroutine stalled");
        service.aid(8);
        std::thread::yield_now();
    }
    // Settle, then check nothing ran twice.
    std::thread::sleep(Duration::from_millis(20));
    for c in counts.iter() {
        assert_eq!(c.load(Ordering::SeqCst), 1);
    }
}

/// Coroutine jobs can be re-activated; every body runs once per cycle.
#[test]
fn coroutine_reruns_after_reactivation() {
    let service = WorkqService::new();
    let wq = service.new_workq();

    let total = Arc::new(AtomicU32::new(0));
    let fns: Vec<Box<dyn Fn() + Send + Sync>> = (0..3)
        .map(|_| {
            let total = Arc::clone(&total);
            Box::new(move || {
                total.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn Fn() + Send + Sync>
        })
        .collect();
    let job = wq.new_coroutine_job(JobType::empty(), fns).unwrap();

    job.activate(Activate::empty());
    drain(&service);
    assert_eq!(total.load(Ordering::SeqCst), 3);

    job.activate(Activate::empty());
    drain(&service);
    assert_eq!(total.load(Ordering::SeqCst), 6);
}

/// workq_switch: switching the current frame to exclusive mode on a queue
/// an enclosing frame holds exclusively is refused.
#[test]
fn switch_detects_deadlock() {
    let service = WorkqService::new();
    let wq = service.new_workq();
    let wq2 = service.new_workq();

    let result = Arc::new(Mutex::new(None));
    let outer_wq = wq.clone();
    let inner_wq = wq.clone();

    let job = {
        let result = Arc::clone(&result);
        let wq2 = wq2.clone();
        // The outer job holds `wq` exclusively; it aids `wq2`, and from
        // inside that nested frame tries to take `wq` exclusively again.
        wq.new_job(JobType::empty(), move || {
            let result = Arc::clone(&result);
            let inner_wq = inner_wq.clone();
            let inner = wq2
                .new_job(JobType::empty(), move || {
                    let r = workq_switch(&PopState::new(inner_wq.clone(), RunMode::Single));
                    *result.lock().unwrap() = Some(r.map(|_| ()));
                })
                .unwrap();
            inner.activate(Activate::empty());
            wq2.aid(1);
        })
        .unwrap()
    };
    let _ = outer_wq;

    job.activate(Activate::empty());
    drain(&service);

    assert_eq!(
        *result.lock().unwrap(),
        Some(Err(workq::SwitchError::Deadlock))
    );
}

/// workq_switch outside any frame fails; a downgrade inside one succeeds.
#[test]
fn switch_outside_and_downgrade() {
    assert_eq!(
        workq_switch(&PopState::released()).unwrap_err(),
        workq::SwitchError::OutsideWorkq
    );

    let service = WorkqService::new();
    let wq = service.new_workq();
    let ok = Arc::new(AtomicBool::new(false));
    let job = {
        let ok = Arc::clone(&ok);
        let me = wq.clone();
        wq.new_job(JobType::empty(), move || {
            // Downgrade our own queue to parallel, then restore.
            let prev = workq_switch(&PopState::new(me.clone(), RunMode::Parallel)).unwrap();
            assert!(prev.is_single());
            ok.store(true, Ordering::Relaxed);
        })
        .unwrap()
    };
    job.activate(Activate::empty());
    drain(&service);
    assert!(ok.load(Ordering::Relaxed));
}

/// The exclusion invariant: a queue is never observed single-locked with
/// parallel holders (outside co-runnable participation and downgrades).
#[test]
fn pool_driven_many_queues() {
    let service = WorkqService::with_threads(4);
    let queues: Vec<_> = (0..8).map(|_| service.new_workq()).collect();

    let total = Arc::new(AtomicU32::new(0));
    let mut jobs = Vec::new();
    for wq in &queues {
        for _ in 0..16 {
            let total = Arc::clone(&total);
            let job = wq
                .new_job(JobType::empty(), move || {
                    total.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            job.activate(Activate::empty());
            jobs.push(job);
        }
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while total.load(Ordering::Relaxed) < 8 * 16 {
        assert!(std::time::Instant::now() < deadline, "pool stalled");
        std::thread::yield_now();
    }
    assert_eq!(total.load(Ordering::Relaxed), 8 * 16);
}

/// Workq::aid drains only the given queue.
#[test]
fn workq_aid_is_local() {
    let service = WorkqService::new();
    let wq_a = service.new_workq();
    let wq_b = service.new_workq();

    let ran_a = Arc::new(AtomicBool::new(false));
    let ran_b = Arc::new(AtomicBool::new(false));

    let job_a = {
        let ran_a = Arc::clone(&ran_a);
        wq_a.new_job(JobType::empty(), move || {
            ran_a.store(true, Ordering::Relaxed);
        })
        .unwrap()
    };
    let job_b = {
        let ran_b = Arc::clone(&ran_b);
        wq_b.new_job(JobType::empty(), move || {
            ran_b.store(true, Ordering::Relaxed);
        })
        .unwrap()
    };

    job_a.activate(Activate::empty());
    job_b.activate(Activate::empty());

    assert!(wq_a.aid(16));
    assert!(ran_a.load(Ordering::Relaxed));
    assert!(!ran_b.load(Ordering::Relaxed));

    drain(&service);
    assert!(ran_b.load(Ordering::Relaxed));
}
