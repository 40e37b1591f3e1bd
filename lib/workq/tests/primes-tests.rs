//! The sieve pipeline: a generator feeds integers through a growing chain
//! of filter stages, one per discovered prime. Each time the tail reader
//! sees a value, that value is prime, and the reader splices a new filter
//! stage (dropping that prime's multiples) in front of itself.
//!
//! Stages communicate through lock-free FIFOs; every queue has a consumer
//! job that its producer activates after pushing, so the whole pipeline is
//! driven purely by job activation. A zero value is the end-of-stream
//! sentinel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lockfree::queue::BoxQueue;
use workq::{Activate, JobHandle, JobType, WorkqService};

const LIMIT: u32 = 3000;

/// A queue plus the job to poke when it gains data.
struct Channel {
    queue: BoxQueue<u32>,
    consumer: Mutex<Option<JobHandle>>,
}

impl Channel {
    fn new() -> Arc<Self> {
        Arc::new(Channel {
            queue: BoxQueue::new(),
            consumer: Mutex::new(None),
        })
    }

    fn send(&self, v: u32) {
        self.queue.push_back(v);
        let consumer = self.consumer.lock().unwrap().clone();
        if let Some(job) = consumer {
            job.activate(Activate::empty());
        }
    }

    fn set_consumer(&self, job: JobHandle) {
        *self.consumer.lock().unwrap() = Some(job);
    }
}

struct Reader {
    input: Arc<Channel>,
    primes: Vec<u32>,
    done: bool,
}

/// Splice a filter stage for `prime` between the reader's current input
/// and a fresh channel the reader reads from instead.
fn insert_filter(
    wq: &workq::WorkqHandle,
    reader_state: &Arc<Mutex<Reader>>,
    reader_job: &JobHandle,
    prime: u32,
) {
    let mut state = reader_state.lock().unwrap();
    let old_input = Arc::clone(&state.input);
    let new_input = Channel::new();

    // The filter drains the old channel into the new one.
    let filter_job = {
        let input = Arc::clone(&old_input);
        let output = Arc::clone(&new_input);
        wq.new_job(JobType::empty(), move || {
            while let Some(v) = input.queue.pop_front() {
                if v == 0 || v % prime != 0 {
                    output.send(v);
                }
            }
        })
        .unwrap()
    };

    old_input.set_consumer(filter_job.clone());
    new_input.set_consumer(reader_job.clone());
    state.input = new_input;

    // Values may already be waiting in the old channel.
    filter_job.activate(Activate::empty());
}

#[test]
fn sieve_pipeline_emits_exactly_the_primes() {
    let service = WorkqService::new();
    let wq = service.new_workq();

    let source = Channel::new();
    let reader_state = Arc::new(Mutex::new(Reader {
        input: Arc::clone(&source),
        primes: Vec::new(),
        done: false,
    }));
    let reader_slot: Arc<Mutex<Option<JobHandle>>> = Arc::new(Mutex::new(None));
    let finished = Arc::new(AtomicBool::new(false));

    let reader_job = {
        let reader_state = Arc::clone(&reader_state);
        let reader_slot = Arc::clone(&reader_slot);
        let finished = Arc::clone(&finished);
        let wq = wq.clone();
        wq.clone()
            .new_job(JobType::empty(), move || {
                loop {
                    // Re-read the input each iteration: handling a prime
                    // replaces it.
                    let (input, done) = {
                        let state = reader_state.lock().unwrap();
                        (Arc::clone(&state.input), state.done)
                    };
                    if done {
                        return;
                    }
                    let Some(v) = input.queue.pop_front() else {
                        return;
                    };
                    if v == 0 {
                        let mut state = reader_state.lock().unwrap();
                        state.done = true;
                        finished.store(true, Ordering::Release);
                        return;
                    }

                    // v survived every filter: it is prime.
                    reader_state.lock().unwrap().primes.push(v);
                    let reader_job = reader_slot.lock().unwrap().clone().unwrap();
                    insert_filter(&wq, &reader_state, &reader_job, v);
                }
            })
            .unwrap()
    };
    *reader_slot.lock().unwrap() = Some(reader_job.clone());
    source.set_consumer(reader_job.clone());

    // The generator: a one-shot job emitting the whole range plus the
    // sentinel.
    {
        let source = Arc::clone(&source);
        wq.once(move || {
            for v in 2..LIMIT {
                source.send(v);
            }
            source.send(0);
        })
        .unwrap();
    }

    while !finished.load(Ordering::Acquire) {
        assert!(service.aid(512), "pipeline stalled before the sentinel");
    }
    // Let any trailing filter work settle.
    while service.aid(512) {}

    let primes = reader_state.lock().unwrap().primes.clone();
    assert_eq!(primes, sieve(LIMIT));

    // Drop the stage cycle (jobs hold channels hold jobs) by clearing the
    // consumer slots.
    *reader_slot.lock().unwrap() = None;
}

/// Reference sieve of Eratosthenes.
fn sieve(limit: u32) -> Vec<u32> {
    let mut is_prime = vec![true; limit as usize];
    let mut primes = Vec::new();
    for n in 2..limit as usize {
        if is_prime[n] {
            primes.push(n as u32);
            let mut m = n * n;
            while m < limit as usize {
                is_prime[m] = false;
                m += n;
            }
        }
    }
    primes
}
