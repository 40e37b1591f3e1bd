use criterion::{criterion_group, criterion_main, Criterion};
use lockfree::queue::BoxQueue;

const ITERATIONS: usize = 10_000;

fn spsc_ping() -> usize {
    let q = BoxQueue::new();
    let mut popped = 0;
    for i in 0..ITERATIONS {
        q.push_back(i);
        popped += usize::from(q.pop_front().is_some());
    }
    popped
}

fn mpmc_contention() -> usize {
    let q = std::sync::Arc::new(BoxQueue::new());

    let producer = {
        let q = std::sync::Arc::clone(&q);
        std::thread::spawn(move || {
            for i in 0..ITERATIONS {
                q.push_back(i);
            }
        })
    };
    let consumer = {
        let q = std::sync::Arc::clone(&q);
        std::thread::spawn(move || {
            let mut popped = 0;
            while popped < ITERATIONS {
                if q.pop_front().is_some() {
                    popped += 1;
                }
            }
            popped
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap()
}

// Baseline: the same traffic through a mutex-protected VecDeque, to keep an
// eye on whether the lock-free path actually pays for itself.
fn mutex_baseline() -> usize {
    let q = std::sync::Mutex::new(std::collections::VecDeque::new());
    let mut popped = 0;
    for i in 0..ITERATIONS {
        q.lock().unwrap().push_back(i);
        popped += usize::from(q.lock().unwrap().pop_front().is_some());
    }
    popped
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("queue_spsc_ping", |b| b.iter(spsc_ping));
    c.bench_function("queue_mpmc_contention", |b| b.iter(mpmc_contention));
    c.bench_function("queue_mutex_baseline", |b| b.iter(mutex_baseline));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
