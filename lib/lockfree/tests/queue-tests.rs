//! Concurrency tests for the lock-free FIFO. See the
//! [crate-level documentation](lockfree) for running these under loom.

use lockfree::queue::BoxQueue;

mod sync;

/// Multiple producers, multiple consumers: every pushed value is popped
/// exactly once.
#[test]
fn mpmc_each_value_once() {
    sync::model(|| {
        let q = sync::Arc::new(BoxQueue::new());
        let producers = sync::NTHREADS / 2;
        let per_producer = sync::NOPS;

        let mut handles = Vec::new();
        for t in 0..producers {
            let q = sync::Arc::clone(&q);
            handles.push(sync::thread::spawn(move || {
                for i in 0..per_producer {
                    q.push_back((t * per_producer + i) as u64);
                }
            }));
        }

        let mut collectors = Vec::new();
        for _ in 0..producers {
            let q = sync::Arc::clone(&q);
            collectors.push(sync::thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match q.pop_front() {
                        Some(v) => got.push(v),
                        None => {
                            if got.len() >= per_producer {
                                break;
                            }
                            sync::thread::yield_now();
                        }
                    }
                }
                got
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        let mut all: Vec<u64> = Vec::new();
        for c in collectors {
            all.extend(c.join().unwrap());
        }
        // Drain the remainder.
        while let Some(v) = q.pop_front() {
            all.push(v);
        }

        all.sort_unstable();
        let expect: Vec<u64> = (0..(producers * per_producer) as u64).collect();
        assert_eq!(all, expect);
    });
}

/// A single producer and single consumer observe FIFO order.
#[test]
fn spsc_order_preserved() {
    sync::model(|| {
        let q = sync::Arc::new(BoxQueue::new());
        let n = sync::NOPS;

        let producer = {
            let q = sync::Arc::clone(&q);
            sync::thread::spawn(move || {
                for i in 0..n {
                    q.push_back(i);
                }
            })
        };

        let mut last = None;
        let mut seen = 0;
        while seen < n {
            if let Some(v) = q.pop_front() {
                if let Some(last) = last {
                    assert!(v > last, "queue reordered {last} and {v}");
                }
                last = Some(v);
                seen += 1;
            } else {
                sync::thread::yield_now();
            }
        }

        producer.join().unwrap();
        assert!(q.is_empty());
    });
}

/// push_front competes with push_back without losing elements.
#[test]
fn front_and_back_producers() {
    sync::model(|| {
        let q = sync::Arc::new(BoxQueue::new());
        let n = sync::NOPS;

        let back = {
            let q = sync::Arc::clone(&q);
            sync::thread::spawn(move || {
                for i in 0..n {
                    q.push_back(i as i64);
                }
            })
        };
        let front = {
            let q = sync::Arc::clone(&q);
            sync::thread::spawn(move || {
                for i in 0..n {
                    q.push_front(-(i as i64) - 1);
                }
            })
        };

        back.join().unwrap();
        front.join().unwrap();

        let mut all: Vec<i64> = std::iter::from_fn(|| q.pop_front()).collect();
        assert_eq!(all.len(), 2 * n);
        all.sort_unstable();
        let expect: Vec<i64> = (-(n as i64)..n as i64).collect();
        assert_eq!(all, expect);
    });
}
