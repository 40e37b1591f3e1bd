//! Concurrency tests for the intrusive lock-free list. See the
//! [crate-level documentation](lockfree) for running these under loom.

use lockfree::list::{List, ListAdapter, ListHook};
use lockfree::refcount::{counted_new, Counted, CountedMgr, HasCount, RefPtr};

mod sync;

struct Node {
    count: Counted,
    hook: ListHook,
    value: u64,
}

impl Node {
    fn new(value: u64) -> RefPtr<Node, CountedMgr> {
        counted_new(Node {
            count: Counted::new(),
            hook: ListHook::new(),
            value,
        })
    }
}

impl HasCount for Node {
    fn count(&self) -> &Counted {
        &self.count
    }
}

struct NodeAdapter;

// SAFETY: hook/elem_of invert each other over Node.hook.
unsafe impl ListAdapter for NodeAdapter {
    type Elem = Node;
    type Mgr = CountedMgr;

    fn hook(elem: &Node) -> &ListHook {
        &elem.hook
    }

    unsafe fn elem_of(hook: *const ListHook) -> *const Node {
        // SAFETY: caller passes a Node's hook.
        unsafe { hook.byte_sub(core::mem::offset_of!(Node, hook)).cast() }
    }
}

type NodeList = List<NodeAdapter>;

/// Concurrent push_back from many threads: nothing lost, nothing doubled.
#[test]
fn concurrent_push_back() {
    sync::model(|| {
        let list = sync::Arc::new(NodeList::new());
        let handles: Vec<_> = (0..sync::NTHREADS)
            .map(|t| {
                let list = sync::Arc::clone(&list);
                sync::thread::spawn(move || {
                    for i in 0..sync::NOPS {
                        assert!(list.push_back(Node::new((t * sync::NOPS + i) as u64)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut all: Vec<u64> = std::iter::from_fn(|| list.pop_front())
            .map(|n| n.value)
            .collect();
        all.sort_unstable();
        let expect: Vec<u64> = (0..(sync::NTHREADS * sync::NOPS) as u64).collect();
        assert_eq!(all, expect);
    });
}

/// Concurrent push_front keeps per-thread values in reverse push order.
#[test]
fn concurrent_push_front() {
    sync::model(|| {
        let list = sync::Arc::new(NodeList::new());
        let handles: Vec<_> = (0..sync::NTHREADS)
            .map(|t| {
                let list = sync::Arc::clone(&list);
                sync::thread::spawn(move || {
                    for i in 0..sync::NOPS {
                        assert!(list.push_front(Node::new((t * sync::NOPS + i) as u64)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Within one thread's values, later pushes appear earlier.
        let all: Vec<u64> = std::iter::from_fn(|| list.pop_front())
            .map(|n| n.value)
            .collect();
        for t in 0..sync::NTHREADS {
            let lo = (t * sync::NOPS) as u64;
            let hi = ((t + 1) * sync::NOPS) as u64;
            let mine: Vec<u64> = all.iter().copied().filter(|v| *v >= lo && *v < hi).collect();
            let mut expect = mine.clone();
            expect.sort_unstable_by(|a, b| b.cmp(a));
            assert_eq!(mine, expect);
        }
    });
}

/// Poppers and pushers racing: every element surfaces exactly once.
#[test]
fn concurrent_push_pop() {
    sync::model(|| {
        let list = sync::Arc::new(NodeList::new());
        let n_push = sync::NTHREADS / 2;
        let n_pop = sync::NTHREADS - n_push;

        let pushers: Vec<_> = (0..n_push)
            .map(|t| {
                let list = sync::Arc::clone(&list);
                sync::thread::spawn(move || {
                    for i in 0..sync::NOPS {
                        list.push_back(Node::new((t * sync::NOPS + i) as u64));
                    }
                })
            })
            .collect();
        let poppers: Vec<_> = (0..n_pop)
            .map(|_| {
                let list = sync::Arc::clone(&list);
                sync::thread::spawn(move || {
                    let mut got = Vec::new();
                    while got.len() < sync::NOPS {
                        match list.pop_front() {
                            Some(n) => got.push(n.value),
                            None => sync::thread::yield_now(),
                        }
                    }
                    got
                })
            })
            .collect();

        for h in pushers {
            h.join().unwrap();
        }
        let mut all = Vec::new();
        for p in poppers {
            all.extend(p.join().unwrap());
        }
        while let Some(n) = list.pop_front() {
            all.push(n.value);
        }

        all.sort_unstable();
        let expect: Vec<u64> = (0..(n_push * sync::NOPS) as u64).collect();
        assert_eq!(all, expect);
    });
}

/// Iterating while another thread inserts: the iterator never observes a
/// torn list, and everything present before the scan is seen.
#[test]
fn iterate_during_insert() {
    sync::model(|| {
        let list = sync::Arc::new(NodeList::new());
        for i in 0..sync::NOPS {
            list.push_back(Node::new(i as u64));
        }

        let pusher = {
            let list = sync::Arc::clone(&list);
            sync::thread::spawn(move || {
                for i in 0..sync::NOPS {
                    list.push_back(Node::new((sync::NOPS + i) as u64));
                }
            })
        };

        let mut iter = list.head_position();
        let mut seen = Vec::new();
        while let Some(n) = iter.next() {
            seen.push(n.value);
        }
        pusher.join().unwrap();

        // All pre-existing elements appear, in order.
        let pre: Vec<u64> = seen.iter().copied().filter(|v| *v < sync::NOPS as u64).collect();
        assert_eq!(pre, (0..sync::NOPS as u64).collect::<Vec<_>>());
    });
}

/// Erasing elements while a second thread iterates over them.
#[test]
fn iterate_during_erase() {
    sync::model(|| {
        let list = sync::Arc::new(NodeList::new());
        let nodes: Vec<_> = (0..sync::NOPS).map(|i| Node::new(i as u64)).collect();
        for n in &nodes {
            list.push_back(n.clone());
        }

        let eraser = {
            let list = sync::Arc::clone(&list);
            let nodes: Vec<_> = nodes.iter().step_by(2).cloned().collect();
            sync::thread::spawn(move || {
                for n in &nodes {
                    list.erase(n);
                    sync::rand_sleep();
                }
            })
        };

        let mut iter = list.head_position();
        let mut seen = Vec::new();
        while let Some(n) = iter.next() {
            seen.push(n.value);
        }
        eraser.join().unwrap();

        // Odd values were never erased and must all be present, in order.
        let odd: Vec<u64> = seen.iter().copied().filter(|v| v % 2 == 1).collect();
        assert_eq!(
            odd,
            (0..sync::NOPS as u64).filter(|v| v % 2 == 1).collect::<Vec<_>>()
        );
    });
}
