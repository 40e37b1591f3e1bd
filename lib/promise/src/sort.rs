//! Parallel sorting built on combinators — divide and conquer where every
//! split is a pair of futures merged by a combining job.

use workq::WorkqHandle;

use crate::combine::combine_on;
use crate::convert::callback;
use crate::launch::{async_on, async_promise, Launch};
use crate::{Future, Promise};

/// Below this length a leaf job just uses the standard sort.
const MAX_STD_SORT: usize = 128;

fn merge<T: Ord>(a: Vec<T>, b: Vec<T>) -> Vec<T> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();

    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                if y < x {
                    out.push(b.next().unwrap());
                } else {
                    out.push(a.next().unwrap());
                }
            }
            (Some(_), None) => out.push(a.next().unwrap()),
            (None, Some(_)) => out.push(b.next().unwrap()),
            (None, None) => return out,
        }
    }
}

/// Merge sort across parallel jobs on `wq`: the returned future holds the
/// sorted copy of `data`.
pub fn merge_sort<T>(wq: &WorkqHandle, data: &[T]) -> Future<Vec<T>>
where
    T: Ord + Clone + Send + Sync + 'static,
{
    // Leaf (and tiny-input) case: sort with the standard library.
    if data.len() <= MAX_STD_SORT {
        let mut v = data.to_vec();
        return async_on(wq, Launch::PARALLEL | Launch::AID, move || {
            v.sort();
            v
        });
    }

    let mid = (data.len() + 1) / 2;
    let left = merge_sort(wq, &data[..mid]);
    let right = merge_sort(wq, &data[mid..]);

    combine_on(
        wq,
        Launch::PARALLEL | Launch::AID,
        |out: Promise<Vec<T>>, (left, right): (Future<Vec<T>>, Future<Vec<T>>)| {
            let merged = left
                .get()
                .and_then(|l| right.get().map(|r| merge(l, r)));
            let _ = match merged {
                Ok(v) => out.set_value(v),
                Err(e) => out.set_failure(e),
            };
        },
        (left, right),
    )
}

/// Quick sort in the pass-promise style: each recursion level partitions
/// and hands its output promise to the combiner of its halves.
pub fn quick_sort<T>(wq: &WorkqHandle, data: Vec<T>) -> Future<Vec<T>>
where
    T: Ord + Send + Sync + 'static,
{
    let wq2 = wq.clone();
    async_promise(wq, Launch::PARALLEL | Launch::AID, move |out| {
        quick_sort_body(out, wq2, data)
    })
}

fn quick_sort_body<T>(out: Promise<Vec<T>>, wq: WorkqHandle, mut data: Vec<T>)
where
    T: Ord + Send + Sync + 'static,
{
    if data.len() <= MAX_STD_SORT {
        data.sort();
        let _ = out.set_value(data);
        return;
    }

    // Partition around the last element.
    let pivot = data.pop().unwrap();
    let mut less = Vec::new();
    let mut greater = Vec::new();
    for v in data {
        if v < pivot {
            less.push(v);
        } else {
            greater.push(v);
        }
    }

    let head = quick_sort(&wq, less);
    let tail = quick_sort(&wq, greater);

    let c = combine_on(
        &wq,
        Launch::PARALLEL | Launch::AID,
        move |p: Promise<Vec<T>>, (head, tail): (Future<Vec<T>>, Future<Vec<T>>)| {
            let joined = head.get().and_then(|mut h| {
                tail.get().map(|t| {
                    h.push(pivot);
                    h.extend(t);
                    h
                })
            });
            let _ = match joined {
                Ok(v) => p.set_value(v),
                Err(e) => p.set_failure(e),
            };
        },
        (head, tail),
    );

    // Forward the combined result into our own output promise.
    callback(c, move |done: Future<Vec<T>>| {
        let _ = match done.get() {
            Ok(v) => out.set_value(v),
            Err(e) => out.set_failure(e),
        };
    });
}

#[cfg(test)]
mod tests {
    use super::merge;

    #[test]
    fn merge_interleaves() {
        assert_eq!(merge(vec![1, 3, 5], vec![2, 4, 6]), [1, 2, 3, 4, 5, 6]);
        assert_eq!(merge(vec![], vec![1]), [1]);
        assert_eq!(merge(vec![1, 1], vec![1]), [1, 1, 1]);
    }
}
