//! Parallel sorting end to end: divide-and-conquer over combinators must
//! agree with the standard sort.

use promise::{merge_sort, quick_sort};
use rand::Rng;
use workq::WorkqService;

fn random_input(len: usize) -> Vec<u64> {
    let mut rng = rand::rng();
    (0..len).map(|_| rng.random_range(0..10_000)).collect()
}

#[test]
fn merge_sort_matches_std_sort() {
    let service = WorkqService::with_threads(4);
    let wq = service.new_workq();

    // Longer than one leaf, so the combiner tree is actually exercised.
    let input = random_input(5000);
    let mut expect = input.clone();
    expect.sort();

    let sorted = merge_sort(&wq, &input).get().unwrap();
    assert_eq!(sorted, expect);
}

#[test]
fn merge_sort_leaf_case() {
    let service = WorkqService::with_threads(2);
    let wq = service.new_workq();

    let input = vec![3u64, 1, 2];
    assert_eq!(merge_sort(&wq, &input).get().unwrap(), [1, 2, 3]);

    let empty: Vec<u64> = Vec::new();
    assert_eq!(merge_sort(&wq, &empty).get().unwrap(), empty);
}

#[test]
fn merge_sort_aid_driven() {
    // No dedicated workers: the waiting thread itself must be able to
    // drive the whole tree through inline aid.
    let service = WorkqService::new();
    let wq = service.new_workq();

    let input = random_input(1000);
    let mut expect = input.clone();
    expect.sort();

    let fut = merge_sort(&wq, &input);
    loop {
        if fut.wait_for(std::time::Duration::ZERO) == promise::FutureStatus::Ready {
            break;
        }
        service.aid(64);
    }
    assert_eq!(fut.get().unwrap(), expect);
}

#[test]
fn quick_sort_matches_std_sort() {
    let service = WorkqService::with_threads(4);
    let wq = service.new_workq();

    let input = random_input(5000);
    let mut expect = input.clone();
    expect.sort();

    let sorted = quick_sort(&wq, input).get().unwrap();
    assert_eq!(sorted, expect);
}

#[test]
fn quick_sort_with_duplicates() {
    let service = WorkqService::with_threads(2);
    let wq = service.new_workq();

    let input = vec![5u64; 1000];
    assert_eq!(quick_sort(&wq, input).get().unwrap(), vec![5u64; 1000]);
}
