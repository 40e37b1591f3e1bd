//! This file contains utilities that can be reused across integration tests.
//! It's in a subdirectory of tests to avoid being interpreted as an integration
//! test itself. See
//! https://doc.rust-lang.org/book/ch11-03-test-organization.html#submodules-in-integration-tests

// Items in here may not end up being used by every test.
#![allow(unused)]

#[cfg(loom)]
pub fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    loom::model(f);
}
#[cfg(not(loom))]
pub fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    f()
}

#[cfg(not(loom))]
pub use std::sync::Arc;
#[cfg(not(loom))]
pub use std::thread;

#[cfg(loom)]
pub use loom::sync::Arc;
#[cfg(loom)]
pub use loom::thread;

#[cfg(loom)]
pub fn rand_sleep() {}
#[cfg(not(loom))]
pub fn rand_sleep() {
    std::thread::sleep(std::time::Duration::from_nanos(
        rand::random::<u64>() % 1_000_000,
    ));
}

/// Thread count for stress tests: small under loom, larger natively.
#[cfg(loom)]
pub const NTHREADS: usize = 2;
#[cfg(not(loom))]
pub const NTHREADS: usize = 8;

/// Per-thread operation count for stress tests.
#[cfg(loom)]
pub const NOPS: usize = 3;
#[cfg(not(loom))]
pub const NOPS: usize = 500;
