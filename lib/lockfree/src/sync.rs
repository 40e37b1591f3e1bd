//! Synchronization primitives that are modeled in loom
//!
//! This module re-exports the low-level primitives the containers are built
//! from (atomics, fences, spin hints). When testing under loom they model the
//! corresponding operation in loom instead of executing it natively.

#[cfg(not(loom))]
pub use std::sync::atomic::{
    self, fence, AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering,
};
#[cfg(not(loom))]
pub use std::sync::Arc;

#[cfg(loom)]
pub use loom::sync::atomic::{self, fence, AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
#[cfg(loom)]
pub use loom::sync::Arc;

/// Busy-wait back-off: a spin hint natively, a full yield under loom so the
/// model checker can schedule the thread we are waiting on.
#[cfg(not(loom))]
pub fn spin_loop_hint() {
    std::hint::spin_loop();
}
#[cfg(loom)]
pub fn spin_loop_hint() {
    loom::thread::yield_now();
}

/// Yield the current thread. Spin-waits in this crate use this rather than
/// `std::thread::yield_now` directly so loom can model the yield.
#[cfg(not(loom))]
pub fn yield_now() {
    std::thread::yield_now();
}
#[cfg(loom)]
pub fn yield_now() {
    loom::thread::yield_now();
}

// From https://docs.rs/loom/latest/loom/#handling-loom-api-differences
#[cfg(not(loom))]
#[derive(Debug)]
#[repr(transparent)]
pub struct UnsafeCell<T>(std::cell::UnsafeCell<T>);
#[cfg(not(loom))]
impl<T> UnsafeCell<T> {
    pub const fn new(data: T) -> UnsafeCell<T> {
        UnsafeCell(std::cell::UnsafeCell::new(data))
    }

    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(*const T) -> R,
    {
        f(self.0.get())
    }

    pub fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(*mut T) -> R,
    {
        f(self.0.get())
    }
}

#[cfg(loom)]
#[derive(Debug)]
pub struct UnsafeCell<T>(loom::cell::UnsafeCell<T>);
#[cfg(loom)]
impl<T> UnsafeCell<T> {
    pub fn new(data: T) -> UnsafeCell<T> {
        UnsafeCell(loom::cell::UnsafeCell::new(data))
    }

    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(*const T) -> R,
    {
        self.0.with(f)
    }

    pub fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(*mut T) -> R,
    {
        self.0.with_mut(f)
    }
}
