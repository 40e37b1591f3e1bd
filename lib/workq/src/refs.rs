//! Dual reference counts for scheduler objects.
//!
//! Every scheduler object (job, work queue, service) is shared two ways at
//! once:
//!
//! * *public* references — what the user holds. Dropping the last one
//!   retires the object: it is taken out of the scheduler (deactivated,
//!   unlinked), but not necessarily freed yet.
//! * *internal* references — run queues, run locks and in-flight traversals.
//!   These can outlive the last public reference; the retire step marks the
//!   object for suicide and the final internal release frees it.
//!
//! The split is what allows a job to delete itself from inside its own run
//! body: retire detects the self-frame, flags suicide and returns, and the
//! worker's internal reference performs the free on the way out.

use lockfree::refcount::RefMgr;
use lockfree::sync::{fence, AtomicBool, AtomicUsize, Ordering};

/// The intrusive counter block.
#[derive(Debug)]
pub(crate) struct LifeCounts {
    ext: AtomicUsize,
    int: AtomicUsize,
    suicide: AtomicBool,
}

impl LifeCounts {
    /// Starts with one public reference (the creator's).
    pub(crate) fn new() -> Self {
        Self {
            ext: AtomicUsize::new(1),
            int: AtomicUsize::new(0),
            suicide: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_suicide(&self) {
        self.suicide.store(true, Ordering::Release);
    }

    pub(crate) fn int_count(&self) -> usize {
        self.int.load(Ordering::Acquire)
    }

    /// Spin until no internal references remain.
    pub(crate) fn wait_unreferenced(&self) {
        while self.int_count() > 0 {
            std::thread::yield_now();
        }
    }
}

/// A type carrying a [`LifeCounts`] block.
pub(crate) trait Shared: Sized {
    fn life(&self) -> &LifeCounts;

    /// Take the object out of the scheduler after the last public reference
    /// dropped. Must either free the object or arrange for the last
    /// internal release to do so (suicide).
    ///
    /// # Safety
    ///
    /// Called exactly once, with no public references remaining.
    unsafe fn retire(ptr: *const Self);

    /// Free the allocation.
    ///
    /// # Safety
    ///
    /// No references of any kind remain.
    unsafe fn free(ptr: *const Self) {
        // SAFETY: objects are allocated via Box::into_raw by their
        // constructors; this is the unique final release.
        drop(unsafe { Box::from_raw(ptr.cast_mut()) });
    }
}

/// Manager for public references.
pub(crate) struct ExtMgr;

// SAFETY: counts through the intrusive block; the final release runs the
// type's retire protocol, which keeps the allocation alive until all
// internal references are gone.
unsafe impl<T: Shared> RefMgr<T> for ExtMgr {
    unsafe fn acquire(ptr: *const T, n: usize) {
        // SAFETY: live per RefMgr contract.
        let old = unsafe { &*ptr }.life().ext.fetch_add(n, Ordering::Acquire);
        debug_assert!(old > 0);
    }

    unsafe fn release(ptr: *const T, n: usize) {
        // SAFETY: live per RefMgr contract.
        let old = unsafe { &*ptr }.life().ext.fetch_sub(n, Ordering::Release);
        debug_assert!(old >= n);
        if old == n {
            fence(Ordering::Acquire);
            // SAFETY: last public reference.
            unsafe { T::retire(ptr) };
        }
    }
}

/// Manager for internal references (run queues, run locks, traversals).
pub(crate) struct IntMgr;

// SAFETY: the final internal release frees the object iff it was retired
// with suicide set; otherwise the retire path frees it after
// wait_unreferenced observes zero.
unsafe impl<T: Shared> RefMgr<T> for IntMgr {
    unsafe fn acquire(ptr: *const T, n: usize) {
        // SAFETY: live per RefMgr contract.
        let old = unsafe { &*ptr }.life().int.fetch_add(n, Ordering::Acquire);
        debug_assert!(old.checked_add(n).is_some());
    }

    unsafe fn release(ptr: *const T, n: usize) {
        // SAFETY: live per RefMgr contract.
        let life = unsafe { &*ptr }.life();
        let old = life.int.fetch_sub(n, Ordering::Release);
        debug_assert!(old >= n);
        if old == n && life.suicide.load(Ordering::Acquire) {
            fence(Ordering::Acquire);
            // SAFETY: retired with suicide set and no references remain.
            unsafe { T::free(ptr) };
        }
    }
}
