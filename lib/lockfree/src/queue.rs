//! Intrusive lock-free FIFO.
//!
//! A Michael–Scott variant. Every element carries a [`QueueHook`]: a single
//! successor word whose low bit marks an in-flight pop. `push_back` swings
//! `tail.succ` from the head sentinel to the new element and then the tail
//! pointer; `pop_front` first marks `head.succ`, then runs a mark-sweep
//! ([`RawQueue::pop_front_aid`]) that any thread can drive to completion:
//! mark the victim's own successor word, move the tail off the victim, and
//! swing `head.succ` past it.
//!
//! Reclamation uses the [hazard registry](crate::hazard) with one global
//! owner token shared by all queues: aid steps publish the element they are
//! about to dereference, and an element may only be destroyed (or reused)
//! once no slot publishes it — see [`QueueHook::ensure_unused`]. No grants
//! are ever handed out for the token, so a granted slot here is a bug.

use core::cell::Cell;
use core::marker::PhantomData;

use crate::hazard::{self, Hazard};
use crate::refcount::{RefMgr, RefPtr};
use crate::sync::{AtomicUsize, Ordering};

const MARK: usize = 0x1;

/// Global hazard owner for all queue operations. Using one shared token
/// lets element destruction rely on a single delayed hazard-wait instead of
/// per-queue bookkeeping.
#[repr(align(2))]
struct Token(#[allow(dead_code)] u8);

#[cfg(not(loom))]
static TOKEN: Token = Token(0);
#[cfg(loom)]
loom::lazy_static! {
    static ref TOKEN: Token = Token(0);
}

fn token_key() -> usize {
    let t: &Token = &TOKEN;
    t as *const Token as usize
}

fn enc(p: *const QueueHook, marked: bool) -> usize {
    debug_assert_eq!(p as usize & MARK, 0);
    p as usize | usize::from(marked)
}

fn dec(v: usize) -> (*const QueueHook, bool) {
    ((v & !MARK) as *const QueueHook, v & MARK != 0)
}

/// The intrusive successor word an element embeds per queue membership.
pub struct QueueHook {
    succ: AtomicUsize,
}

impl QueueHook {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            succ: AtomicUsize::new(0),
        }
    }
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            succ: AtomicUsize::new(0),
        }
    }

    /// Spin until no hazard reader publishes this element. Must be called
    /// before the element's memory is reused or mutated outside the queue.
    pub fn ensure_unused(&self) {
        hazard::wait_unused(token_key(), self as *const Self as usize);
    }
}

impl Default for QueueHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for QueueHook {
    fn drop(&mut self) {
        self.ensure_unused();
    }
}

/// The untyped queue engine, operating on raw hook pointers.
///
/// Boxed by the typed wrappers: the head sentinel's address must stay
/// stable for the lifetime of the queue.
struct RawQueue {
    head: QueueHook,
    /// `*const QueueHook`; always points at the last element or the head.
    tail: AtomicUsize,
    size: AtomicUsize,
}

impl RawQueue {
    fn new_boxed() -> Box<Self> {
        let q = Box::new(RawQueue {
            head: QueueHook::new(),
            tail: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        });
        let head = q.head_ptr();
        q.head.succ.store(enc(head, false), Ordering::Relaxed);
        q.tail.store(head as usize, Ordering::Relaxed);
        q
    }

    fn head_ptr(&self) -> *const QueueHook {
        &self.head
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn is_empty(&self) -> bool {
        dec(self.head.succ.load(Ordering::Relaxed)).0 == self.head_ptr()
    }

    /// Append `e`.
    ///
    /// # Safety
    ///
    /// The caller has exclusive ownership of `e`, which stays valid until
    /// popped (and hazard-quiescent afterwards).
    unsafe fn push_back(&self, e: *const QueueHook) {
        let head = self.head_ptr();
        // SAFETY: exclusive ownership per caller contract.
        let e_ref = unsafe { &*e };
        e_ref.ensure_unused();
        e_ref.succ.store(enc(head, false), Ordering::Relaxed);

        let hz = Hazard::new(token_key());
        let mut p = self.tail.load(Ordering::Relaxed) as *const QueueHook;

        self.size.fetch_add(1, Ordering::Release);

        loop {
            let done = Cell::new(false);
            let p_succ = Cell::new((head, false));
            let p_cur = Cell::new(p);

            hz.publish(
                p_cur.get() as usize,
                || {
                    let p = p_cur.get();
                    let p_check = self.tail.load(Ordering::Acquire) as *const QueueHook;
                    if !core::ptr::eq(p, p_check) {
                        p_cur.set(p_check);
                        return;
                    }

                    // SAFETY: `p` is published and re-validated as the
                    // tail, so it cannot have been reclaimed.
                    let p_ref = unsafe { &*p };
                    match p_ref.succ.compare_exchange_weak(
                        enc(head, false),
                        enc(e, false),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            let _ = self.tail.compare_exchange(
                                p as usize,
                                e as usize,
                                Ordering::Release,
                                Ordering::Relaxed,
                            );
                            done.set(true);
                        }
                        Err(cur) => {
                            let cur = dec(cur);
                            p_succ.set(cur);
                            // Help the tail along.
                            if self
                                .tail
                                .compare_exchange_weak(
                                    p as usize,
                                    cur.0 as usize,
                                    Ordering::Release,
                                    Ordering::Relaxed,
                                )
                                .is_ok()
                            {
                                p_cur.set(cur.0);
                            }
                        }
                    }
                },
                || unreachable!("queue token never receives grants"),
            );

            if done.get() {
                return;
            }
            p = p_cur.get();

            let (sp, s_marked) = p_succ.get();
            if s_marked {
                if core::ptr::eq(p, head) {
                    p = sp;
                }
                p = self.pop_front_aid(&hz, p, true);
            }
        }
    }

    /// Prepend `e` directly after the head.
    ///
    /// # Safety
    ///
    /// As for [`Self::push_back`].
    unsafe fn push_front(&self, e: *const QueueHook) {
        // SAFETY: exclusive ownership per caller contract.
        let e_ref = unsafe { &*e };
        e_ref.ensure_unused();

        self.size.fetch_add(1, Ordering::Release);

        let mut s = dec(self.head.succ.load(Ordering::Relaxed));
        loop {
            if s.1 {
                let hz = Hazard::new(token_key());
                s = (self.pop_front_aid(&hz, s.0, true), false);
            }

            e_ref.succ.store(enc(s.0, s.1), Ordering::Relaxed);
            match self.head.succ.compare_exchange_weak(
                enc(s.0, s.1),
                enc(e, false),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(cur) => s = dec(cur),
            }
        }
    }

    /// Detach and return the first element, or null when empty.
    fn pop_front(&self) -> Option<*const QueueHook> {
        let hz = Hazard::new(token_key());

        let mut e = dec(self.head.succ.load(Ordering::Relaxed));
        loop {
            if e.1 {
                e = (self.pop_front_aid(&hz, e.0, true), false);
            }
            if core::ptr::eq(e.0, self.head_ptr()) {
                return None;
            }
            match self.head.succ.compare_exchange_weak(
                enc(e.0, false),
                enc(e.0, true),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => e = dec(cur),
            }
        }

        self.size.fetch_sub(1, Ordering::Release);
        self.pop_front_aid(&hz, e.0, false);
        Some(e.0)
    }

    /// Drive an in-flight pop of `s` (the element `head.succ` points at
    /// with the mark set) to completion: mark `s.succ`, move the tail off
    /// `s`, swing `head.succ` past `s`. Any thread may run this.
    ///
    /// Returns the new `head.succ` pointer; with `until_valid` set, loops
    /// until that pointer is unmarked.
    fn pop_front_aid(
        &self,
        hz: &Hazard,
        mut s: *const QueueHook,
        until_valid: bool,
    ) -> *const QueueHook {
        let head = self.head_ptr();
        loop {
            debug_assert!(!s.is_null());
            debug_assert!(!core::ptr::eq(s, head));
            let h_succ = Cell::new((core::ptr::null::<QueueHook>(), false));

            hz.publish(
                s as usize,
                || {
                    // Validate hazard acquisition.
                    let hs = dec(self.head.succ.load(Ordering::Acquire));
                    h_succ.set(hs);
                    if !core::ptr::eq(hs.0, s) {
                        return;
                    }
                    debug_assert!(hs.1);

                    // Mark s.succ to freeze it, learning its value.
                    // SAFETY: `s` is published and re-validated as
                    // head.succ, so it cannot have been reclaimed.
                    let s_ref = unsafe { &*s };
                    let mut ss = (head, false);
                    loop {
                        if ss.1 {
                            break;
                        }
                        match s_ref.succ.compare_exchange_weak(
                            enc(ss.0, false),
                            enc(ss.0, true),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => break,
                            Err(cur) => ss = dec(cur),
                        }
                    }

                    // Move the tail out of the way.
                    let _ = self.tail.compare_exchange(
                        s as usize,
                        ss.0 as usize,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );

                    // Swing head.succ to the successor of s.
                    match self.head.succ.compare_exchange(
                        enc(s, true),
                        enc(ss.0, false),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => h_succ.set((ss.0, false)),
                        Err(cur) => h_succ.set(dec(cur)),
                    }
                },
                || unreachable!("queue token never receives grants"),
            );

            let (hp, h_marked) = h_succ.get();
            s = hp;
            if !h_marked || !until_valid {
                return s;
            }
        }
    }
}

/// Mapping between elements and their embedded [`QueueHook`].
///
/// # Safety
///
/// `hook` and `elem_of` must invert each other for the same embedded field,
/// and `Mgr` must keep queued elements alive while the queue holds its
/// reference.
pub unsafe trait QueueAdapter {
    type Elem;
    type Mgr: RefMgr<Self::Elem>;

    fn hook(elem: &Self::Elem) -> &QueueHook;

    /// Recover the element from its hook address.
    ///
    /// # Safety
    ///
    /// `hook` must be the hook of a live element of this adapter's type.
    unsafe fn elem_of(hook: *const QueueHook) -> *const Self::Elem;
}

pub type QElemRef<A> = RefPtr<<A as QueueAdapter>::Elem, <A as QueueAdapter>::Mgr>;

/// Typed FIFO over intrusive elements; holds one user reference per queued
/// element.
pub struct Queue<A: QueueAdapter> {
    raw: Box<RawQueue>,
    _marker: PhantomData<A>,
}

// SAFETY: the engine is internally synchronized; elements move across
// threads as counted references.
unsafe impl<A: QueueAdapter> Send for Queue<A> where A::Elem: Send + Sync {}
unsafe impl<A: QueueAdapter> Sync for Queue<A> where A::Elem: Send + Sync {}

impl<A: QueueAdapter> Queue<A> {
    pub fn new() -> Self {
        Self {
            raw: RawQueue::new_boxed(),
            _marker: PhantomData,
        }
    }

    pub fn push_back(&self, elem: QElemRef<A>) {
        let hook = A::hook(&elem) as *const QueueHook;
        let _ = RefPtr::into_raw(elem);
        // SAFETY: the reference we just leaked keeps the element alive
        // until popped.
        unsafe { self.raw.push_back(hook) };
    }

    pub fn push_front(&self, elem: QElemRef<A>) {
        let hook = A::hook(&elem) as *const QueueHook;
        let _ = RefPtr::into_raw(elem);
        // SAFETY: as in push_back.
        unsafe { self.raw.push_front(hook) };
    }

    pub fn pop_front(&self) -> Option<QElemRef<A>> {
        let hook = self.raw.pop_front()?;
        // SAFETY: the queue's leaked reference is adopted back; `elem_of`
        // inverts `hook`.
        Some(unsafe { RefPtr::from_raw(A::elem_of(hook)) })
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl<A: QueueAdapter> Default for Queue<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: QueueAdapter> Drop for Queue<A> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

/// Non-intrusive convenience queue: one heap node per value.
pub struct BoxQueue<T> {
    raw: Box<RawQueue>,
    _marker: PhantomData<T>,
}

struct BoxNode<T> {
    hook: QueueHook,
    value: T,
}

// SAFETY: values move through the queue by ownership.
unsafe impl<T: Send> Send for BoxQueue<T> {}
unsafe impl<T: Send> Sync for BoxQueue<T> {}

impl<T> BoxQueue<T> {
    pub fn new() -> Self {
        Self {
            raw: RawQueue::new_boxed(),
            _marker: PhantomData,
        }
    }

    pub fn push_back(&self, value: T) {
        let node = Box::into_raw(Box::new(BoxNode {
            hook: QueueHook::new(),
            value,
        }));
        // SAFETY: the leaked box owns the node until popped.
        unsafe { self.raw.push_back(&(*node).hook) };
    }

    pub fn push_front(&self, value: T) {
        let node = Box::into_raw(Box::new(BoxNode {
            hook: QueueHook::new(),
            value,
        }));
        // SAFETY: as in push_back.
        unsafe { self.raw.push_front(&(*node).hook) };
    }

    pub fn pop_front(&self) -> Option<T> {
        let hook = self.raw.pop_front()?;
        // SAFETY: hooks in this queue only come from BoxNode allocations;
        // popping transfers ownership back to us. The node's Drop waits for
        // hazard quiescence before the memory is released.
        let node = unsafe {
            Box::from_raw(
                hook.byte_sub(core::mem::offset_of!(BoxNode<T>, hook))
                    .cast_mut()
                    .cast::<BoxNode<T>>(),
            )
        };
        Some(node.value)
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl<T> Default for BoxQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for BoxQueue<T> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}
