//! Intrusive doubly-linked lock-free list.
//!
//! Elements embed a [`ListHook`] per list they participate in. The hook
//! carries two [`LlPtr`]s (`pred_link`, `succ_link`) and a `link_count` of
//! incoming references (neighbour links plus traversal guards). One flag bit
//! is packed into each link:
//!
//! * `pred_link` flag (`MARK`) — the element is unlinked or being unlinked.
//! * `succ_link` flag (`MARK`) — the insert lock: held while the element is
//!   being linked, which is what makes double-insertion detectable.
//!
//! A second, transient flag bit (`FREEZE`) briefly pins a link while a
//! neighbour commits an insert or unlink under it; every compare-and-swap
//! encodes its expectation with `FREEZE` clear, so a frozen link simply makes
//! competitors retry.
//!
//! Unlinking is cooperative: the unlinker marks the element's `pred_link`,
//! and *any* thread that subsequently walks over the marked element splices
//! its own `succ_link` past it ([`ListHook::succ`]). The unlinker then walks
//! forward repairing stale `pred_link`s and spin-waits for `link_count` to
//! drain before the hook is cleared for reuse.
//!
//! Iterators ([`Iter`]) are positions *in* the list: a pair of anchor hooks
//! (`back`, `front`) linked around the current element. Stepping unlinks an
//! anchor and relinks it around the next non-iterator element, which keeps
//! the position meaningful across concurrent inserts and removals.

use core::marker::PhantomData;

use crate::llptr::LlPtr;
use crate::refcount::{RefMgr, RefPtr};
use crate::sync::{spin_loop_hint, yield_now, AtomicUsize, Ordering};

/// Visible flag bit: "unlinked" on `pred_link`, "linking" on `succ_link`.
const MARK: usize = 0b01;
/// Transient pin while a neighbour commits an operation under this link.
const FREEZE: usize = 0b10;

/// What a hook is part of. Traversals looking for data skip iterator hooks.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HookKind {
    Head,
    Elem,
    IterFwd,
    IterBack,
}

/// Manager counting incoming links on a hook.
pub struct LinkMgr;

// SAFETY: link_count tracks every incoming reference; `release` never frees
// (hooks are owned by their element), it only lets `unlink_wait` observe
// quiescence.
unsafe impl RefMgr<ListHook> for LinkMgr {
    unsafe fn acquire(ptr: *const ListHook, n: usize) {
        // SAFETY: live per RefMgr contract.
        let old = unsafe { &*ptr }.link_count.fetch_add(n, Ordering::Acquire);
        debug_assert!(old.checked_add(n).is_some());
    }

    unsafe fn release(ptr: *const ListHook, n: usize) {
        // SAFETY: live per RefMgr contract.
        let old = unsafe { &*ptr }.link_count.fetch_sub(n, Ordering::Release);
        debug_assert!(old >= n);
    }
}

type HookPtr = LlPtr<ListHook, LinkMgr, 2>;
pub type HookRef = RefPtr<ListHook, LinkMgr>;

/// Result of a single linking attempt between explicit neighbours.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LinkError {
    /// The element is already linked (its insert lock is taken).
    Twice,
    /// The neighbours moved; retry with refreshed neighbours.
    Retry,
    /// The predecessor anchor is unlinked.
    LostA,
    /// The successor anchor is unlinked.
    LostB,
    /// Both anchors are unlinked.
    LostAb,
}

/// Result of a single unlink attempt.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UnlinkResult {
    /// This attempt marked the element; the caller owns completion.
    Ok,
    /// A competing operation interfered; retry.
    Retry,
    /// The element is already unlinked (or never was linked).
    Fail,
}

pub struct ListHook {
    kind: HookKind,
    pred_link: HookPtr,
    succ_link: HookPtr,
    link_count: AtomicUsize,
}

// SAFETY: all mutable state is atomic.
unsafe impl Send for ListHook {}
unsafe impl Sync for ListHook {}

impl ListHook {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self::with_kind(HookKind::Elem)
    }
    #[cfg(loom)]
    pub fn new() -> Self {
        Self::with_kind(HookKind::Elem)
    }

    #[cfg(not(loom))]
    const fn with_kind(kind: HookKind) -> Self {
        Self {
            kind,
            pred_link: HookPtr::new_null(),
            succ_link: HookPtr::new_null(),
            link_count: AtomicUsize::new(0),
        }
    }
    #[cfg(loom)]
    fn with_kind(kind: HookKind) -> Self {
        Self {
            kind,
            pred_link: HookPtr::new_null(),
            succ_link: HookPtr::new_null(),
            link_count: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// True while the element is unlinked or being unlinked.
    pub fn is_marked(&self) -> bool {
        self.pred_link.load_flags(Ordering::Acquire) & MARK != 0
    }

    /// True while the element is linked into some list (or mid-link).
    pub fn is_linked(&self) -> bool {
        !self.pred_link.load_no_acquire(Ordering::Acquire).0.is_null()
            || !self.succ_link.load_no_acquire(Ordering::Acquire).0.is_null()
            || self.succ_link.load_flags(Ordering::Acquire) & MARK != 0
    }

    /// Spin until no incoming references remain.
    pub fn wait_unused(&self) {
        while self.link_count.load(Ordering::Acquire) > 0 {
            yield_now();
        }
    }

    /// The first successor that is not being unlinked, splicing marked
    /// elements out of our `succ_link` on the way (cooperative unlink aid).
    pub fn succ(&self) -> (Option<HookRef>, bool) {
        let (mut s, mut s_fl) = load_ps(&self.succ_link);
        loop {
            let sp = match s {
                Some(ref sp) => sp,
                None => return (None, s_fl),
            };
            if !sp.is_marked() {
                return (s, s_fl);
            }

            // Successor is being unlinked: skip past it.
            let (ss, _) = load_ps(&sp.succ_link);
            let ss = match ss {
                Some(ss) => ss,
                // Fully detached under us; reload our own link.
                None => {
                    let r = load_ps(&self.succ_link);
                    s = r.0;
                    s_fl = r.1;
                    continue;
                }
            };
            if cas_ps(
                &self.succ_link,
                (sp.as_ptr(), s_fl),
                (Some(ss.clone()), s_fl),
            ) {
                s = Some(ss);
            } else {
                spin_loop_hint();
                let r = load_ps(&self.succ_link);
                s = r.0;
                s_fl = r.1;
            }
        }
    }

    /// The direct predecessor, repairing stale `pred_link`s on the way.
    ///
    /// The returned flag is this element's own mark: when set, the element
    /// is unlinked and the search may only move backwards.
    pub fn pred(&self) -> (Option<HookRef>, bool) {
        let (mut p, mut p_fl) = load_ps(&self.pred_link);
        loop {
            let pp = match p {
                Some(ref pp) => pp,
                None => return (None, p_fl),
            };

            // Move forward until pp is the direct predecessor. Not allowed
            // once we are marked: a marked element must not search forward.
            if !p_fl {
                let ps = match pp.succ().0 {
                    Some(ps) => ps,
                    // pp lost its links under us; our own link must have
                    // moved on as well.
                    None => {
                        let r = load_ps(&self.pred_link);
                        p = r.0;
                        p_fl = r.1;
                        continue;
                    }
                };
                if !core::ptr::eq(ps.as_ptr(), self) {
                    if cas_ps(&self.pred_link, (pp.as_ptr(), false), (Some(ps.clone()), false)) {
                        p = Some(ps);
                    } else {
                        spin_loop_hint();
                        let r = load_ps(&self.pred_link);
                        p = r.0;
                        p_fl = r.1;
                    }
                    continue;
                }
            }

            // pp is a direct predecessor; done if it is live itself.
            if !pp.is_marked() {
                return (p, p_fl);
            }

            // pp is being unlinked; move to its predecessor.
            let (ppp, _) = load_ps(&pp.pred_link);
            let ppp = match ppp {
                Some(ppp) => ppp,
                None => {
                    let r = load_ps(&self.pred_link);
                    p = r.0;
                    p_fl = r.1;
                    continue;
                }
            };
            if cas_ps(&self.pred_link, (pp.as_ptr(), p_fl), (Some(ppp.clone()), p_fl)) {
                p = Some(ppp);
            } else {
                spin_loop_hint();
                let r = load_ps(&self.pred_link);
                p = r.0;
                p_fl = r.1;
            }
        }
    }

    /// Take the insert lock: only an unlinked, unlocked element qualifies.
    fn insert_lock(&self) -> bool {
        if self
            .succ_link
            .compare_exchange_flags(
                (core::ptr::null(), 0),
                MARK,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }
        // An unlink clears pred_link last; wait for it so we never link an
        // element whose previous unlink is still draining.
        while !self.pred_link.load_no_acquire(Ordering::Acquire).0.is_null() {
            yield_now();
        }
        true
    }

    /// Drop the insert lock without linking.
    fn insert_unlock(&self) {
        let old = self.succ_link.fetch_and(FREEZE, Ordering::AcqRel);
        debug_assert!(old & MARK != 0);
    }

    /// Link `self` (insert-locked) between `pred` and `succ`. Fails when the
    /// neighbours are no longer adjacent or `pred` is being unlinked.
    fn insert_between(&self, pred: &HookRef, succ: &HookRef) -> bool {
        let old_pred = self.pred_link.exchange((Some(pred.clone()), 0), Ordering::AcqRel);
        debug_assert!(old_pred.0.is_none());
        let old_succ = self
            .succ_link
            .exchange((Some(succ.clone()), MARK), Ordering::AcqRel);
        debug_assert!(old_succ.0.is_none() && old_succ.1 & MARK != 0);

        // Pin pred against unlinking while we link behind it.
        let freeze = match freeze_if(&pred.pred_link, |_, marked| !marked) {
            Some(f) => f,
            None => {
                self.rollback_insert();
                return false;
            }
        };

        // Swing pred.succ from succ to self; this is the commit point.
        if !cas_ps(
            &pred.succ_link,
            (succ.as_ptr(), false),
            (Some(HookRef::new(self)), false),
        ) {
            drop(freeze);
            self.rollback_insert();
            return false;
        }

        // Linked; clear the insert lock, then repair succ's pred_link.
        let old = self.succ_link.fetch_and(FREEZE, Ordering::AcqRel);
        debug_assert!(old & MARK != 0);
        drop(freeze);

        succ.pred();
        true
    }

    fn rollback_insert(&self) {
        self.succ_link.exchange((None, MARK), Ordering::AcqRel);
        self.pred_link.exchange((None, 0), Ordering::AcqRel);
    }

    /// Link `self` between the explicit neighbours `a` and `b`.
    pub fn link_between(&self, a: &HookRef, b: &HookRef) -> Result<(), LinkError> {
        if !self.insert_lock() {
            return Err(LinkError::Twice);
        }
        match (a.is_marked(), b.is_marked()) {
            (false, false) => {}
            (true, false) => {
                self.insert_unlock();
                return Err(LinkError::LostA);
            }
            (false, true) => {
                self.insert_unlock();
                return Err(LinkError::LostB);
            }
            (true, true) => {
                self.insert_unlock();
                return Err(LinkError::LostAb);
            }
        }
        if self.insert_between(a, b) {
            Ok(())
        } else {
            self.insert_unlock();
            Err(LinkError::Retry)
        }
    }

    /// Link `self` directly after `anchor`, retrying around concurrent
    /// mutation until the anchor itself disappears.
    pub fn link_after(&self, anchor: &HookRef) -> Result<(), LinkError> {
        if !self.insert_lock() {
            return Err(LinkError::Twice);
        }
        self.link_after_locked(anchor)
    }

    fn link_after_locked(&self, anchor: &HookRef) -> Result<(), LinkError> {
        loop {
            if anchor.is_marked() {
                self.insert_unlock();
                return Err(LinkError::LostA);
            }
            let (s, _) = anchor.succ();
            let s = match s {
                Some(s) => s,
                None => {
                    self.insert_unlock();
                    return Err(LinkError::LostA);
                }
            };
            if self.insert_between(anchor, &s) {
                return Ok(());
            }
        }
    }

    /// Link `self` directly before `anchor`.
    pub fn link_before(&self, anchor: &HookRef) -> Result<(), LinkError> {
        if !self.insert_lock() {
            return Err(LinkError::Twice);
        }
        self.link_before_locked(anchor)
    }

    fn link_before_locked(&self, anchor: &HookRef) -> Result<(), LinkError> {
        loop {
            let (p, anchor_marked) = anchor.pred();
            if anchor_marked {
                self.insert_unlock();
                return Err(LinkError::LostB);
            }
            let p = match p {
                Some(p) => p,
                None => {
                    self.insert_unlock();
                    return Err(LinkError::LostB);
                }
            };
            if self.insert_between(&p, anchor) {
                return Ok(());
            }
        }
    }

    /// One unlink attempt: mark our `pred_link` and splice the predecessor
    /// past us. On [`UnlinkResult::Ok`] the caller owns completion and must
    /// follow up with [`Self::unlink_wait`].
    pub fn try_unlink(&self) -> UnlinkResult {
        // Hold a reference on ourselves so a relink cannot start while we
        // are mid-unlink.
        let _self_ref = HookRef::new(self);

        let (p, p_marked) = self.pred();
        let p = match p {
            Some(p) => p,
            None => return UnlinkResult::Fail,
        };
        if p_marked {
            return UnlinkResult::Fail;
        }

        // Pin p.succ while it points at us, so p cannot finish its own
        // unlink or accept another insert under us.
        let freeze = match freeze_if(&p.succ_link, |ptr, marked| {
            core::ptr::eq(ptr, self) && !marked
        }) {
            Some(f) => f,
            None => return UnlinkResult::Retry,
        };

        if !cas_ps(&self.pred_link, (p.as_ptr(), false), (Some(p.clone()), true)) {
            drop(freeze);
            let (p2, m2) = load_ps(&self.pred_link);
            if p2.is_none() || m2 {
                return UnlinkResult::Fail;
            }
            return UnlinkResult::Retry;
        }
        drop(freeze);

        // Make p skip us.
        p.succ();
        UnlinkResult::Ok
    }

    /// Complete an unlink: repair forward `pred_link`s, wait for
    /// `link_count` to drain to `expect_refs`, then clear our links.
    ///
    /// When `relock` is set the insert lock is re-taken as part of clearing,
    /// so the element can be atomically relinked (iterator stepping).
    pub fn unlink_wait(&self, head: &ListHook, expect_refs: usize, relock: bool) {
        debug_assert!(self.is_marked());

        let mut s = self.succ().0;
        while self.link_count.load(Ordering::Relaxed) > expect_refs {
            let cur = match s {
                Some(ref cur) => cur,
                None => break,
            };
            if core::ptr::eq(cur.pred_link.load_no_acquire(Ordering::Acquire).0, self) {
                cur.pred();
            }
            // Only stop once the head was repaired: it may still reach us
            // through its pred_link.
            if core::ptr::eq(cur.as_ptr(), head) {
                break;
            }
            s = cur.succ().0;
        }

        while self.link_count.load(Ordering::Relaxed) > expect_refs {
            yield_now();
        }

        self.succ_link
            .store((None, if relock { MARK } else { 0 }), Ordering::Release);
        self.pred_link.store((None, 0), Ordering::Release);
    }

    /// Unlink from the list owning `head`. Returns false when the element
    /// was already unlinked. `expect_refs` is the number of references the
    /// caller itself holds on this hook.
    pub fn unlink(&self, head: &ListHook, expect_refs: usize) -> bool {
        loop {
            match self.try_unlink() {
                UnlinkResult::Ok => {
                    self.unlink_wait(head, expect_refs, false);
                    return true;
                }
                UnlinkResult::Retry => spin_loop_hint(),
                UnlinkResult::Fail => return false,
            }
        }
    }

    /// The first hook after `self` that is not an iterator anchor (an
    /// element, or the head).
    fn next_non_iter(&self) -> Option<HookRef> {
        let mut cur = self.succ().0?;
        loop {
            match cur.kind {
                HookKind::Elem | HookKind::Head => return Some(cur),
                HookKind::IterFwd | HookKind::IterBack => cur = cur.succ().0?,
            }
        }
    }

    /// Backward counterpart of [`Self::next_non_iter`].
    fn prev_non_iter(&self) -> Option<HookRef> {
        let mut cur = self.pred().0?;
        loop {
            match cur.kind {
                HookKind::Elem | HookKind::Head => return Some(cur),
                HookKind::IterFwd | HookKind::IterBack => cur = cur.pred().0?,
            }
        }
    }
}

impl Default for ListHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ListHook {
    fn drop(&mut self) {
        debug_assert_eq!(self.link_count.load(Ordering::Relaxed), 0);
    }
}

impl core::fmt::Debug for ListHook {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListHook")
            .field("kind", &self.kind)
            .field("marked", &self.is_marked())
            .finish_non_exhaustive()
    }
}

fn load_ps(p: &HookPtr) -> (Option<HookRef>, bool) {
    let (r, fl) = p.load(Ordering::Acquire);
    (r, fl & MARK != 0)
}

/// CAS helper over `(pointer, mark)`; expectations implicitly require
/// `FREEZE` to be clear, so frozen links make competitors retry.
fn cas_ps(p: &HookPtr, expect: (*const ListHook, bool), set: (Option<HookRef>, bool)) -> bool {
    p.compare_exchange(
        (expect.0, if expect.1 { MARK } else { 0 }),
        (set.0, if set.1 { MARK } else { 0 }),
        Ordering::AcqRel,
        Ordering::Acquire,
    )
    .is_ok()
}

struct Frozen<'a> {
    p: &'a HookPtr,
}

/// Pin `p` (set `FREEZE`) while `cond(ptr, mark)` holds; `None` once the
/// condition fails.
fn freeze_if<'a>(p: &'a HookPtr, cond: impl Fn(*const ListHook, bool) -> bool) -> Option<Frozen<'a>> {
    loop {
        let (ptr, fl) = p.load_no_acquire(Ordering::Acquire);
        if fl & FREEZE != 0 {
            spin_loop_hint();
            continue;
        }
        if !cond(ptr, fl & MARK != 0) {
            return None;
        }
        if p
            .compare_exchange_flags((ptr, fl), fl | FREEZE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Some(Frozen { p });
        }
        spin_loop_hint();
    }
}

impl Drop for Frozen<'_> {
    fn drop(&mut self) {
        let old = self.p.fetch_and(MARK, Ordering::Release);
        debug_assert!(old & FREEZE != 0);
    }
}

/// Mapping between elements and their embedded hook for one list.
///
/// # Safety
///
/// `hook` and `elem_of` must be exact inverses for the same embedded field,
/// and `Mgr` must keep the element (and therefore the hook) alive while the
/// list holds its reference.
pub unsafe trait ListAdapter {
    type Elem;
    type Mgr: RefMgr<Self::Elem>;

    fn hook(elem: &Self::Elem) -> &ListHook;

    /// Recover the element from its hook address.
    ///
    /// # Safety
    ///
    /// `hook` must be the hook of a live element of this adapter's type.
    unsafe fn elem_of(hook: *const ListHook) -> *const Self::Elem;
}

pub type ElemRef<A> = RefPtr<<A as ListAdapter>::Elem, <A as ListAdapter>::Mgr>;

/// The list-level wrapper: manages one user reference per linked element.
pub struct List<A: ListAdapter> {
    head: Box<ListHook>,
    _marker: PhantomData<A>,
}

// SAFETY: the head hook is internally synchronized; elements are shared
// across threads through counted references.
unsafe impl<A: ListAdapter> Send for List<A> where A::Elem: Send + Sync {}
unsafe impl<A: ListAdapter> Sync for List<A> where A::Elem: Send + Sync {}

impl<A: ListAdapter> List<A> {
    pub fn new() -> Self {
        let head = Box::new(ListHook::with_kind(HookKind::Head));
        // Self-link the head; its link_count settles at 2.
        let r = HookRef::new(&head);
        head.pred_link.store((Some(r.clone()), 0), Ordering::Release);
        head.succ_link.store((Some(r), 0), Ordering::Release);
        Self {
            head,
            _marker: PhantomData,
        }
    }

    fn head_ref(&self) -> HookRef {
        HookRef::new(&self.head)
    }

    /// Append; false when the element is already linked.
    pub fn push_back(&self, elem: ElemRef<A>) -> bool {
        match A::hook(&elem).link_before(&self.head_ref()) {
            Ok(()) => {
                // The linkage owns this user reference now.
                let _ = RefPtr::into_raw(elem);
                true
            }
            Err(LinkError::Twice) => false,
            Err(e) => unreachable!("head anchor lost: {:?}", e),
        }
    }

    /// Prepend; false when the element is already linked.
    pub fn push_front(&self, elem: ElemRef<A>) -> bool {
        match A::hook(&elem).link_after(&self.head_ref()) {
            Ok(()) => {
                let _ = RefPtr::into_raw(elem);
                true
            }
            Err(LinkError::Twice) => false,
            Err(e) => unreachable!("head anchor lost: {:?}", e),
        }
    }

    /// Detach and return the first element.
    pub fn pop_front(&self) -> Option<ElemRef<A>> {
        let mut cur = self.head.succ().0?;
        while !core::ptr::eq(cur.as_ptr(), &*self.head) {
            if cur.kind() == HookKind::Elem && cur.unlink(&self.head, 1) {
                return Some(self.adopt(&cur));
            }
            cur = cur.succ().0?;
        }
        None
    }

    /// Detach and return the last element.
    pub fn pop_back(&self) -> Option<ElemRef<A>> {
        let mut cur = self.head.pred().0?;
        while !core::ptr::eq(cur.as_ptr(), &*self.head) {
            if cur.kind() == HookKind::Elem && cur.unlink(&self.head, 1) {
                return Some(self.adopt(&cur));
            }
            cur = cur.pred().0?;
        }
        None
    }

    /// Unlink a specific element; the list's reference is returned. `None`
    /// when the element was not linked (or already mid-unlink elsewhere).
    pub fn erase(&self, elem: &A::Elem) -> Option<ElemRef<A>> {
        let hook = A::hook(elem);
        let guard = HookRef::new(hook);
        if guard.unlink(&self.head, 1) {
            Some(self.adopt(&guard))
        } else {
            None
        }
    }

    /// Recover the user reference owned by a (just unlinked) linkage.
    fn adopt(&self, hook: &HookRef) -> ElemRef<A> {
        // SAFETY: the hook belongs to a live element (the linkage reference
        // we are adopting keeps it alive), and `elem_of` inverts `hook`.
        unsafe { RefPtr::from_raw(A::elem_of(hook.as_ptr())) }
    }

    pub fn clear(&self) {
        while self.pop_front().is_some() {}
    }

    /// Snapshot element count; O(n) and approximate under concurrency.
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = match self.head.succ().0 {
            Some(c) => c,
            None => return 0,
        };
        while !core::ptr::eq(cur.as_ptr(), &*self.head) {
            if cur.kind() == HookKind::Elem && !cur.is_marked() {
                n += 1;
            }
            cur = match cur.succ().0 {
                Some(c) => c,
                None => break,
            };
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        match self.head.next_non_iter() {
            Some(h) => core::ptr::eq(h.as_ptr(), &*self.head),
            None => true,
        }
    }

    /// A fresh user reference to the first element, without unlinking it.
    pub fn front(&self) -> Option<ElemRef<A>> {
        self.cursor_next(None)
    }

    /// Snapshot cursor step: the first element after `hint` (or from the
    /// start when `hint` is `None` or no longer present). The hint is a
    /// plain address and is never dereferenced, so a stale hint is safe; it
    /// merely restarts the walk. Returns a fresh user reference; no hook
    /// references are retained across the call.
    pub fn cursor_next(&self, hint: Option<*const A::Elem>) -> Option<ElemRef<A>> {
        let mut cur = self.head.succ().0?;

        if let Some(hint) = hint {
            // Find the hint's position.
            let mut scan = cur.clone();
            let mut found = false;
            while !core::ptr::eq(scan.as_ptr(), &*self.head) {
                if scan.kind() == HookKind::Elem {
                    // SAFETY: the hook reference keeps the element from
                    // being reclaimed; we only take its address.
                    let elem = unsafe { A::elem_of(scan.as_ptr()) };
                    if core::ptr::eq(elem, hint) {
                        found = true;
                        break;
                    }
                }
                scan = scan.succ().0?;
            }
            if found {
                cur = scan.succ().0?;
            }
        }

        while !core::ptr::eq(cur.as_ptr(), &*self.head) {
            if cur.kind() == HookKind::Elem && !cur.is_marked() {
                // SAFETY: our hook reference blocks completion of any
                // unlink, so the element is live; acquire a user reference
                // before the hook reference is dropped.
                return Some(unsafe { RefPtr::new(&*A::elem_of(cur.as_ptr())) });
            }
            cur = cur.succ().0?;
        }
        None
    }

    /// A position at the head (stepping forward reaches the first element).
    pub fn head_position(&self) -> Iter<'_, A> {
        let iter = Iter::new_detached(self);
        iter.anchor_at(&self.head_ref());
        iter
    }

    /// A position at `elem`; fails when the element is being linked by
    /// another thread or is not linked.
    pub fn iterator_to(&self, elem: &A::Elem) -> Option<Iter<'_, A>> {
        let hook = A::hook(elem);
        if hook.succ_link.load_flags(Ordering::Acquire) & MARK != 0 {
            // Mid-link by another thread.
            return None;
        }
        if hook.is_marked() || !hook.is_linked() {
            return None;
        }
        let iter = Iter::new_detached(self);
        let target = HookRef::new(hook);
        if iter.try_anchor_at(&target) {
            Some(iter)
        } else {
            None
        }
    }
}

impl<A: ListAdapter> Default for List<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ListAdapter> Drop for List<A> {
    fn drop(&mut self) {
        self.clear();
        // Break the head's self-links so its link_count drains.
        self.head.succ_link.store((None, 0), Ordering::Release);
        self.head.pred_link.store((None, 0), Ordering::Release);
        self.head.wait_unused();
    }
}

/// A stable position in the list: a pair of anchor hooks linked around the
/// current element. Two positions are [equal](Iter::same_position) when no
/// element lies between their back anchors.
pub struct Iter<'a, A: ListAdapter> {
    list: &'a List<A>,
    back: Box<ListHook>,
    front: Box<ListHook>,
}

impl<'a, A: ListAdapter> Iter<'a, A> {
    fn new_detached(list: &'a List<A>) -> Self {
        Self {
            list,
            back: Box::new(ListHook::with_kind(HookKind::IterBack)),
            front: Box::new(ListHook::with_kind(HookKind::IterFwd)),
        }
    }

    /// Anchor around `target`, which must survive anchoring (head).
    fn anchor_at(&self, target: &HookRef) {
        assert!(self.try_anchor_at(target));
    }

    /// Anchor `back` before and `front` after `target`. False when the
    /// target vanished mid-way (anchors end up adjacent to each other or
    /// detached).
    fn try_anchor_at(&self, target: &HookRef) -> bool {
        debug_assert!(!self.back.is_linked() && !self.front.is_linked());
        if self.back.link_before(target).is_err() {
            return false;
        }
        if self.front.link_after(target).is_ok() {
            return true;
        }
        // Target disappeared after the back anchor went in; take the back
        // anchor out again.
        let ok = self.back.unlink(&self.list.head, 0);
        debug_assert!(ok);
        false
    }

    /// Unlink an anchor so it can be relinked elsewhere (insert lock held).
    fn detach_for_move(&self, anchor: &ListHook) {
        loop {
            match anchor.try_unlink() {
                UnlinkResult::Ok => break,
                UnlinkResult::Retry => spin_loop_hint(),
                UnlinkResult::Fail => unreachable!("iterator anchor unlinked externally"),
            }
        }
        anchor.unlink_wait(&self.list.head, 0, true);
    }

    /// Move both anchors around `target`. False when the target was
    /// unlinked mid-move; the anchors are left adjacent and the caller
    /// re-walks.
    fn relink_at(&self, target: &HookRef) -> bool {
        self.detach_for_move(&self.back);
        if self.back.link_before_locked(target).is_err() {
            // Target died; put back right behind front again. Our own
            // anchors never disappear, so this cannot fail.
            let front_ref = HookRef::new(&*self.front);
            assert!(self.back.insert_lock());
            assert!(self.back.link_before_locked(&front_ref).is_ok());
            return false;
        }

        self.detach_for_move(&self.front);
        if self.front.link_after_locked(target).is_err() {
            // Target died with back already placed; restore adjacency.
            let back_ref = HookRef::new(&*self.back);
            assert!(self.front.insert_lock());
            assert!(self.front.link_after_locked(&back_ref).is_ok());
            return false;
        }
        true
    }

    /// Step to the next element; `None` when the position wraps to the
    /// head.
    pub fn next(&mut self) -> Option<ElemRef<A>> {
        loop {
            let target = self.front.next_non_iter()?;
            if !self.relink_at(&target) {
                continue;
            }
            if target.kind() == HookKind::Head {
                return None;
            }
            if target.is_marked() {
                // Concurrently removed from under us; keep walking.
                continue;
            }
            return Some(self.elem_ref(&target));
        }
    }

    /// Step to the previous element; `None` when the position wraps to the
    /// head.
    pub fn prev(&mut self) -> Option<ElemRef<A>> {
        loop {
            let target = self.back.prev_non_iter()?;
            if !self.relink_at(&target) {
                continue;
            }
            if target.kind() == HookKind::Head {
                return None;
            }
            if target.is_marked() {
                continue;
            }
            return Some(self.elem_ref(&target));
        }
    }

    /// The element at this position: the first live element between the
    /// anchors, if any.
    pub fn get(&self) -> Option<ElemRef<A>> {
        Some(self.elem_ref(&self.current()?))
    }

    /// The hook between the anchors, bounded by `front` (an element that
    /// drifted beyond the front anchor is not "at" this position).
    fn current(&self) -> Option<HookRef> {
        let mut cur = self.back.succ().0?;
        loop {
            if core::ptr::eq(cur.as_ptr(), &*self.front) {
                return None;
            }
            match cur.kind() {
                HookKind::Elem if !cur.is_marked() => return Some(cur),
                HookKind::Head => return None,
                _ => cur = cur.succ().0?,
            }
        }
    }

    /// Insert `elem` at this position (directly behind the back anchor,
    /// i.e. before the current element). False when `elem` is already
    /// linked.
    pub fn insert(&self, elem: ElemRef<A>) -> bool {
        let back_ref = HookRef::new(&*self.back);
        match A::hook(&elem).link_after(&back_ref) {
            Ok(()) => {
                let _ = RefPtr::into_raw(elem);
                true
            }
            Err(LinkError::Twice) => false,
            Err(e) => unreachable!("iterator anchor lost: {:?}", e),
        }
    }

    /// Unlink and return the element at this position.
    pub fn erase(&self) -> Option<ElemRef<A>> {
        let cur = self.current()?;
        if cur.unlink(&self.list.head, 1) {
            // SAFETY: the adopted reference is the linkage's user reference.
            Some(unsafe { RefPtr::from_raw(A::elem_of(cur.as_ptr())) })
        } else {
            None
        }
    }

    /// Two positions are equal when no element lies between their back
    /// anchors (in either direction).
    pub fn same_position(&self, other: &Iter<'_, A>) -> bool {
        fn reaches(from: &ListHook, to: &ListHook) -> bool {
            let mut cur = match from.succ().0 {
                Some(c) => c,
                None => return false,
            };
            loop {
                if core::ptr::eq(cur.as_ptr(), to) {
                    return true;
                }
                match cur.kind() {
                    HookKind::Elem | HookKind::Head => return false,
                    _ => {}
                }
                cur = match cur.succ().0 {
                    Some(c) => c,
                    None => return false,
                };
            }
        }
        reaches(&self.back, &other.back) || reaches(&other.back, &self.back)
    }

    fn elem_ref(&self, hook: &HookRef) -> ElemRef<A> {
        debug_assert_eq!(hook.kind(), HookKind::Elem);
        // SAFETY: the hook reference keeps the element linked or at least
        // un-reclaimed; `elem_of` inverts `hook`. We acquire a fresh user
        // reference rather than stealing the linkage's.
        unsafe { RefPtr::new(&*A::elem_of(hook.as_ptr())) }
    }
}

impl<A: ListAdapter> Drop for Iter<'_, A> {
    fn drop(&mut self) {
        for anchor in [&self.back, &self.front] {
            if anchor.is_linked() {
                let ok = anchor.unlink(&self.list.head, 0);
                debug_assert!(ok);
            }
        }
    }
}
