//! Process-wide hazard-pointer registry.
//!
//! A fixed table of `(owner, value)` slots. A reader that is about to
//! dereference a shared pointer claims a slot, publishes the pointer's
//! address as the slot value, and re-validates the source afterwards. A
//! writer that wants to retire a pointer walks the table and *grants* one
//! reference to every slot currently publishing that pointer, transferring
//! counts it already owns instead of freeing the pointee.
//!
//! The owner word disambiguates which atomic location a published value was
//! read from, so unrelated structures sharing the table never grant to each
//! other. Owners are addresses: non-zero, with the least significant bit
//! reserved as the mid-release marker.

use crate::sync::{AtomicUsize, Ordering};

/// Marker bit on the owner word: set while a granter is operating on the
/// slot, and preserved by slot release so an in-flight grant is never
/// orphaned.
const FLAG: usize = 0x1;
const MASK: usize = !FLAG;

const SLOT_COUNT: usize = 64;

#[repr(align(64))]
struct Slot {
    owner: AtomicUsize,
    value: AtomicUsize,
}

impl Slot {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
            value: AtomicUsize::new(0),
        }
    }
    #[cfg(loom)]
    fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
            value: AtomicUsize::new(0),
        }
    }
}

// Page aligned, to reduce TLB misses.
#[repr(align(4096))]
struct SlotTable {
    slots: [Slot; SLOT_COUNT],
}

#[cfg(not(loom))]
static SLOTS: SlotTable = SlotTable {
    slots: {
        const S: Slot = Slot::new();
        [S; SLOT_COUNT]
    },
};
#[cfg(not(loom))]
static ALLOC_IDX: AtomicUsize = AtomicUsize::new(0);

#[cfg(loom)]
loom::lazy_static! {
    static ref SLOTS: SlotTable = SlotTable {
        slots: core::array::from_fn(|_| Slot::new()),
    };
    static ref ALLOC_IDX: AtomicUsize = AtomicUsize::new(0);
}

fn slots() -> &'static [Slot; SLOT_COUNT] {
    &SLOTS.slots
}

/// Number of slots in the registry. Grants acquire up to this many extra
/// references up front, so each slot can be handed one.
pub fn slot_count() -> usize {
    SLOT_COUNT
}

fn valid_owner(owner: usize) -> usize {
    assert_ne!(owner, 0, "hazard: owner must be non-null");
    assert_eq!(owner & FLAG, 0, "hazard: owner may not have LSB set");
    owner
}

/// Attempt to transfer one reference to `slot` if it currently publishes
/// `(owner, value)`.
///
/// Claims the slot by setting the owner flag, then clears the value; the
/// reader's slot-clear observing zero is how it learns a reference was
/// handed to it.
fn mark(slot: &Slot, owner: usize, value: usize) -> bool {
    loop {
        if slot.value.load(Ordering::Relaxed) != value {
            return false;
        }

        match slot
            .owner
            .compare_exchange_weak(owner, owner | FLAG, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                let granted = slot
                    .value
                    .compare_exchange(value, 0, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok();
                // Syncs with the Acquire in `Hazard::new`: the slot only
                // becomes reallocatable once the flag clears.
                slot.owner.fetch_and(MASK, Ordering::Release);
                return granted;
            }
            Err(cur) => {
                if cur & MASK != owner {
                    return false;
                }
                // Another grant holds the flag on the same owner; retry.
            }
        }
    }
}

/// A claimed hazard slot, released on drop.
pub struct Hazard {
    slot: &'static Slot,
}

impl Hazard {
    /// Claim a free slot for `owner`. Spins until one is available.
    ///
    /// `owner` must be non-zero with the least significant bit clear
    /// (addresses of 2-aligned objects qualify).
    pub fn new(owner: usize) -> Self {
        let owner = valid_owner(owner);
        let start = ALLOC_IDX.fetch_add(1, Ordering::Relaxed) % SLOT_COUNT;

        let mut idx = start;
        let slot = loop {
            let s = &slots()[idx];
            if s
                .owner
                .compare_exchange_weak(0, owner, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break s;
            }
            idx = (idx + 1) % SLOT_COUNT;
            if idx == start {
                crate::sync::spin_loop_hint();
            }
        };

        debug_assert_eq!(slot.value.load(Ordering::Relaxed), 0);
        Hazard { slot }
    }

    /// Publish `value`, run `op`, then clear the slot. If a granter cleared
    /// the slot first (delivering a reference), run `on_grant`.
    ///
    /// `op` and `on_grant` must not panic: a panic would leave the slot
    /// published and wedge every writer of `value`.
    pub fn publish(&self, value: usize, op: impl FnOnce(), on_grant: impl FnOnce()) {
        let old = self.slot.value.swap(value, Ordering::AcqRel);
        debug_assert_eq!(old, 0);
        op();
        if self.slot.value.swap(0, Ordering::Release) == 0 {
            on_grant();
        }
    }
}

impl Drop for Hazard {
    fn drop(&mut self) {
        debug_assert_eq!(self.slot.value.load(Ordering::Relaxed), 0);
        // Keep the flag bit: a granter that claimed this slot concurrently
        // still owns it until it clears the flag.
        self.slot.owner.fetch_and(FLAG, Ordering::Release);
    }
}

/// Hand references for `(owner, value)` to every slot currently publishing
/// it.
///
/// The caller owns `nrefs` spare references. When `nrefs` is smaller than
/// the table, `acquire` is called once for the difference so every slot
/// could be served; leftovers are returned through `release`. Both
/// callbacks must not panic.
pub fn grant(
    acquire: impl FnOnce(usize),
    release: impl FnOnce(usize),
    owner: usize,
    value: usize,
    nrefs: usize,
) {
    let owner = valid_owner(owner);
    let slot_count = slot_count();

    let mut nrefs = nrefs;
    if nrefs < slot_count {
        acquire(slot_count - nrefs);
        nrefs = slot_count;
    }

    for slot in slots() {
        if mark(slot, owner, value) {
            nrefs -= 1;
        }
    }
    if nrefs > 0 {
        release(nrefs);
    }
}

/// Bounded grant: hand out at most `nrefs` references, returning how many
/// were actually delivered.
pub fn grant_n(owner: usize, value: usize, nrefs: usize) -> usize {
    let owner = valid_owner(owner);

    let mut count = 0;
    for slot in slots() {
        if count == nrefs {
            break;
        }
        if mark(slot, owner, value) {
            count += 1;
        }
    }
    count
}

/// Busy-wait until no slot publishes `(owner, value)`.
pub fn wait_unused(owner: usize, value: usize) {
    let owner = valid_owner(owner);

    for slot in slots() {
        while slot.owner.load(Ordering::Acquire) & MASK == owner
            && slot.value.load(Ordering::Acquire) == value
        {
            crate::sync::yield_now();
        }
    }
}
