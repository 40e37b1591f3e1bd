//! Lock-free intrusive containers with hazard-pointer reclamation.
//!
//! This crate provides the memory-reclamation layer and the two intrusive
//! containers the `workq` scheduler is built on:
//!
//! * [`hazard`] — a process-wide table of hazard slots. A reader publishes
//!   the pointer it is about to dereference; a writer that just unlinked that
//!   pointer hands the reader a reference count ("grant") instead of freeing
//!   the pointee out from under it.
//! * [`LlPtr`](llptr::LlPtr) — an atomic word holding a reference-counted
//!   pointer plus a small set of flag bits packed into the pointer's
//!   alignment bits. Loads acquire a reference through the hazard protocol,
//!   so the pointee cannot be destroyed between the raw read and the
//!   reference-count increment.
//! * [`list`] — an ordered intrusive doubly-linked list supporting
//!   concurrent insert, unlink and iteration. Threads that encounter a
//!   half-finished unlink help drive it to completion.
//! * [`queue`] — an intrusive multi-producer/multi-consumer FIFO
//!   (a Michael–Scott variant with a mark-sweep pop).
//!
//! Reference counting is pluggable: every container is parameterized over a
//! [`RefMgr`](refcount::RefMgr) that encodes whose count a link represents
//! (an element's public count, a scheduler-internal count, or a hook's link
//! count). See [`refcount`].
//!
//! This crate contains tests that are designed to work with [loom]. To run
//! them under loom:
//!
//! ```shell
//! LOOM_MAX_PREEMPTIONS=3 \
//! RUSTFLAGS="--cfg loom" \
//! cargo test -p lockfree --target-dir=loomtarget -- --nocapture
//! ```
//!
//! Setting `--target-dir` avoids thrashing the build cache back and forth
//! between a loom build or not.
//!
//! [loom]: <https://docs.rs/loom/latest/loom/>

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod hazard;
pub mod list;
pub mod llptr;
pub mod queue;
pub mod refcount;

/// This is public primarily for the integration tests in `tests/*`, which is
/// the recommended way of writing loom tests.
///
/// Not actually intended for usage by other crates.
pub mod sync;
