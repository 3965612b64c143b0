#![allow(clippy::missing_safety_doc)]

//! Tagged zone memory allocator in the id-Tech lineage, plus the intrusive
//! data structures built on top of it.
//!
//! The heap hands out raw blocks stamped with a [`PurgeTag`] that describes
//! their lifecycle. Bulk release by tag range replaces most individual frees,
//! and blocks at or above the purge level may be evicted behind the caller's
//! back, with an owner slot nulled so stale pointers are observable.
//!
//! Two backends implement [`ZoneAlloc`]: [`arena::ZoneHeap`] carves blocks out
//! of one mmap'd pool with first-fit search and neighbor coalescing, and
//! [`native::NativeHeap`] forwards to the system allocator while keeping the
//! same tag bookkeeping.
//!
//! On top sit [`hash::HashTable`], an intrusive chained hash table generic
//! over key behavior, [`meta::MetaTable`], a dual-indexed key/type property
//! store, and [`object::ObjectRegistry`], which ties owned Rust values into
//! the tag lifecycle so a tag sweep runs their destructors.

pub mod arena;
pub mod chain;
pub mod hash;
pub mod heap;
pub mod meta;
pub mod native;
pub mod object;
pub mod tag;

pub use arena::ZoneHeap;
pub use chain::ChainLink;
pub use hash::{Adapter, CaseStrKey, HashKey, HashTable, IntKey, NoCaseStrKey};
pub use heap::{HeapConfig, ZoneAlloc};
pub use meta::{MetaError, MetaObject, MetaTable, MetaTypeOps, MetaValue};
pub use native::NativeHeap;
pub use object::{ObjectHandle, ObjectRegistry};
pub use tag::{NUM_TAGS, PURGE_LEVEL, PurgeTag};

// =============================================================================
// Shared helpers
// =============================================================================

/// Rounds `n` up to the next multiple of `align`. `align` must be a power of two.
pub(crate) const fn align_up(n: usize, align: usize) -> usize {
  (n + align - 1) & !(align - 1)
}

const _: () = assert!(align_up(0, 32) == 0);
const _: () = assert!(align_up(1, 32) == 32);
const _: () = assert!(align_up(32, 32) == 32);
const _: () = assert!(align_up(33, 32) == 64);

/// Trace-level heap operation logging, compiled out without the
/// `zone-log` feature.
macro_rules! zone_log {
  ($($arg:tt)*) => {{
    #[cfg(feature = "zone-log")]
    log::trace!($($arg)*);
  }};
}
pub(crate) use zone_log;
