//! The common allocation interface both heap backends implement, and the
//! tunables they are built with.

use core::ptr::{self, null_mut};
use std::{io, path::Path};

use crate::tag::PurgeTag;

// =============================================================================
// Configuration
// =============================================================================

/// Heap tunables. [`HeapConfig::default`] matches the classic setup: a 16 MiB
/// pool, shrinking by 256 KiB steps down to a 2 MiB floor when the initial
/// mapping fails, and a 1 KiB minimum leftover before a free block is split.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
  /// Desired arena pool size in bytes.
  pub pool_size: usize,
  /// Smallest acceptable pool before giving up.
  pub min_pool_size: usize,
  /// Step to shrink by when a mapping attempt fails.
  pub retry_amount: usize,
  /// Minimum leftover payload for splitting a free block. Remainders smaller
  /// than this stay attached to the allocation.
  pub min_split: usize,
}

impl Default for HeapConfig {
  fn default() -> Self {
    HeapConfig {
      pool_size: 16 << 20,
      min_pool_size: 2 << 20,
      retry_amount: 256 << 10,
      min_split: 1024,
    }
  }
}

// =============================================================================
// Shared header constants
// =============================================================================

/// Corruption signature stamped into live block headers.
#[cfg(feature = "id-check")]
pub(crate) const ZONE_ID: u32 = 0x5A4F_4E45; // "ZONE"

/// Fill byte for fresh and freed payloads.
#[cfg(feature = "scramble")]
pub(crate) const SCRAMBLE_BYTE: u8 = 0xA5;

// =============================================================================
// ZoneAlloc
// =============================================================================

/// Tagged allocation interface.
///
/// All pointers handed out are raw payload pointers; the block header lives
/// immediately before the payload and is owned by the heap. `user` arguments
/// are owner slots: when non-null, the heap stores the payload pointer there
/// on allocation and nulls it when the block is freed or purged. Purgeable
/// tags require an owner slot, since eviction is otherwise unobservable.
pub trait ZoneAlloc {
  /// Allocates `size` bytes under `tag`. A zero `size` nulls the owner slot
  /// and returns null. Panics when memory is exhausted; the zone never
  /// returns null for a real request.
  unsafe fn malloc(&mut self, size: usize, tag: PurgeTag, user: *mut *mut u8) -> *mut u8;

  /// Releases one block. Null is ignored, [`PurgeTag::Permanent`] blocks are
  /// silently kept, and the owner slot (if any) is nulled.
  unsafe fn free(&mut self, ptr: *mut u8);

  /// Releases every block whose tag falls in `low..=high`. The range is
  /// clamped to freeable tags and [`PurgeTag::Permanent`] blocks are skipped.
  /// Registered objects in the range are dropped before raw blocks go away.
  fn free_tags(&mut self, low: PurgeTag, high: PurgeTag);

  /// Retags a live block. No-op on [`PurgeTag::Permanent`] blocks; panics
  /// when retagging an ownerless block purgeable.
  unsafe fn change_tag(&mut self, ptr: *mut u8, tag: PurgeTag);

  /// Tag of a live block.
  unsafe fn check_tag(&self, ptr: *mut u8) -> PurgeTag;

  /// Usable payload size of a live block. At least what was asked for.
  unsafe fn block_size(&self, ptr: *mut u8) -> usize;

  /// Walks the heap and panics on any broken invariant.
  fn check_heap(&self);

  /// Writes a human-readable block listing to `path`.
  fn print(&self, path: &Path) -> io::Result<()>;

  /// Bytes currently allocated under `tag`.
  #[cfg(feature = "instrumented")]
  fn memory_for_tag(&self, tag: PurgeTag) -> usize;

  // ---------------------------------------------------------------------------
  // Derived operations
  // ---------------------------------------------------------------------------

  /// Zero-filled allocation of `count * size` bytes.
  unsafe fn calloc(
    &mut self,
    count: usize,
    size: usize,
    tag: PurgeTag,
    user: *mut *mut u8,
  ) -> *mut u8 {
    let total = count
      .checked_mul(size)
      .unwrap_or_else(|| panic!("calloc: {count} * {size} overflows"));
    unsafe {
      let p = self.malloc(total, tag, user);
      if !p.is_null() {
        ptr::write_bytes(p, 0, total);
      }
      p
    }
  }

  /// Resizes by allocating fresh storage, copying the overlap and freeing the
  /// old block. Always moves; in-place growth is deliberately not attempted.
  /// Null `ptr` degenerates to [`malloc`](Self::malloc), zero `size` to
  /// [`free`](Self::free) returning null.
  unsafe fn realloc(
    &mut self,
    ptr: *mut u8,
    size: usize,
    tag: PurgeTag,
    user: *mut *mut u8,
  ) -> *mut u8 {
    unsafe {
      let p = self.malloc(size, tag, user);
      if !ptr.is_null() {
        let old_size = self.block_size(ptr);
        if !p.is_null() {
          ptr::copy_nonoverlapping(ptr, p, old_size.min(size));
        }
        self.free(ptr);
        // Freeing the old block may have nulled the same owner slot.
        if !user.is_null() {
          *user = p;
        }
      }
      p
    }
  }

  /// Copies `s` into the zone as a NUL-terminated C string.
  unsafe fn strdup(&mut self, s: &str, tag: PurgeTag, user: *mut *mut u8) -> *mut u8 {
    unsafe {
      let p = self.malloc(s.len() + 1, tag, user);
      ptr::copy_nonoverlapping(s.as_ptr(), p, s.len());
      *p.add(s.len()) = 0;
      p
    }
  }

  /// Zeroed scratch allocation under [`PurgeTag::Auto`], released en masse by
  /// [`free_alloc_auto`](Self::free_alloc_auto).
  unsafe fn alloc_auto(&mut self, size: usize) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    unsafe { self.calloc(size, 1, PurgeTag::Auto, null_mut()) }
  }

  /// Resizes a scratch allocation. Panics if `ptr` is not tagged
  /// [`PurgeTag::Auto`].
  unsafe fn realloc_auto(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe {
      if !ptr.is_null() && self.check_tag(ptr) != PurgeTag::Auto {
        panic!("realloc_auto: block is not a scratch allocation");
      }
      self.realloc(ptr, size, PurgeTag::Auto, null_mut())
    }
  }

  /// Copies `s` as a scratch C string.
  unsafe fn strdup_auto(&mut self, s: &str) -> *mut u8 {
    unsafe { self.strdup(s, PurgeTag::Auto, null_mut()) }
  }

  /// Releases every scratch allocation at once.
  fn free_alloc_auto(&mut self) {
    self.free_tags(PurgeTag::Auto, PurgeTag::Auto);
  }
}
