//! Purge tags: the lifecycle classes every zone allocation is stamped with.

// =============================================================================
// Tags
// =============================================================================

/// Lifecycle class of a zone allocation.
///
/// Ordering is meaningful: tags at or above [`PURGE_LEVEL`] are purgeable and
/// may be reclaimed by the heap whenever it needs room. Purgeable blocks must
/// carry an owner slot so the eviction is observable.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum PurgeTag {
  /// Block is on the free list. Never a valid allocation tag.
  Free = 0,
  /// Lives until explicitly freed.
  Static = 1,
  /// Lives forever: free and retag are silent no-ops.
  Permanent = 2,
  /// Renderer-owned data, bulk-freed on video mode changes.
  Renderer = 3,
  /// Scratch allocations released in one shot by [`crate::ZoneAlloc::free_alloc_auto`].
  Auto = 4,
  /// Level-lifetime data, bulk-freed between levels.
  Level = 5,
  /// Purgeable cache data, evictable at any time.
  Cache = 6,
}

/// Number of tag values, including [`PurgeTag::Free`].
pub const NUM_TAGS: usize = 7;

/// Tags `>= PURGE_LEVEL` are purgeable.
pub const PURGE_LEVEL: PurgeTag = PurgeTag::Cache;

const _: () = assert!(PurgeTag::Free as u8 == 0);
const _: () = assert!(PurgeTag::Cache as usize == NUM_TAGS - 1);
const _: () = assert!(PURGE_LEVEL as u8 > PurgeTag::Permanent as u8);

impl PurgeTag {
  /// All tag values in ascending order.
  pub const ALL: [PurgeTag; NUM_TAGS] = [
    PurgeTag::Free,
    PurgeTag::Static,
    PurgeTag::Permanent,
    PurgeTag::Renderer,
    PurgeTag::Auto,
    PurgeTag::Level,
    PurgeTag::Cache,
  ];

  /// True if blocks with this tag may be evicted by the heap.
  #[inline]
  pub const fn is_purgeable(self) -> bool {
    self as u8 >= PURGE_LEVEL as u8
  }

  /// Recovers a tag from its stored byte. `None` for out-of-range values,
  /// which indicate header corruption.
  pub(crate) fn from_raw(raw: u8) -> Option<PurgeTag> {
    if (raw as usize) < NUM_TAGS { Some(Self::ALL[raw as usize]) } else { None }
  }
}

/// Clamps a bulk-free range to freeable tags: the low bound never reaches
/// [`PurgeTag::Free`] and the high bound never passes [`PurgeTag::Cache`].
pub(crate) fn clamp_tag_range(low: PurgeTag, high: PurgeTag) -> (u8, u8) {
  let lo = (low as u8).max(PurgeTag::Static as u8);
  let hi = (high as u8).min(PurgeTag::Cache as u8);
  (lo, hi)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn purgeable_boundary() {
    assert!(PurgeTag::Cache.is_purgeable());
    assert!(!PurgeTag::Level.is_purgeable());
    assert!(!PurgeTag::Static.is_purgeable());
  }

  #[test]
  fn raw_round_trip() {
    for tag in PurgeTag::ALL {
      assert_eq!(PurgeTag::from_raw(tag as u8), Some(tag));
    }
    assert_eq!(PurgeTag::from_raw(NUM_TAGS as u8), None);
    assert_eq!(PurgeTag::from_raw(0xff), None);
  }

  #[test]
  fn range_clamping() {
    assert_eq!(
      clamp_tag_range(PurgeTag::Free, PurgeTag::Cache),
      (PurgeTag::Static as u8, PurgeTag::Cache as u8)
    );
    assert_eq!(
      clamp_tag_range(PurgeTag::Level, PurgeTag::Level),
      (PurgeTag::Level as u8, PurgeTag::Level as u8)
    );
  }
}
