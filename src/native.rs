//! System-allocator-backed zone heap.
//!
//! Every block comes straight from `malloc`, with the zone header in front of
//! the payload and the block threaded onto a per-tag list. Tag semantics are
//! identical to the arena backend; there is no pool to exhaust, so purging
//! only happens when the system allocator itself runs dry.

use core::{
  mem::size_of,
  ptr::{self, null_mut},
};
use std::{
  fs::File,
  io::{self, BufWriter, Write},
  path::Path,
};

use crate::{
  heap::ZoneAlloc,
  object::ObjectRegistry,
  tag::{NUM_TAGS, PURGE_LEVEL, PurgeTag, clamp_tag_range},
  zone_log,
};

#[cfg(feature = "id-check")]
use crate::heap::ZONE_ID;
#[cfg(feature = "scramble")]
use crate::heap::SCRAMBLE_BYTE;

// =============================================================================
// Block header
// =============================================================================

/// Header in front of every payload. `prev` points at the slot holding us,
/// either the tag list head or the previous block's `next`, so unlinking
/// needs no list walk.
#[repr(C)]
struct MemBlock {
  next: *mut MemBlock,
  prev: *mut *mut MemBlock,
  size: usize,
  user: *mut *mut u8,
  tag: u8,
  #[cfg(feature = "id-check")]
  id: u32,
}

/// Header bytes in front of every payload, padded so the payload keeps the
/// system allocator's 16-byte alignment.
const HEADER_SIZE: usize = crate::align_up(size_of::<MemBlock>(), 16);

const _: () = assert!(HEADER_SIZE >= size_of::<MemBlock>());

#[inline]
unsafe fn payload(block: *mut MemBlock) -> *mut u8 {
  unsafe { (block as *mut u8).add(HEADER_SIZE) }
}

#[inline]
unsafe fn block_of(ptr: *mut u8) -> *mut MemBlock {
  unsafe { ptr.sub(HEADER_SIZE) as *mut MemBlock }
}

// =============================================================================
// NativeHeap
// =============================================================================

/// The system-allocator [`ZoneAlloc`] implementation.
pub struct NativeHeap {
  /// One list head per tag. Boxed so back pointers survive moves of the
  /// heap value.
  blockbytag: Box<[*mut MemBlock]>,
  objects: ObjectRegistry,
  #[cfg(feature = "instrumented")]
  memory_by_tag: [usize; NUM_TAGS],
}

impl NativeHeap {
  pub fn new() -> NativeHeap {
    NativeHeap {
      blockbytag: vec![null_mut(); NUM_TAGS].into_boxed_slice(),
      objects: ObjectRegistry::new(),
      #[cfg(feature = "instrumented")]
      memory_by_tag: [0; NUM_TAGS],
    }
  }

  /// Registry of tag-scoped objects swept by [`ZoneAlloc::free_tags`].
  pub fn objects(&self) -> &ObjectRegistry {
    &self.objects
  }

  pub fn objects_mut(&mut self) -> &mut ObjectRegistry {
    &mut self.objects
  }

  unsafe fn link(&mut self, block: *mut MemBlock, tag: u8) {
    unsafe {
      let head = self.blockbytag.as_mut_ptr().add(tag as usize);
      (*block).next = *head;
      if !(*head).is_null() {
        (**head).prev = &raw mut (*block).next;
      }
      *head = block;
      (*block).prev = head;
      (*block).tag = tag;
    }
  }

  unsafe fn unlink(block: *mut MemBlock) {
    unsafe {
      let next = (*block).next;
      *(*block).prev = next;
      if !next.is_null() {
        (*next).prev = (*block).prev;
      }
    }
  }

  #[cfg(feature = "id-check")]
  unsafe fn check_id(block: *mut MemBlock, what: &str) {
    unsafe {
      if (*block).id != ZONE_ID {
        panic!("{what} a pointer without zone id");
      }
    }
  }
}

impl ZoneAlloc for NativeHeap {
  unsafe fn malloc(&mut self, size: usize, tag: PurgeTag, user: *mut *mut u8) -> *mut u8 {
    if tag.is_purgeable() && user.is_null() {
      panic!("zone malloc: an owner is required for purgeable blocks");
    }
    if size == 0 {
      unsafe {
        if !user.is_null() {
          *user = null_mut();
        }
      }
      return null_mut();
    }

    unsafe {
      let block = loop {
        let p = libc::malloc(size + HEADER_SIZE) as *mut MemBlock;
        if !p.is_null() {
          break p;
        }
        // Under memory pressure the cache tag is all we can give back.
        if self.blockbytag[PurgeTag::Cache as usize].is_null() {
          panic!("zone malloc: failure trying to allocate {size} bytes");
        }
        self.free_tags(PurgeTag::Cache, PurgeTag::Cache);
      };
      ptr::write(
        block,
        MemBlock {
          next: null_mut(),
          prev: null_mut(),
          size,
          user,
          tag: tag as u8,
          #[cfg(feature = "id-check")]
          id: ZONE_ID,
        },
      );
      self.link(block, tag as u8);

      let p = payload(block);
      if !user.is_null() {
        *user = p;
      }
      #[cfg(feature = "scramble")]
      ptr::write_bytes(p, SCRAMBLE_BYTE, size);
      #[cfg(feature = "instrumented")]
      {
        self.memory_by_tag[tag as usize] += size;
      }
      zone_log!("zone malloc: {:p}, {} bytes, tag {:?}", p, size, tag);
      p
    }
  }

  unsafe fn free(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    unsafe {
      let block = block_of(ptr);
      #[cfg(feature = "id-check")]
      Self::check_id(block, "zone free: freed");
      if (*block).tag == PurgeTag::Permanent as u8 {
        return;
      }
      if (*block).tag == PurgeTag::Free as u8 || (*block).tag as usize >= NUM_TAGS {
        panic!("zone free: freed a freed or corrupted block");
      }
      #[cfg(feature = "id-check")]
      {
        (*block).id = 0;
      }
      #[cfg(feature = "instrumented")]
      {
        self.memory_by_tag[(*block).tag as usize] -= (*block).size;
      }
      if !(*block).user.is_null() {
        *(*block).user = null_mut();
      }
      #[cfg(feature = "scramble")]
      ptr::write_bytes(ptr, SCRAMBLE_BYTE, (*block).size);
      zone_log!("zone free: {:p}", ptr);
      Self::unlink(block);
      libc::free(block as *mut libc::c_void);
    }
  }

  fn free_tags(&mut self, low: PurgeTag, high: PurgeTag) {
    let (lo, hi) = clamp_tag_range(low, high);
    // Objects go first so their destructors can still read zone memory.
    self.objects.free_tags(low, high);
    zone_log!("zone free_tags: {low:?}..={high:?}");

    unsafe {
      for tag in lo..=hi {
        if tag == PurgeTag::Permanent as u8 {
          continue;
        }
        let mut block = self.blockbytag[tag as usize];
        self.blockbytag[tag as usize] = null_mut();
        while !block.is_null() {
          let next = (*block).next;
          #[cfg(feature = "id-check")]
          Self::check_id(block, "zone free_tags: freed");
          if !(*block).user.is_null() {
            *(*block).user = null_mut();
          }
          #[cfg(feature = "instrumented")]
          {
            self.memory_by_tag[tag as usize] -= (*block).size;
          }
          libc::free(block as *mut libc::c_void);
          block = next;
        }
      }
    }
  }

  unsafe fn change_tag(&mut self, ptr: *mut u8, tag: PurgeTag) {
    assert!(tag != PurgeTag::Free, "zone change_tag: blocks are freed, not retagged free");
    unsafe {
      let block = block_of(ptr);
      #[cfg(feature = "id-check")]
      Self::check_id(block, "zone change_tag: retagged");
      if (*block).tag == PurgeTag::Permanent as u8 {
        return;
      }
      if tag.is_purgeable() && (*block).user.is_null() {
        panic!("zone change_tag: an owner is required for purgeable blocks");
      }
      if (*block).tag == tag as u8 {
        return;
      }
      #[cfg(feature = "instrumented")]
      {
        self.memory_by_tag[(*block).tag as usize] -= (*block).size;
        self.memory_by_tag[tag as usize] += (*block).size;
      }
      Self::unlink(block);
      self.link(block, tag as u8);
    }
  }

  unsafe fn check_tag(&self, ptr: *mut u8) -> PurgeTag {
    unsafe {
      let block = block_of(ptr);
      #[cfg(feature = "id-check")]
      Self::check_id(block, "zone check_tag: checked");
      match PurgeTag::from_raw((*block).tag) {
        Some(tag) => tag,
        None => panic!("zone check_tag: corrupted block header"),
      }
    }
  }

  unsafe fn block_size(&self, ptr: *mut u8) -> usize {
    unsafe {
      let block = block_of(ptr);
      #[cfg(feature = "id-check")]
      Self::check_id(block, "zone block_size: sized");
      (*block).size
    }
  }

  /// With no contiguous pool there is little structure to verify; walk the
  /// tag lists and validate headers and back links.
  fn check_heap(&self) {
    unsafe {
      for tag in 0..NUM_TAGS {
        let mut slot = self.blockbytag.as_ptr().add(tag) as *mut *mut MemBlock;
        let mut block = *slot;
        while !block.is_null() {
          #[cfg(feature = "id-check")]
          Self::check_id(block, "zone check_heap: visited");
          if (*block).tag as usize != tag {
            panic!("zone check_heap: block on the wrong tag list");
          }
          if (*block).prev != slot {
            panic!("zone check_heap: block doesn't have proper back link");
          }
          slot = &raw mut (*block).next;
          block = *slot;
        }
      }
    }
  }

  fn print(&self, path: &Path) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "native zone heap:")?;
    unsafe {
      for tag in 0..NUM_TAGS {
        let mut block = self.blockbytag[tag];
        if block.is_null() {
          continue;
        }
        writeln!(out, "tag {tag}:")?;
        while !block.is_null() {
          writeln!(
            out,
            "{:p}: {{ size: {:8}, user: {:p} }}",
            block,
            (*block).size,
            (*block).user,
          )?;
          if (*block).tag >= PURGE_LEVEL as u8 && (*block).user.is_null() {
            writeln!(out, "  WARNING: purgeable block with no owner")?;
          }
          block = (*block).next;
        }
      }
    }
    out.flush()
  }

  #[cfg(feature = "instrumented")]
  fn memory_for_tag(&self, tag: PurgeTag) -> usize {
    self.memory_by_tag[tag as usize]
  }
}

impl Default for NativeHeap {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for NativeHeap {
  fn drop(&mut self) {
    // Objects first: their destructors may still look at zone memory.
    self.objects.drain_all();
    unsafe {
      for tag in 0..NUM_TAGS {
        let mut block = self.blockbytag[tag];
        while !block.is_null() {
          let next = (*block).next;
          libc::free(block as *mut libc::c_void);
          block = next;
        }
      }
    }
  }
}
