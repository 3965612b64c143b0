//! Arena-backed zone heap.
//!
//! One mmap'd pool is carved into a circular doubly-linked list of blocks,
//! each headed by a [`MemBlock`] directly before its payload. Allocation is
//! first-fit from a rover cursor, purging cache blocks it walks over; freeing
//! coalesces with both neighbors. When the pool is exhausted the heap
//! overflows to the system allocator, keeping those blocks on per-tag side
//! lists so tag sweeps still find them.

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
  align_up,
  heap::{HeapConfig, ZoneAlloc},
  object::ObjectRegistry,
  tag::{NUM_TAGS, PURGE_LEVEL, PurgeTag, clamp_tag_range},
  zone_log,
};

#[cfg(feature = "id-check")]
use crate::heap::ZONE_ID;
#[cfg(feature = "scramble")]
use crate::heap::SCRAMBLE_BYTE;

// =============================================================================
// Constants
// =============================================================================

/// Allocation granularity. Sizes round up to this, so payloads keep their
/// alignment and neighboring headers stay aligned too.
const CHUNK_SIZE: usize = 32;

/// Alignment of the first block in the pool.
const CACHE_ALIGN: usize = 32;

/// Header bytes in front of every payload.
const HEADER_SIZE: usize = align_up(size_of::<MemBlock>(), CHUNK_SIZE);

const _: () = assert!(CHUNK_SIZE.is_power_of_two());
const _: () = assert!(CACHE_ALIGN.is_power_of_two());
const _: () = assert!(HEADER_SIZE >= size_of::<MemBlock>());
const _: () = assert!(HEADER_SIZE % CHUNK_SIZE == 0);

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED { null_mut() } else { ptr as *mut u8 }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// Block header
// =============================================================================

/// Sits immediately before every payload.
///
/// Pool blocks use `next`/`prev` as the circular arena list. Overflow blocks
/// (`vm` set) live on singly-headed per-tag side lists instead, where
/// `prev_slot` points at whatever slot holds them.
#[repr(C)]
struct MemBlock {
  next: *mut MemBlock,
  prev: *mut MemBlock,
  prev_slot: *mut *mut MemBlock,
  /// Payload bytes, header not included.
  size: usize,
  /// Owner slot, nulled when the block goes away.
  user: *mut *mut u8,
  tag: u8,
  /// True for overflow blocks from the system allocator.
  vm: bool,
  #[cfg(feature = "id-check")]
  id: u32,
}

#[inline]
unsafe fn payload(block: *mut MemBlock) -> *mut u8 {
  unsafe { (block as *mut u8).add(HEADER_SIZE) }
}

#[inline]
unsafe fn block_of(ptr: *mut u8) -> *mut MemBlock {
  unsafe { ptr.sub(HEADER_SIZE) as *mut MemBlock }
}

// =============================================================================
// ZoneHeap
// =============================================================================

/// The arena-backed [`ZoneAlloc`] implementation.
pub struct ZoneHeap {
  /// mmap base.
  pool: *mut u8,
  /// Mapped length, including slack for alignment and the first header.
  mapped: usize,
  /// First block of the circular list. Never merges backwards.
  zone: *mut MemBlock,
  /// Search cursor; allocation resumes here.
  rover: *mut MemBlock,
  /// Side lists of overflow blocks, one per tag. Boxed so back pointers
  /// survive moves of the heap value.
  blockbytag: Box<[*mut MemBlock]>,
  objects: ObjectRegistry,
  config: HeapConfig,
  #[cfg(feature = "instrumented")]
  memory_by_tag: [usize; NUM_TAGS],
}

impl ZoneHeap {
  /// Maps the pool and sets up a single spanning free block. Shrinks the
  /// request by `retry_amount` steps when mapping fails, down to
  /// `min_pool_size`; panics below that.
  pub fn new(config: HeapConfig) -> ZoneHeap {
    let floor = align_up(config.min_pool_size.max(CHUNK_SIZE), CHUNK_SIZE);
    let mut size = align_up(config.pool_size, CHUNK_SIZE).max(floor);
    let (pool, mapped) = loop {
      let total = size + HEADER_SIZE + CACHE_ALIGN;
      let p = unsafe { os_mmap(total) };
      if !p.is_null() {
        break (p, total);
      }
      if size <= floor {
        panic!("ZoneHeap::new: failed on allocation of {size} bytes");
      }
      size = size.saturating_sub(config.retry_amount).max(floor);
    };

    let zone = align_up(pool as usize, CACHE_ALIGN) as *mut MemBlock;
    unsafe {
      ptr::write(
        zone,
        MemBlock {
          next: zone,
          prev: zone,
          prev_slot: null_mut(),
          size,
          user: null_mut(),
          tag: PurgeTag::Free as u8,
          vm: false,
          #[cfg(feature = "id-check")]
          id: 0,
        },
      );
    }
    zone_log!("zone heap initialized: {size} byte pool at {pool:p}");

    ZoneHeap {
      pool,
      mapped,
      zone,
      rover: zone,
      blockbytag: vec![null_mut(); NUM_TAGS].into_boxed_slice(),
      objects: ObjectRegistry::new(),
      config,
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

  /// True if `ptr` points into the mapped pool (as opposed to an overflow
  /// block).
  pub fn contains(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    let base = self.pool as usize;
    addr >= base && addr < base + self.mapped
  }

  /// Reclaimable pool bytes: free blocks plus purgeable blocks.
  pub fn free_memory(&self) -> usize {
    let mut total = 0;
    unsafe {
      let mut block = self.zone;
      loop {
        if (*block).tag == PurgeTag::Free as u8 || (*block).tag >= PURGE_LEVEL as u8 {
          total += (*block).size;
        }
        block = (*block).next;
        if block == self.zone {
          break;
        }
      }
    }
    total
  }

  /// Writes the raw pool to `path` for post-mortem inspection.
  pub fn dump_core(&self, path: &Path) -> io::Result<()> {
    let bytes = unsafe { std::slice::from_raw_parts(self.pool, self.mapped) };
    std::fs::write(path, bytes)
  }

  // ---------------------------------------------------------------------------
  // Internals
  // ---------------------------------------------------------------------------

  /// Stamps a chosen block and hands out its payload.
  unsafe fn finish_alloc(
    &mut self,
    block: *mut MemBlock,
    tag: PurgeTag,
    user: *mut *mut u8,
  ) -> *mut u8 {
    unsafe {
      (*block).tag = tag as u8;
      (*block).user = user;
      #[cfg(feature = "id-check")]
      {
        (*block).id = ZONE_ID;
      }
      let p = payload(block);
      if !user.is_null() {
        *user = p;
      }
      #[cfg(feature = "scramble")]
      ptr::write_bytes(p, SCRAMBLE_BYTE, (*block).size);
      #[cfg(feature = "instrumented")]
      {
        self.memory_by_tag[tag as usize] += (*block).size;
      }
      zone_log!("zone malloc: {:p}, {} bytes, tag {:?}", p, (*block).size, tag);
      p
    }
  }

  /// Pool exhausted: take an overflow block from the system allocator,
  /// evicting the cache tag if even that fails.
  unsafe fn vm_alloc(&mut self, size: usize, tag: PurgeTag, user: *mut *mut u8) -> *mut u8 {
    unsafe {
      let block = loop {
        let p = libc::malloc(size + HEADER_SIZE) as *mut MemBlock;
        if !p.is_null() {
          break p;
        }
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
          prev_slot: null_mut(),
          size,
          user: null_mut(),
          tag: PurgeTag::Free as u8,
          vm: true,
          #[cfg(feature = "id-check")]
          id: 0,
        },
      );
      self.link_vm(block, tag as u8);
      self.finish_alloc(block, tag, user)
    }
  }

  unsafe fn link_vm(&mut self, block: *mut MemBlock, tag: u8) {
    unsafe {
      let head = self.blockbytag.as_mut_ptr().add(tag as usize);
      (*block).next = *head;
      if !(*head).is_null() {
        (**head).prev_slot = &raw mut (*block).next;
      }
      *head = block;
      (*block).prev_slot = head;
    }
  }

  unsafe fn unlink_vm(block: *mut MemBlock) {
    unsafe {
      let next = (*block).next;
      *(*block).prev_slot = next;
      if !next.is_null() {
        (*next).prev_slot = (*block).prev_slot;
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

impl ZoneAlloc for ZoneHeap {
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
    let size = align_up(size, CHUNK_SIZE);

    unsafe {
      // Scan from just before the rover; the block behind it is often free.
      let mut block = self.rover;
      if (*(*block).prev).tag == PurgeTag::Free as u8 {
        block = (*block).prev;
      }
      let mut start = block;

      loop {
        if (*block).tag >= PURGE_LEVEL as u8 {
          // Purge the block we are standing on. Freeing may merge it
          // backwards, so re-derive our position from the block before it.
          start = (*block).prev;
          self.free(payload(block));
          block = if (*start).next == block { (*start).next } else { start };
        }
        if (*block).tag == PurgeTag::Free as u8 && (*block).size >= size {
          let extra = (*block).size - size;
          if extra >= self.config.min_split + HEADER_SIZE {
            let split = (block as *mut u8).add(HEADER_SIZE + size) as *mut MemBlock;
            ptr::write(
              split,
              MemBlock {
                next: (*block).next,
                prev: block,
                prev_slot: null_mut(),
                size: extra - HEADER_SIZE,
                user: null_mut(),
                tag: PurgeTag::Free as u8,
                vm: false,
                #[cfg(feature = "id-check")]
                id: 0,
              },
            );
            (*(*block).next).prev = split;
            (*block).next = split;
            (*block).size = size;
          }
          self.rover = (*block).next;
          return self.finish_alloc(block, tag, user);
        }
        block = (*block).next;
        if block == start {
          break;
        }
      }

      self.vm_alloc(size, tag, user)
    }
  }

  unsafe fn free(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    unsafe {
      let mut block = block_of(ptr);
      #[cfg(feature = "id-check")]
      Self::check_id(block, "zone free: freed");
      if (*block).tag == PurgeTag::Permanent as u8 {
        return;
      }
      if (*block).tag == PurgeTag::Free as u8 || (*block).tag as usize >= NUM_TAGS {
        panic!("zone free: freed a freed or corrupted block");
      }
      #[cfg(feature = "instrumented")]
      {
        self.memory_by_tag[(*block).tag as usize] -= (*block).size;
      }
      #[cfg(feature = "id-check")]
      {
        (*block).id = 0;
      }
      if !(*block).user.is_null() {
        *(*block).user = null_mut();
      }
      #[cfg(feature = "scramble")]
      ptr::write_bytes(ptr, SCRAMBLE_BYTE, (*block).size);
      zone_log!("zone free: {:p}", ptr);

      if (*block).vm {
        Self::unlink_vm(block);
        libc::free(block as *mut libc::c_void);
        return;
      }

      (*block).tag = PurgeTag::Free as u8;
      (*block).user = null_mut();

      // Merge with the previous block. The zone base never merges backwards.
      if block != self.zone {
        let other = (*block).prev;
        if (*other).tag == PurgeTag::Free as u8 {
          if self.rover == block {
            self.rover = other;
          }
          (*other).next = (*block).next;
          (*(*block).next).prev = other;
          (*other).size += (*block).size + HEADER_SIZE;
          block = other;
        }
      }

      // Merge with the next block unless the list wraps to the zone base.
      let other = (*block).next;
      if (*other).tag == PurgeTag::Free as u8 && other != self.zone {
        if self.rover == other {
          self.rover = block;
        }
        (*block).next = (*other).next;
        (*(*other).next).prev = block;
        (*block).size += (*other).size + HEADER_SIZE;
      }
    }
  }

  fn free_tags(&mut self, low: PurgeTag, high: PurgeTag) {
    let (lo, hi) = clamp_tag_range(low, high);
    // Objects go first so their destructors can still read zone memory.
    self.objects.free_tags(low, high);
    zone_log!("zone free_tags: {low:?}..={high:?}");

    unsafe {
      let mut block = self.zone;
      loop {
        let tag = (*block).tag;
        if tag >= lo && tag <= hi && tag != PurgeTag::Permanent as u8 {
          let prev = (*block).prev;
          let cur = block;
          self.free(payload(cur));
          // If the freed block merged backwards we are inside prev now.
          block = if (*prev).next == cur { cur } else { prev };
        }
        block = (*block).next;
        if block == self.zone {
          break;
        }
      }

      // Overflow blocks: detach each list and release it wholesale.
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
      if (*block).vm {
        Self::unlink_vm(block);
        self.link_vm(block, tag as u8);
      }
      (*block).tag = tag as u8;
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

  fn check_heap(&self) {
    unsafe {
      let mut block = self.zone;
      loop {
        let next = (*block).next;
        if next != self.zone {
          if (block as *const u8).add(HEADER_SIZE + (*block).size) != next as *const u8 {
            panic!("zone check_heap: block size does not touch the next block");
          }
          if (*block).tag == PurgeTag::Free as u8 && (*next).tag == PurgeTag::Free as u8 {
            panic!("zone check_heap: two consecutive free blocks");
          }
        }
        if (*next).prev != block {
          panic!("zone check_heap: next block doesn't have proper back link");
        }
        if (*block).tag as usize >= NUM_TAGS {
          panic!("zone check_heap: block with invalid tag");
        }
        block = next;
        if block == self.zone {
          break;
        }
      }
    }
  }

  fn print(&self, path: &Path) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "zone heap: {} bytes mapped at {:p}", self.mapped, self.pool)?;
    unsafe {
      let mut block = self.zone;
      loop {
        writeln!(
          out,
          "{:p}: {{ size: {:8}, tag: {}, user: {:p} }}",
          block,
          (*block).size,
          (*block).tag,
          (*block).user,
        )?;
        if (*block).tag >= PURGE_LEVEL as u8 && (*block).user.is_null() {
          writeln!(out, "  WARNING: purgeable block with no owner")?;
        }
        if (*block).tag as usize >= NUM_TAGS {
          writeln!(out, "  WARNING: invalid tag")?;
        }
        let next = (*block).next;
        if next != self.zone
          && (block as *const u8).add(HEADER_SIZE + (*block).size) != next as *const u8
        {
          writeln!(out, "  WARNING: block size does not touch the next block")?;
        }
        block = next;
        if block == self.zone {
          break;
        }
      }
      for tag in 0..NUM_TAGS {
        let mut block = self.blockbytag[tag];
        if block.is_null() {
          continue;
        }
        writeln!(out, "overflow blocks, tag {tag}:")?;
        while !block.is_null() {
          writeln!(
            out,
            "{:p}: {{ size: {:8}, user: {:p} }}",
            block,
            (*block).size,
            (*block).user,
          )?;
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

impl Drop for ZoneHeap {
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
      os_munmap(self.pool, self.mapped);
    }
  }
}
