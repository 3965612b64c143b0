//! Property-based tests: random operation sequences against the arena heap
//! and the intrusive hash table, checked against simple models.

use core::ptr::null_mut;
use std::collections::HashSet;

use proptest::prelude::*;
use zoneheap::{Adapter, CaseStrKey, ChainLink, HashTable, HeapConfig, PurgeTag, ZoneAlloc, ZoneHeap, hash};

// =============================================================================
// Arena heap under random alloc/free traffic
// =============================================================================

fn test_config() -> HeapConfig {
  HeapConfig { pool_size: 256 << 10, min_pool_size: 256 << 10, retry_amount: 0, min_split: 64 }
}

proptest! {
  /// Random alloc/free interleavings never corrupt the block list, never
  /// clobber live payloads, and release every byte back on full cleanup.
  #[test]
  fn arena_random_traffic(ops in prop::collection::vec((0u8..3, 1usize..700), 1..200)) {
    let mut heap = ZoneHeap::new(test_config());
    let initial = heap.free_memory();
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
    let mut next_pattern: u8 = 1;

    unsafe {
      for (action, size) in ops {
        match action {
          // allocate and stamp a pattern
          0 | 1 => {
            if live.len() < 48 {
              let p = heap.malloc(size, PurgeTag::Static, null_mut());
              prop_assert!(!p.is_null());
              prop_assert!(heap.contains(p));
              core::ptr::write_bytes(p, next_pattern, size);
              live.push((p, size, next_pattern));
              next_pattern = next_pattern.wrapping_add(1).max(1);
            }
          }
          // free one picked by the size draw
          _ => {
            if !live.is_empty() {
              let (p, len, pat) = live.swap_remove(size % live.len());
              let bytes = core::slice::from_raw_parts(p, len);
              prop_assert!(bytes.iter().all(|&b| b == pat));
              heap.free(p);
            }
          }
        }
      }

      heap.check_heap();
      for (p, len, pat) in &live {
        let bytes = core::slice::from_raw_parts(*p, *len);
        prop_assert!(bytes.iter().all(|b| b == pat));
      }
      for (p, _, _) in live.drain(..) {
        heap.free(p);
      }
      heap.check_heap();
      prop_assert_eq!(heap.free_memory(), initial);
    }
  }

  /// block_size never under-reports and check_tag always round-trips.
  #[test]
  fn arena_header_queries(sizes in prop::collection::vec(1usize..2000, 1..40)) {
    let mut heap = ZoneHeap::new(test_config());
    unsafe {
      let mut blocks = Vec::new();
      for (i, size) in sizes.iter().copied().enumerate() {
        let tag = if i % 2 == 0 { PurgeTag::Static } else { PurgeTag::Level };
        let p = heap.malloc(size, tag, null_mut());
        prop_assert!(heap.block_size(p) >= size);
        prop_assert_eq!(heap.check_tag(p), tag);
        blocks.push(p);
      }
      for p in blocks {
        heap.free(p);
      }
    }
  }
}

// =============================================================================
// Hash table against a set model
// =============================================================================

struct Entry {
  link: ChainLink<Entry>,
  key: String,
  in_table: bool,
}

struct ByKey;

impl Adapter for ByKey {
  type Item = Entry;
  type Key = CaseStrKey;

  unsafe fn link(item: *mut Entry) -> *mut ChainLink<Entry> {
    unsafe { &raw mut (*item).link }
  }

  unsafe fn key<'a>(item: *const Entry) -> &'a str {
    unsafe { &(*item).key }
  }
}

proptest! {
  /// Membership matches a HashSet model across adds, removes and rebuilds.
  #[test]
  fn hash_table_matches_set_model(
    ops in prop::collection::vec((0u8..3, 0usize..24), 1..150),
  ) {
    let mut entries: Vec<Box<Entry>> = (0..24)
      .map(|i| Box::new(Entry { link: ChainLink::new(), key: format!("key{i}"), in_table: false }))
      .collect();
    let mut table: HashTable<ByKey> = HashTable::new(7);
    let mut model: HashSet<usize> = HashSet::new();

    unsafe {
      for (action, idx) in ops {
        match action {
          0 => {
            if !entries[idx].in_table {
              table.add(&mut *entries[idx]);
              entries[idx].in_table = true;
              model.insert(idx);
            }
          }
          1 => {
            if entries[idx].in_table {
              let p: *mut Entry = &mut *entries[idx];
              table.remove(p);
              entries[idx].in_table = false;
              model.remove(&idx);
            }
          }
          _ => {
            if let Some(next) = hash::next_chain_size(table.num_chains()) {
              if table.load_factor() > 1.0 {
                table.rebuild(next);
              }
            }
          }
        }

        prop_assert_eq!(table.num_items(), model.len());
        for i in 0..entries.len() {
          let hit = table.find(&format!("key{i}"));
          prop_assert_eq!(!hit.is_null(), model.contains(&i));
        }
      }
      drop(table);
    }
  }
}

// =============================================================================
// Staged growth
// =============================================================================

#[test]
fn rebuild_keeps_object_identity() {
  // 20 keys over 8 chains (load 2.5), rebuilt to 64: every key still
  // resolves to the same object pointer, and the load drops to 0.3125.
  let mut entries: Vec<Box<Entry>> = (0..20)
    .map(|i| Box::new(Entry { link: ChainLink::new(), key: format!("thing{i}"), in_table: true }))
    .collect();
  let mut table: HashTable<ByKey> = HashTable::new(8);

  unsafe {
    let mut originals = Vec::new();
    for e in entries.iter_mut() {
      let p: *mut Entry = &mut **e;
      table.add(p);
      originals.push(p);
    }
    assert_eq!(table.num_items(), 20);
    assert!((table.load_factor() - 2.5).abs() < 1e-6);

    table.rebuild(64);

    assert_eq!(table.num_items(), 20);
    assert!((table.load_factor() - 0.3125).abs() < 1e-6);
    for (e, p) in entries.iter().zip(originals) {
      assert_eq!(table.find(&e.key), p);
    }
  }
}

#[test]
fn thousand_keys_through_the_prime_ladder() {
  let mut entries: Vec<Box<Entry>> = (0..1000)
    .map(|i| Box::new(Entry { link: ChainLink::new(), key: format!("lump{i:04}"), in_table: true }))
    .collect();
  let mut table: HashTable<ByKey> = HashTable::new(hash::CHAIN_PRIMES[0]);

  unsafe {
    for e in entries.iter_mut() {
      table.add(&mut **e);
      while table.load_factor() > 0.667 {
        match hash::next_chain_size(table.num_chains()) {
          Some(next) => table.rebuild(next),
          None => break,
        }
      }
    }

    assert_eq!(table.num_items(), 1000);
    assert!(table.load_factor() <= 0.667);
    assert_eq!(table.num_chains(), 1543);
    for e in entries.iter() {
      assert!(!table.find(&e.key).is_null());
    }
  }
  drop(table);
}
