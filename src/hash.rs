//! Generic intrusive chained hash table.
//!
//! The table stores no objects; it threads [`ChainLink`] nodes that live
//! inside the objects themselves. An [`Adapter`] names the link field and the
//! key field of the item type, so one object can sit in several tables at
//! once through different adapters. Key behavior (hashing and comparison) is
//! a separate [`HashKey`] strategy so tables can be case-sensitive,
//! case-insensitive or integer-keyed without touching the table code.
//!
//! The table never rehashes on its own; callers watch [`HashTable::load_factor`]
//! and call [`HashTable::rebuild`] when it suits them. The unmodulated hash is
//! cached in each link's scratch word, so a rebuild re-buckets without
//! touching the keys.

use core::{marker::PhantomData, mem, ptr::null_mut};

use crate::chain::ChainLink;

// =============================================================================
// Key strategies
// =============================================================================

/// Hashing and equality for a key type.
pub trait HashKey {
  /// The borrowed form keys are passed around as.
  type Borrowed: ?Sized;

  /// Unmodulated hash code.
  fn hash_code(key: &Self::Borrowed) -> u32;

  /// Key equality under this strategy.
  fn matches(a: &Self::Borrowed, b: &Self::Borrowed) -> bool;
}

/// Case-sensitive string keys.
pub struct CaseStrKey;

/// Case-insensitive (ASCII) string keys.
pub struct NoCaseStrKey;

/// Integer keys, hashed by identity.
pub struct IntKey;

impl HashKey for CaseStrKey {
  type Borrowed = str;

  fn hash_code(key: &str) -> u32 {
    let mut h: u32 = 0;
    for b in key.bytes() {
      h = h.wrapping_mul(5).wrapping_add(b as u32);
    }
    h
  }

  fn matches(a: &str, b: &str) -> bool {
    a == b
  }
}

impl HashKey for NoCaseStrKey {
  type Borrowed = str;

  fn hash_code(key: &str) -> u32 {
    let mut h: u32 = 0;
    for b in key.bytes() {
      h = h.wrapping_mul(5).wrapping_add(b.to_ascii_uppercase() as u32);
    }
    h
  }

  fn matches(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
  }
}

impl HashKey for IntKey {
  type Borrowed = u32;

  fn hash_code(key: &u32) -> u32 {
    *key
  }

  fn matches(a: &u32, b: &u32) -> bool {
    a == b
  }
}

// =============================================================================
// Adapter
// =============================================================================

/// Names the intrusive link and the key of an item type.
///
/// Implemented per (item, link field) pair. Items that belong to two tables
/// simultaneously get two adapters, one per embedded link.
pub trait Adapter {
  type Item;
  type Key: HashKey;

  /// Address of the embedded link inside `item`.
  ///
  /// # Safety
  /// `item` must point to a live item.
  unsafe fn link(item: *mut Self::Item) -> *mut ChainLink<Self::Item>;

  /// Borrow of the item's key.
  ///
  /// # Safety
  /// `item` must point to a live item, and the returned borrow must not
  /// outlive it.
  unsafe fn key<'a>(item: *const Self::Item) -> &'a <Self::Key as HashKey>::Borrowed;
}

type Borrowed<A> = <<A as Adapter>::Key as HashKey>::Borrowed;

// =============================================================================
// Chain size ladder
// =============================================================================

/// Prime chain counts for staged growth.
pub const CHAIN_PRIMES: [usize; 12] =
  [53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317];

/// Smallest prime in the ladder above `current`, or `None` once the ladder
/// is exhausted.
pub fn next_chain_size(current: usize) -> Option<usize> {
  CHAIN_PRIMES.iter().copied().find(|&p| p > current)
}

// =============================================================================
// HashTable
// =============================================================================

/// Intrusive chained hash table over items described by `A`.
///
/// The table does not own its items; adding and removing only links and
/// unlinks the embedded node. Dropping the table unlinks every remaining item
/// so no link is left dangling into the freed chain array.
pub struct HashTable<A: Adapter> {
  chains: Box<[*mut ChainLink<A::Item>]>,
  num_items: usize,
  load_factor: f32,
  _marker: PhantomData<A>,
}

impl<A: Adapter> HashTable<A> {
  /// Creates a table with `num_chains` buckets.
  pub fn new(num_chains: usize) -> Self {
    assert!(num_chains >= 1, "hash table needs at least one chain");
    HashTable {
      chains: vec![null_mut(); num_chains].into_boxed_slice(),
      num_items: 0,
      load_factor: 0.0,
      _marker: PhantomData,
    }
  }

  #[inline]
  pub fn num_items(&self) -> usize {
    self.num_items
  }

  #[inline]
  pub fn num_chains(&self) -> usize {
    self.chains.len()
  }

  /// Items per chain. Callers use this to decide when to [`rebuild`](Self::rebuild).
  #[inline]
  pub fn load_factor(&self) -> f32 {
    self.load_factor
  }

  fn calc_load_factor(&mut self) {
    self.load_factor = self.num_items as f32 / self.chains.len() as f32;
  }

  unsafe fn link_in(&mut self, object: *mut A::Item, unmod_hc: u32) {
    unsafe {
      let link = A::link(object);
      (*link).set_data(unmod_hc);
      let idx = unmod_hc as usize % self.chains.len();
      ChainLink::insert(link, object, self.chains.as_mut_ptr().add(idx));
    }
  }

  /// Adds `object`, hashing its key.
  ///
  /// # Safety
  /// `object` must be live, its link unlinked, and it must stay put (and
  /// alive) until removed.
  pub unsafe fn add(&mut self, object: *mut A::Item) {
    unsafe {
      let hc = A::Key::hash_code(A::key(object));
      self.add_with_code(object, hc);
    }
  }

  /// Adds `object` under a precomputed unmodulated hash code.
  ///
  /// # Safety
  /// As [`add`](Self::add); `unmod_hc` must equal the hash of the object's key.
  pub unsafe fn add_with_code(&mut self, object: *mut A::Item, unmod_hc: u32) {
    unsafe { self.link_in(object, unmod_hc) };
    self.num_items += 1;
    self.calc_load_factor();
  }

  /// Adds `object` without bumping the item count. For callers that manage
  /// counts across several tables themselves.
  ///
  /// # Safety
  /// As [`add`](Self::add).
  pub unsafe fn add_no_count(&mut self, object: *mut A::Item) {
    unsafe {
      let hc = A::Key::hash_code(A::key(object));
      self.link_in(object, hc);
    }
  }

  /// Unlinks `object` from the table.
  ///
  /// # Safety
  /// `object` must be live and currently linked in this table.
  pub unsafe fn remove(&mut self, object: *mut A::Item) {
    unsafe { ChainLink::remove(A::link(object)) };
    debug_assert!(self.num_items > 0);
    self.num_items -= 1;
    self.calc_load_factor();
  }

  /// Unlinks `object` without touching the item count.
  ///
  /// # Safety
  /// As [`remove`](Self::remove).
  pub unsafe fn remove_no_count(&mut self, object: *mut A::Item) {
    unsafe { ChainLink::remove(A::link(object)) };
  }

  /// First item matching `key`, or null.
  ///
  /// # Safety
  /// Every linked item must still be live.
  pub unsafe fn find(&self, key: &Borrowed<A>) -> *mut A::Item {
    unsafe { self.find_with_code(key, A::Key::hash_code(key)) }
  }

  /// [`find`](Self::find) with a precomputed unmodulated hash code.
  ///
  /// # Safety
  /// As [`find`](Self::find).
  pub unsafe fn find_with_code(&self, key: &Borrowed<A>, unmod_hc: u32) -> *mut A::Item {
    let mut chain = self.chains[unmod_hc as usize % self.chains.len()];
    unsafe {
      while !chain.is_null() {
        let object = (*chain).object();
        if A::Key::matches(A::key(object), key) {
          return object;
        }
        chain = (*chain).next();
      }
    }
    null_mut()
  }

  /// Iterates every item stored under `key`. Pass null to start, the previous
  /// result to continue; returns null when exhausted. Items sharing a key are
  /// visited in reverse insertion order.
  ///
  /// # Safety
  /// `prev` must be null or a live item linked in this table.
  pub unsafe fn key_iterator(&self, prev: *mut A::Item, key: &Borrowed<A>) -> *mut A::Item {
    unsafe {
      if prev.is_null() {
        return self.find(key);
      }
      let mut chain = (*A::link(prev)).next();
      while !chain.is_null() {
        let object = (*chain).object();
        if A::Key::matches(A::key(object), key) {
          return object;
        }
        chain = (*chain).next();
      }
      null_mut()
    }
  }

  /// Iterates every item in the table in unspecified order. Same protocol as
  /// [`key_iterator`](Self::key_iterator).
  ///
  /// # Safety
  /// `prev` must be null or a live item linked in this table.
  pub unsafe fn table_iterator(&self, prev: *mut A::Item) -> *mut A::Item {
    let n = self.chains.len();
    let mut start = 0;
    unsafe {
      if !prev.is_null() {
        let link = A::link(prev);
        let next = (*link).next();
        if !next.is_null() {
          return (*next).object();
        }
        start = (*link).data() as usize % n + 1;
      }
      for idx in start..n {
        let head = self.chains[idx];
        if !head.is_null() {
          return (*head).object();
        }
      }
    }
    null_mut()
  }

  /// Head of the chain `key` hashes to. Raw access for callers that walk
  /// chains themselves; entries for other keys share the chain.
  pub fn chain_for_key(&self, key: &Borrowed<A>) -> *mut ChainLink<A::Item> {
    self.chains[A::Key::hash_code(key) as usize % self.chains.len()]
  }

  /// Next link on the same chain.
  ///
  /// # Safety
  /// `link` must be a live link in this table.
  pub unsafe fn next_on_chain(&self, link: *mut ChainLink<A::Item>) -> *mut ChainLink<A::Item> {
    unsafe { (*link).next() }
  }

  /// Re-buckets every item into `new_num_chains` chains, preserving the item
  /// count and relative key order. Uses the hash codes cached in the links,
  /// so keys are not rehashed.
  ///
  /// # Safety
  /// Every linked item must still be live.
  pub unsafe fn rebuild(&mut self, new_num_chains: usize) {
    assert!(new_num_chains >= 1, "hash table needs at least one chain");
    let old = mem::replace(&mut self.chains, vec![null_mut(); new_num_chains].into_boxed_slice());
    // Tail slot per new chain, so relinking appends instead of prepending and
    // chain-relative order survives the rebuild.
    let mut tails: Vec<*mut ChainLink<A::Item>> = vec![null_mut(); new_num_chains];
    for idx in 0..old.len() {
      while !old[idx].is_null() {
        let link = old[idx];
        unsafe {
          let object = (*link).object();
          ChainLink::remove(link);
          let new_idx = (*link).data() as usize % new_num_chains;
          let slot = if tails[new_idx].is_null() {
            self.chains.as_mut_ptr().add(new_idx)
          } else {
            ChainLink::next_slot(tails[new_idx])
          };
          ChainLink::insert(link, object, slot);
          tails[new_idx] = link;
        }
      }
    }
    self.calc_load_factor();
  }

  /// Unlinks everything and resets the count.
  pub fn clear(&mut self) {
    for idx in 0..self.chains.len() {
      while !self.chains[idx].is_null() {
        unsafe { ChainLink::remove(self.chains[idx]) };
      }
    }
    self.num_items = 0;
    self.load_factor = 0.0;
  }
}

impl<A: Adapter> Drop for HashTable<A> {
  fn drop(&mut self) {
    // Leave no link pointing into the freed chain array.
    self.clear();
  }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  struct Widget {
    link: ChainLink<Widget>,
    name: &'static str,
    serial: u32,
  }

  impl Widget {
    fn new(name: &'static str, serial: u32) -> Box<Widget> {
      Box::new(Widget { link: ChainLink::new(), name, serial })
    }
  }

  struct ByName;

  impl Adapter for ByName {
    type Item = Widget;
    type Key = NoCaseStrKey;

    unsafe fn link(item: *mut Widget) -> *mut ChainLink<Widget> {
      unsafe { &raw mut (*item).link }
    }

    unsafe fn key<'a>(item: *const Widget) -> &'a str {
      unsafe { (*item).name }
    }
  }

  #[test]
  fn add_find_remove_round_trip() {
    let mut widgets = vec![
      Widget::new("chaingun", 1),
      Widget::new("plasma", 2),
      Widget::new("rocket", 3),
    ];
    let mut table: HashTable<ByName> = HashTable::new(7);
    for w in widgets.iter_mut() {
      unsafe { table.add(&mut **w) };
    }
    assert_eq!(table.num_items(), 3);

    unsafe {
      let hit = table.find("Plasma"); // case-insensitive key strategy
      assert!(!hit.is_null());
      assert_eq!((*hit).serial, 2);

      assert!(table.find("bfg").is_null());

      table.remove(hit);
      assert!(table.find("plasma").is_null());
    }
    assert_eq!(table.num_items(), 2);
  }

  #[test]
  fn multi_value_key_iteration() {
    let mut widgets: Vec<Box<Widget>> =
      (0..4).map(|i| Widget::new("shell", i)).collect();
    widgets.push(Widget::new("clip", 99));
    let mut table: HashTable<ByName> = HashTable::new(3);
    for w in widgets.iter_mut() {
      unsafe { table.add(&mut **w) };
    }

    let mut serials = Vec::new();
    unsafe {
      let mut cur = table.key_iterator(null_mut(), "shell");
      while !cur.is_null() {
        serials.push((*cur).serial);
        cur = table.key_iterator(cur, "shell");
      }
    }
    // reverse insertion order, and the unrelated key is never visited
    assert_eq!(serials, vec![3, 2, 1, 0]);

    // the raw chain walk sees at least as much as the key iterator
    let mut on_chain = 0;
    unsafe {
      let mut link = table.chain_for_key("shell");
      while !link.is_null() {
        on_chain += 1;
        link = table.next_on_chain(link);
      }
    }
    assert!(on_chain >= 4);
  }

  #[test]
  fn table_iterator_visits_everything_once() {
    let names = ["a", "b", "c", "d", "e", "f", "g"];
    let mut widgets: Vec<Box<Widget>> =
      names.iter().enumerate().map(|(i, n)| Widget::new(*n, i as u32)).collect();
    let mut table: HashTable<ByName> = HashTable::new(5);
    for w in widgets.iter_mut() {
      unsafe { table.add(&mut **w) };
    }

    let mut seen = Vec::new();
    unsafe {
      let mut cur = table.table_iterator(null_mut());
      while !cur.is_null() {
        seen.push((*cur).serial);
        cur = table.table_iterator(cur);
      }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6]);
  }

  #[test]
  fn rebuild_preserves_items_and_lookup() {
    let names = ["alpha", "beta", "gamma", "delta", "epsilon"];
    let mut widgets: Vec<Box<Widget>> =
      names.iter().enumerate().map(|(i, n)| Widget::new(*n, i as u32)).collect();
    let mut table: HashTable<ByName> = HashTable::new(2);
    for w in widgets.iter_mut() {
      unsafe { table.add(&mut **w) };
    }
    assert!(table.load_factor() > 1.0);

    unsafe { table.rebuild(53) };

    assert_eq!(table.num_items(), 5);
    assert!(table.load_factor() < 1.0);
    unsafe {
      for (i, n) in names.iter().enumerate() {
        let hit = table.find(n);
        assert!(!hit.is_null());
        assert_eq!((*hit).serial, i as u32);
      }
    }
  }

  #[test]
  fn rebuild_keeps_duplicate_key_order() {
    // duplicate keys all land on one chain, so the rebuild has to append
    // through the tail slot instead of prepending
    let mut widgets: Vec<Box<Widget>> =
      (0..6).map(|i| Widget::new("cell", i)).collect();
    let mut table: HashTable<ByName> = HashTable::new(3);
    for w in widgets.iter_mut() {
      unsafe { table.add(&mut **w) };
    }

    unsafe { table.rebuild(7) };

    let mut serials = Vec::new();
    unsafe {
      let mut cur = table.key_iterator(null_mut(), "cell");
      while !cur.is_null() {
        serials.push((*cur).serial);
        cur = table.key_iterator(cur, "cell");
      }
    }
    assert_eq!(serials, vec![5, 4, 3, 2, 1, 0]);
  }

  struct Numbered {
    link: ChainLink<Numbered>,
    id: u32,
    payload: &'static str,
  }

  struct ById;

  impl Adapter for ById {
    type Item = Numbered;
    type Key = IntKey;

    unsafe fn link(item: *mut Numbered) -> *mut ChainLink<Numbered> {
      unsafe { &raw mut (*item).link }
    }

    unsafe fn key<'a>(item: *const Numbered) -> &'a u32 {
      unsafe { &(*item).id }
    }
  }

  #[test]
  fn integer_keys() {
    let mut items = vec![
      Box::new(Numbered { link: ChainLink::new(), id: 10, payload: "ten" }),
      Box::new(Numbered { link: ChainLink::new(), id: 23, payload: "collider" }),
    ];
    let mut table: HashTable<ById> = HashTable::new(13);
    for item in items.iter_mut() {
      unsafe { table.add(&mut **item) };
    }
    unsafe {
      // 10 and 23 share a chain of 13 but are distinct keys
      let hit = table.find(&10);
      assert_eq!((*hit).payload, "ten");
      let hit = table.find(&23);
      assert_eq!((*hit).payload, "collider");
      assert!(table.find(&11).is_null());
    }
  }

  #[test]
  fn chain_size_ladder() {
    assert_eq!(next_chain_size(53), Some(97));
    assert_eq!(next_chain_size(96), Some(97));
    assert_eq!(next_chain_size(98317), None);
  }
}
