//! Registry tying owned Rust values into the tag lifecycle.
//!
//! A registered value lives until its tag range is swept (or it is explicitly
//! unregistered), at which point it is dropped like any other owned value.
//! Both heap backends embed a registry and sweep it before releasing raw
//! blocks, so object destructors can still look at zone memory they
//! reference.

use core::{any::Any, marker::PhantomData, ptr::null_mut};

use crate::{
  tag::{NUM_TAGS, PurgeTag, clamp_tag_range},
  zone_log,
};

// =============================================================================
// Nodes and handles
// =============================================================================

struct ObjNode {
  next: *mut ObjNode,
  /// Slot holding us: the tag list head or the previous node's `next`.
  prev: *mut *mut ObjNode,
  tag: u8,
  value: Box<dyn Any>,
}

/// Typed handle to a registered object. Copyable; does not keep the object
/// alive. A handle dangles once its object is swept or unregistered, and
/// using it afterwards is undefined, exactly like a raw zone pointer after
/// its tag range is freed.
pub struct ObjectHandle<T> {
  node: *mut ObjNode,
  _marker: PhantomData<*mut T>,
}

impl<T> Clone for ObjectHandle<T> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<T> Copy for ObjectHandle<T> {}

impl<T: 'static> ObjectHandle<T> {
  /// Borrows the registered value.
  ///
  /// # Safety
  /// The object must not have been swept or unregistered, and the borrow must
  /// end before any operation that could drop it.
  pub unsafe fn get<'a>(self) -> &'a T {
    unsafe {
      match (*self.node).value.downcast_ref::<T>() {
        Some(v) => v,
        None => panic!("object handle type mismatch"),
      }
    }
  }

  /// Mutably borrows the registered value.
  ///
  /// # Safety
  /// As [`get`](Self::get), and the borrow must be unique.
  pub unsafe fn get_mut<'a>(self) -> &'a mut T {
    unsafe {
      match (*self.node).value.downcast_mut::<T>() {
        Some(v) => v,
        None => panic!("object handle type mismatch"),
      }
    }
  }

  /// Current tag of the object.
  ///
  /// # Safety
  /// The object must not have been swept or unregistered.
  pub unsafe fn tag(self) -> PurgeTag {
    unsafe { PurgeTag::ALL[(*self.node).tag as usize] }
  }
}

// =============================================================================
// ObjectRegistry
// =============================================================================

/// Per-heap registry of tag-scoped objects, one intrusive list per tag.
pub struct ObjectRegistry {
  // Boxed so list back pointers survive moves of the registry.
  by_tag: Box<[*mut ObjNode]>,
}

impl ObjectRegistry {
  pub fn new() -> ObjectRegistry {
    ObjectRegistry { by_tag: vec![null_mut(); NUM_TAGS].into_boxed_slice() }
  }

  unsafe fn link(&mut self, node: *mut ObjNode, tag: u8) {
    unsafe {
      let head = self.by_tag.as_mut_ptr().add(tag as usize);
      (*node).next = *head;
      if !(*head).is_null() {
        (**head).prev = &raw mut (*node).next;
      }
      *head = node;
      (*node).prev = head;
      (*node).tag = tag;
    }
  }

  unsafe fn unlink(node: *mut ObjNode) {
    unsafe {
      let next = (*node).next;
      *(*node).prev = next;
      if !next.is_null() {
        (*next).prev = (*node).prev;
      }
    }
  }

  /// Registers `value` under `tag` and hands back a typed handle.
  /// [`PurgeTag::Free`] is not a valid object tag.
  pub fn register<T: 'static>(&mut self, value: T, tag: PurgeTag) -> ObjectHandle<T> {
    assert!(tag != PurgeTag::Free, "objects cannot be registered on the free tag");
    let node = Box::into_raw(Box::new(ObjNode {
      next: null_mut(),
      prev: null_mut(),
      tag: tag as u8,
      value: Box::new(value),
    }));
    unsafe { self.link(node, tag as u8) };
    zone_log!("object registered: {:p} tag {:?}", node, tag);
    ObjectHandle { node, _marker: PhantomData }
  }

  /// Moves an object to another tag list. No-op on [`PurgeTag::Permanent`]
  /// objects; [`PurgeTag::Free`] is rejected.
  ///
  /// # Safety
  /// The handle must still be live in this registry.
  pub unsafe fn change_tag<T>(&mut self, handle: ObjectHandle<T>, tag: PurgeTag) {
    assert!(tag != PurgeTag::Free, "objects cannot be retagged free");
    let node = handle.node;
    unsafe {
      if (*node).tag == PurgeTag::Permanent as u8 {
        return;
      }
      Self::unlink(node);
      self.link(node, tag as u8);
    }
  }

  /// Removes an object from the registry and returns ownership of its value.
  ///
  /// # Safety
  /// The handle must still be live in this registry.
  pub unsafe fn unregister<T: 'static>(&mut self, handle: ObjectHandle<T>) -> Box<T> {
    unsafe {
      Self::unlink(handle.node);
      let node = Box::from_raw(handle.node);
      match node.value.downcast::<T>() {
        Ok(v) => v,
        Err(_) => panic!("object handle type mismatch"),
      }
    }
  }

  /// Drops every object whose tag falls in `low..=high`. The range is
  /// clamped to freeable tags and [`PurgeTag::Permanent`] objects are kept.
  pub fn free_tags(&mut self, low: PurgeTag, high: PurgeTag) {
    let (lo, hi) = clamp_tag_range(low, high);
    for tag in lo..=hi {
      if tag == PurgeTag::Permanent as u8 {
        continue;
      }
      self.drop_list(tag as usize);
    }
  }

  fn drop_list(&mut self, idx: usize) {
    let mut node = self.by_tag[idx];
    self.by_tag[idx] = null_mut();
    while !node.is_null() {
      unsafe {
        let next = (*node).next;
        zone_log!("object swept: {:p}", node);
        drop(Box::from_raw(node));
        node = next;
      }
    }
  }

  /// Drops everything, [`PurgeTag::Permanent`] included. Teardown path.
  pub(crate) fn drain_all(&mut self) {
    for idx in 0..NUM_TAGS {
      self.drop_list(idx);
    }
  }

  /// True if `handle`'s object is still registered. Walks every tag list,
  /// comparing node addresses only, so it is safe to ask about a swept
  /// handle; use it as a diagnostic rather than a hot-path check.
  pub fn is_live<T>(&self, handle: ObjectHandle<T>) -> bool {
    for idx in 0..NUM_TAGS {
      let mut node = self.by_tag[idx];
      while !node.is_null() {
        if node == handle.node {
          return true;
        }
        node = unsafe { (*node).next };
      }
    }
    false
  }

  /// Number of live objects under `tag`.
  pub fn count_for_tag(&self, tag: PurgeTag) -> usize {
    let mut n = 0;
    let mut node = self.by_tag[tag as usize];
    while !node.is_null() {
      n += 1;
      node = unsafe { (*node).next };
    }
    n
  }
}

impl Default for ObjectRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for ObjectRegistry {
  fn drop(&mut self) {
    self.drain_all();
  }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use std::{cell::Cell, rc::Rc};

  struct Tracked {
    drops: Rc<Cell<usize>>,
    value: i32,
  }

  impl Drop for Tracked {
    fn drop(&mut self) {
      self.drops.set(self.drops.get() + 1);
    }
  }

  #[test]
  fn sweep_runs_destructors_for_range_only() {
    let drops = Rc::new(Cell::new(0));
    let mut reg = ObjectRegistry::new();
    let keep = reg.register(Tracked { drops: drops.clone(), value: 1 }, PurgeTag::Static);
    let _gone_a = reg.register(Tracked { drops: drops.clone(), value: 2 }, PurgeTag::Level);
    let _gone_b = reg.register(Tracked { drops: drops.clone(), value: 3 }, PurgeTag::Cache);

    reg.free_tags(PurgeTag::Level, PurgeTag::Cache);
    assert_eq!(drops.get(), 2);
    assert_eq!(reg.count_for_tag(PurgeTag::Level), 0);
    assert_eq!(reg.count_for_tag(PurgeTag::Cache), 0);
    assert_eq!(unsafe { keep.get() }.value, 1);

    drop(reg);
    assert_eq!(drops.get(), 3);
  }

  #[test]
  fn permanent_objects_survive_sweeps() {
    let drops = Rc::new(Cell::new(0));
    let mut reg = ObjectRegistry::new();
    let perm = reg.register(Tracked { drops: drops.clone(), value: 7 }, PurgeTag::Permanent);

    reg.free_tags(PurgeTag::Free, PurgeTag::Cache);
    assert_eq!(drops.get(), 0);
    assert_eq!(unsafe { perm.get() }.value, 7);

    // retag is a silent no-op too
    unsafe { reg.change_tag(perm, PurgeTag::Cache) };
    reg.free_tags(PurgeTag::Cache, PurgeTag::Cache);
    assert_eq!(drops.get(), 0);
  }

  #[test]
  fn change_tag_moves_between_sweeps() {
    let drops = Rc::new(Cell::new(0));
    let mut reg = ObjectRegistry::new();
    let h = reg.register(Tracked { drops: drops.clone(), value: 4 }, PurgeTag::Level);

    unsafe { reg.change_tag(h, PurgeTag::Static) };
    reg.free_tags(PurgeTag::Level, PurgeTag::Level);
    assert_eq!(drops.get(), 0);
    assert_eq!(unsafe { h.tag() }, PurgeTag::Static);

    reg.free_tags(PurgeTag::Static, PurgeTag::Static);
    assert_eq!(drops.get(), 1);
  }

  #[test]
  fn unregister_returns_ownership() {
    let drops = Rc::new(Cell::new(0));
    let mut reg = ObjectRegistry::new();
    let h = reg.register(Tracked { drops: drops.clone(), value: 9 }, PurgeTag::Static);
    assert!(reg.is_live(h));

    let boxed = unsafe { reg.unregister(h) };
    assert!(!reg.is_live(h));
    assert_eq!(boxed.value, 9);
    assert_eq!(drops.get(), 0);
    assert_eq!(reg.count_for_tag(PurgeTag::Static), 0);
    drop(boxed);
    assert_eq!(drops.get(), 1);
  }

  #[test]
  fn get_mut_mutates_in_place() {
    let mut reg = ObjectRegistry::new();
    let h = reg.register(vec![1, 2, 3], PurgeTag::Static);
    unsafe { h.get_mut() }.push(4);
    assert_eq!(unsafe { h.get() }.len(), 4);
  }
}
