//! Intrusive doubly-linked chain node.
//!
//! The node embeds in its owner and carries the back pointer as a
//! pointer-to-slot rather than a pointer-to-node, so removal is O(1) without
//! knowing which chain the node is on, and works for the head element and the
//! interior alike.

use core::ptr::null_mut;

// =============================================================================
// ChainLink
// =============================================================================

/// Intrusive chain node embedded inside `T`.
///
/// A node is either fully unlinked (`next` and `prev` both null) or a member
/// of exactly one chain. `prev` points at the slot holding us: either the
/// chain head or the previous node's `next` field. `data` is scratch storage
/// for the owner; the hash table keeps the unmodulated hash code there so
/// chains can be rebuilt without rehashing keys.
#[repr(C)]
pub struct ChainLink<T> {
  next: *mut ChainLink<T>,
  prev: *mut *mut ChainLink<T>,
  object: *mut T,
  data: u32,
}

impl<T> ChainLink<T> {
  /// A fresh, unlinked node.
  pub const fn new() -> Self {
    ChainLink { next: null_mut(), prev: null_mut(), object: null_mut(), data: 0 }
  }

  /// Links `this` at the head of the chain rooted at `head`, pointing back at
  /// `object`.
  ///
  /// # Safety
  /// `this` must be unlinked, `head` must be a valid chain head slot, and
  /// both must outlive their membership in the chain.
  pub unsafe fn insert(this: *mut Self, object: *mut T, head: *mut *mut ChainLink<T>) {
    unsafe {
      debug_assert!((*this).prev.is_null(), "inserting a node that is already linked");
      (*this).object = object;
      let first = *head;
      (*this).next = first;
      if !first.is_null() {
        (*first).prev = &raw mut (*this).next;
      }
      *head = this;
      (*this).prev = head;
    }
  }

  /// Unlinks `this` from whatever chain it is on. No-op if unlinked.
  ///
  /// # Safety
  /// If linked, the chain (including the head slot `prev` points into) must
  /// still be alive.
  pub unsafe fn remove(this: *mut Self) {
    unsafe {
      if (*this).prev.is_null() {
        return;
      }
      let next = (*this).next;
      *(*this).prev = next;
      if !next.is_null() {
        (*next).prev = (*this).prev;
      }
      (*this).next = null_mut();
      (*this).prev = null_mut();
    }
  }

  /// Address of the `next` slot, usable as an insertion point for appending
  /// after `this`.
  ///
  /// # Safety
  /// `this` must point to a live node.
  #[inline]
  pub(crate) unsafe fn next_slot(this: *mut Self) -> *mut *mut ChainLink<T> {
    unsafe { &raw mut (*this).next }
  }

  #[inline]
  pub fn is_linked(&self) -> bool {
    !self.prev.is_null()
  }

  #[inline]
  pub fn next(&self) -> *mut ChainLink<T> {
    self.next
  }

  #[inline]
  pub fn object(&self) -> *mut T {
    self.object
  }

  #[inline]
  pub fn data(&self) -> u32 {
    self.data
  }

  #[inline]
  pub fn set_data(&mut self, data: u32) {
    self.data = data;
  }
}

impl<T> Default for ChainLink<T> {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Tests
// =============================================================================
