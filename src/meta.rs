//! MetaTable: a property store indexed by key and by type simultaneously.
//!
//! Every record is a [`MetaObject`] carrying two intrusive links, one per
//! index, so the same record can be looked up by key, by type name, or by
//! both at once. Keys are not unique; adding under an existing key shadows
//! rather than replaces, and iteration walks all records for a key in
//! most-recently-added order.
//!
//! Lookup failures are reported through a per-table error cell rather than a
//! sentinel return, mirrored by [`MetaTable::last_error`].

use core::{cell::Cell, fmt, ptr::null_mut};
use std::any::Any;

use crate::{
  chain::ChainLink,
  hash::{self, Adapter, CaseStrKey, HashTable},
};

// =============================================================================
// Constants
// =============================================================================

/// Initial chain count of the key index.
const META_NUM_CHAINS: usize = 53;
/// Initial chain count of the type index.
const META_NUM_TYPE_CHAINS: usize = 31;
/// Load factor beyond which an index is rebuilt to the next prime size.
const META_LOAD_FACTOR: f32 = 0.667;

/// Built-in type names.
pub const TYPE_INT: &str = "int";
pub const TYPE_DOUBLE: &str = "double";
pub const TYPE_STRING: &str = "string";
pub const TYPE_CONST_STRING: &str = "conststring";
pub const TYPE_TABLE: &str = "table";

// =============================================================================
// Errors
// =============================================================================

/// Outcome discriminator for the most recent table operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MetaError {
  #[default]
  NoError,
  /// No record under the requested key (and type, if one was given).
  NoSuchObject,
  /// The requested type name has not been registered.
  NoSuchType,
}

// =============================================================================
// Custom type registry
// =============================================================================

/// Behavior for values stored as [`MetaValue::Custom`]. Registered per table
/// with [`MetaTable::register_type`] so copies and printing work without the
/// table knowing the concrete type.
pub struct MetaTypeOps {
  pub name: &'static str,
  pub clone_value: fn(&dyn Any) -> Box<dyn Any>,
  pub to_string: fn(&dyn Any) -> String,
}

// =============================================================================
// MetaObject
// =============================================================================

/// The payload of a record.
pub enum MetaValue {
  Int(i32),
  Double(f64),
  String(String),
  ConstString(&'static str),
  Table(Box<MetaTable>),
  Custom { ops: &'static MetaTypeOps, value: Box<dyn Any> },
}

/// One record: a key, a type name and a value, linked into both indices.
pub struct MetaObject {
  key_link: ChainLink<MetaObject>,
  type_link: ChainLink<MetaObject>,
  key: Box<str>,
  type_name: &'static str,
  value: MetaValue,
}

impl MetaObject {
  fn boxed(key: &str, type_name: &'static str, value: MetaValue) -> Box<MetaObject> {
    Box::new(MetaObject {
      key_link: ChainLink::new(),
      type_link: ChainLink::new(),
      key: key.into(),
      type_name,
      value,
    })
  }

  #[inline]
  pub fn key(&self) -> &str {
    &self.key
  }

  #[inline]
  pub fn type_name(&self) -> &'static str {
    self.type_name
  }

  #[inline]
  pub fn value(&self) -> &MetaValue {
    &self.value
  }

  #[inline]
  pub fn value_mut(&mut self) -> &mut MetaValue {
    &mut self.value
  }
}

impl fmt::Display for MetaObject {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.value {
      MetaValue::Int(v) => write!(f, "{v}"),
      MetaValue::Double(v) => write!(f, "{v}"),
      MetaValue::String(v) => write!(f, "{v}"),
      MetaValue::ConstString(v) => write!(f, "{v}"),
      MetaValue::Table(t) => write!(f, "(table with {} items)", t.num_items()),
      MetaValue::Custom { ops, value } => write!(f, "{}", (ops.to_string)(value.as_ref())),
    }
  }
}

// =============================================================================
// Index adapters
// =============================================================================

struct KeyIndex;

impl Adapter for KeyIndex {
  type Item = MetaObject;
  type Key = CaseStrKey;

  unsafe fn link(item: *mut MetaObject) -> *mut ChainLink<MetaObject> {
    unsafe { &raw mut (*item).key_link }
  }

  unsafe fn key<'a>(item: *const MetaObject) -> &'a str {
    unsafe { &(*item).key }
  }
}

struct TypeIndex;

impl Adapter for TypeIndex {
  type Item = MetaObject;
  type Key = CaseStrKey;

  unsafe fn link(item: *mut MetaObject) -> *mut ChainLink<MetaObject> {
    unsafe { &raw mut (*item).type_link }
  }

  unsafe fn key<'a>(item: *const MetaObject) -> &'a str {
    unsafe { (*item).type_name }
  }
}

// =============================================================================
// MetaTable
// =============================================================================

/// Dual-indexed property table. Owns its records.
pub struct MetaTable {
  by_key: HashTable<KeyIndex>,
  by_type: HashTable<TypeIndex>,
  last_error: Cell<MetaError>,
  custom_types: Vec<&'static MetaTypeOps>,
}

fn rebuild_if_needed<A: Adapter>(table: &mut HashTable<A>) {
  if table.load_factor() > META_LOAD_FACTOR
    && let Some(next) = hash::next_chain_size(table.num_chains())
  {
    unsafe { table.rebuild(next) };
  }
}

impl MetaTable {
  pub fn new() -> MetaTable {
    MetaTable {
      by_key: HashTable::new(META_NUM_CHAINS),
      by_type: HashTable::new(META_NUM_TYPE_CHAINS),
      last_error: Cell::new(MetaError::NoError),
      custom_types: Vec::new(),
    }
  }

  /// Error state of the most recent operation.
  #[inline]
  pub fn last_error(&self) -> MetaError {
    self.last_error.get()
  }

  #[inline]
  pub fn num_items(&self) -> usize {
    self.by_key.num_items()
  }

  // ---------------------------------------------------------------------------
  // Untyped object access
  // ---------------------------------------------------------------------------

  fn add_boxed(&mut self, object: Box<MetaObject>) {
    rebuild_if_needed(&mut self.by_key);
    rebuild_if_needed(&mut self.by_type);
    let p = Box::into_raw(object);
    unsafe {
      self.by_key.add(p);
      self.by_type.add(p);
    }
    self.last_error.set(MetaError::NoError);
  }

  /// Adds a record. The key is copied; duplicate keys shadow rather than
  /// replace.
  pub fn add_object(&mut self, key: &str, type_name: &'static str, value: MetaValue) {
    self.add_boxed(MetaObject::boxed(key, type_name, value));
  }

  /// Unlinks `object` from both indices and takes ownership of it.
  pub fn remove_object(&mut self, object: &MetaObject) -> Box<MetaObject> {
    let p = object as *const MetaObject as *mut MetaObject;
    unsafe {
      self.by_key.remove(p);
      self.by_type.remove(p);
      self.last_error.set(MetaError::NoError);
      Box::from_raw(p)
    }
  }

  fn found(&self, hit: *mut MetaObject) -> Option<&MetaObject> {
    if hit.is_null() {
      self.last_error.set(MetaError::NoSuchObject);
      None
    } else {
      self.last_error.set(MetaError::NoError);
      unsafe { Some(&*hit) }
    }
  }

  /// Most recently added record under `key`.
  pub fn get_object(&self, key: &str) -> Option<&MetaObject> {
    self.found(unsafe { self.by_key.find(key) })
  }

  /// Most recently added record of type `type_name`.
  pub fn get_object_type(&self, type_name: &str) -> Option<&MetaObject> {
    self.found(unsafe { self.by_type.find(type_name) })
  }

  /// Most recently added record matching both `key` and `type_name`.
  pub fn get_object_key_and_type(&self, key: &str, type_name: &str) -> Option<&MetaObject> {
    unsafe {
      let mut hit = self.by_key.find(key);
      while !hit.is_null() && (*hit).type_name != type_name {
        hit = self.by_key.key_iterator(hit, key);
      }
      self.found(hit)
    }
  }

  /// Iterates all records under `key`, newest first. Pass `None` to start.
  pub fn get_next_object<'a>(
    &'a self,
    prev: Option<&'a MetaObject>,
    key: &str,
  ) -> Option<&'a MetaObject> {
    let prev = prev.map_or(null_mut(), |p| p as *const MetaObject as *mut MetaObject);
    self.found(unsafe { self.by_key.key_iterator(prev, key) })
  }

  /// Iterates all records of type `type_name`, newest first.
  pub fn get_next_object_type<'a>(
    &'a self,
    prev: Option<&'a MetaObject>,
    type_name: &str,
  ) -> Option<&'a MetaObject> {
    let prev = prev.map_or(null_mut(), |p| p as *const MetaObject as *mut MetaObject);
    self.found(unsafe { self.by_type.key_iterator(prev, type_name) })
  }

  /// Iterates all records matching both `key` and `type_name`, newest first.
  pub fn get_next_object_key_and_type<'a>(
    &'a self,
    prev: Option<&'a MetaObject>,
    key: &str,
    type_name: &str,
  ) -> Option<&'a MetaObject> {
    let mut cur = prev.map_or(null_mut(), |p| p as *const MetaObject as *mut MetaObject);
    unsafe {
      loop {
        cur = self.by_key.key_iterator(cur, key);
        if cur.is_null() || (*cur).type_name == type_name {
          return self.found(cur);
        }
      }
    }
  }

  /// Iterates every record in unspecified order. Does not touch the error
  /// state, so it can wrap other lookups.
  pub fn table_iterator<'a>(&'a self, prev: Option<&'a MetaObject>) -> Option<&'a MetaObject> {
    let prev = prev.map_or(null_mut(), |p| p as *const MetaObject as *mut MetaObject);
    unsafe { self.by_key.table_iterator(prev).as_ref() }
  }

  pub fn has_key(&self, key: &str) -> bool {
    !unsafe { self.by_key.find(key) }.is_null()
  }

  pub fn has_type(&self, type_name: &str) -> bool {
    !unsafe { self.by_type.find(type_name) }.is_null()
  }

  pub fn has_key_and_type(&self, key: &str, type_name: &str) -> bool {
    unsafe {
      let mut hit = self.by_key.find(key);
      while !hit.is_null() {
        if (*hit).type_name == type_name {
          return true;
        }
        hit = self.by_key.key_iterator(hit, key);
      }
    }
    false
  }

  pub fn count_of_key(&self, key: &str) -> usize {
    let mut n = 0;
    let mut cur = null_mut();
    unsafe {
      loop {
        cur = self.by_key.key_iterator(cur, key);
        if cur.is_null() {
          return n;
        }
        n += 1;
      }
    }
  }

  pub fn count_of_type(&self, type_name: &str) -> usize {
    let mut n = 0;
    let mut cur = null_mut();
    unsafe {
      loop {
        cur = self.by_type.key_iterator(cur, type_name);
        if cur.is_null() {
          return n;
        }
        n += 1;
      }
    }
  }

  pub fn count_of_key_and_type(&self, key: &str, type_name: &str) -> usize {
    let mut n = 0;
    let mut cur = None;
    while let Some(obj) = {
      let next = self.get_next_object_key_and_type(cur, key, type_name);
      self.last_error.set(MetaError::NoError);
      next
    } {
      n += 1;
      cur = Some(obj);
    }
    n
  }

  // ---------------------------------------------------------------------------
  // Typed accessors
  // ---------------------------------------------------------------------------

  pub fn add_int(&mut self, key: &str, value: i32) {
    self.add_object(key, TYPE_INT, MetaValue::Int(value));
  }

  /// Integer under `key`, or `default` if absent (setting the error state).
  pub fn get_int(&self, key: &str, default: i32) -> i32 {
    match self.get_object_key_and_type(key, TYPE_INT).map(MetaObject::value) {
      Some(&MetaValue::Int(v)) => v,
      _ => default,
    }
  }

  /// Overwrites the newest integer under `key`, or adds one.
  pub fn set_int(&mut self, key: &str, value: i32) {
    let hit = unsafe { self.find_mut(key, TYPE_INT) };
    match hit {
      Some(obj) => obj.value = MetaValue::Int(value),
      None => self.add_int(key, value),
    }
    self.last_error.set(MetaError::NoError);
  }

  /// Removes and returns the newest integer under `key`.
  pub fn remove_int(&mut self, key: &str) -> Option<i32> {
    let obj = self.take(key, TYPE_INT)?;
    match obj.value {
      MetaValue::Int(v) => Some(v),
      _ => panic!("stored value does not match its type name"),
    }
  }

  pub fn add_double(&mut self, key: &str, value: f64) {
    self.add_object(key, TYPE_DOUBLE, MetaValue::Double(value));
  }

  pub fn get_double(&self, key: &str, default: f64) -> f64 {
    match self.get_object_key_and_type(key, TYPE_DOUBLE).map(MetaObject::value) {
      Some(&MetaValue::Double(v)) => v,
      _ => default,
    }
  }

  pub fn set_double(&mut self, key: &str, value: f64) {
    let hit = unsafe { self.find_mut(key, TYPE_DOUBLE) };
    match hit {
      Some(obj) => obj.value = MetaValue::Double(value),
      None => self.add_double(key, value),
    }
    self.last_error.set(MetaError::NoError);
  }

  pub fn remove_double(&mut self, key: &str) -> Option<f64> {
    let obj = self.take(key, TYPE_DOUBLE)?;
    match obj.value {
      MetaValue::Double(v) => Some(v),
      _ => panic!("stored value does not match its type name"),
    }
  }

  pub fn add_string(&mut self, key: &str, value: &str) {
    self.add_object(key, TYPE_STRING, MetaValue::String(value.to_owned()));
  }

  pub fn get_string<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
    match self.get_object_key_and_type(key, TYPE_STRING).map(MetaObject::value) {
      Some(MetaValue::String(v)) => v,
      _ => default,
    }
  }

  pub fn set_string(&mut self, key: &str, value: &str) {
    let hit = unsafe { self.find_mut(key, TYPE_STRING) };
    match hit {
      Some(obj) => obj.value = MetaValue::String(value.to_owned()),
      None => self.add_string(key, value),
    }
    self.last_error.set(MetaError::NoError);
  }

  pub fn remove_string(&mut self, key: &str) -> Option<String> {
    let obj = self.take(key, TYPE_STRING)?;
    match obj.value {
      MetaValue::String(v) => Some(v),
      _ => panic!("stored value does not match its type name"),
    }
  }

  pub fn add_const_string(&mut self, key: &str, value: &'static str) {
    self.add_object(key, TYPE_CONST_STRING, MetaValue::ConstString(value));
  }

  pub fn get_const_string(&self, key: &str, default: &'static str) -> &'static str {
    match self.get_object_key_and_type(key, TYPE_CONST_STRING).map(MetaObject::value) {
      Some(&MetaValue::ConstString(v)) => v,
      _ => default,
    }
  }

  pub fn set_const_string(&mut self, key: &str, value: &'static str) {
    let hit = unsafe { self.find_mut(key, TYPE_CONST_STRING) };
    match hit {
      Some(obj) => obj.value = MetaValue::ConstString(value),
      None => self.add_const_string(key, value),
    }
    self.last_error.set(MetaError::NoError);
  }

  pub fn remove_const_string(&mut self, key: &str) -> Option<&'static str> {
    let obj = self.take(key, TYPE_CONST_STRING)?;
    match obj.value {
      MetaValue::ConstString(v) => Some(v),
      _ => panic!("stored value does not match its type name"),
    }
  }

  /// Adds a nested table under `key`.
  pub fn add_table(&mut self, key: &str, table: MetaTable) {
    self.add_object(key, TYPE_TABLE, MetaValue::Table(Box::new(table)));
  }

  pub fn get_table(&self, key: &str) -> Option<&MetaTable> {
    match self.get_object_key_and_type(key, TYPE_TABLE).map(MetaObject::value) {
      Some(MetaValue::Table(t)) => Some(t),
      _ => None,
    }
  }

  pub fn get_table_mut(&mut self, key: &str) -> Option<&mut MetaTable> {
    let hit = unsafe { self.find_mut(key, TYPE_TABLE) };
    match hit.map(|obj| &mut obj.value) {
      Some(MetaValue::Table(t)) => Some(t),
      _ => None,
    }
  }

  pub fn remove_table(&mut self, key: &str) -> Option<MetaTable> {
    let obj = self.take(key, TYPE_TABLE)?;
    match obj.value {
      MetaValue::Table(t) => Some(*t),
      _ => panic!("stored value does not match its type name"),
    }
  }

  // ---------------------------------------------------------------------------
  // Custom types
  // ---------------------------------------------------------------------------

  /// Installs behavior for a named custom type. Idempotent per name.
  pub fn register_type(&mut self, ops: &'static MetaTypeOps) {
    if !self.custom_types.iter().any(|t| t.name == ops.name) {
      self.custom_types.push(ops);
    }
  }

  fn find_type(&self, name: &str) -> Option<&'static MetaTypeOps> {
    self.custom_types.iter().copied().find(|t| t.name == name)
  }

  /// Adds a value of a registered custom type. Returns false (and sets
  /// [`MetaError::NoSuchType`]) if `type_name` was never registered.
  pub fn add_custom(&mut self, key: &str, type_name: &str, value: Box<dyn Any>) -> bool {
    let Some(ops) = self.find_type(type_name) else {
      self.last_error.set(MetaError::NoSuchType);
      return false;
    };
    self.add_object(key, ops.name, MetaValue::Custom { ops, value });
    true
  }

  /// Newest custom value under `key` downcastable to `T`.
  pub fn get_custom<T: 'static>(&self, key: &str) -> Option<&T> {
    let mut cur = None;
    loop {
      cur = self.get_next_object(cur, key);
      match cur {
        None => return None,
        Some(obj) => {
          if let MetaValue::Custom { value, .. } = &obj.value
            && let Some(v) = value.downcast_ref::<T>()
          {
            self.last_error.set(MetaError::NoError);
            return Some(v);
          }
        }
      }
    }
  }

  // ---------------------------------------------------------------------------
  // Whole-table operations
  // ---------------------------------------------------------------------------

  /// Deep-copies every record into `dest`. Nested tables and custom values
  /// are cloned through their type behavior. Additive: `dest` keeps what it
  /// already holds.
  pub fn copy_table_to(&self, dest: &mut MetaTable) {
    for ops in self.custom_types.iter().copied() {
      dest.register_type(ops);
    }
    let mut cur = None;
    while let Some(obj) = self.table_iterator(cur) {
      dest.add_boxed(clone_object(obj));
      cur = Some(obj);
    }
  }

  /// Removes and drops every record.
  pub fn clear_table(&mut self) {
    loop {
      let p = unsafe { self.by_key.table_iterator(null_mut()) };
      if p.is_null() {
        break;
      }
      unsafe {
        self.by_key.remove(p);
        self.by_type.remove(p);
        drop(Box::from_raw(p));
      }
    }
    self.last_error.set(MetaError::NoError);
  }

  // ---------------------------------------------------------------------------
  // Internals
  // ---------------------------------------------------------------------------

  /// Mutable access to the newest record matching `key` and `type_name`.
  /// Unsafe internally to sidestep the shared find path; the `&mut self`
  /// receiver keeps it exclusive.
  unsafe fn find_mut(&mut self, key: &str, type_name: &str) -> Option<&mut MetaObject> {
    unsafe {
      let mut hit = self.by_key.find(key);
      while !hit.is_null() && (*hit).type_name != type_name {
        hit = self.by_key.key_iterator(hit, key);
      }
      hit.as_mut()
    }
  }

  /// Removes the newest record matching `key` and `type_name` and returns it.
  fn take(&mut self, key: &str, type_name: &str) -> Option<Box<MetaObject>> {
    unsafe {
      let mut hit = self.by_key.find(key);
      while !hit.is_null() && (*hit).type_name != type_name {
        hit = self.by_key.key_iterator(hit, key);
      }
      if hit.is_null() {
        self.last_error.set(MetaError::NoSuchObject);
        return None;
      }
      self.by_key.remove(hit);
      self.by_type.remove(hit);
      self.last_error.set(MetaError::NoError);
      Some(Box::from_raw(hit))
    }
  }
}

fn clone_object(obj: &MetaObject) -> Box<MetaObject> {
  let value = match &obj.value {
    MetaValue::Int(v) => MetaValue::Int(*v),
    MetaValue::Double(v) => MetaValue::Double(*v),
    MetaValue::String(v) => MetaValue::String(v.clone()),
    MetaValue::ConstString(v) => MetaValue::ConstString(v),
    MetaValue::Table(t) => MetaValue::Table(Box::new((**t).clone())),
    MetaValue::Custom { ops, value } => {
      MetaValue::Custom { ops, value: (ops.clone_value)(value.as_ref()) }
    }
  };
  MetaObject::boxed(&obj.key, obj.type_name, value)
}

impl Default for MetaTable {
  fn default() -> Self {
    Self::new()
  }
}

impl Clone for MetaTable {
  fn clone(&self) -> Self {
    let mut out = MetaTable::new();
    self.copy_table_to(&mut out);
    out
  }
}

impl Drop for MetaTable {
  fn drop(&mut self) {
    self.clear_table();
  }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn typed_round_trip_with_defaults() {
    let mut table = MetaTable::new();
    table.add_int("health", 100);
    table.add_double("speed", 12.5);
    table.add_string("name", "imp");
    table.add_const_string("class", "monster");

    assert_eq!(table.get_int("health", -1), 100);
    assert_eq!(table.get_double("speed", 0.0), 12.5);
    assert_eq!(table.get_string("name", "?"), "imp");
    assert_eq!(table.get_const_string("class", "?"), "monster");
    assert_eq!(table.last_error(), MetaError::NoError);

    assert_eq!(table.get_int("armor", 7), 7);
    assert_eq!(table.last_error(), MetaError::NoSuchObject);
  }

  #[test]
  fn typed_lookup_does_not_cross_types() {
    let mut table = MetaTable::new();
    table.add_int("thing", 3);
    assert_eq!(table.get_double("thing", -1.0), -1.0);
    assert_eq!(table.last_error(), MetaError::NoSuchObject);
    assert_eq!(table.get_int("thing", -1), 3);
  }

  #[test]
  fn duplicate_keys_shadow_and_iterate() {
    let mut table = MetaTable::new();
    table.add_int("frame", 1);
    table.add_int("frame", 2);
    table.add_int("frame", 3);

    // newest shadows
    assert_eq!(table.get_int("frame", 0), 3);
    assert_eq!(table.count_of_key("frame"), 3);

    let mut seen = Vec::new();
    let mut cur = None;
    while let Some(obj) = table.get_next_object(cur, "frame") {
      if let MetaValue::Int(v) = obj.value() {
        seen.push(*v);
      }
      cur = Some(obj);
    }
    assert_eq!(seen, vec![3, 2, 1]);

    // removal unshadows
    assert_eq!(table.remove_int("frame"), Some(3));
    assert_eq!(table.get_int("frame", 0), 2);
    assert_eq!(table.count_of_key("frame"), 2);
  }

  #[test]
  fn dual_index_stays_consistent() {
    let mut table = MetaTable::new();
    table.add_int("a", 1);
    table.add_int("b", 2);
    table.add_string("c", "x");

    assert_eq!(table.count_of_type(TYPE_INT), 2);
    assert_eq!(table.count_of_type(TYPE_STRING), 1);
    assert_eq!(table.count_of_key_and_type("a", TYPE_INT), 1);
    assert!(table.has_key("a"));
    assert!(table.has_type(TYPE_STRING));
    assert!(table.has_key_and_type("a", TYPE_INT));
    assert!(!table.has_key_and_type("a", TYPE_STRING));

    let obj = table.get_object_type(TYPE_STRING).unwrap().key().to_owned();
    assert_eq!(obj, "c");

    table.remove_string("c");
    assert_eq!(table.count_of_type(TYPE_STRING), 0);
    assert!(table.get_object_type(TYPE_STRING).is_none());
    assert_eq!(table.last_error(), MetaError::NoSuchObject);
    assert_eq!(table.num_items(), 2);
  }

  #[test]
  fn set_overwrites_in_place() {
    let mut table = MetaTable::new();
    table.set_int("tics", 8);
    assert_eq!(table.get_int("tics", 0), 8);
    table.set_int("tics", 9);
    assert_eq!(table.get_int("tics", 0), 9);
    assert_eq!(table.count_of_key("tics"), 1);
  }

  #[test]
  fn rebuild_under_load_keeps_lookups() {
    let mut table = MetaTable::new();
    let keys: Vec<String> = (0..200).map(|i| format!("key{i}")).collect();
    for (i, k) in keys.iter().enumerate() {
      table.add_int(k, i as i32);
    }
    // 200 items over 53 initial chains forces at least one rebuild
    for (i, k) in keys.iter().enumerate() {
      assert_eq!(table.get_int(k, -1), i as i32);
    }
    assert_eq!(table.num_items(), 200);
  }

  #[test]
  fn nested_tables_and_deep_copy() {
    let mut inner = MetaTable::new();
    inner.add_int("depth", 2);
    let mut table = MetaTable::new();
    table.add_int("depth", 1);
    table.add_table("child", inner);

    let copy = table.clone();
    assert_eq!(copy.get_int("depth", 0), 1);
    assert_eq!(copy.get_table("child").unwrap().get_int("depth", 0), 2);

    // the copy is independent
    table.get_table_mut("child").unwrap().set_int("depth", 99);
    assert_eq!(copy.get_table("child").unwrap().get_int("depth", 0), 2);
  }

  #[derive(Debug, PartialEq)]
  struct Coord {
    x: i32,
    y: i32,
  }

  static COORD_OPS: MetaTypeOps = MetaTypeOps {
    name: "coord",
    clone_value: |v| {
      let c = v.downcast_ref::<Coord>().unwrap();
      Box::new(Coord { x: c.x, y: c.y })
    },
    to_string: |v| {
      let c = v.downcast_ref::<Coord>().unwrap();
      format!("({}, {})", c.x, c.y)
    },
  };

  #[test]
  fn custom_types_need_registration() {
    let mut table = MetaTable::new();
    assert!(!table.add_custom("spawn", "coord", Box::new(Coord { x: 1, y: 2 })));
    assert_eq!(table.last_error(), MetaError::NoSuchType);

    table.register_type(&COORD_OPS);
    assert!(table.add_custom("spawn", "coord", Box::new(Coord { x: 1, y: 2 })));
    assert_eq!(table.get_custom::<Coord>("spawn"), Some(&Coord { x: 1, y: 2 }));

    // cloning goes through the registered behavior
    let copy = table.clone();
    assert_eq!(copy.get_custom::<Coord>("spawn"), Some(&Coord { x: 1, y: 2 }));
    let shown = format!("{}", copy.get_object("spawn").unwrap());
    assert_eq!(shown, "(1, 2)");
  }

  #[test]
  fn clear_table_empties_both_indices() {
    let mut table = MetaTable::new();
    table.add_int("a", 1);
    table.add_string("b", "two");
    table.clear_table();
    assert_eq!(table.num_items(), 0);
    assert_eq!(table.count_of_type(TYPE_INT), 0);
    assert!(table.table_iterator(None).is_none());
  }
}
