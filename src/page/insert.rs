//! Insert skiplists
//!
//! Records created after a page was loaded live in per-gap skiplists: one
//! list between each pair of on-disk slots (row stores) or one append list
//! keyed by record number (column stores). Nodes are allocated at their
//! final level and never reallocated; readers traverse atomic forward links
//! without locking while structural inserts serialize on a small mutex.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::constants::{SKIP_MAXDEPTH, SKIP_PROBABILITY};
use crate::page::update::{self, Update};

pub struct InsertNode<K> {
  key: K,
  upd: AtomicPtr<Update>,
  next: Box<[AtomicPtr<InsertNode<K>>]>,
}

impl<K> InsertNode<K> {
  pub fn key(&self) -> &K {
    &self.key
  }

  pub fn upd_head(&self) -> &AtomicPtr<Update> {
    &self.upd
  }

  fn level(&self) -> usize {
    self.next.len()
  }

  fn next_at(&self, level: usize) -> *mut InsertNode<K> {
    if level < self.next.len() {
      self.next[level].load(Ordering::Acquire)
    } else {
      ptr::null_mut()
    }
  }

  /// Forward neighbor at level 0
  pub fn next_node(&self) -> Option<&InsertNode<K>> {
    let next = self.next_at(0);
    // Safety: nodes live until the list is dropped
    unsafe { next.as_ref() }
  }
}

pub struct InsertList<K> {
  head: [AtomicPtr<InsertNode<K>>; SKIP_MAXDEPTH],
  write_lock: Mutex<()>,
  count: AtomicUsize,
}

impl<K: Ord> Default for InsertList<K> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K: Ord> InsertList<K> {
  pub fn new() -> Self {
    Self {
      head: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
      write_lock: Mutex::new(()),
      count: AtomicUsize::new(0),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.count.load(Ordering::Acquire) == 0
  }

  pub fn len(&self) -> usize {
    self.count.load(Ordering::Acquire)
  }

  fn random_level() -> usize {
    let mut rng = rand::thread_rng();
    let mut level = 1;
    while level < SKIP_MAXDEPTH && rng.gen_ratio(1, SKIP_PROBABILITY) {
      level += 1;
    }
    level
  }

  /// Per-level strict predecessors of `key`
  fn predecessors(&self, key: &K) -> [*mut InsertNode<K>; SKIP_MAXDEPTH] {
    let mut preds: [*mut InsertNode<K>; SKIP_MAXDEPTH] = [ptr::null_mut(); SKIP_MAXDEPTH];
    let mut current: *mut InsertNode<K> = ptr::null_mut();
    for level in (0..SKIP_MAXDEPTH).rev() {
      let mut next = if current.is_null() {
        self.head[level].load(Ordering::Acquire)
      } else {
        // Safety: list nodes are never freed while the list is shared
        unsafe { (*current).next_at(level) }
      };
      while !next.is_null() {
        // Safety: as above
        let node = unsafe { &*next };
        if node.key >= *key {
          break;
        }
        current = next;
        next = node.next_at(level);
      }
      preds[level] = current;
    }
    preds
  }

  /// Exact-match lookup
  pub fn search(&self, key: &K) -> Option<&InsertNode<K>> {
    let (_, ge) = self.search_pair(key);
    ge.filter(|node| node.key == *key)
  }

  /// `(last < key, first >= key)` for cursor positioning
  pub fn search_pair(&self, key: &K) -> (Option<&InsertNode<K>>, Option<&InsertNode<K>>) {
    let preds = self.predecessors(key);
    let lt = preds[0];
    let ge = if lt.is_null() {
      self.head[0].load(Ordering::Acquire)
    } else {
      // Safety: nodes live until the list drops
      unsafe { (*lt).next_at(0) }
    };
    // Safety: as above
    unsafe { (lt.as_ref(), ge.as_ref()) }
  }

  /// Greatest node strictly below `key`
  pub fn search_lt(&self, key: &K) -> Option<&InsertNode<K>> {
    self.search_pair(key).0
  }

  /// Find the node for `key`, creating it if missing. Returns the node and
  /// whether it was created.
  pub fn insert_or_get(&self, key: K) -> (&InsertNode<K>, bool) {
    let _guard = self.write_lock.lock();
    if let Some(node) = self.search(&key) {
      return (node, false);
    }
    let level = Self::random_level();
    let node = Box::new(InsertNode {
      key,
      upd: AtomicPtr::new(ptr::null_mut()),
      next: (0..level)
        .map(|_| AtomicPtr::new(ptr::null_mut()))
        .collect::<Vec<_>>()
        .into_boxed_slice(),
    });
    let raw = Box::into_raw(node);
    // Safety: raw is unpublished until the level-0 store below
    let preds = self.predecessors(unsafe { &(*raw).key });
    for lvl in 0..level {
      let next = if preds[lvl].is_null() {
        self.head[lvl].load(Ordering::Acquire)
      } else {
        // Safety: predecessor nodes are live
        unsafe { (*preds[lvl]).next_at(lvl) }
      };
      // Safety: we own raw until publication
      unsafe { (*raw).next[lvl].store(next, Ordering::Relaxed) };
      if preds[lvl].is_null() {
        self.head[lvl].store(raw, Ordering::Release);
      } else {
        // Safety: predecessor nodes are live
        unsafe { (*preds[lvl]).next[lvl].store(raw, Ordering::Release) };
      }
    }
    self.count.fetch_add(1, Ordering::AcqRel);
    // Safety: now linked; lives until the list drops
    (unsafe { &*raw }, true)
  }

  /// First node in key order
  pub fn first(&self) -> Option<&InsertNode<K>> {
    let first = self.head[0].load(Ordering::Acquire);
    // Safety: nodes live until the list drops
    unsafe { first.as_ref() }
  }

  /// Last node in key order
  pub fn last(&self) -> Option<&InsertNode<K>> {
    let mut current: *mut InsertNode<K> = ptr::null_mut();
    for level in (0..SKIP_MAXDEPTH).rev() {
      let mut next = if current.is_null() {
        self.head[level].load(Ordering::Acquire)
      } else {
        // Safety: nodes live until the list drops
        unsafe { (*current).next_at(level) }
      };
      while !next.is_null() {
        current = next;
        // Safety: as above
        next = unsafe { (*current).next_at(level) };
      }
    }
    // Safety: as above
    unsafe { current.as_ref() }
  }

  /// Iterate nodes in key order
  pub fn iter(&self) -> InsertIter<'_, K> {
    InsertIter {
      current: self.head[0].load(Ordering::Acquire),
      _list: self,
    }
  }

  /// Total heap footprint of nodes and their update chains
  pub fn memory_footprint(&self) -> usize
  where
    K: KeyFootprint,
  {
    self
      .iter()
      .map(|node| {
        std::mem::size_of::<InsertNode<K>>()
          + node.key.footprint()
          + node.level() * std::mem::size_of::<AtomicPtr<InsertNode<K>>>()
          + update::chain_footprint(&node.upd)
      })
      .sum()
  }
}

impl<K> Drop for InsertList<K> {
  fn drop(&mut self) {
    let mut current = self.head[0].swap(ptr::null_mut(), Ordering::AcqRel);
    while !current.is_null() {
      // Safety: exclusive access in drop; nodes came from Box::into_raw
      let node = unsafe { Box::from_raw(current) };
      update::free_chain(&node.upd);
      current = node.next_at(0);
    }
  }
}

pub struct InsertIter<'a, K> {
  current: *mut InsertNode<K>,
  _list: &'a InsertList<K>,
}

impl<'a, K> Iterator for InsertIter<'a, K> {
  type Item = &'a InsertNode<K>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.current.is_null() {
      return None;
    }
    // Safety: nodes live as long as the list borrow
    let node = unsafe { &*self.current };
    self.current = node.next_at(0);
    Some(node)
  }
}

/// Heap footprint of a key
pub trait KeyFootprint {
  fn footprint(&self) -> usize;
}

impl KeyFootprint for Vec<u8> {
  fn footprint(&self) -> usize {
    self.len()
  }
}

impl KeyFootprint for u64 {
  fn footprint(&self) -> usize {
    0
  }
}

// Safety: nodes are reached only through atomic links and the update
// chains are themselves Sync
unsafe impl<K: Send> Send for InsertList<K> {}
unsafe impl<K: Send + Sync> Sync for InsertList<K> {}
