//! Child references
//!
//! A `Ref` is the parent-side link to a child page: its state byte, on-disk
//! address, cached key (or starting record number), the loaded page if any,
//! and an optional fast-truncate descriptor. Internal pages publish an
//! immutable `PageIndex` of child refs; splits swap in a new index with one
//! pointer store and leave the superseded ref in the `Split` state so
//! in-flight descents restart.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::block::Addr;
use crate::types::{RecNo, TimeAggregate, Timestamp, TxnId};

use super::update::UpdateRef;
use super::Page;

/// Child reference state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefState {
  /// On disk; only the address is known
  Disk = 0,
  /// In memory; the page pointer is valid
  Mem = 1,
  /// Being transitioned by one thread; others yield and retry
  Locked = 2,
  /// Fast-truncated; carries a `PageDel` descriptor
  Deleted = 3,
  /// Replaced by a split; restart the descent through the new index
  Split = 4,
}

impl RefState {
  fn from_u8(value: u8) -> Self {
    match value {
      1 => Self::Mem,
      2 => Self::Locked,
      3 => Self::Deleted,
      4 => Self::Split,
      _ => Self::Disk,
    }
  }
}

/// Smallest key of the child's subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefKey {
  Row(Vec<u8>),
  Col(RecNo),
}

impl RefKey {
  pub fn as_row(&self) -> &[u8] {
    match self {
      Self::Row(key) => key,
      Self::Col(_) => &[],
    }
  }

  pub fn as_col(&self) -> RecNo {
    match self {
      Self::Col(recno) => *recno,
      Self::Row(_) => 0,
    }
  }
}

/// Fast-truncate descriptor: the whole subtree is deleted as of the stamped
/// transaction, without having been read
#[derive(Debug, Clone, Copy)]
pub struct PageDel {
  pub txn_id: TxnId,
  pub commit_ts: Timestamp,
  pub durable_ts: Timestamp,
  /// False until the owning transaction commits
  pub committed: bool,
}

/// Parent-side link to a child page
pub struct Ref {
  state: AtomicU8,
  key: RefKey,
  /// True when the child is a leaf; decides the address-cell kind at
  /// reconciliation
  child_leaf: bool,
  addr: Mutex<Option<Addr>>,
  page: RwLock<Option<Arc<Page>>>,
  del: Mutex<Option<PageDel>>,
  /// Tombstones laid down by instantiating an uncommitted fast-truncate;
  /// stamped or aborted when the truncating transaction resolves
  del_updates: Mutex<Vec<UpdateRef>>,
  /// Aggregate of the subtree's time windows, refreshed at reconciliation
  ta: Mutex<TimeAggregate>,
}

impl Ref {
  pub fn new_disk(key: RefKey, addr: Addr, child_leaf: bool) -> Arc<Self> {
    Arc::new(Self {
      state: AtomicU8::new(RefState::Disk as u8),
      key,
      child_leaf,
      addr: Mutex::new(Some(addr)),
      page: RwLock::new(None),
      del: Mutex::new(None),
      del_updates: Mutex::new(Vec::new()),
      ta: Mutex::new(TimeAggregate::empty()),
    })
  }

  pub fn new_mem(key: RefKey, page: Arc<Page>) -> Arc<Self> {
    let child_leaf = page.is_leaf();
    Arc::new(Self {
      state: AtomicU8::new(RefState::Mem as u8),
      key,
      child_leaf,
      addr: Mutex::new(None),
      page: RwLock::new(Some(page)),
      del: Mutex::new(None),
      del_updates: Mutex::new(Vec::new()),
      ta: Mutex::new(TimeAggregate::empty()),
    })
  }

  pub fn new_deleted(key: RefKey, addr: Addr, del: PageDel) -> Arc<Self> {
    Arc::new(Self {
      state: AtomicU8::new(RefState::Deleted as u8),
      key,
      child_leaf: true,
      addr: Mutex::new(Some(addr)),
      page: RwLock::new(None),
      del: Mutex::new(Some(del)),
      del_updates: Mutex::new(Vec::new()),
      ta: Mutex::new(TimeAggregate::empty()),
    })
  }

  pub fn child_is_leaf(&self) -> bool {
    self.child_leaf
  }

  pub fn time_aggregate(&self) -> TimeAggregate {
    *self.ta.lock()
  }

  pub fn set_time_aggregate(&self, ta: TimeAggregate) {
    *self.ta.lock() = ta;
  }

  pub fn key(&self) -> &RefKey {
    &self.key
  }

  pub fn state(&self) -> RefState {
    RefState::from_u8(self.state.load(Ordering::Acquire))
  }

  /// Atomically move `from` to `to`; false if another thread won
  pub fn cas_state(&self, from: RefState, to: RefState) -> bool {
    self
      .state
      .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Unconditional transition; only valid while holding `Locked`
  pub fn set_state(&self, to: RefState) {
    self.state.store(to as u8, Ordering::Release);
  }

  pub fn addr(&self) -> Option<Addr> {
    *self.addr.lock()
  }

  pub fn set_addr(&self, addr: Option<Addr>) {
    *self.addr.lock() = addr;
  }

  pub fn page(&self) -> Option<Arc<Page>> {
    self.page.read().clone()
  }

  pub fn set_page(&self, page: Option<Arc<Page>>) {
    *self.page.write() = page;
  }

  pub fn page_del(&self) -> Option<PageDel> {
    *self.del.lock()
  }

  pub fn set_page_del(&self, del: Option<PageDel>) {
    *self.del.lock() = del;
  }

  /// Record a tombstone from instantiating this ref's uncommitted truncate
  pub fn push_del_update(&self, upd: UpdateRef) {
    self.del_updates.lock().push(upd);
  }

  pub fn take_del_updates(&self) -> Vec<UpdateRef> {
    std::mem::take(&mut self.del_updates.lock())
  }

  /// Publish commit times into the truncate descriptor and any tombstones
  /// instantiation already laid down
  pub fn commit_page_del(&self, commit_ts: Timestamp, durable_ts: Timestamp) {
    let mut guard = self.del.lock();
    if let Some(del) = guard.as_mut() {
      del.commit_ts = commit_ts;
      del.durable_ts = durable_ts;
      del.committed = true;
    }
    drop(guard);
    for upd in self.take_del_updates() {
      upd.get().commit(commit_ts, durable_ts);
    }
  }
}

/// Immutable child index of an internal page
pub struct PageIndex {
  pub entries: Vec<Arc<Ref>>,
}

impl PageIndex {
  pub fn new(entries: Vec<Arc<Ref>>) -> Arc<Self> {
    Arc::new(Self { entries })
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Index of the child covering `key`: greatest entry key <= key. Entry 0
  /// covers everything below the second entry's key.
  pub fn search_row(&self, key: &[u8]) -> usize {
    let mut lo = 1usize;
    let mut hi = self.entries.len();
    while lo < hi {
      let mid = (lo + hi) / 2;
      if self.entries[mid].key().as_row() <= key {
        lo = mid + 1;
      } else {
        hi = mid;
      }
    }
    lo - 1
  }

  /// Index of the child covering `recno`
  pub fn search_col(&self, recno: RecNo) -> usize {
    let mut lo = 1usize;
    let mut hi = self.entries.len();
    while lo < hi {
      let mid = (lo + hi) / 2;
      if self.entries[mid].key().as_col() <= recno {
        lo = mid + 1;
      } else {
        hi = mid;
      }
    }
    lo - 1
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn disk_ref(key: &[u8]) -> Arc<Ref> {
    Ref::new_disk(
      RefKey::Row(key.to_vec()),
      Addr {
        object_id: 1,
        off: 4096,
        size: 4096,
        checksum: 0,
      },
      true,
    )
  }

  #[test]
  fn state_transitions() {
    let r = disk_ref(b"a");
    assert_eq!(r.state(), RefState::Disk);
    assert!(r.cas_state(RefState::Disk, RefState::Locked));
    // Second locker loses
    assert!(!r.cas_state(RefState::Disk, RefState::Locked));
    r.set_state(RefState::Mem);
    assert_eq!(r.state(), RefState::Mem);
  }

  #[test]
  fn row_index_search() {
    let index = PageIndex::new(vec![disk_ref(b""), disk_ref(b"g"), disk_ref(b"p")]);
    assert_eq!(index.search_row(b"a"), 0);
    assert_eq!(index.search_row(b"g"), 1);
    assert_eq!(index.search_row(b"h"), 1);
    assert_eq!(index.search_row(b"p"), 2);
    assert_eq!(index.search_row(b"zzz"), 2);
  }

  #[test]
  fn col_index_search() {
    let refs: Vec<Arc<Ref>> = [1u64, 100, 500]
      .iter()
      .map(|&recno| {
        Ref::new_disk(
          RefKey::Col(recno),
          Addr {
            object_id: 1,
            off: 4096,
            size: 4096,
            checksum: 0,
          },
          true,
        )
      })
      .collect();
    let index = PageIndex::new(refs);
    assert_eq!(index.search_col(1), 0);
    assert_eq!(index.search_col(99), 0);
    assert_eq!(index.search_col(100), 1);
    assert_eq!(index.search_col(1000), 2);
  }

  #[test]
  fn page_del_commit_publishes() {
    let r = Ref::new_deleted(
      RefKey::Row(b"k".to_vec()),
      Addr {
        object_id: 1,
        off: 4096,
        size: 4096,
        checksum: 0,
      },
      PageDel {
        txn_id: 5,
        commit_ts: 0,
        durable_ts: 0,
        committed: false,
      },
    );
    r.commit_page_del(50, 60);
    let del = r.page_del().unwrap();
    assert!(del.committed);
    assert_eq!(del.commit_ts, 50);
    assert_eq!(del.durable_ts, 60);
  }
}
