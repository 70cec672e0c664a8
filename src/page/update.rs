//! Update chains
//!
//! Every modified key carries a singly linked, newest-first chain of
//! `Update` nodes. Installation is lock-free: build the node, then a
//! bounded CAS loop swings the chain head. Commit and rollback mutate only
//! atomic fields, so they run without touching page latches.
//!
//! Chain nodes are owned by the chain and freed only while the owning page
//! is held exclusively (eviction teardown), which is what makes the raw
//! pointer traversal sound: no reader can hold a chain position without a
//! hazard reference on the page, and eviction never proceeds past a live
//! hazard.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};

use crate::constants::{TS_NONE, TXN_ABORTED};
use crate::error::{Result, RollbackReason, TernError};
use crate::types::{Timestamp, TxnId};

/// Number of CAS attempts before an install reports a conflict
const INSTALL_ATTEMPTS: usize = 64;

/// What an update does to its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
  /// Full replacement value
  Standard,
  /// Packed modify edits against the next older full value
  Modify,
  /// Deletion
  Tombstone,
  /// Placeholder taken by `Cursor::reserve`; never written to disk
  Reserve,
}

/// Prepare state of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrepareState {
  None = 0,
  InProgress = 1,
  Resolved = 2,
}

impl PrepareState {
  fn from_u8(value: u8) -> Self {
    match value {
      1 => Self::InProgress,
      2 => Self::Resolved,
      _ => Self::None,
    }
  }
}

/// One node of an update chain
pub struct Update {
  txn_id: AtomicU64,
  start_ts: AtomicU64,
  durable_ts: AtomicU64,
  prepare_state: AtomicU8,
  kind: UpdateKind,
  data: Box<[u8]>,
  next: AtomicPtr<Update>,
}

impl Update {
  pub fn new(kind: UpdateKind, data: Vec<u8>, txn_id: TxnId) -> Box<Self> {
    Box::new(Self {
      txn_id: AtomicU64::new(txn_id),
      start_ts: AtomicU64::new(TS_NONE),
      durable_ts: AtomicU64::new(TS_NONE),
      prepare_state: AtomicU8::new(PrepareState::None as u8),
      kind,
      data: data.into_boxed_slice(),
      next: AtomicPtr::new(ptr::null_mut()),
    })
  }

  pub fn kind(&self) -> UpdateKind {
    self.kind
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn txn_id(&self) -> TxnId {
    self.txn_id.load(Ordering::Acquire)
  }

  pub fn start_ts(&self) -> Timestamp {
    self.start_ts.load(Ordering::Acquire)
  }

  pub fn durable_ts(&self) -> Timestamp {
    self.durable_ts.load(Ordering::Acquire)
  }

  pub fn prepare_state(&self) -> PrepareState {
    PrepareState::from_u8(self.prepare_state.load(Ordering::Acquire))
  }

  pub fn is_aborted(&self) -> bool {
    self.txn_id() == TXN_ABORTED
  }

  /// Publish commit times; called once per update at transaction commit
  pub fn commit(&self, commit_ts: Timestamp, durable_ts: Timestamp) {
    self.start_ts.store(commit_ts, Ordering::Release);
    self.durable_ts.store(durable_ts, Ordering::Release);
  }

  /// Mark aborted; readers skip the node from now on
  pub fn abort(&self) {
    self.txn_id.store(TXN_ABORTED, Ordering::Release);
  }

  pub fn set_prepared(&self) {
    self
      .prepare_state
      .store(PrepareState::InProgress as u8, Ordering::Release);
  }

  /// Move a prepared update to resolved; commit times must be published
  /// first so a reader never sees a resolved update without them
  pub fn resolve_prepare(&self) {
    self
      .prepare_state
      .store(PrepareState::Resolved as u8, Ordering::Release);
  }

  pub fn next_ptr(&self) -> *mut Update {
    self.next.load(Ordering::Acquire)
  }

  /// Iterate the chain suffix older than this update. Same lifetime rules
  /// as `walk`.
  pub fn older(&self) -> OlderIter<'_> {
    OlderIter {
      current: self.next_ptr(),
      _marker: std::marker::PhantomData,
    }
  }

  /// Approximate heap footprint for cache accounting
  pub fn memory_footprint(&self) -> usize {
    std::mem::size_of::<Update>() + self.data.len()
  }
}

// ============================================================================
// Chain operations
// ============================================================================

/// Stable address of an update inside a chain; held by transaction
/// mod-lists.
///
/// Safety: the pointee lives until its page is torn down, and a page with
/// unresolved updates is never evictable, so a mod-list entry outlives the
/// transaction that created it.
#[derive(Clone, Copy)]
pub struct UpdateRef(*const Update);

unsafe impl Send for UpdateRef {}
unsafe impl Sync for UpdateRef {}

impl UpdateRef {
  pub fn get(&self) -> &Update {
    // Safety: see type-level invariant
    unsafe { &*self.0 }
  }
}

/// Install `upd` as the new chain head. `check_head` vets the observed head
/// before each attempt (write-conflict detection); installation retries
/// while other writers race, failing after a bound.
pub fn install(
  head: &AtomicPtr<Update>,
  upd: Box<Update>,
  mut check_head: impl FnMut(Option<&Update>) -> Result<()>,
) -> Result<UpdateRef> {
  let raw = Box::into_raw(upd);
  for _ in 0..INSTALL_ATTEMPTS {
    let current = head.load(Ordering::Acquire);
    // Safety: chain nodes are never freed while the page is shared
    let current_ref = unsafe { current.as_ref() };
    if let Err(e) = check_head(current_ref) {
      // Safety: raw has not been published, we still own it
      drop(unsafe { Box::from_raw(raw) });
      return Err(e);
    }
    // Safety: raw is unpublished, we are the only writer of its next field
    unsafe { (*raw).next.store(current, Ordering::Relaxed) };
    if head
      .compare_exchange(current, raw, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      return Ok(UpdateRef(raw));
    }
  }
  // Safety: never published
  drop(unsafe { Box::from_raw(raw) });
  Err(TernError::Rollback(RollbackReason::WriteConflict))
}

/// Iterator over the suffix of a chain, oldest entries last
pub struct OlderIter<'a> {
  current: *const Update,
  _marker: std::marker::PhantomData<&'a Update>,
}

impl<'a> Iterator for OlderIter<'a> {
  type Item = &'a Update;

  fn next(&mut self) -> Option<Self::Item> {
    if self.current.is_null() {
      return None;
    }
    // Safety: nodes outlive the borrow on the update we started from
    let upd = unsafe { &*self.current };
    self.current = upd.next_ptr();
    Some(upd)
  }
}

/// Iterator over a chain, newest first
pub struct ChainIter<'a> {
  current: *const Update,
  _head: &'a AtomicPtr<Update>,
}

impl<'a> Iterator for ChainIter<'a> {
  type Item = &'a Update;

  fn next(&mut self) -> Option<Self::Item> {
    if self.current.is_null() {
      return None;
    }
    // Safety: nodes outlive the page borrow carried by `_head`
    let upd = unsafe { &*self.current };
    self.current = upd.next_ptr();
    Some(upd)
  }
}

/// Walk a chain newest-first. The caller must hold the page (hazard
/// reference or exclusive access) for the duration of the borrow.
pub fn walk(head: &AtomicPtr<Update>) -> ChainIter<'_> {
  ChainIter {
    current: head.load(Ordering::Acquire),
    _head: head,
  }
}

/// Total footprint of a chain
pub fn chain_footprint(head: &AtomicPtr<Update>) -> usize {
  walk(head).map(Update::memory_footprint).sum()
}

/// Free an entire chain. Requires exclusive access to the page.
pub fn free_chain(head: &AtomicPtr<Update>) {
  let mut current = head.swap(ptr::null_mut(), Ordering::AcqRel);
  while !current.is_null() {
    // Safety: exclusive access, nodes came from Box::into_raw
    let boxed = unsafe { Box::from_raw(current) };
    current = boxed.next.load(Ordering::Relaxed);
  }
}

/// Drop everything older than `keep`'s successor. Requires exclusive
/// access; used when eviction discards history no reader can need.
pub fn truncate_after(keep: &Update) {
  let mut current = keep.next.swap(ptr::null_mut(), Ordering::AcqRel);
  while !current.is_null() {
    // Safety: exclusive access
    let boxed = unsafe { Box::from_raw(current) };
    current = boxed.next.load(Ordering::Relaxed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicPtr;
  use std::sync::Arc;

  fn empty_head() -> AtomicPtr<Update> {
    AtomicPtr::new(ptr::null_mut())
  }

  #[test]
  fn install_and_walk_newest_first() {
    let head = empty_head();
    install(&head, Update::new(UpdateKind::Standard, b"a".to_vec(), 1), |_| Ok(())).unwrap();
    install(&head, Update::new(UpdateKind::Standard, b"b".to_vec(), 2), |_| Ok(())).unwrap();
    let datas: Vec<&[u8]> = walk(&head).map(Update::data).collect();
    assert_eq!(datas, vec![b"b".as_ref(), b"a".as_ref()]);
    free_chain(&head);
    assert!(walk(&head).next().is_none());
  }

  #[test]
  fn check_head_sees_current_head() {
    let head = empty_head();
    install(&head, Update::new(UpdateKind::Standard, b"a".to_vec(), 1), |head| {
      assert!(head.is_none());
      Ok(())
    })
    .unwrap();
    let err = install(
      &head,
      Update::new(UpdateKind::Standard, b"b".to_vec(), 2),
      |head| {
        assert_eq!(head.unwrap().txn_id(), 1);
        Err(TernError::Rollback(RollbackReason::WriteConflict))
      },
    );
    assert!(matches!(
      err,
      Err(TernError::Rollback(RollbackReason::WriteConflict))
    ));
    // The rejected update must not have been published
    assert_eq!(walk(&head).count(), 1);
    free_chain(&head);
  }

  #[test]
  fn concurrent_installs_all_land() {
    let head = Arc::new(empty_head());
    let threads: Vec<_> = (0..8)
      .map(|t| {
        let head = Arc::clone(&head);
        std::thread::spawn(move || {
          for i in 0..100u64 {
            install(
              &head,
              Update::new(UpdateKind::Standard, vec![t as u8], t * 1000 + i),
              |_| Ok(()),
            )
            .unwrap();
          }
        })
      })
      .collect();
    for t in threads {
      t.join().unwrap();
    }
    assert_eq!(walk(&head).count(), 800);
    free_chain(&head);
  }

  #[test]
  fn commit_publishes_times_and_abort_marks() {
    let head = empty_head();
    let upd = install(
      &head,
      Update::new(UpdateKind::Tombstone, Vec::new(), 9),
      |_| Ok(()),
    )
    .unwrap();
    upd.get().commit(100, 120);
    assert_eq!(upd.get().start_ts(), 100);
    assert_eq!(upd.get().durable_ts(), 120);
    assert!(!upd.get().is_aborted());
    upd.get().abort();
    assert!(upd.get().is_aborted());
    free_chain(&head);
  }

  #[test]
  fn truncate_after_frees_suffix() {
    let head = empty_head();
    for i in 0..5u64 {
      install(
        &head,
        Update::new(UpdateKind::Standard, vec![i as u8], i),
        |_| Ok(()),
      )
      .unwrap();
    }
    let newest = walk(&head).next().unwrap();
    truncate_after(newest);
    assert_eq!(walk(&head).count(), 1);
    free_chain(&head);
  }
}
