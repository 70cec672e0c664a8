//! Transactions and the global MVCC registry
//!
//! Every session shares a `TxnShared` slot in the global registry: its
//! current write id and the oldest id/timestamp it still needs. Snapshots
//! scan the registry; commit publishes timestamps to every update in the
//! transaction's mod-list; rollback marks them aborted.

pub mod snapshot;
pub mod timestamp;
pub mod visibility;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::{TS_NONE, TXN_FIRST, TXN_MAX, TXN_NONE};
use crate::error::{Result, TernError};
use crate::page::refs::{Ref, RefState};
use crate::page::update::UpdateRef;
use crate::types::{Timestamp, TxnId};

pub use snapshot::Snapshot;
pub use timestamp::GlobalTimestamps;

/// Isolation level of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
  /// Sees uncommitted updates; modifications are forbidden
  ReadUncommitted,
  /// Fresh snapshot per operation
  ReadCommitted,
  /// One snapshot fixed at first read
  Snapshot,
}

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
  Idle,
  Running,
  Prepared,
}

/// One entry in a transaction's mod-list
pub enum TxnMod {
  Update(UpdateRef),
  /// A fast-truncated child ref
  PageDel(Arc<Ref>),
}

/// Per-session state shared with the global registry
pub struct TxnShared {
  /// Current write transaction id; TXN_NONE outside a write
  id: AtomicU64,
  /// Oldest id this session's snapshot still needs
  pinned_id: AtomicU64,
  /// Read timestamp pinned by this session
  pinned_ts: AtomicU64,
}

impl TxnShared {
  fn new() -> Self {
    Self {
      id: AtomicU64::new(TXN_NONE),
      pinned_id: AtomicU64::new(TXN_NONE),
      pinned_ts: AtomicU64::new(TS_NONE),
    }
  }

  pub fn id(&self) -> TxnId {
    self.id.load(Ordering::Acquire)
  }

  pub fn pinned_id(&self) -> TxnId {
    self.pinned_id.load(Ordering::Acquire)
  }
}

/// Global transaction registry plus timestamp state
pub struct TxnGlobal {
  current_id: AtomicU64,
  sessions: RwLock<Vec<Arc<TxnShared>>>,
  pub ts: GlobalTimestamps,
}

impl Default for TxnGlobal {
  fn default() -> Self {
    Self::new()
  }
}

impl TxnGlobal {
  pub fn new() -> Self {
    Self {
      current_id: AtomicU64::new(TXN_FIRST),
      sessions: RwLock::new(Vec::new()),
      ts: GlobalTimestamps::new(),
    }
  }

  /// A session slot outside the registry, for engine-internal work that
  /// must never pin the oldest id
  pub(crate) fn detached_shared() -> Arc<TxnShared> {
    Arc::new(TxnShared::new())
  }

  pub fn register_session(&self) -> Arc<TxnShared> {
    let shared = Arc::new(TxnShared::new());
    self.sessions.write().push(Arc::clone(&shared));
    shared
  }

  pub fn unregister_session(&self, shared: &Arc<TxnShared>) {
    self.sessions.write().retain(|s| !Arc::ptr_eq(s, shared));
  }

  /// Assign a write id; monotonic across the engine
  pub fn allocate_id(&self, shared: &TxnShared) -> TxnId {
    let id = self.current_id.fetch_add(1, Ordering::AcqRel);
    shared.id.store(id, Ordering::Release);
    id
  }

  /// The id the next writer would get
  pub fn current_id(&self) -> TxnId {
    self.current_id.load(Ordering::Acquire)
  }

  /// Is `id` currently running in some session?
  pub fn is_active(&self, id: TxnId) -> bool {
    if id == TXN_NONE {
      return false;
    }
    self.sessions.read().iter().any(|shared| shared.id() == id)
  }

  /// Oldest id any component may still need: the minimum over running
  /// writers and pinned snapshots
  pub fn oldest_id(&self) -> TxnId {
    let mut oldest = self.current_id();
    for shared in self.sessions.read().iter() {
      let id = shared.id();
      if id != TXN_NONE && id < oldest {
        oldest = id;
      }
      let pinned = shared.pinned_id();
      if pinned != TXN_NONE && pinned < oldest {
        oldest = pinned;
      }
    }
    oldest
  }

  /// Capture a snapshot for `own`: every other in-flight writer lands in
  /// the concurrent set
  pub fn take_snapshot(&self, own: &TxnShared) -> Snapshot {
    let max_id = self.current_id();
    let mut concurrent = Vec::new();
    let mut min_id = max_id;
    for shared in self.sessions.read().iter() {
      let id = shared.id();
      if id == TXN_NONE || id >= max_id {
        continue;
      }
      if std::ptr::eq(shared.as_ref() as *const TxnShared, own as *const TxnShared) {
        continue;
      }
      concurrent.push(id);
      min_id = min_id.min(id);
    }
    concurrent.sort_unstable();
    own.pinned_id.store(min_id, Ordering::Release);
    Snapshot {
      min_id,
      max_id,
      concurrent,
    }
  }

  fn release_snapshot(&self, shared: &TxnShared) {
    shared.pinned_id.store(TXN_NONE, Ordering::Release);
    shared.pinned_ts.store(TS_NONE, Ordering::Release);
    self.refresh_pinned_ts();
  }

  /// Recompute the oldest pinned read timestamp across sessions
  fn refresh_pinned_ts(&self) {
    let mut pinned = TS_NONE;
    for shared in self.sessions.read().iter() {
      let ts = shared.pinned_ts.load(Ordering::Acquire);
      if ts != TS_NONE && (pinned == TS_NONE || ts < pinned) {
        pinned = ts;
      }
    }
    self.ts.set_pinned(pinned);
  }
}

/// A session's transaction
pub struct Transaction {
  shared: Arc<TxnShared>,
  pub isolation: Isolation,
  state: TxnState,
  /// Id assigned on first write; TXN_NONE for read-only transactions
  id: TxnId,
  snapshot: Option<Snapshot>,
  pub read_ts: Timestamp,
  commit_ts: Timestamp,
  durable_ts: Timestamp,
  prepare_ts: Timestamp,
  mods: Vec<TxnMod>,
  /// Set by a failed operation; only rollback is allowed afterwards
  pub needs_rollback: bool,
  /// True once begun explicitly (as opposed to autocommit)
  pub explicit: bool,
}

impl Transaction {
  pub fn new(shared: Arc<TxnShared>) -> Self {
    Self {
      shared,
      isolation: Isolation::Snapshot,
      state: TxnState::Idle,
      id: TXN_NONE,
      snapshot: None,
      read_ts: TS_NONE,
      commit_ts: TS_NONE,
      durable_ts: TS_NONE,
      prepare_ts: TS_NONE,
      mods: Vec::new(),
      needs_rollback: false,
      explicit: false,
    }
  }

  pub fn is_running(&self) -> bool {
    self.state != TxnState::Idle
  }

  pub fn is_prepared(&self) -> bool {
    self.state == TxnState::Prepared
  }

  pub fn id(&self) -> TxnId {
    self.id
  }

  pub fn snapshot(&self) -> Option<&Snapshot> {
    self.snapshot.as_ref()
  }

  pub fn has_mods(&self) -> bool {
    !self.mods.is_empty()
  }

  /// Does this transaction's snapshot pin the global oldest id? Such a
  /// transaction is the one blocking eviction from reclaiming history.
  pub fn pins_oldest(&self, global: &TxnGlobal) -> bool {
    let pinned = self.shared.pinned_id();
    pinned != TXN_NONE && pinned == global.oldest_id() && pinned < global.current_id()
  }

  pub fn begin(&mut self, isolation: Isolation, explicit: bool) -> Result<()> {
    if self.is_running() {
      return Err(TernError::TransactionInProgress);
    }
    self.isolation = isolation;
    self.state = TxnState::Running;
    self.explicit = explicit;
    self.needs_rollback = false;
    Ok(())
  }

  /// Fix a read timestamp; reads become repeatable as of this time
  pub fn set_read_ts(&mut self, global: &TxnGlobal, read_ts: Timestamp) -> Result<()> {
    if !self.is_running() {
      return Err(TernError::NoTransaction);
    }
    let oldest = global.ts.oldest();
    if read_ts < oldest {
      return Err(TernError::InvalidArgument(format!(
        "read timestamp {read_ts} older than oldest {oldest}"
      )));
    }
    self.read_ts = read_ts;
    self.shared.pinned_ts.store(read_ts, Ordering::Release);
    global.refresh_pinned_ts();
    Ok(())
  }

  /// The snapshot for the current operation, taken lazily at first read
  /// and refreshed per operation under read-committed
  pub fn ensure_snapshot(&mut self, global: &TxnGlobal) -> &Snapshot {
    let refresh = match self.isolation {
      Isolation::Snapshot => self.snapshot.is_none(),
      Isolation::ReadCommitted => true,
      Isolation::ReadUncommitted => self.snapshot.is_none(),
    };
    if refresh {
      self.snapshot = Some(global.take_snapshot(&self.shared));
    }
    self.snapshot.as_ref().expect("snapshot just taken")
  }

  /// Id for a write, assigned on the first modification
  pub fn id_for_write(&mut self, global: &TxnGlobal) -> Result<TxnId> {
    if self.isolation == Isolation::ReadUncommitted {
      return Err(TernError::InvalidArgument(
        "modifications are forbidden at read-uncommitted".to_string(),
      ));
    }
    if self.id == TXN_NONE {
      self.id = global.allocate_id(&self.shared);
      if self.id > TXN_MAX {
        return Err(TernError::Panic("transaction id space exhausted".to_string()));
      }
    }
    Ok(self.id)
  }

  pub fn add_mod_update(&mut self, upd: UpdateRef) {
    self.mods.push(TxnMod::Update(upd));
  }

  pub fn add_mod_page_del(&mut self, r: Arc<Ref>) {
    self.mods.push(TxnMod::PageDel(r));
  }

  /// Prepare: stamp every update in-progress so readers block on it
  pub fn prepare(&mut self, global: &TxnGlobal, prepare_ts: Timestamp) -> Result<()> {
    if !self.is_running() {
      return Err(TernError::NoTransaction);
    }
    if self.state == TxnState::Prepared {
      return Err(TernError::InvalidArgument("already prepared".to_string()));
    }
    let oldest = global.ts.oldest();
    if prepare_ts < oldest {
      return Err(TernError::InvalidArgument(format!(
        "prepare timestamp {prepare_ts} older than oldest {oldest}"
      )));
    }
    self.prepare_ts = prepare_ts;
    for m in &self.mods {
      if let TxnMod::Update(upd) = m {
        // The prepare timestamp rides in start_ts until commit replaces it;
        // readers use it to decide whether to report a prepare conflict
        upd.get().commit(prepare_ts, TS_NONE);
        upd.get().set_prepared();
      }
    }
    self.state = TxnState::Prepared;
    Ok(())
  }

  /// Commit: validate timestamps, publish them to every modification,
  /// resolve prepared updates, release the snapshot
  pub fn commit(
    &mut self,
    global: &TxnGlobal,
    commit_ts: Timestamp,
    durable_ts: Timestamp,
  ) -> Result<()> {
    if !self.is_running() {
      return Err(TernError::NoTransaction);
    }
    if self.needs_rollback {
      return Err(TernError::InvalidArgument(
        "transaction must roll back".to_string(),
      ));
    }
    let prepared = self.state == TxnState::Prepared;
    if prepared && commit_ts == TS_NONE {
      return Err(TernError::InvalidArgument(
        "prepared transactions require a commit timestamp".to_string(),
      ));
    }
    if commit_ts != TS_NONE {
      let oldest = global.ts.oldest();
      if commit_ts < oldest {
        return Err(TernError::InvalidArgument(format!(
          "commit timestamp {commit_ts} older than oldest {oldest}"
        )));
      }
      let stable = global.ts.stable();
      if stable != TS_NONE && commit_ts < stable {
        return Err(TernError::InvalidArgument(format!(
          "commit timestamp {commit_ts} behind stable {stable}"
        )));
      }
      if self.commit_ts != TS_NONE && commit_ts < self.commit_ts {
        return Err(TernError::InvalidArgument(
          "commit timestamp may not move backwards in a transaction".to_string(),
        ));
      }
      if prepared && commit_ts < self.prepare_ts {
        return Err(TernError::InvalidArgument(
          "commit timestamp older than prepare timestamp".to_string(),
        ));
      }
    }
    let durable_ts = if durable_ts == TS_NONE { commit_ts } else { durable_ts };
    if durable_ts < commit_ts {
      return Err(TernError::InvalidArgument(
        "durable timestamp older than commit timestamp".to_string(),
      ));
    }
    self.commit_ts = commit_ts;
    self.durable_ts = durable_ts;

    for m in &self.mods {
      match m {
        TxnMod::Update(upd) => {
          let upd = upd.get();
          upd.commit(commit_ts, durable_ts);
          if prepared {
            upd.resolve_prepare();
          }
        }
        TxnMod::PageDel(r) => {
          r.commit_page_del(commit_ts, durable_ts);
        }
      }
    }
    self.finish(global);
    Ok(())
  }

  /// Roll back: mark every update aborted and restore truncated refs
  pub fn rollback(&mut self, global: &TxnGlobal) {
    for m in &self.mods {
      match m {
        TxnMod::Update(upd) => upd.get().abort(),
        TxnMod::PageDel(r) => {
          for upd in r.take_del_updates() {
            upd.get().abort();
          }
          r.set_page_del(None);
          r.cas_state(RefState::Deleted, RefState::Disk);
        }
      }
    }
    self.finish(global);
  }

  fn finish(&mut self, global: &TxnGlobal) {
    self.shared.id.store(TXN_NONE, Ordering::Release);
    global.release_snapshot(&self.shared);
    self.id = TXN_NONE;
    self.snapshot = None;
    self.read_ts = TS_NONE;
    self.commit_ts = TS_NONE;
    self.durable_ts = TS_NONE;
    self.prepare_ts = TS_NONE;
    self.mods.clear();
    self.state = TxnState::Idle;
    self.needs_rollback = false;
    self.explicit = false;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::page::update::{install, Update, UpdateKind};
  use std::ptr;
  use std::sync::atomic::AtomicPtr;

  #[test]
  fn ids_are_monotonic_and_snapshots_exclude_self() {
    let global = TxnGlobal::new();
    let s1 = global.register_session();
    let s2 = global.register_session();
    let id1 = global.allocate_id(&s1);
    let id2 = global.allocate_id(&s2);
    assert!(id2 > id1);

    let snap = global.take_snapshot(&s1);
    assert!(snap.concurrent.contains(&id2));
    assert!(!snap.concurrent.contains(&id1));
  }

  #[test]
  fn oldest_id_tracks_running_writers() {
    let global = TxnGlobal::new();
    let s1 = global.register_session();
    let _s2 = global.register_session();
    let id1 = global.allocate_id(&s1);
    assert_eq!(global.oldest_id(), id1);
    s1.id.store(TXN_NONE, Ordering::Release);
    assert_eq!(global.oldest_id(), global.current_id());
  }

  #[test]
  fn commit_publishes_to_mod_list() {
    let global = TxnGlobal::new();
    let shared = global.register_session();
    let mut txn = Transaction::new(Arc::clone(&shared));
    txn.begin(Isolation::Snapshot, true).unwrap();
    let id = txn.id_for_write(&global).unwrap();

    let head = AtomicPtr::new(ptr::null_mut());
    let upd = install(
      &head,
      Update::new(UpdateKind::Standard, b"v".to_vec(), id),
      |_| Ok(()),
    )
    .unwrap();
    txn.add_mod_update(upd);
    txn.commit(&global, 100, TS_NONE).unwrap();

    let committed = crate::page::update::walk(&head).next().unwrap();
    assert_eq!(committed.start_ts(), 100);
    assert_eq!(committed.durable_ts(), 100);
    assert!(!txn.is_running());
    crate::page::update::free_chain(&head);
  }

  #[test]
  fn rollback_aborts_updates() {
    let global = TxnGlobal::new();
    let shared = global.register_session();
    let mut txn = Transaction::new(Arc::clone(&shared));
    txn.begin(Isolation::Snapshot, true).unwrap();
    let id = txn.id_for_write(&global).unwrap();

    let head = AtomicPtr::new(ptr::null_mut());
    let upd = install(
      &head,
      Update::new(UpdateKind::Standard, b"v".to_vec(), id),
      |_| Ok(()),
    )
    .unwrap();
    txn.add_mod_update(upd);
    txn.rollback(&global);

    assert!(crate::page::update::walk(&head).next().unwrap().is_aborted());
    crate::page::update::free_chain(&head);
  }

  #[test]
  fn prepared_commit_requires_timestamp_and_resolves() {
    let global = TxnGlobal::new();
    let shared = global.register_session();
    let mut txn = Transaction::new(Arc::clone(&shared));
    txn.begin(Isolation::Snapshot, true).unwrap();
    let id = txn.id_for_write(&global).unwrap();

    let head = AtomicPtr::new(ptr::null_mut());
    let upd = install(
      &head,
      Update::new(UpdateKind::Standard, b"v".to_vec(), id),
      |_| Ok(()),
    )
    .unwrap();
    txn.add_mod_update(upd);
    txn.prepare(&global, 50).unwrap();
    assert!(matches!(
      txn.commit(&global, TS_NONE, TS_NONE),
      Err(TernError::InvalidArgument(_))
    ));
    assert!(matches!(
      txn.commit(&global, 40, TS_NONE),
      Err(TernError::InvalidArgument(_))
    ));
    txn.commit(&global, 60, 70).unwrap();
    let committed = crate::page::update::walk(&head).next().unwrap();
    assert_eq!(
      committed.prepare_state(),
      crate::page::update::PrepareState::Resolved
    );
    assert_eq!(committed.durable_ts(), 70);
    crate::page::update::free_chain(&head);
  }

  #[test]
  fn commit_before_oldest_is_rejected() {
    let global = TxnGlobal::new();
    global.ts.set(Some(100), Some(100)).unwrap();
    let shared = global.register_session();
    let mut txn = Transaction::new(shared);
    txn.begin(Isolation::Snapshot, true).unwrap();
    txn.id_for_write(&global).unwrap();
    assert!(matches!(
      txn.commit(&global, 50, TS_NONE),
      Err(TernError::InvalidArgument(_))
    ));
  }
}
