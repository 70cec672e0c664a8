//! Visibility predicates
//!
//! Three questions drive every read and every reconciliation choice: is an
//! update visible to this transaction (by id and by timestamp), is an
//! update visible to everyone (safe to discard older history), and is an
//! on-disk time window visible at a read timestamp.

use crate::constants::{TS_NONE, TXN_NONE};
use crate::error::{Result, TernError};
use crate::page::update::{walk, PrepareState, Update, UpdateKind};
use crate::types::{TimeWindow, Timestamp};

use super::{Isolation, Transaction, TxnGlobal};

/// Is `upd` visible to `txn`? The caller must have fixed the transaction's
/// snapshot (`ensure_snapshot`) before walking chains. Returns
/// `PrepareConflict` when the update is prepared and the reader's timestamp
/// overlaps it.
pub fn upd_visible(txn: &Transaction, upd: &Update) -> Result<bool> {
  if upd.is_aborted() {
    return Ok(false);
  }
  let id = upd.txn_id();
  // Read-your-writes, prepared or not
  if id != TXN_NONE && id == txn.id() {
    return Ok(true);
  }
  if txn.isolation == Isolation::ReadUncommitted {
    return Ok(true);
  }
  if upd.prepare_state() == PrepareState::InProgress {
    // The prepare timestamp rides in start_ts; a reader at or past it
    // cannot decide until the transaction resolves
    if txn.read_ts != TS_NONE && upd.start_ts() != TS_NONE && upd.start_ts() <= txn.read_ts {
      return Err(TernError::PrepareConflict);
    }
    return Ok(false);
  }
  let seen_by_id = match txn.snapshot() {
    Some(snapshot) => snapshot.sees(id),
    // No snapshot taken: treat any committed update as settled
    None => true,
  };
  if !seen_by_id {
    return Ok(false);
  }
  if txn.read_ts != TS_NONE && upd.start_ts() != TS_NONE && upd.start_ts() > txn.read_ts {
    return Ok(false);
  }
  Ok(true)
}

/// Is `upd` visible to every current and future reader? Monotonic: once
/// true it stays true until the update is physically discarded.
pub fn upd_visible_all(global: &TxnGlobal, upd: &Update) -> bool {
  if upd.is_aborted() || upd.prepare_state() == PrepareState::InProgress {
    return false;
  }
  let id = upd.txn_id();
  if id != TXN_NONE && id >= global.oldest_id() {
    return false;
  }
  let start_ts = upd.start_ts();
  start_ts == TS_NONE || start_ts <= global.ts.pinned_or_oldest()
}

/// Is an on-disk value's time window visible at `read_ts`? On-disk values
/// carry no transaction ids; their writers committed before the image was
/// written.
pub fn tw_visible(read_ts: Timestamp, tw: &TimeWindow) -> bool {
  if read_ts == TS_NONE {
    return tw.is_live();
  }
  if tw.start_ts != TS_NONE && tw.start_ts > read_ts {
    return false;
  }
  tw.is_live() || tw.stop_ts > read_ts
}

/// The first visible update on a chain, skipping reserve placeholders.
/// `None` means the reader falls through to the on-disk value.
pub fn visible_update<'a>(
  txn: &Transaction,
  head: &'a std::sync::atomic::AtomicPtr<Update>,
) -> Result<Option<&'a Update>> {
  for upd in walk(head) {
    if upd.kind() == UpdateKind::Reserve {
      // A reserve placeholder is visible only to its own transaction, and
      // carries no value either way
      continue;
    }
    if upd_visible(txn, upd)? {
      return Ok(Some(upd));
    }
  }
  Ok(None)
}

/// Can a writer with snapshot `txn` install on a chain whose newest entry
/// is `head`? The head must be visible (committed before us, or our own),
/// otherwise the write conflicts.
pub fn check_write_conflict(txn: &Transaction, head: Option<&Update>) -> Result<()> {
  let Some(head) = head else {
    return Ok(());
  };
  if head.is_aborted() {
    return Ok(());
  }
  if head.txn_id() == txn.id() {
    return Ok(());
  }
  match upd_visible(txn, head) {
    Ok(true) => Ok(()),
    // A prepared head is a conflict for writers, not a wait
    Ok(false) | Err(TernError::PrepareConflict) => Err(TernError::Rollback(
      crate::error::RollbackReason::WriteConflict,
    )),
    Err(e) => Err(e),
  }
}

/// A writer updating an on-disk value must also not be behind it in time
pub fn check_tw_write_conflict(txn: &Transaction, tw: &TimeWindow) -> Result<()> {
  if txn.read_ts != TS_NONE && !tw_visible(txn.read_ts, tw) && tw.start_ts > txn.read_ts {
    return Err(TernError::Rollback(
      crate::error::RollbackReason::WriteConflict,
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mvcc::TxnShared;
  use crate::page::update::install;
  use std::ptr;
  use std::sync::atomic::AtomicPtr;
  use std::sync::Arc;

  fn txn_with(global: &TxnGlobal) -> (Transaction, Arc<TxnShared>) {
    let shared = global.register_session();
    let txn = Transaction::new(Arc::clone(&shared));
    (txn, shared)
  }

  #[test]
  fn own_updates_are_visible() {
    let global = TxnGlobal::new();
    let (mut txn, _shared) = txn_with(&global);
    txn.begin(Isolation::Snapshot, true).unwrap();
    let id = txn.id_for_write(&global).unwrap();
    txn.ensure_snapshot(&global);
    let upd = Update::new(UpdateKind::Standard, b"v".to_vec(), id);
    assert!(upd_visible(&txn, &upd).unwrap());
  }

  #[test]
  fn concurrent_writer_is_invisible_under_snapshot() {
    let global = TxnGlobal::new();
    let (mut writer, _ws) = txn_with(&global);
    writer.begin(Isolation::Snapshot, true).unwrap();
    let writer_id = writer.id_for_write(&global).unwrap();

    let (mut reader, _rs) = txn_with(&global);
    reader.begin(Isolation::Snapshot, true).unwrap();
    reader.ensure_snapshot(&global);

    let upd = Update::new(UpdateKind::Standard, b"v".to_vec(), writer_id);
    upd.commit(10, 10); // even committed, the id was in flight at snapshot
    assert!(!upd_visible(&reader, &upd).unwrap());
    // But read-uncommitted sees it
    reader.isolation = Isolation::ReadUncommitted;
    assert!(upd_visible(&reader, &upd).unwrap());
  }

  /// Commit a single-update chain at `commit_ts`, through a real
  /// transaction so ids are settled in later snapshots
  fn committed_update(
    global: &TxnGlobal,
    head: &AtomicPtr<Update>,
    data: &[u8],
    commit_ts: Timestamp,
  ) {
    let (mut writer, _shared) = txn_with(global);
    writer.begin(Isolation::Snapshot, true).unwrap();
    let id = writer.id_for_write(global).unwrap();
    let upd = install(
      head,
      Update::new(UpdateKind::Standard, data.to_vec(), id),
      |_| Ok(()),
    )
    .unwrap();
    writer.add_mod_update(upd);
    writer.commit(global, commit_ts, TS_NONE).unwrap();
  }

  #[test]
  fn read_ts_filters_newer_commits() {
    let global = TxnGlobal::new();
    let head = AtomicPtr::new(ptr::null_mut());
    committed_update(&global, &head, b"old", 10);
    committed_update(&global, &head, b"new", 20);

    let (mut reader, _rs) = txn_with(&global);
    reader.begin(Isolation::Snapshot, true).unwrap();
    reader.set_read_ts(&global, 15).unwrap();
    reader.ensure_snapshot(&global);

    let mut chain = walk(&head);
    let newer = chain.next().unwrap();
    let older = chain.next().unwrap();
    assert!(!upd_visible(&reader, newer).unwrap());
    assert!(upd_visible(&reader, older).unwrap());
    crate::page::update::free_chain(&head);
  }

  #[test]
  fn prepared_update_conflicts_at_overlapping_read_ts() {
    let global = TxnGlobal::new();
    let (mut reader, _rs) = txn_with(&global);
    reader.begin(Isolation::Snapshot, true).unwrap();
    reader.set_read_ts(&global, 100).unwrap();
    reader.ensure_snapshot(&global);

    let upd = Update::new(UpdateKind::Standard, b"v".to_vec(), 7);
    upd.commit(50, TS_NONE); // prepare_ts rides in start_ts
    upd.set_prepared();
    assert!(matches!(
      upd_visible(&reader, &upd),
      Err(TernError::PrepareConflict)
    ));

    // A reader below the prepare timestamp passes it by
    let (mut early, _es) = txn_with(&global);
    early.begin(Isolation::Snapshot, true).unwrap();
    early.set_read_ts(&global, 40).unwrap();
    early.ensure_snapshot(&global);
    assert!(!upd_visible(&early, &upd).unwrap());
  }

  #[test]
  fn visible_all_requires_settled_id_and_old_timestamp() {
    let global = TxnGlobal::new();
    global.ts.set(Some(100), Some(100)).unwrap();
    let head = AtomicPtr::new(ptr::null_mut());
    committed_update(&global, &head, b"v", 50);
    let settled = walk(&head).next().unwrap();
    assert!(upd_visible_all(&global, settled));

    let (mut writer, _ws) = txn_with(&global);
    writer.begin(Isolation::Snapshot, true).unwrap();
    let wid = writer.id_for_write(&global).unwrap();
    let pending = Update::new(UpdateKind::Standard, b"v".to_vec(), wid);
    assert!(!upd_visible_all(&global, &pending));
    writer.rollback(&global);

    let newish = AtomicPtr::new(ptr::null_mut());
    committed_update(&global, &newish, b"v", 150);
    assert!(!upd_visible_all(&global, walk(&newish).next().unwrap()));
    crate::page::update::free_chain(&head);
    crate::page::update::free_chain(&newish);
  }

  #[test]
  fn time_window_visibility() {
    let live = TimeWindow {
      start_ts: 10,
      stop_ts: crate::constants::TS_MAX,
    };
    let stopped = TimeWindow {
      start_ts: 10,
      stop_ts: 20,
    };
    assert!(tw_visible(TS_NONE, &live));
    assert!(!tw_visible(TS_NONE, &stopped));
    assert!(tw_visible(15, &live));
    assert!(tw_visible(15, &stopped));
    assert!(!tw_visible(25, &stopped));
    assert!(!tw_visible(5, &live));
  }

  #[test]
  fn chain_walk_returns_newest_visible() {
    let global = TxnGlobal::new();
    let head = AtomicPtr::new(ptr::null_mut());
    committed_update(&global, &head, b"old", 10);
    committed_update(&global, &head, b"new", 30);

    let (mut reader, _rs) = txn_with(&global);
    reader.begin(Isolation::Snapshot, true).unwrap();
    reader.set_read_ts(&global, 20).unwrap();
    reader.ensure_snapshot(&global);
    let found = visible_update(&reader, &head).unwrap().unwrap();
    assert_eq!(found.data(), b"old");

    reader.rollback(&global);
    let mut late = Transaction::new(global.register_session());
    late.begin(Isolation::Snapshot, true).unwrap();
    late.ensure_snapshot(&global);
    let found = visible_update(&late, &head).unwrap().unwrap();
    assert_eq!(found.data(), b"new");
    crate::page::update::free_chain(&head);
  }

  #[test]
  fn write_conflict_on_invisible_head() {
    let global = TxnGlobal::new();
    let (mut writer_a, _sa) = txn_with(&global);
    writer_a.begin(Isolation::Snapshot, true).unwrap();
    let id_a = writer_a.id_for_write(&global).unwrap();
    writer_a.ensure_snapshot(&global);

    let (mut writer_b, _sb) = txn_with(&global);
    writer_b.begin(Isolation::Snapshot, true).unwrap();
    writer_b.id_for_write(&global).unwrap();
    writer_b.ensure_snapshot(&global);

    let upd_a = Update::new(UpdateKind::Standard, b"a".to_vec(), id_a);
    assert!(check_write_conflict(&writer_a, Some(&upd_a)).is_ok());
    assert!(matches!(
      check_write_conflict(&writer_b, Some(&upd_a)),
      Err(TernError::Rollback(_))
    ));
    // Once aborted, the head no longer conflicts
    upd_a.abort();
    assert!(check_write_conflict(&writer_b, Some(&upd_a)).is_ok());
  }
}
