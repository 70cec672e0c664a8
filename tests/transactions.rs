//! Transactional behavior: conflicts, snapshots, timestamps, prepare.

use terndb::{
  Engine, EngineOptions, Isolation, RollbackReason, TableOptions, TernError,
};

fn open_engine(home: &std::path::Path) -> std::sync::Arc<Engine> {
  let _ = env_logger::builder().is_test(true).try_init();
  Engine::open(home, EngineOptions::new()).expect("open engine")
}

#[test]
fn concurrent_updates_conflict_and_loser_rolls_back() {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(dir.path());
  engine.create("file:t.tern", TableOptions::new()).unwrap();

  let seed = engine.open_session().unwrap();
  let seed_cursor = seed.open_cursor("file:t.tern").unwrap();
  seed_cursor.insert(b"k", b"base").unwrap();

  let s1 = engine.open_session().unwrap();
  let s2 = engine.open_session().unwrap();
  let c1 = s1.open_cursor("file:t.tern").unwrap();
  let c2 = s2.open_cursor("file:t.tern").unwrap();

  s1.begin_transaction(Isolation::Snapshot).unwrap();
  s2.begin_transaction(Isolation::Snapshot).unwrap();
  c1.update(b"k", b"a").unwrap();
  // The second writer loses the chain race
  let err = c2.update(b"k", b"b").unwrap_err();
  assert!(matches!(
    err,
    TernError::Rollback(RollbackReason::WriteConflict)
  ));
  // Only rollback is allowed on the loser now
  assert!(matches!(
    c2.update(b"k", b"b2"),
    Err(TernError::InvalidArgument(_))
  ));
  s2.rollback_transaction().unwrap();
  s1.commit_transaction(0, 0).unwrap();

  assert_eq!(seed_cursor.get(b"k").unwrap(), b"a");
}

#[test]
fn snapshot_reads_are_repeatable_at_read_ts() {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(dir.path());
  engine.create("file:t.tern", TableOptions::new()).unwrap();

  // Version at commit_ts 5
  let writer = engine.open_session().unwrap();
  let wc = writer.open_cursor("file:t.tern").unwrap();
  writer.begin_transaction(Isolation::Snapshot).unwrap();
  wc.insert(b"k", b"old").unwrap();
  writer.commit_transaction(5, 0).unwrap();

  // Reader pinned at ts 10
  let reader = engine.open_session().unwrap();
  let rc = reader.open_cursor("file:t.tern").unwrap();
  reader.begin_transaction(Isolation::Snapshot).unwrap();
  reader.timestamp_transaction(10).unwrap();
  assert_eq!(rc.get(b"k").unwrap(), b"old");

  // A commit at ts 20 is invisible to the pinned reader
  writer.begin_transaction(Isolation::Snapshot).unwrap();
  wc.insert(b"k", b"new").unwrap();
  writer.commit_transaction(20, 0).unwrap();

  assert_eq!(rc.get(b"k").unwrap(), b"old");
  assert!(matches!(rc.get(b"missing"), Err(TernError::NotFound)));
  reader.rollback_transaction().unwrap();

  // A fresh reader above ts 20 sees the new version
  let late = engine.open_session().unwrap();
  let lc = late.open_cursor("file:t.tern").unwrap();
  late.begin_transaction(Isolation::Snapshot).unwrap();
  late.timestamp_transaction(25).unwrap();
  assert_eq!(lc.get(b"k").unwrap(), b"new");
}

#[test]
fn rollback_discards_writes() {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(dir.path());
  engine.create("file:t.tern", TableOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:t.tern").unwrap();

  session.begin_transaction(Isolation::Snapshot).unwrap();
  cursor.insert(b"gone", b"soon").unwrap();
  assert_eq!(cursor.get(b"gone").unwrap(), b"soon"); // read-your-writes
  session.rollback_transaction().unwrap();

  assert!(matches!(cursor.get(b"gone"), Err(TernError::NotFound)));
}

#[test]
fn prepared_transaction_lifecycle() {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(dir.path());
  engine.create("file:t.tern", TableOptions::new()).unwrap();

  let writer = engine.open_session().unwrap();
  let wc = writer.open_cursor("file:t.tern").unwrap();
  writer.begin_transaction(Isolation::Snapshot).unwrap();
  wc.insert(b"k", b"prepared-value").unwrap();
  writer.prepare_transaction(30).unwrap();

  // A reader below the prepare timestamp passes the update by
  let early = engine.open_session().unwrap();
  let ec = early.open_cursor("file:t.tern").unwrap();
  early.begin_transaction(Isolation::Snapshot).unwrap();
  early.timestamp_transaction(20).unwrap();
  assert!(matches!(ec.get(b"k"), Err(TernError::NotFound)));
  early.rollback_transaction().unwrap();

  // A reader overlapping it surfaces the prepare conflict after its
  // bounded wait
  let blocked = engine.open_session().unwrap();
  let bc = blocked.open_cursor("file:t.tern").unwrap();
  blocked.begin_transaction(Isolation::Snapshot).unwrap();
  blocked.timestamp_transaction(40).unwrap();
  assert!(matches!(bc.get(b"k"), Err(TernError::PrepareConflict)));
  assert_eq!(blocked.get_last_error().unwrap().code, -4);
  blocked.rollback_transaction().unwrap();

  // Commit must carry a timestamp no older than the prepare
  assert!(writer.commit_transaction(0, 0).is_err());
  writer.commit_transaction(35, 40).unwrap();

  let late = engine.open_session().unwrap();
  let lc = late.open_cursor("file:t.tern").unwrap();
  late.begin_transaction(Isolation::Snapshot).unwrap();
  late.timestamp_transaction(40).unwrap();
  assert_eq!(lc.get(b"k").unwrap(), b"prepared-value");
}

#[test]
fn reserve_blocks_other_writers() {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(dir.path());
  engine.create("file:t.tern", TableOptions::new()).unwrap();
  let seed = engine.open_session().unwrap();
  seed
    .open_cursor("file:t.tern")
    .unwrap()
    .insert(b"k", b"v")
    .unwrap();

  let holder = engine.open_session().unwrap();
  let hc = holder.open_cursor("file:t.tern").unwrap();
  holder.begin_transaction(Isolation::Snapshot).unwrap();
  hc.reserve(b"k").unwrap();

  let other = engine.open_session().unwrap();
  let oc = other.open_cursor("file:t.tern").unwrap();
  assert!(matches!(
    oc.update(b"k", b"stolen"),
    Err(TernError::Rollback(RollbackReason::WriteConflict))
  ));

  holder.rollback_transaction().unwrap();
  // The reserve never carried a value
  assert_eq!(oc.get(b"k").unwrap(), b"v");
}

#[test]
fn commit_timestamp_validation() {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(dir.path());
  engine.create("file:t.tern", TableOptions::new()).unwrap();
  engine.set_timestamps(Some(100), Some(100)).unwrap();

  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:t.tern").unwrap();
  session.begin_transaction(Isolation::Snapshot).unwrap();
  cursor.insert(b"k", b"v").unwrap();
  // Behind oldest/stable
  assert!(session.commit_transaction(50, 0).is_err());
  session.commit_transaction(150, 0).unwrap();

  // Timestamps may not move backwards
  assert!(engine.set_timestamps(Some(50), None).is_err());
}

#[test]
fn read_uncommitted_sees_in_flight_writes() {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(dir.path());
  engine.create("file:t.tern", TableOptions::new()).unwrap();

  let writer = engine.open_session().unwrap();
  let wc = writer.open_cursor("file:t.tern").unwrap();
  writer.begin_transaction(Isolation::Snapshot).unwrap();
  wc.insert(b"k", b"dirty").unwrap();

  let reader = engine.open_session().unwrap();
  let rc = reader.open_cursor("file:t.tern").unwrap();
  reader
    .begin_transaction(Isolation::ReadUncommitted)
    .unwrap();
  assert_eq!(rc.get(b"k").unwrap(), b"dirty");
  // Modifications are forbidden at read-uncommitted
  assert!(rc.insert(b"x", b"y").is_err());
  reader.rollback_transaction().unwrap();
  writer.rollback_transaction().unwrap();
}
