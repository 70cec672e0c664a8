//! Range truncate with timestamps, checkpoint, and recovery.

use terndb::{Engine, EngineOptions, Isolation, TableOptions, TernError};

fn key(i: u32) -> Vec<u8> {
  format!("{i:08}").into_bytes()
}

#[test]
fn truncate_range_survives_reopen() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();

  {
    let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
    engine.create("file:big.tern", TableOptions::new()).unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:big.tern").unwrap();
    for i in 1..=10_000u32 {
      cursor.insert(&key(i), b"payload").unwrap();
    }
    // Split the tree into on-disk leaves so whole subtrees can be
    // fast-truncated without being read
    engine.checkpoint(None).unwrap();

    session.begin_transaction(Isolation::Snapshot).unwrap();
    session
      .truncate("file:big.tern", &key(3000), &key(7000))
      .unwrap();
    session.commit_transaction(50, 0).unwrap();

    engine.set_timestamps(Some(50), Some(50)).unwrap();
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
    engine.close().unwrap();
  }

  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:big.tern").unwrap();
  let mut count = 0u32;
  let mut in_range = 0u32;
  while let Some((k, _)) = cursor.next().unwrap() {
    count += 1;
    if k >= key(3000) && k <= key(7000) {
      in_range += 1;
    }
  }
  assert_eq!(in_range, 0);
  assert_eq!(count, 10_000 - 4_001);
  assert!(matches!(cursor.get(&key(5000)), Err(TernError::NotFound)));
  assert_eq!(cursor.get(&key(2999)).unwrap(), b"payload");
  assert_eq!(cursor.get(&key(7001)).unwrap(), b"payload");
}

#[test]
fn uncommitted_truncate_rolls_back() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  engine.create("file:t.tern", TableOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:t.tern").unwrap();
  for i in 1..=1000u32 {
    cursor.insert(&key(i), b"v").unwrap();
  }
  engine.checkpoint(None).unwrap();

  session.begin_transaction(Isolation::Snapshot).unwrap();
  session.truncate("file:t.tern", &key(1), &key(1000)).unwrap();
  // The truncating transaction no longer sees the range
  assert!(matches!(cursor.get(&key(500)), Err(TernError::NotFound)));
  session.rollback_transaction().unwrap();

  // Everything is back
  let mut count = 0;
  while cursor.next().unwrap().is_some() {
    count += 1;
  }
  assert_eq!(count, 1000);
}

#[test]
fn pre_truncate_readers_keep_their_snapshot() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  engine.create("file:t.tern", TableOptions::new()).unwrap();
  let writer = engine.open_session().unwrap();
  let wc = writer.open_cursor("file:t.tern").unwrap();
  writer.begin_transaction(Isolation::Snapshot).unwrap();
  for i in 1..=10_000u32 {
    wc.insert(&key(i), b"v").unwrap();
  }
  writer.commit_transaction(10, 0).unwrap();
  // Split the tree so the truncate can fast-delete whole subtrees
  engine.checkpoint(None).unwrap();

  // Reader pinned before the truncate
  let reader = engine.open_session().unwrap();
  let rc = reader.open_cursor("file:t.tern").unwrap();
  reader.begin_transaction(Isolation::Snapshot).unwrap();
  reader.timestamp_transaction(20).unwrap();
  assert_eq!(rc.get(&key(100)).unwrap(), b"v");

  writer.begin_transaction(Isolation::Snapshot).unwrap();
  writer.truncate("file:t.tern", &key(1), &key(10_000)).unwrap();
  writer.commit_transaction(30, 0).unwrap();

  // Boundary keys come back through tombstone chains; keys in the middle
  // force a fast-truncated subtree to instantiate its pre-truncate image
  assert_eq!(rc.get(&key(100)).unwrap(), b"v");
  assert_eq!(rc.get(&key(5000)).unwrap(), b"v");
  assert_eq!(rc.get(&key(9999)).unwrap(), b"v");
  reader.rollback_transaction().unwrap();

  // New readers see the emptiness
  let late = engine.open_session().unwrap();
  let lc = late.open_cursor("file:t.tern").unwrap();
  assert!(matches!(lc.get(&key(100)), Err(TernError::NotFound)));
  assert!(matches!(lc.get(&key(5000)), Err(TernError::NotFound)));
}
