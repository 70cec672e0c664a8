//! Basic key/value durability: insert, checkpoint, reopen, scan.

use terndb::{Engine, EngineOptions, ModifyOp, TableOptions, TernError};

fn open_engine(home: &std::path::Path) -> std::sync::Arc<Engine> {
  let _ = env_logger::builder().is_test(true).try_init();
  Engine::open(home, EngineOptions::new()).expect("open engine")
}

#[test]
fn insert_checkpoint_reopen_scan() {
  let dir = tempfile::tempdir().unwrap();

  {
    let engine = open_engine(dir.path());
    engine.create("file:kv.tern", TableOptions::new()).unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:kv.tern").unwrap();
    cursor.insert(b"k1", b"v1").unwrap();
    cursor.insert(b"k2", b"v2").unwrap();
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
    engine.close().unwrap();
  }

  let engine = open_engine(dir.path());
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:kv.tern").unwrap();
  let mut scanned = Vec::new();
  while let Some((key, value)) = cursor.next().unwrap() {
    scanned.push((key, value));
  }
  assert_eq!(
    scanned,
    vec![
      (b"k1".to_vec(), b"v1".to_vec()),
      (b"k2".to_vec(), b"v2".to_vec()),
    ]
  );
}

#[test]
fn overwrite_and_remove_survive_checkpoint() {
  let dir = tempfile::tempdir().unwrap();
  {
    let engine = open_engine(dir.path());
    engine.create("file:kv.tern", TableOptions::new()).unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:kv.tern").unwrap();
    for i in 0..100u32 {
      cursor
        .insert(format!("key{i:03}").as_bytes(), b"first")
        .unwrap();
    }
    cursor.update(b"key050", b"second").unwrap();
    cursor.remove(b"key051").unwrap();
    assert!(matches!(cursor.get(b"key051"), Err(TernError::NotFound)));
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
  }

  let engine = open_engine(dir.path());
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:kv.tern").unwrap();
  assert_eq!(cursor.get(b"key050").unwrap(), b"second");
  assert!(matches!(cursor.get(b"key051"), Err(TernError::NotFound)));
  assert_eq!(cursor.get(b"key000").unwrap(), b"first");
  let mut count = 0;
  while cursor.next().unwrap().is_some() {
    count += 1;
  }
  assert_eq!(count, 99);
}

#[test]
fn reverse_scan_matches_forward() {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(dir.path());
  engine.create("file:kv.tern", TableOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:kv.tern").unwrap();
  for i in 0..50u32 {
    cursor
      .insert(format!("{i:04}").as_bytes(), format!("v{i}").as_bytes())
      .unwrap();
  }
  let mut forward = Vec::new();
  while let Some((key, _)) = cursor.next().unwrap() {
    forward.push(key);
  }
  cursor.reset();
  let mut backward = Vec::new();
  while let Some((key, _)) = cursor.prev().unwrap() {
    backward.push(key);
  }
  backward.reverse();
  assert_eq!(forward, backward);
  assert_eq!(forward.len(), 50);
}

#[test]
fn modify_squashes_through_checkpoint() {
  let dir = tempfile::tempdir().unwrap();
  {
    let engine = open_engine(dir.path());
    engine.create("file:kv.tern", TableOptions::new()).unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:kv.tern").unwrap();
    cursor.insert(b"doc", b"hello world").unwrap();
    cursor
      .modify(
        b"doc",
        &[ModifyOp {
          offset: 0,
          remove_size: 5,
          data: b"HELLO".to_vec(),
        }],
      )
      .unwrap();
    assert_eq!(cursor.get(b"doc").unwrap(), b"HELLO world");
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
  }

  let engine = open_engine(dir.path());
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:kv.tern").unwrap();
  assert_eq!(cursor.get(b"doc").unwrap(), b"HELLO world");
}

#[test]
fn large_values_roundtrip_through_overflow_blocks() {
  let dir = tempfile::tempdir().unwrap();
  let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
  {
    let engine = open_engine(dir.path());
    engine.create("file:kv.tern", TableOptions::new()).unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:kv.tern").unwrap();
    cursor.insert(b"big", &big).unwrap();
    cursor.insert(b"small", b"s").unwrap();
    assert_eq!(cursor.get(b"big").unwrap(), big);
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
  }

  let engine = open_engine(dir.path());
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:kv.tern").unwrap();
  assert_eq!(cursor.get(b"big").unwrap(), big);
  assert_eq!(cursor.get(b"small").unwrap(), b"s");
}

#[test]
fn named_checkpoints_coexist_with_unnamed() {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(dir.path());
  engine.create("file:kv.tern", TableOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:kv.tern").unwrap();
  cursor.insert(b"a", b"1").unwrap();
  engine.checkpoint(Some("backup")).unwrap();
  cursor.insert(b"b", b"2").unwrap();
  engine.checkpoint(None).unwrap();
  // Both checkpoints resolved without disturbing reads
  assert_eq!(cursor.get(b"a").unwrap(), b"1");
  assert_eq!(cursor.get(b"b").unwrap(), b"2");
}
