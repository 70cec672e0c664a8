//! Column stores: record-number cursors, appends, fixed-width values.

use terndb::{Engine, EngineOptions, KeyFormat, TableOptions, TernError};

#[test]
fn variable_column_append_scan_reopen() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();

  {
    let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
    engine
      .create(
        "file:events.tern",
        TableOptions::new().key_format(KeyFormat::RecNo),
      )
      .unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:events.tern").unwrap();
    for i in 0..500u32 {
      let recno = cursor.col_append(format!("event-{i}").as_bytes()).unwrap();
      assert_eq!(recno, u64::from(i) + 1);
    }
    cursor.col_remove(100).unwrap();
    assert!(matches!(cursor.col_get(100), Err(TernError::NotFound)));
    assert_eq!(cursor.col_get(101).unwrap(), b"event-100");
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
    engine.close().unwrap();
  }

  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:events.tern").unwrap();
  let mut seen = Vec::new();
  while let Some((recno, value)) = cursor.col_next().unwrap() {
    seen.push((recno, value));
  }
  assert_eq!(seen.len(), 499);
  // Record numbers ascend strictly and skip the removed record
  assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
  assert!(seen.iter().all(|(recno, _)| *recno != 100));
  assert_eq!(seen[0], (1, b"event-0".to_vec()));

  // Appends continue past the recovered maximum
  let recno = cursor.col_append(b"fresh").unwrap();
  assert_eq!(recno, 501);
}

#[test]
fn fixed_column_bit_packing_roundtrip() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();

  {
    let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
    engine
      .create(
        "file:flags.tern",
        TableOptions::new()
          .key_format(KeyFormat::RecNoFixed)
          .fixed_bitsize(4),
      )
      .unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:flags.tern").unwrap();
    for i in 0..200u64 {
      cursor.col_insert(i + 1, &[(i % 16) as u8]).unwrap();
    }
    // Values wider than the bit size are rejected
    assert!(matches!(
      cursor.col_insert(1, &[0x55]),
      Err(TernError::InvalidArgument(_))
    ));
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
    engine.close().unwrap();
  }

  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:flags.tern").unwrap();
  for i in 0..200u64 {
    assert_eq!(cursor.col_get(i + 1).unwrap(), vec![(i % 16) as u8]);
  }
}

#[test]
fn column_truncate_range() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  engine
    .create(
      "file:events.tern",
      TableOptions::new().key_format(KeyFormat::RecNo),
    )
    .unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:events.tern").unwrap();
  for _ in 0..300u32 {
    cursor.col_append(b"v").unwrap();
  }
  session.truncate_recno("file:events.tern", 100, 199).unwrap();
  let mut remaining = 0;
  while cursor.col_next().unwrap().is_some() {
    remaining += 1;
  }
  assert_eq!(remaining, 200);
}
