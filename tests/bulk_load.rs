//! Bulk loading: sorted direct appends into a fresh table.

use terndb::{Engine, EngineOptions, KeyFormat, TableOptions, TernError};

#[test]
fn bulk_load_row_table_and_reopen() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();

  {
    let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
    engine.create("file:b.tern", TableOptions::new()).unwrap();
    let session = engine.open_session().unwrap();
    let mut bulk = session.open_bulk_cursor("file:b.tern").unwrap();
    for i in 0..20_000u32 {
      bulk
        .insert_row(format!("{i:08}").as_bytes(), format!("value-{i}").as_bytes())
        .unwrap();
    }
    session.bulk_finish(bulk).unwrap();
    engine.checkpoint(None).unwrap();
    drop(session);
    engine.close().unwrap();
  }

  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:b.tern").unwrap();
  assert_eq!(cursor.get(b"00000000").unwrap(), b"value-0");
  assert_eq!(cursor.get(b"00019999").unwrap(), b"value-19999");
  let mut count = 0;
  let mut prev: Option<Vec<u8>> = None;
  while let Some((key, _)) = cursor.next().unwrap() {
    if let Some(prev) = &prev {
      assert!(key > *prev, "bulk-loaded keys out of order");
    }
    prev = Some(key);
    count += 1;
  }
  assert_eq!(count, 20_000);
}

#[test]
fn bulk_rejects_unsorted_keys_and_nonempty_tables() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  engine.create("file:b.tern", TableOptions::new()).unwrap();
  let session = engine.open_session().unwrap();

  {
    let mut bulk = session.open_bulk_cursor("file:b.tern").unwrap();
    bulk.insert_row(b"m", b"1").unwrap();
    assert!(matches!(
      bulk.insert_row(b"a", b"2"),
      Err(TernError::InvalidArgument(_))
    ));
    assert!(matches!(
      bulk.insert_row(b"m", b"dup"),
      Err(TernError::InvalidArgument(_))
    ));
    session.bulk_finish(bulk).unwrap();
  }

  // The table now has data: a second bulk cursor is refused
  assert!(matches!(
    session.open_bulk_cursor("file:b.tern"),
    Err(TernError::InvalidArgument(_))
  ));
}

#[test]
fn bulk_load_column_table() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  engine
    .create(
      "file:c.tern",
      TableOptions::new().key_format(KeyFormat::RecNo),
    )
    .unwrap();
  let session = engine.open_session().unwrap();
  let mut bulk = session.open_bulk_cursor("file:c.tern").unwrap();
  for i in 0..5000u32 {
    let recno = bulk.insert_col(format!("r{i}").as_bytes()).unwrap();
    assert_eq!(recno, u64::from(i) + 1);
  }
  session.bulk_finish(bulk).unwrap();

  let cursor = session.open_cursor("file:c.tern").unwrap();
  assert_eq!(cursor.col_get(1).unwrap(), b"r0");
  assert_eq!(cursor.col_get(5000).unwrap(), b"r4999");
}
