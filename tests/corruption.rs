//! Checksum failures: a flipped byte is detected and contained.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use terndb::{Engine, EngineOptions, TableOptions, TernError};

#[test]
fn flipped_byte_is_corruption_neighbors_survive() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();

  {
    let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
    engine.create("file:c.tern", TableOptions::new()).unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:c.tern").unwrap();
    cursor.insert(b"k", b"v").unwrap();
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
    engine.close().unwrap();
  }

  // The first block written after the description sector is the root leaf
  let path = dir.path().join("c.tern");
  {
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(4096 + 100)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xff;
    file.seek(SeekFrom::Start(4096 + 100)).unwrap();
    file.write_all(&byte).unwrap();
    file.sync_all().unwrap();
  }

  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:c.tern").unwrap();
  assert!(matches!(cursor.get(b"k"), Err(TernError::Corruption(_))));
  // The session remembers the failure
  assert_eq!(session.get_last_error().unwrap().code, -6);
  // The connection stays up: other tables keep working
  drop(cursor);
  engine.create("file:ok.tern", TableOptions::new()).unwrap();
  let ok = session.open_cursor("file:ok.tern").unwrap();
  ok.insert(b"still", b"alive").unwrap();
  assert_eq!(ok.get(b"still").unwrap(), b"alive");
}

#[test]
fn verify_reports_damage_and_clean_tables_pass() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();

  {
    let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
    engine.create("file:v.tern", TableOptions::new()).unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:v.tern").unwrap();
    for i in 0..500u32 {
      cursor
        .insert(format!("{i:06}").as_bytes(), b"value")
        .unwrap();
    }
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
    let report = engine.verify("file:v.tern").unwrap();
    assert!(report.valid);
    engine.close().unwrap();
  }

  let path = dir.path().join("v.tern");
  {
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(4096 + 64)).unwrap();
    file.write_all(&[0xff; 8]).unwrap();
    file.sync_all().unwrap();
  }

  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  assert!(matches!(
    engine.verify("file:v.tern"),
    Err(TernError::Corruption(_))
  ));
}

#[test]
fn salvage_rebuilds_from_surviving_blocks() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();

  {
    let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
    engine.create("file:s.tern", TableOptions::new()).unwrap();
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:s.tern").unwrap();
    for i in 0..2000u32 {
      let mut value = format!("value-{i}").into_bytes();
      value.resize(100, b'x');
      cursor.insert(format!("{i:06}").as_bytes(), &value).unwrap();
    }
    engine.checkpoint(None).unwrap();
    drop(cursor);
    drop(session);
    engine.close().unwrap();
  }

  // Wreck one block in the middle of the file; salvage keeps the rest
  let path = dir.path().join("s.tern");
  let file_len = std::fs::metadata(&path).unwrap().len();
  {
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let target = (file_len / 2 / 4096) * 4096;
    file.seek(SeekFrom::Start(target)).unwrap();
    file.write_all(&[0xa5; 32]).unwrap();
    file.sync_all().unwrap();
  }

  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  engine.salvage("file:s.tern").unwrap();

  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:s.tern").unwrap();
  let mut recovered = 0u32;
  while let Some((key, value)) = cursor.next().unwrap() {
    let i: u32 = String::from_utf8(key).unwrap().parse().unwrap();
    assert!(value.starts_with(format!("value-{i}").as_bytes()));
    assert_eq!(value.len(), 100);
    recovered += 1;
  }
  // Most records survive; the wrecked block's records are gone
  assert!(recovered > 1000, "only {recovered} records recovered");
  assert!(recovered <= 2000);
  // And the rebuilt table verifies clean
  let report = engine.verify("file:s.tern").unwrap();
  assert!(report.valid);
}
