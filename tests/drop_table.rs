//! Dropping tables: busy handles, metadata cleanup, dropped-object errors.

use terndb::{BusyReason, Engine, EngineOptions, TableOptions, TernError};

#[test]
fn drop_removes_table_and_file() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  engine.create("file:d.tern", TableOptions::new()).unwrap();
  {
    let session = engine.open_session().unwrap();
    let cursor = session.open_cursor("file:d.tern").unwrap();
    cursor.insert(b"k", b"v").unwrap();
    engine.checkpoint(None).unwrap();

    // An open cursor keeps the handle busy
    assert!(matches!(
      engine.drop_table("file:d.tern"),
      Err(TernError::Busy(BusyReason::HandleInUse))
    ));
    drop(cursor);
    drop(session);
  }

  engine.drop_table("file:d.tern").unwrap();
  assert!(!dir.path().join("d.tern").exists());

  let session = engine.open_session().unwrap();
  assert!(matches!(
    session.open_cursor("file:d.tern"),
    Err(TernError::ObjectNotFound(_))
  ));
  assert!(matches!(
    engine.drop_table("file:d.tern"),
    Err(TernError::ObjectNotFound(_))
  ));

  // The name is reusable
  engine.create("file:d.tern", TableOptions::new()).unwrap();
  let cursor = session.open_cursor("file:d.tern").unwrap();
  assert!(matches!(cursor.get(b"k"), Err(TernError::NotFound)));
}

#[test]
fn create_refuses_duplicates_and_bad_uris() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  engine.create("file:x.tern", TableOptions::new()).unwrap();
  assert!(matches!(
    engine.create("file:x.tern", TableOptions::new()),
    Err(TernError::ObjectExists(_))
  ));
  assert!(matches!(
    engine.create("table:x", TableOptions::new()),
    Err(TernError::InvalidArgument(_))
  ));
  assert!(matches!(
    engine.create("file:../escape", TableOptions::new()),
    Err(TernError::InvalidArgument(_))
  ));
}

#[test]
fn second_engine_on_same_home_is_locked_out() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(dir.path(), EngineOptions::new()).unwrap();
  assert!(matches!(
    Engine::open(dir.path(), EngineOptions::new()),
    Err(TernError::LockFailed(_))
  ));
  drop(engine);
  Engine::open(dir.path(), EngineOptions::new()).unwrap();
}
