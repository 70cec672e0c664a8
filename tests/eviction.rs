//! Cache pressure: eviction keeps a bounded cache while data exceeds it.

use terndb::{Engine, EngineOptions, TableOptions};

#[test]
fn working_set_larger_than_cache() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(
    dir.path(),
    EngineOptions::new().cache_max(2 * 1024 * 1024),
  )
  .unwrap();
  engine.create("file:hot.tern", TableOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:hot.tern").unwrap();

  let value = vec![0x42u8; 512];
  for i in 0..8_000u32 {
    cursor.insert(format!("{i:08}").as_bytes(), &value).unwrap();
    // Checkpoints split the tree into evictable leaves and bound the
    // dirty set well below the cache ceiling
    if i % 1000 == 999 {
      engine.checkpoint(None).unwrap();
    }
  }
  engine.checkpoint(None).unwrap();

  // Everything reads back even though the data is twice the cache
  for i in (0..8_000u32).step_by(97) {
    assert_eq!(cursor.get(format!("{i:08}").as_bytes()).unwrap(), value);
  }

  let stats = engine.stats();
  assert!(stats.pages_evicted > 0, "no eviction under cache pressure");
  assert!(
    stats.cache_bytes_inmem < 8 * 1024 * 1024,
    "cache accounting ran away: {} bytes",
    stats.cache_bytes_inmem
  );
}

#[test]
fn scans_stay_consistent_while_eviction_churns() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(
    dir.path(),
    EngineOptions::new().cache_max(2 * 1024 * 1024),
  )
  .unwrap();
  engine.create("file:pin.tern", TableOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:pin.tern").unwrap();

  let value = vec![7u8; 256];
  for i in 0..8_000u32 {
    cursor.insert(format!("{i:08}").as_bytes(), &value).unwrap();
    if i % 1000 == 999 {
      engine.checkpoint(None).unwrap();
    }
  }
  engine.checkpoint(None).unwrap();

  // The scanning cursor's hazard reference keeps its current leaf safe
  // while the eviction server reclaims everything else
  let scanner = session.open_cursor("file:pin.tern").unwrap();
  let mut count = 0u32;
  while let Some((_, v)) = scanner.next().unwrap() {
    assert_eq!(v, value);
    count += 1;
  }
  assert_eq!(count, 8_000);
}
