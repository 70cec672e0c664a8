//! Cursor throughput: point reads and inserts against a warm cache.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use terndb::{Engine, EngineOptions, TableOptions};

fn bench_cursor(c: &mut Criterion) {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::open(dir.path(), EngineOptions::new().cache_max(256 * 1024 * 1024))
    .expect("open engine");
  engine.create("file:bench.tern", TableOptions::new()).unwrap();
  let session = engine.open_session().unwrap();
  let cursor = session.open_cursor("file:bench.tern").unwrap();

  let value = vec![0xabu8; 100];
  for i in 0..100_000u32 {
    cursor.insert(format!("{i:010}").as_bytes(), &value).unwrap();
  }
  engine.checkpoint(None).unwrap();

  let mut group = c.benchmark_group("cursor");
  group.bench_function("point_get", |b| {
    let mut i = 0u32;
    b.iter(|| {
      let key = format!("{:010}", i % 100_000);
      i = i.wrapping_add(7919);
      cursor.get(key.as_bytes()).unwrap()
    })
  });

  group.bench_function("insert_overwrite", |b| {
    let mut i = 0u32;
    b.iter_batched(
      || {
        let key = format!("{:010}", i % 100_000);
        i = i.wrapping_add(104_729);
        key
      },
      |key| cursor.insert(key.as_bytes(), &value).unwrap(),
      BatchSize::SmallInput,
    )
  });

  group.bench_function("scan_1000", |b| {
    b.iter(|| {
      cursor.reset();
      let mut n = 0;
      while n < 1000 {
        if cursor.next().unwrap().is_none() {
          break;
        }
        n += 1;
      }
      n
    })
  });
  group.finish();
}

criterion_group!(benches, bench_cursor);
criterion_main!(benches);
