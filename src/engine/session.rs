//! Sessions and cursors
//!
//! A session owns one transaction at a time (explicit or autocommit), a
//! hazard table, and the last-error side channel. Cursors share the
//! session's transaction through an `Arc<Mutex<..>>` handle, so several
//! cursors can work inside one transaction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::btree::cursor::TreeCursor;
use crate::constants::TS_NONE;
use crate::engine::{Engine, EngineShared};
use crate::error::{Result, RollbackReason, TernError};
use crate::mvcc::{Isolation, Transaction, TxnShared};
use crate::page::hazard::HazardTable;
use crate::types::{ModifyOp, RecNo, Timestamp};

/// Last failure of a session: numeric code, sub-level code, message
#[derive(Debug, Clone, Default)]
pub struct LastError {
  pub code: i32,
  pub sub_code: i32,
  pub message: String,
}

/// One session against an engine
pub struct Session {
  engine: Arc<Engine>,
  shared: Arc<EngineShared>,
  txn_shared: Arc<TxnShared>,
  txn: Arc<Mutex<Transaction>>,
  hazard: Arc<HazardTable>,
  /// Shared with this session's cursors so every failure lands here
  last_error: Arc<Mutex<Option<LastError>>>,
  /// Per-operation timeout; zero disables the timer
  pub operation_timeout: Duration,
}

fn record_last<T>(slot: &Mutex<Option<LastError>>, result: Result<T>) -> Result<T> {
  if let Err(e) = &result {
    *slot.lock() = Some(LastError {
      code: e.code(),
      sub_code: e.sub_code(),
      message: e.to_string(),
    });
  }
  result
}

impl Engine {
  /// Open a new session
  pub fn open_session(self: &Arc<Self>) -> Result<Session> {
    self.shared.check_poisoned()?;
    let txn_shared = self.shared.txn.register_session();
    let hazard = self.shared.hazards.register();
    Ok(Session {
      engine: Arc::clone(self),
      shared: Arc::clone(&self.shared),
      txn: Arc::new(Mutex::new(Transaction::new(Arc::clone(&txn_shared)))),
      txn_shared,
      hazard,
      last_error: Arc::new(Mutex::new(None)),
      operation_timeout: Duration::ZERO,
    })
  }
}

impl Session {
  fn record<T>(&self, result: Result<T>) -> Result<T> {
    record_last(&self.last_error, result)
  }

  /// The most recent error on this session
  pub fn get_last_error(&self) -> Option<LastError> {
    self.last_error.lock().clone()
  }

  // ==========================================================================
  // Transactions
  // ==========================================================================

  /// Begin an explicit transaction
  pub fn begin_transaction(&self, isolation: Isolation) -> Result<()> {
    let result = (|| {
      self.shared.check_poisoned()?;
      self.txn.lock().begin(isolation, true)
    })();
    self.record(result)
  }

  /// Fix the transaction's read timestamp
  pub fn timestamp_transaction(&self, read_ts: Timestamp) -> Result<()> {
    let result = self.txn.lock().set_read_ts(&self.shared.txn, read_ts);
    self.record(result)
  }

  /// Prepare the transaction at `prepare_ts`
  pub fn prepare_transaction(&self, prepare_ts: Timestamp) -> Result<()> {
    let result = self.txn.lock().prepare(&self.shared.txn, prepare_ts);
    self.record(result)
  }

  /// Commit, optionally at a commit (and durable) timestamp
  pub fn commit_transaction(
    &self,
    commit_ts: Timestamp,
    durable_ts: Timestamp,
  ) -> Result<()> {
    let result = (|| {
      self.shared.check_poisoned()?;
      let mut txn = self.txn.lock();
      let outcome = txn.commit(&self.shared.txn, commit_ts, durable_ts);
      if outcome.is_ok() {
        self
          .shared
          .stats
          .txn_commits
          .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
      }
      outcome
    })();
    self.record(result)
  }

  /// Roll the transaction back
  pub fn rollback_transaction(&self) -> Result<()> {
    let result = (|| {
      let mut txn = self.txn.lock();
      if !txn.is_running() {
        return Err(TernError::NoTransaction);
      }
      txn.rollback(&self.shared.txn);
      self
        .shared
        .stats
        .txn_rollbacks
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
      Ok(())
    })();
    self.record(result)
  }

  // ==========================================================================
  // Cursors and maintenance entry points
  // ==========================================================================

  /// Open a cursor on a table
  pub fn open_cursor(&self, uri: &str) -> Result<Cursor> {
    let result = (|| {
      self.shared.check_poisoned()?;
      let btree = self.engine.open_table(uri)?;
      Ok(Cursor {
        engine: Arc::clone(&self.engine),
        shared: Arc::clone(&self.shared),
        txn: Arc::clone(&self.txn),
        inner: Mutex::new(TreeCursor::new(btree, Arc::clone(&self.hazard))),
        last_error: Arc::clone(&self.last_error),
        operation_timeout: self.operation_timeout,
      })
    })();
    self.record(result)
  }

  /// Open a bulk-load cursor; the table must be empty
  pub fn open_bulk_cursor(&self, uri: &str) -> Result<crate::btree::bulk::BulkCursor> {
    let result = (|| {
      self.shared.check_poisoned()?;
      let btree = self.engine.open_table(uri)?;
      crate::btree::bulk::BulkCursor::open(btree)
    })();
    self.record(result)
  }

  /// Finish a bulk load: flush the final chunk and publish the new root
  pub fn bulk_finish(&self, bulk: crate::btree::bulk::BulkCursor) -> Result<()> {
    let result = bulk.close(&self.shared);
    self.record(result)
  }

  /// Remove all row keys in `[start, stop]`
  pub fn truncate(&self, uri: &str, start: &[u8], stop: &[u8]) -> Result<()> {
    let result = (|| {
      self.shared.check_poisoned()?;
      let btree = self.engine.open_table(uri)?;
      self.with_txn(|txn| btree.truncate_rows(&self.shared, txn, start, stop))
    })();
    self.record(result)
  }

  /// Remove all records in `[start, stop]` of a column store
  pub fn truncate_recno(&self, uri: &str, start: RecNo, stop: RecNo) -> Result<()> {
    let result = (|| {
      self.shared.check_poisoned()?;
      let btree = self.engine.open_table(uri)?;
      self.with_txn(|txn| btree.truncate_recnos(&self.shared, txn, start, stop))
    })();
    self.record(result)
  }

  /// Autocommit wrapper shared by session-level writes
  fn with_txn<R>(&self, f: impl FnOnce(&mut Transaction) -> Result<R>) -> Result<R> {
    let mut txn = self.txn.lock();
    run_in_txn(&self.shared, &mut txn, f)
  }
}

impl Drop for Session {
  fn drop(&mut self) {
    let mut txn = self.txn.lock();
    if txn.is_running() {
      txn.rollback(&self.shared.txn);
    }
    drop(txn);
    self.shared.txn.unregister_session(&self.txn_shared);
    self.shared.hazards.unregister(&self.hazard);
  }
}

/// Run `f` inside the session transaction, opening and resolving an
/// autocommit transaction when none is active. Rollback-class failures mark
/// an explicit transaction rollback-only.
fn run_in_txn<R>(
  shared: &EngineShared,
  txn: &mut Transaction,
  f: impl FnOnce(&mut Transaction) -> Result<R>,
) -> Result<R> {
  if txn.needs_rollback {
    return Err(TernError::InvalidArgument(
      "transaction must roll back".to_string(),
    ));
  }
  let implicit = !txn.is_running();
  if implicit {
    txn.begin(Isolation::Snapshot, false)?;
  }
  let result = f(txn);
  if implicit {
    match &result {
      Ok(_) => {
        txn.commit(&shared.txn, TS_NONE, TS_NONE)?;
      }
      Err(_) => txn.rollback(&shared.txn),
    }
  } else if matches!(result, Err(TernError::Rollback(_))) {
    txn.needs_rollback = true;
  }
  result
}

// ============================================================================
// Cursor
// ============================================================================

/// A session cursor over one table
pub struct Cursor {
  engine: Arc<Engine>,
  shared: Arc<EngineShared>,
  txn: Arc<Mutex<Transaction>>,
  inner: Mutex<TreeCursor>,
  last_error: Arc<Mutex<Option<LastError>>>,
  operation_timeout: Duration,
}

impl Cursor {
  /// Wait out cache pressure, assisting eviction, then run the operation
  fn guarded<R>(
    &self,
    write: bool,
    f: impl Fn(&mut TreeCursor, &mut Transaction) -> Result<R>,
  ) -> Result<R> {
    record_last(&self.last_error, self.guarded_inner(write, f))
  }

  fn guarded_inner<R>(
    &self,
    write: bool,
    f: impl Fn(&mut TreeCursor, &mut Transaction) -> Result<R>,
  ) -> Result<R> {
    self.shared.check_poisoned()?;
    let started = Instant::now();
    self.wait_for_cache(started)?;

    let mut txn = self.txn.lock();
    let mut inner = self.inner.lock();
    if write {
      // Writers translate prepare conflicts into write conflicts
      let result = run_in_txn(&self.shared, &mut txn, |txn| f(&mut inner, txn));
      return match result {
        Err(TernError::PrepareConflict) => {
          if txn.is_running() && txn.explicit {
            txn.needs_rollback = true;
          }
          Err(TernError::Rollback(RollbackReason::WriteConflict))
        }
        other => other,
      };
    }
    // Readers wait out prepared updates with a bounded yield loop
    let mut spins = 0u32;
    loop {
      let result = run_in_txn(&self.shared, &mut txn, |txn| f(&mut inner, txn));
      match result {
        Err(TernError::PrepareConflict) if spins < 1000 => {
          self.check_timeout(started)?;
          crate::btree::yield_briefly(&mut spins);
        }
        other => return other,
      }
    }
  }

  fn check_timeout(&self, started: Instant) -> Result<()> {
    if !self.operation_timeout.is_zero() && started.elapsed() > self.operation_timeout {
      return Err(TernError::Rollback(RollbackReason::OperationTimeout));
    }
    Ok(())
  }

  /// Cooperative eviction assist when the cache runs hot
  fn wait_for_cache(&self, started: Instant) -> Result<()> {
    if !self.shared.cache.over_trigger() {
      return Ok(());
    }
    self.engine.evict_wake();
    let deadline = Duration::from_micros(self.shared.cache_max_wait_us);
    let mut assisted = false;
    let mut spins = 0u32;
    while self.shared.cache.hard_full() {
      if !assisted {
        // One in-line eviction attempt before waiting
        self.engine.evict_assist();
        assisted = true;
        continue;
      }
      if started.elapsed() > deadline {
        // A stuck cache is often pinned by the oldest reader; poke that
        // transaction specifically so history can be reclaimed
        let reason = {
          let txn = self.txn.lock();
          if txn.is_running() && txn.pins_oldest(&self.shared.txn) {
            RollbackReason::OldestForEviction
          } else {
            RollbackReason::CacheOverflow
          }
        };
        return Err(TernError::Rollback(reason));
      }
      self.check_timeout(started)?;
      crate::btree::yield_briefly(&mut spins);
    }
    Ok(())
  }

  pub fn uri(&self) -> String {
    self.inner.lock().btree.uri.clone()
  }

  /// Forget the cursor position
  pub fn reset(&self) {
    self.inner.lock().reset();
  }

  // ==========================================================================
  // Row operations
  // ==========================================================================

  /// Exact lookup
  pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
    self.guarded(false, |cursor, txn| cursor.search(&self.shared, txn, key))
  }

  /// Insert or overwrite
  pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
    self.guarded(true, |cursor, txn| {
      cursor.insert(&self.shared, txn, key, value)
    })
  }

  /// Overwrite
  pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
    self.guarded(true, |cursor, txn| {
      cursor.update(&self.shared, txn, key, value)
    })
  }

  /// Delete; `NotFound` when no visible value exists
  pub fn remove(&self, key: &[u8]) -> Result<()> {
    self.guarded(true, |cursor, txn| cursor.remove(&self.shared, txn, key))
  }

  /// Apply partial edits to an existing value
  pub fn modify(&self, key: &[u8], ops: &[ModifyOp]) -> Result<()> {
    self.guarded(true, |cursor, txn| {
      cursor.modify(&self.shared, txn, key, ops)
    })
  }

  /// Reserve the key: conflict detection without a value
  pub fn reserve(&self, key: &[u8]) -> Result<()> {
    self.guarded(true, |cursor, txn| cursor.reserve(&self.shared, txn, key))
  }

  /// Next record in ascending key order
  pub fn next(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    self.guarded(false, |cursor, txn| cursor.next(&self.shared, txn))
  }

  /// Previous record in descending key order
  pub fn prev(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    self.guarded(false, |cursor, txn| cursor.prev(&self.shared, txn))
  }

  // ==========================================================================
  // Column operations
  // ==========================================================================

  /// Exact record lookup
  pub fn col_get(&self, recno: RecNo) -> Result<Vec<u8>> {
    self.guarded(false, |cursor, txn| {
      cursor.col_search(&self.shared, txn, recno)
    })
  }

  /// Insert or overwrite a record
  pub fn col_insert(&self, recno: RecNo, value: &[u8]) -> Result<()> {
    self.guarded(true, |cursor, txn| {
      cursor.col_insert(&self.shared, txn, recno, value)
    })
  }

  /// Append a record; returns its number
  pub fn col_append(&self, value: &[u8]) -> Result<RecNo> {
    self.guarded(true, |cursor, txn| {
      cursor.col_append(&self.shared, txn, value)
    })
  }

  /// Delete a record
  pub fn col_remove(&self, recno: RecNo) -> Result<()> {
    self.guarded(true, |cursor, txn| {
      cursor.col_remove(&self.shared, txn, recno)
    })
  }

  /// Next record in ascending record-number order
  pub fn col_next(&self) -> Result<Option<(RecNo, Vec<u8>)>> {
    self.guarded(false, |cursor, txn| cursor.col_next(&self.shared, txn))
  }
}
