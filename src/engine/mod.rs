//! Engine: the embeddable entry point
//!
//! All global mutable state lives in one `EngineShared` value created at
//! open and passed through every operation: the transaction registry,
//! cache counters, hazard tables, and the compressor registry. The
//! `Engine` itself owns the home directory lock, the open-table catalog,
//! the metadata table, and the background eviction server.

pub mod salvage;
pub mod session;
pub mod verify;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use hashbrown::HashMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::block::{BlockManager, CheckpointCookie};
use crate::btree::Btree;
use crate::config::{EngineOptions, TableOptions};
use crate::constants::{HS_URI, INITIAL_BTREE_ID, LOCK_FILE, METADATA_BTREE_ID, METADATA_FILE, METADATA_URI};
use crate::error::{BusyReason, Result, TernError};
use crate::evict;
use crate::fh::{FileHandle, HomeLock};
use crate::meta::turtle::{turtle_read, turtle_write};
use crate::meta::{meta_get, meta_list, meta_put, meta_remove, uri_file_name, MetaEntry};
use crate::mvcc::{Isolation, Transaction, TxnGlobal, TxnShared};
use crate::page::hazard::HazardRegistry;
use crate::recon;
use crate::types::EngineStats;
use crate::util::compress::CompressorRegistry;

/// Engine-core statistic counters
#[derive(Default)]
pub struct EngineCounters {
  pub pages_read: AtomicU64,
  pub pages_written: AtomicU64,
  pub pages_evicted: AtomicU64,
  pub txn_commits: AtomicU64,
  pub txn_rollbacks: AtomicU64,
  pub checkpoints: AtomicU64,
}

/// Global state threaded through every operation
pub struct EngineShared {
  pub txn: TxnGlobal,
  pub cache: evict::CacheState,
  pub hazards: HazardRegistry,
  pub compressors: CompressorRegistry,
  pub stats: EngineCounters,
  pub cache_max_wait_us: u64,
  /// Session slot for internal history-store and metadata transactions;
  /// never registered, so it cannot pin the oldest id
  pub(crate) hs_txn: Arc<TxnShared>,
  hs: RwLock<Option<Arc<Btree>>>,
  /// True while a checkpoint runs; dirty-page eviction stands down so the
  /// checkpoint's parent images stay consistent with their children
  pub(crate) ckpt_running: AtomicBool,
  /// Set when an invariant broke; every subsequent call fails `Panic`
  poison: RwLock<Option<String>>,
}

impl EngineShared {
  fn new(options: &EngineOptions) -> Arc<Self> {
    Arc::new(Self {
      txn: TxnGlobal::new(),
      cache: evict::CacheState::new(options.cache_max),
      hazards: HazardRegistry::new(),
      compressors: CompressorRegistry::with_builtins(),
      stats: EngineCounters::default(),
      cache_max_wait_us: options.cache_max_wait_us,
      hs_txn: TxnGlobal::detached_shared(),
      hs: RwLock::new(None),
      ckpt_running: AtomicBool::new(false),
      poison: RwLock::new(None),
    })
  }

  pub fn hs(&self) -> Option<Arc<Btree>> {
    self.hs.read().clone()
  }

  pub(crate) fn set_hs(&self, hs: Option<Arc<Btree>>) {
    *self.hs.write() = hs;
  }

  /// A transaction for internal catalog and history-store work
  pub(crate) fn internal_txn(&self) -> Transaction {
    let mut txn = Transaction::new(Arc::clone(&self.hs_txn));
    txn
      .begin(Isolation::Snapshot, false)
      .expect("fresh transaction begins");
    txn
  }

  pub fn check_poisoned(&self) -> Result<()> {
    match self.poison.read().as_ref() {
      Some(reason) => Err(TernError::Panic(reason.clone())),
      None => Ok(()),
    }
  }

  pub fn poison(&self, reason: &str) {
    warn!("engine poisoned: {reason}");
    let mut guard = self.poison.write();
    if guard.is_none() {
      *guard = Some(reason.to_string());
    }
  }
}

/// An open engine home
pub struct Engine {
  home: PathBuf,
  options: EngineOptions,
  pub shared: Arc<EngineShared>,
  _lock: HomeLock,
  meta: Arc<Btree>,
  tables: Arc<RwLock<HashMap<String, Arc<Btree>>>>,
  next_btree_id: AtomicU32,
  /// One checkpoint at a time, process-wide
  ckpt_lock: Mutex<()>,
  evict_stop: Mutex<Option<Sender<()>>>,
  evict_join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Engine {
  /// Open (or create) an engine home directory
  pub fn open<P: AsRef<Path>>(home: P, options: EngineOptions) -> Result<Arc<Self>> {
    let home = home.as_ref().to_path_buf();
    if !home.exists() {
      if !options.create {
        return Err(TernError::ObjectNotFound(home.display().to_string()));
      }
      std::fs::create_dir_all(&home)?;
    }
    let lock = HomeLock::acquire(home.join(LOCK_FILE))?;
    let shared = EngineShared::new(&options);

    // Bootstrap: the turtle file locates the metadata table's checkpoint
    let meta = match turtle_read(&home)? {
      Some(cookie_bytes) => {
        let fh = Arc::new(FileHandle::open(home.join(METADATA_FILE), options.read_only)?);
        let (bm, cookie) = BlockManager::open_with_cookie_bytes(
          fh,
          METADATA_BTREE_ID,
          None,
          Some(&cookie_bytes),
        )?;
        Btree::open(
          METADATA_BTREE_ID,
          METADATA_URI.to_string(),
          TableOptions::default(),
          Arc::new(bm),
          cookie.as_ref(),
        )
      }
      None => {
        if options.read_only {
          return Err(TernError::ObjectNotFound("metadata checkpoint".to_string()));
        }
        // Nothing durable exists yet; a stale metadata file from a crash
        // before the first checkpoint is dead weight
        let meta_path = home.join(METADATA_FILE);
        if meta_path.exists() {
          std::fs::remove_file(&meta_path)?;
        }
        let fh = Arc::new(FileHandle::create(&meta_path)?);
        let bm = BlockManager::create(
          fh,
          METADATA_BTREE_ID,
          crate::constants::DEFAULT_ALLOCATION_SIZE as u64,
          None,
        )?;
        Btree::create(
          METADATA_BTREE_ID,
          METADATA_URI.to_string(),
          TableOptions::default(),
          Arc::new(bm),
        )
      }
    };

    let engine = Arc::new(Self {
      home,
      options: options.clone(),
      shared: Arc::clone(&shared),
      _lock: lock,
      meta,
      tables: Arc::new(RwLock::new(HashMap::new())),
      next_btree_id: AtomicU32::new(INITIAL_BTREE_ID),
      ckpt_lock: Mutex::new(()),
      evict_stop: Mutex::new(None),
      evict_join: Mutex::new(None),
    });

    // Settle the id allocator above everything the metadata knows
    let mut max_id = METADATA_BTREE_ID;
    for (_, entry) in meta_list(&engine.shared, &engine.meta)? {
      max_id = max_id.max(entry.btree_id);
    }
    engine
      .next_btree_id
      .store(max_id.max(INITIAL_BTREE_ID - 1) + 1, Ordering::Release);

    engine.open_history_store()?;
    if options.eviction_server && !options.read_only {
      engine.start_eviction_server();
    }
    info!("opened engine at {}", engine.home.display());
    Ok(engine)
  }

  fn open_history_store(self: &Arc<Self>) -> Result<()> {
    match meta_get(&self.shared, &self.meta, HS_URI)? {
      Some(entry) => {
        let hs = self.open_table_from_entry(HS_URI, &entry)?;
        self.shared.set_hs(Some(hs));
      }
      None => {
        if self.options.read_only {
          return Ok(());
        }
        let hs = self.create_table_inner(HS_URI, TableOptions::default())?;
        self.shared.set_hs(Some(hs));
      }
    }
    Ok(())
  }

  fn start_eviction_server(self: &Arc<Self>) {
    let (tx, rx) = unbounded::<()>();
    let shared = Arc::clone(&self.shared);
    let tables = Arc::clone(&self.tables);
    let join = std::thread::Builder::new()
      .name("tern-evict".to_string())
      .spawn(move || loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
          Err(RecvTimeoutError::Disconnected) => break,
          Ok(()) | Err(RecvTimeoutError::Timeout) => {}
        }
        if shared.cache.over_trigger() {
          let mut trees: Vec<Arc<Btree>> = tables.read().values().cloned().collect();
          if let Some(hs) = shared.hs() {
            trees.push(hs);
          }
          evict::evict_pass(&shared, &trees);
        }
      })
      .expect("spawn eviction server");
    *self.evict_stop.lock() = Some(tx);
    *self.evict_join.lock() = Some(join);
  }

  /// Nudge the eviction server
  pub(crate) fn evict_wake(&self) {
    if let Some(tx) = self.evict_stop.lock().as_ref() {
      let _ = tx.try_send(());
    }
  }

  /// Run one synchronous eviction pass (cursor assist)
  pub(crate) fn evict_assist(&self) {
    let mut trees: Vec<Arc<Btree>> = self.tables.read().values().cloned().collect();
    if let Some(hs) = self.shared.hs() {
      trees.push(hs);
    }
    evict::evict_pass(&self.shared, &trees);
  }

  pub fn home(&self) -> &Path {
    &self.home
  }

  /// Engine-wide statistics snapshot
  pub fn stats(&self) -> EngineStats {
    let s = &self.shared.stats;
    let mut blocks_allocated = 0;
    let mut blocks_freed = 0;
    for btree in self.tables.read().values() {
      blocks_allocated += btree.bm.stats.blocks_allocated.load(Ordering::Relaxed);
      blocks_freed += btree.bm.stats.blocks_freed.load(Ordering::Relaxed);
    }
    EngineStats {
      cache_bytes_inmem: self.shared.cache.bytes_inmem(),
      cache_bytes_dirty: self.shared.cache.bytes_dirty(),
      cache_pages_clean: self
        .shared
        .cache
        .pages_inmem()
        .saturating_sub(self.shared.cache.pages_dirty()),
      cache_pages_dirty: self.shared.cache.pages_dirty(),
      pages_read: s.pages_read.load(Ordering::Relaxed),
      pages_written: s.pages_written.load(Ordering::Relaxed),
      pages_evicted: s.pages_evicted.load(Ordering::Relaxed),
      blocks_allocated,
      blocks_freed,
      checkpoints: s.checkpoints.load(Ordering::Relaxed),
      txn_commits: s.txn_commits.load(Ordering::Relaxed),
      txn_rollbacks: s.txn_rollbacks.load(Ordering::Relaxed),
    }
  }

  /// Move the global oldest/stable timestamps forward
  pub fn set_timestamps(
    &self,
    oldest: Option<crate::types::Timestamp>,
    stable: Option<crate::types::Timestamp>,
  ) -> Result<()> {
    self.shared.check_poisoned()?;
    self.shared.txn.ts.set(oldest, stable)
  }

  // ==========================================================================
  // Table lifecycle
  // ==========================================================================

  /// Create a table; fails if the URI already exists
  pub fn create(&self, uri: &str, options: TableOptions) -> Result<()> {
    self.shared.check_poisoned()?;
    if self.options.read_only {
      return Err(TernError::ReadOnly);
    }
    uri_file_name(uri)?;
    options.validate()?;
    self.create_table_inner(uri, options)?;
    Ok(())
  }

  fn create_table_inner(&self, uri: &str, options: TableOptions) -> Result<Arc<Btree>> {
    let name = uri_file_name(uri)?;
    if meta_get(&self.shared, &self.meta, uri)?.is_some() {
      return Err(TernError::ObjectExists(uri.to_string()));
    }
    let id = self.next_btree_id.fetch_add(1, Ordering::AcqRel);
    let compressor = self.shared.compressors.resolve(&options.block_compressor)?;
    let fh = Arc::new(FileHandle::create(self.home.join(name))?);
    let bm = BlockManager::create(fh, id, options.allocation_size as u64, compressor)?;
    let btree = Btree::create(id, uri.to_string(), options.clone(), Arc::new(bm));
    meta_put(
      &self.shared,
      &self.meta,
      uri,
      &MetaEntry::new(id, options),
    )?;
    self.tables.write().insert(uri.to_string(), Arc::clone(&btree));
    debug!("created table {uri} (id {id})");
    Ok(btree)
  }

  fn open_table_from_entry(&self, uri: &str, entry: &MetaEntry) -> Result<Arc<Btree>> {
    let name = uri_file_name(uri)?;
    let compressor = self
      .shared
      .compressors
      .resolve(&entry.config.block_compressor)?;
    let fh = Arc::new(FileHandle::open(self.home.join(name), self.options.read_only)?);
    let cookie_bytes = entry.checkpoint("")?;
    let (bm, cookie) = BlockManager::open_with_cookie_bytes(
      fh,
      entry.btree_id,
      compressor,
      cookie_bytes.as_deref(),
    )?;
    Ok(Btree::open(
      entry.btree_id,
      uri.to_string(),
      entry.config.clone(),
      Arc::new(bm),
      cookie.as_ref(),
    ))
  }

  /// Fetch (opening if needed) the data handle for `uri`
  pub fn open_table(&self, uri: &str) -> Result<Arc<Btree>> {
    self.shared.check_poisoned()?;
    if let Some(btree) = self.tables.read().get(uri) {
      return Ok(Arc::clone(btree));
    }
    let entry = meta_get(&self.shared, &self.meta, uri)?
      .ok_or_else(|| TernError::ObjectNotFound(uri.to_string()))?;
    let btree = self.open_table_from_entry(uri, &entry)?;
    let mut tables = self.tables.write();
    Ok(
      tables
        .entry(uri.to_string())
        .or_insert(btree)
        .clone(),
    )
  }

  /// Drop a table: remove its file and metadata. Busy while cursors are
  /// open on it.
  pub fn drop_table(&self, uri: &str) -> Result<()> {
    self.shared.check_poisoned()?;
    if self.options.read_only {
      return Err(TernError::ReadOnly);
    }
    if uri == HS_URI || uri == METADATA_URI {
      return Err(TernError::InvalidArgument(format!("{uri} is reserved")));
    }
    let _ckpt = self.ckpt_lock.lock();
    let name = uri_file_name(uri)?;
    {
      let mut tables = self.tables.write();
      if let Some(btree) = tables.get(uri) {
        if btree.cursors_open() > 0 {
          return Err(TernError::Busy(BusyReason::HandleInUse));
        }
        // Open handles observe the drop on their next block I/O
        btree.bm.set_dropped();
        tables.remove(uri);
      }
    }
    if meta_get(&self.shared, &self.meta, uri)?.is_none() {
      return Err(TernError::ObjectNotFound(uri.to_string()));
    }
    meta_remove(&self.shared, &self.meta, uri)?;
    let path = self.home.join(name);
    if path.exists() {
      std::fs::remove_file(path)?;
    }
    debug!("dropped table {uri}");
    Ok(())
  }

  // ==========================================================================
  // Checkpoints
  // ==========================================================================

  /// Checkpoint every open table, the history store, and the metadata
  /// table, then swap the turtle pointer. After this returns, every
  /// transaction that committed with `commit_ts <= stable` (or without
  /// timestamps) is recoverable.
  pub fn checkpoint(&self, name: Option<&str>) -> Result<()> {
    self.shared.check_poisoned()?;
    if self.options.read_only {
      return Err(TernError::ReadOnly);
    }
    let _guard = self.ckpt_lock.lock();
    self.shared.ckpt_running.store(true, Ordering::Release);
    let result = self.checkpoint_locked(name);
    self.shared.ckpt_running.store(false, Ordering::Release);
    if let Err(TernError::Internal(reason)) = &result {
      // A checkpoint that broke an internal invariant may have left the
      // in-memory tree inconsistent with the metadata
      self.shared.poison(reason);
    }
    result
  }

  fn checkpoint_locked(&self, name: Option<&str>) -> Result<()> {
    let name = name.unwrap_or("");
    if name.is_empty() {
      debug!("starting unnamed checkpoint");
    } else {
      debug!("starting checkpoint {name}");
    }

    let tables: Vec<(String, Arc<Btree>)> = self
      .tables
      .read()
      .iter()
      .filter(|(uri, _)| uri.as_str() != HS_URI)
      .map(|(uri, btree)| (uri.clone(), Arc::clone(btree)))
      .collect();
    for (uri, btree) in &tables {
      self.checkpoint_one(uri, btree, name)?;
    }
    // User-table reconciliation spills into the history store, so it goes
    // second; the metadata (which now holds every fresh cookie) goes last
    if let Some(hs) = self.shared.hs() {
      self.checkpoint_one(HS_URI, &hs, "")?;
    }

    let root = recon::checkpoint_tree(&self.shared, &self.meta)?;
    let cookie = self.meta.bm.checkpoint_start(root.as_ref())?;
    self.meta.bm.checkpoint_resolve()?;
    turtle_write(
      &self.home,
      &cookie.pack(self.meta.bm.allocation_size()),
    )?;

    self
      .shared
      .stats
      .checkpoints
      .fetch_add(1, Ordering::Relaxed);
    debug!("checkpoint complete");
    Ok(())
  }

  fn checkpoint_one(&self, uri: &str, btree: &Arc<Btree>, name: &str) -> Result<()> {
    let root = recon::checkpoint_tree(&self.shared, btree)?;
    let cookie: CheckpointCookie = btree.bm.checkpoint_start(root.as_ref())?;
    btree.bm.checkpoint_resolve()?;
    let mut entry = meta_get(&self.shared, &self.meta, uri)?
      .ok_or_else(|| TernError::Internal(format!("{uri} vanished from metadata")))?;
    entry.set_checkpoint(name, &cookie.pack(btree.bm.allocation_size()));
    meta_put(&self.shared, &self.meta, uri, &entry)
  }

  /// Flush and close. The engine is unusable afterwards.
  pub fn close(self: &Arc<Self>) -> Result<()> {
    if !self.options.read_only {
      self.checkpoint(None)?;
    }
    self.stop_eviction_server();
    info!("closed engine at {}", self.home.display());
    Ok(())
  }

  fn stop_eviction_server(&self) {
    self.evict_stop.lock().take();
    if let Some(join) = self.evict_join.lock().take() {
      let _ = join.join();
    }
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    self.evict_stop.lock().take();
    if let Some(join) = self.evict_join.lock().take() {
      let _ = join.join();
    }
  }
}
