//! Eviction
//!
//! Cache accounting plus the machinery that picks pages, reconciles dirty
//! ones, and releases their memory. A background server thread scans when
//! the cache passes its trigger; cursors entering a full cache run one
//! assist pass themselves before giving up with a cache-overflow rollback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::btree::Btree;
use crate::constants::{
  CACHE_DIRTY_TRIGGER_PCT, CACHE_EVICT_TARGET_PCT, CACHE_EVICT_TRIGGER_PCT,
};
use crate::engine::EngineShared;
use crate::error::Result;
use crate::page::refs::{Ref, RefState};
use crate::page::{Page, PageKind};
use crate::recon::{install_rec_result, reconcile_page, RecMode};
use crate::types::ReadGen;

// ============================================================================
// Cache accounting
// ============================================================================

/// Cache counters shared across the engine
pub struct CacheState {
  max_bytes: AtomicU64,
  bytes_inmem: AtomicU64,
  bytes_dirty: AtomicU64,
  pages_inmem: AtomicU64,
  pages_dirty: AtomicU64,
  read_gen: AtomicU64,
}

impl CacheState {
  pub fn new(max_bytes: u64) -> Self {
    Self {
      max_bytes: AtomicU64::new(max_bytes),
      bytes_inmem: AtomicU64::new(0),
      bytes_dirty: AtomicU64::new(0),
      pages_inmem: AtomicU64::new(0),
      pages_dirty: AtomicU64::new(0),
      read_gen: AtomicU64::new(1),
    }
  }

  pub fn max_bytes(&self) -> u64 {
    self.max_bytes.load(Ordering::Relaxed)
  }

  pub fn bytes_inmem(&self) -> u64 {
    self.bytes_inmem.load(Ordering::Relaxed)
  }

  pub fn bytes_dirty(&self) -> u64 {
    self.bytes_dirty.load(Ordering::Relaxed)
  }

  pub fn pages_inmem(&self) -> u64 {
    self.pages_inmem.load(Ordering::Relaxed)
  }

  pub fn pages_dirty(&self) -> u64 {
    self.pages_dirty.load(Ordering::Relaxed)
  }

  /// Monotonic access counter for eviction scoring
  pub fn next_read_gen(&self) -> ReadGen {
    self.read_gen.fetch_add(1, Ordering::Relaxed)
  }

  pub fn page_in(&self, footprint: usize) {
    self.bytes_inmem.fetch_add(footprint as u64, Ordering::AcqRel);
    self.pages_inmem.fetch_add(1, Ordering::AcqRel);
  }

  pub fn page_out(&self, footprint: usize) {
    self
      .bytes_inmem
      .fetch_sub((footprint as u64).min(self.bytes_inmem()), Ordering::AcqRel);
    let pages = self.pages_inmem.load(Ordering::Acquire);
    if pages > 0 {
      self.pages_inmem.fetch_sub(1, Ordering::AcqRel);
    }
  }

  pub fn add_bytes(&self, bytes: usize) {
    self.bytes_inmem.fetch_add(bytes as u64, Ordering::AcqRel);
  }

  pub fn dirty_add(&self, bytes: usize) {
    self.bytes_dirty.fetch_add(bytes as u64, Ordering::AcqRel);
  }

  pub fn page_dirtied(&self) {
    self.pages_dirty.fetch_add(1, Ordering::AcqRel);
  }

  /// A page came clean; its dirty bytes are accounted back out
  pub fn page_cleaned(&self, dirty_bytes: usize) {
    self
      .bytes_dirty
      .fetch_sub((dirty_bytes as u64).min(self.bytes_dirty()), Ordering::AcqRel);
    let pages = self.pages_dirty.load(Ordering::Acquire);
    if pages > 0 {
      self.pages_dirty.fetch_sub(1, Ordering::AcqRel);
    }
  }

  /// Past the point where eviction should run
  pub fn over_trigger(&self) -> bool {
    self.bytes_inmem() > self.max_bytes() * CACHE_EVICT_TRIGGER_PCT / 100
  }

  /// Eviction target: scan down to here
  pub fn under_target(&self) -> bool {
    self.bytes_inmem() <= self.max_bytes() * CACHE_EVICT_TARGET_PCT / 100
  }

  /// Completely full: operations roll back rather than grow the cache
  pub fn hard_full(&self) -> bool {
    self.bytes_inmem() > self.max_bytes()
  }

  /// Dirty data dominates; bias eviction toward dirty pages
  pub fn dirty_heavy(&self) -> bool {
    self.bytes_dirty() > self.max_bytes() * CACHE_DIRTY_TRIGGER_PCT / 100
  }
}

// ============================================================================
// Candidate selection
// ============================================================================

struct Candidate {
  btree: Arc<Btree>,
  parent: Option<Arc<Page>>,
  r: Arc<Ref>,
  score: u64,
}

/// Collect resident leaf pages as eviction candidates with their scores
fn collect_candidates(shared: &EngineShared, trees: &[Arc<Btree>], out: &mut Vec<Candidate>) {
  let dirty_bias = shared.cache.dirty_heavy();
  for btree in trees {
    let root = btree.root_ref();
    walk_for_candidates(btree, None, &root, dirty_bias, out);
  }
}

fn walk_for_candidates(
  btree: &Arc<Btree>,
  parent: Option<&Arc<Page>>,
  r: &Arc<Ref>,
  dirty_bias: bool,
  out: &mut Vec<Candidate>,
) {
  if r.state() != RefState::Mem {
    return;
  }
  let Some(page) = r.page() else {
    return;
  };
  match &page.kind {
    PageKind::Internal(internal) => {
      for child in internal.index().entries.iter() {
        walk_for_candidates(btree, Some(&page), child, dirty_bias, out);
      }
    }
    _ => {
      // The root leaf of a young tree stays pinned
      let Some(parent) = parent else {
        return;
      };
      let mut score = page.read_gen();
      if dirty_bias && page.is_dirty() {
        // Dirty pages evict first when dirty data dominates
        score /= 2;
      }
      out.push(Candidate {
        btree: Arc::clone(btree),
        parent: Some(Arc::clone(parent)),
        r: Arc::clone(r),
        score,
      });
    }
  }
}

// ============================================================================
// Page eviction
// ============================================================================

/// Try to evict one page: lock the ref, honor hazards, reconcile dirty
/// state, then release the memory. Returns whether the page went out.
pub fn evict_page(
  shared: &EngineShared,
  btree: &Arc<Btree>,
  parent: Option<&Page>,
  r: &Arc<Ref>,
) -> Result<bool> {
  if !r.cas_state(RefState::Mem, RefState::Locked) {
    return Ok(false);
  }
  if shared.hazards.pinned(r) {
    r.set_state(RefState::Mem);
    return Ok(false);
  }
  let Some(page) = r.page() else {
    r.set_state(RefState::Mem);
    return Ok(false);
  };

  if page.is_dirty() {
    // A running checkpoint owns dirty-page reconciliation; competing here
    // could publish a parent image that misses a concurrent split
    if shared.ckpt_running.load(Ordering::Acquire) {
      r.set_state(RefState::Mem);
      return Ok(false);
    }
    let outcome = match reconcile_page(shared, btree, &page, RecMode::Evict) {
      Ok(outcome) => outcome,
      Err(_) => {
        // Unresolved updates or a write failure: the page stays resident
        // and dirty, with no published image
        r.set_state(RefState::Mem);
        return Ok(false);
      }
    };
    let was_split = matches!(outcome.result, crate::recon::RecResult::Multi(_));
    if let Err(e) = install_rec_result(shared, btree, parent, r, &page, outcome) {
      // Leave the page resident rather than wedging the ref
      r.set_state(RefState::Mem);
      return Err(e);
    }
    if was_split {
      // install handled the index swap and page teardown
      shared
        .stats
        .pages_evicted
        .fetch_add(1, Ordering::Relaxed);
      return Ok(true);
    }
  }

  if r.addr().is_none() {
    // Nothing on disk and nothing worth writing: an empty page stays
    r.set_state(RefState::Mem);
    return Ok(false);
  }

  r.set_page(None);
  r.set_state(RefState::Disk);
  shared.cache.page_out(page.memory_footprint());
  shared.stats.pages_evicted.fetch_add(1, Ordering::Relaxed);
  Ok(true)
}

/// One eviction pass: rank candidates by read generation and evict until
/// the cache reaches its target. Returns the number of pages evicted.
pub fn evict_pass(shared: &EngineShared, trees: &[Arc<Btree>]) -> usize {
  let mut candidates = Vec::new();
  collect_candidates(shared, trees, &mut candidates);
  candidates.sort_by_key(|c| c.score);

  let mut evicted = 0;
  for candidate in candidates {
    if shared.cache.under_target() {
      break;
    }
    match evict_page(
      shared,
      &candidate.btree,
      candidate.parent.as_deref(),
      &candidate.r,
    ) {
      Ok(true) => evicted += 1,
      Ok(false) => {}
      Err(e) => warn!("eviction failed on {}: {e}", candidate.btree.uri),
    }
  }
  if evicted > 0 {
    debug!(
      "evicted {evicted} pages, cache {} / {} bytes",
      shared.cache.bytes_inmem(),
      shared.cache.max_bytes()
    );
  }
  evicted
}
