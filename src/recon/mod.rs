//! Reconciliation
//!
//! Converts an in-memory page plus its update chains back into one or more
//! on-disk blocks. Update selection follows MVCC: the newest committed
//! update wins, older still-needed versions spill to the history store, and
//! prepared updates abort the pass. Images are chunked at the split
//! threshold; multi-chunk output becomes a page split at the parent.

pub mod col;
pub mod hs;
pub mod row;

use std::sync::Arc;

use log::debug;

use crate::block::Addr;
use crate::btree::Btree;
use crate::constants::{BLOCK_HEADER_SIZE, TS_NONE};
use crate::engine::EngineShared;
use crate::error::{Result, TernError};
use crate::mvcc::visibility::upd_visible_all;
use crate::page::cell::{CellBuilder, DiskPageHeader, DiskPageType, PAGE_HEADER_SIZE};
use crate::page::refs::{PageIndex, Ref, RefKey, RefState};
use crate::page::update::{walk, PrepareState, Update, UpdateKind};
use crate::page::{Page, PageKind, PageType};
use crate::types::{RecNo, TimeAggregate, Timestamp};

/// Why this reconciliation runs; eviction cannot leave anything behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecMode {
  /// Checkpoint: uncommitted updates stay in memory, the page stays dirty
  Checkpoint,
  /// Eviction: any unresolved update fails the pass
  Evict,
}

/// Output of reconciling one page
pub enum RecResult {
  /// The page holds nothing; it has no on-disk presence
  Empty,
  /// One replacement block
  Single(Addr),
  /// Multiple chunks: the page splits
  Multi(Vec<(RefKey, Addr)>),
}

/// What reconciliation produced, plus whether in-memory state was retained
pub struct RecOutcome {
  pub result: RecResult,
  /// Uncommitted updates were skipped; the page must stay dirty
  pub retained: bool,
  /// Aggregate of every time window written
  pub ta: TimeAggregate,
}

// ============================================================================
// Update selection
// ============================================================================

/// The update chosen for the page image, with its value squashed
pub(crate) struct Selected<'a> {
  pub upd: &'a Update,
  pub start_ts: Timestamp,
}

/// A version bound for the history store
pub(crate) struct HsSpill {
  pub start_ts: Timestamp,
  pub durable_ts: Timestamp,
  /// When the next newer version superseded this one
  pub stop_ts: Timestamp,
  pub value: Vec<u8>,
}

pub(crate) struct Selection<'a> {
  pub selected: Option<Selected<'a>>,
  pub spills: Vec<HsSpill>,
  pub retained: bool,
  /// The walk ended at a version visible to everyone
  pub saw_visible_all: bool,
  /// start_ts of the oldest committed chain entry examined
  pub oldest_committed_start: Timestamp,
}

/// Walk a chain newest-first and choose what reconciliation writes. The
/// newest committed update wins; visible-but-not-visible-all older versions
/// spill to the history store; anything older than a visible-all version is
/// discarded. Prepared in-progress updates fail the pass.
pub(crate) fn update_select<'a>(
  shared: &EngineShared,
  head: &'a std::sync::atomic::AtomicPtr<Update>,
  disk_base: &dyn Fn() -> Result<Vec<u8>>,
) -> Result<Selection<'a>> {
  let mut selection = Selection {
    selected: None,
    spills: Vec::new(),
    retained: false,
    saw_visible_all: false,
    oldest_committed_start: TS_NONE,
  };
  let mut newer_start: Timestamp = TS_NONE;
  for upd in walk(head) {
    if upd.is_aborted() || upd.kind() == UpdateKind::Reserve {
      continue;
    }
    if upd.prepare_state() == PrepareState::InProgress {
      return Err(TernError::PrepareConflict);
    }
    if shared.txn.is_active(upd.txn_id()) {
      // Uncommitted: skip it, the page stays dirty
      selection.retained = true;
      continue;
    }
    if selection.selected.is_none() {
      selection.selected = Some(Selected {
        upd,
        start_ts: upd.start_ts(),
      });
      newer_start = upd.start_ts();
      if upd_visible_all(&shared.txn, upd) {
        selection.saw_visible_all = true;
        break; // nothing older can be needed
      }
      continue;
    }
    // An older committed version: readers between its start and the newer
    // version's start may still need it
    match upd.kind() {
      UpdateKind::Standard => {
        selection.spills.push(HsSpill {
          start_ts: upd.start_ts(),
          durable_ts: upd.durable_ts(),
          stop_ts: newer_start,
          value: upd.data().to_vec(),
        });
        newer_start = upd.start_ts();
      }
      UpdateKind::Modify => {
        // Squash the modify against its own lineage
        let value = squash_modify(upd, disk_base)?;
        selection.spills.push(HsSpill {
          start_ts: upd.start_ts(),
          durable_ts: upd.durable_ts(),
          stop_ts: newer_start,
          value,
        });
        newer_start = upd.start_ts();
      }
      UpdateKind::Tombstone => {
        // A tombstone bounds the version below it; no record of its own
        newer_start = upd.start_ts();
      }
      UpdateKind::Reserve => unreachable!(),
    }
    if upd_visible_all(&shared.txn, upd) {
      selection.saw_visible_all = true;
      break;
    }
  }
  selection.oldest_committed_start = newer_start;
  Ok(selection)
}

/// Materialize a modify update against the older entries of its own chain,
/// bottoming out at the on-disk base value
pub(crate) fn squash_modify(
  chosen: &Update,
  disk_base: &dyn Fn() -> Result<Vec<u8>>,
) -> Result<Vec<u8>> {
  let mut edits = vec![crate::page::cell::unpack_modify(chosen.data())?];
  let mut base: Option<Vec<u8>> = None;
  for older in chosen.older() {
    if older.is_aborted() || older.kind() == UpdateKind::Reserve {
      continue;
    }
    match older.kind() {
      UpdateKind::Modify => edits.push(crate::page::cell::unpack_modify(older.data())?),
      UpdateKind::Standard => {
        base = Some(older.data().to_vec());
        break;
      }
      UpdateKind::Tombstone => {
        base = Some(Vec::new());
        break;
      }
      UpdateKind::Reserve => unreachable!(),
    }
  }
  let mut value = match base {
    Some(base) => base,
    None => disk_base()?,
  };
  for ops in edits.iter().rev() {
    value = crate::page::cell::apply_modify(&value, ops);
  }
  Ok(value)
}

// ============================================================================
// Chunk writer
// ============================================================================

/// Accumulates cells and emits finished blocks at the split threshold
pub(crate) struct ChunkWriter<'a> {
  btree: &'a Btree,
  page_type: DiskPageType,
  write_gen: u64,
  split_limit: usize,
  builder: CellBuilder,
  entries: u32,
  first_key: Option<RefKey>,
  chunk_start_recno: RecNo,
  chunks: Vec<(RefKey, Addr)>,
  leftmost: bool,
}

impl<'a> ChunkWriter<'a> {
  pub fn new(btree: &'a Btree, page_type: DiskPageType, write_gen: u64, internal: bool) -> Self {
    let page_max = if internal {
      btree.opts.internal_page_max
    } else {
      btree.opts.leaf_page_max
    };
    Self::with_limit(btree, page_type, write_gen, page_max * btree.opts.split_pct / 100)
  }

  /// A writer that never splits; used when uncommitted state must keep the
  /// page as one in-memory unit
  pub fn unsplit(btree: &'a Btree, page_type: DiskPageType, write_gen: u64) -> Self {
    Self::with_limit(btree, page_type, write_gen, usize::MAX)
  }

  fn with_limit(btree: &'a Btree, page_type: DiskPageType, write_gen: u64, limit: usize) -> Self {
    Self {
      btree,
      page_type,
      write_gen,
      split_limit: limit,
      builder: Self::new_builder(btree),
      entries: 0,
      first_key: None,
      chunk_start_recno: 0,
      chunks: Vec::new(),
      leftmost: true,
    }
  }

  fn new_builder(btree: &Btree) -> CellBuilder {
    CellBuilder::new(
      BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE,
      btree.opts.prefix_compression,
      btree.bm.allocation_size(),
    )
  }

  pub fn builder(&mut self) -> &mut CellBuilder {
    &mut self.builder
  }

  /// Start a record; `key` is its position for a possible split point
  pub fn begin_record(&mut self, key: RefKey) {
    if self.first_key.is_none() {
      self.chunk_start_recno = key.as_col();
      self.first_key = Some(if self.leftmost && matches!(key, RefKey::Row(_)) {
        RefKey::Row(Vec::new())
      } else {
        key
      });
    }
    self.entries += 1;
  }

  /// Close the record; rolls the chunk when it crossed the threshold
  pub fn end_record(&mut self) -> Result<()> {
    if self.builder.len() >= self.split_limit {
      self.flush()?;
    }
    Ok(())
  }

  fn flush(&mut self) -> Result<()> {
    if self.entries == 0 {
      return Ok(());
    }
    let builder = std::mem::replace(&mut self.builder, Self::new_builder(self.btree));
    let mut image = builder.into_buf();
    DiskPageHeader {
      write_gen: self.write_gen,
      entries: self.entries,
      page_type: self.page_type,
      recno: self.chunk_start_recno,
    }
    .pack(&mut image[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE]);
    let addr = self.btree.bm.write(&image, true)?;
    let key = self.first_key.take().expect("chunk has records");
    self.chunks.push((key, addr));
    self.entries = 0;
    self.leftmost = false;
    Ok(())
  }

  /// Emit a raw pre-built image (fixed-length column leaves)
  pub fn flush_raw(&mut self, mut image: Vec<u8>, entries: u32, key: RefKey) -> Result<()> {
    DiskPageHeader {
      write_gen: self.write_gen,
      entries,
      page_type: self.page_type,
      recno: key.as_col(),
    }
    .pack(&mut image[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE]);
    let addr = self.btree.bm.write(&image, true)?;
    let stored_key = if self.leftmost {
      match &key {
        RefKey::Row(_) => RefKey::Row(Vec::new()),
        RefKey::Col(recno) => RefKey::Col(*recno),
      }
    } else {
      key
    };
    self.chunks.push((stored_key, addr));
    self.leftmost = false;
    Ok(())
  }

  pub fn finish(mut self) -> Result<RecResult> {
    self.flush()?;
    match self.chunks.len() {
      0 => Ok(RecResult::Empty),
      1 => Ok(RecResult::Single(self.chunks.remove(0).1)),
      _ => Ok(RecResult::Multi(self.chunks)),
    }
  }
}

// ============================================================================
// Page dispatch
// ============================================================================

/// Reconcile one page into block images. The caller installs the result.
pub fn reconcile_page(
  shared: &EngineShared,
  btree: &Btree,
  page: &Arc<Page>,
  mode: RecMode,
) -> Result<RecOutcome> {
  let dispatch = |no_split: bool| -> Result<RecOutcome> {
    match &page.kind {
      PageKind::RowLeaf(_) => row::rec_row_leaf(shared, btree, page, no_split),
      PageKind::ColVarLeaf(_) => col::rec_col_var(shared, btree, page, no_split),
      PageKind::ColFixLeaf(_) => col::rec_col_fix(shared, btree, page),
      PageKind::Internal(_) => rec_internal(shared, btree, page),
    }
  };
  let outcome = dispatch(false)?;
  if outcome.retained && mode == RecMode::Evict {
    if let RecResult::Multi(parts) = &outcome.result {
      for (_, addr) in parts {
        let _ = btree.bm.free(addr);
      }
    } else if let RecResult::Single(addr) = &outcome.result {
      let _ = btree.bm.free(addr);
    }
    return Err(TernError::Busy(crate::error::BusyReason::HandleInUse));
  }
  if outcome.retained {
    if let RecResult::Multi(parts) = &outcome.result {
      // A page with uncommitted updates cannot split away from them: throw
      // the chunks back and write one oversized image instead
      for (_, addr) in parts {
        btree.bm.free(addr)?;
      }
      return dispatch(true);
    }
  }
  Ok(outcome)
}

/// Reconcile an internal page: one address cell per child
fn rec_internal(shared: &EngineShared, btree: &Btree, page: &Arc<Page>) -> Result<RecOutcome> {
  let row = page.page_type() == PageType::RowInternal;
  let disk_type = if row {
    DiskPageType::RowInternal
  } else {
    DiskPageType::ColInternal
  };
  let mut writer = ChunkWriter::new(btree, disk_type, page.disk_gen + 1, true);
  let mut retained = false;
  let mut ta = TimeAggregate::empty();

  let index = page.internal().index();
  for child in index.entries.iter() {
    let key = child.key().clone();
    let recno = if row { None } else { Some(key.as_col()) };
    match child.state() {
      RefState::Deleted => {
        let del = child.page_del();
        match del {
          Some(del) if del.committed => {
            let visible_all = del.txn_id == crate::constants::TXN_NONE
              || del.txn_id < shared.txn.oldest_id();
            let ts_settled =
              del.commit_ts == TS_NONE || del.commit_ts <= shared.txn.ts.pinned_or_oldest();
            let addr = child.addr();
            if visible_all && ts_settled {
              // Nobody can need the subtree: free it and drop the entry
              if let Some(addr) = addr {
                btree.bm.free(&addr)?;
              }
              continue;
            }
            let Some(addr) = addr else { continue };
            writer.begin_record(key.clone());
            if row {
              writer.builder().key(key.as_row());
            }
            writer
              .builder()
              .addr_deleted(&addr, del.commit_ts, del.durable_ts, recno);
            writer.end_record()?;
          }
          _ => {
            // Uncommitted truncate: the checkpoint keeps the original child
            retained = true;
            let Some(addr) = child.addr() else { continue };
            writer.begin_record(key.clone());
            if row {
              writer.builder().key(key.as_row());
            }
            writer
              .builder()
              .addr(child.child_is_leaf(), &addr, &TimeAggregate::empty(), recno);
            writer.end_record()?;
          }
        }
      }
      _ => {
        // Disk, Mem (already reconciled clean), or transiently Locked: the
        // address is authoritative
        let Some(addr) = child.addr() else {
          // A clean child with no address holds nothing
          continue;
        };
        let child_ta = child.time_aggregate();
        ta.merge(&child_ta);
        writer.begin_record(key.clone());
        if row {
          writer.builder().key(key.as_row());
        }
        writer
          .builder()
          .addr(child.child_is_leaf(), &addr, &child_ta, recno);
        writer.end_record()?;
      }
    }
  }
  let result = writer.finish()?;
  debug!(
    "reconciled internal page of {} ({} children)",
    btree.uri,
    index.len()
  );
  Ok(RecOutcome {
    result,
    retained,
    ta,
  })
}

// ============================================================================
// Checkpoint driver
// ============================================================================

/// Reconcile every dirty page under `r` bottom-up and install the results,
/// splitting parents as needed. Returns whether this subtree's address
/// changed, so ancestors mark themselves dirty.
fn rec_subtree(
  shared: &EngineShared,
  btree: &Arc<Btree>,
  parent: Option<&Page>,
  r: &Arc<Ref>,
) -> Result<bool> {
  if r.state() != RefState::Mem {
    return Ok(false);
  }
  let Some(page) = r.page() else {
    return Ok(false);
  };
  if let PageKind::Internal(internal) = &page.kind {
    let mut child_changed = false;
    let index = internal.index();
    for child in index.entries.iter() {
      child_changed |= rec_subtree(shared, btree, Some(&page), child)?;
    }
    // A child split replaced the index mid-walk; one more pass catches
    // anything still dirty
    let reloaded = internal.index();
    if !Arc::ptr_eq(&index, &reloaded) {
      child_changed = true;
      for child in reloaded.entries.iter() {
        child_changed |= rec_subtree(shared, btree, Some(&page), child)?;
      }
    }
    if child_changed && page.mark_dirty(0) {
      shared.cache.page_dirtied();
    }
  }
  if !page.is_dirty() {
    return Ok(false);
  }
  let outcome = reconcile_page(shared, btree, &page, RecMode::Checkpoint)?;
  install_rec_result(shared, btree, parent, r, &page, outcome)?;
  Ok(true)
}

/// Install a reconciliation result under `r`. `parent` carries the internal
/// page holding `r`, None for the root.
pub(crate) fn install_rec_result(
  shared: &EngineShared,
  btree: &Arc<Btree>,
  parent: Option<&Page>,
  r: &Arc<Ref>,
  page: &Arc<Page>,
  outcome: RecOutcome,
) -> Result<()> {
  // The previous image and any superseded overflow blocks are dead
  let old_addr = r.addr();
  let finish_dirty = |retained: bool| {
    if let Some(modify) = page.clear_dirty() {
      shared.cache.page_cleaned(modify.bytes_dirty);
      for addr in &modify.ovfl_discard {
        let _ = btree.bm.free(addr);
      }
    }
    if retained {
      // Keep accounting honest: the page is still dirty with the bytes the
      // skipped updates hold
      if page.mark_dirty(0) {
        shared.cache.page_dirtied();
      }
    }
  };

  match outcome.result {
    RecResult::Empty => {
      if let Some(addr) = old_addr {
        btree.bm.free(&addr)?;
      }
      r.set_addr(None);
      r.set_time_aggregate(TimeAggregate::empty());
      finish_dirty(outcome.retained);
      Ok(())
    }
    RecResult::Single(addr) => {
      if let Some(old) = old_addr {
        btree.bm.free(&old)?;
      }
      // An undersized single-chunk leaf is a merge candidate for its
      // parent's next reconciliation
      if parent.is_some()
        && page.is_leaf()
        && (addr.size as usize)
          < btree.opts.leaf_page_max * crate::constants::MERGE_THRESHOLD_PCT / 100
      {
        debug!(
          "undersized leaf in {} ({} bytes): parent merge candidate",
          btree.uri, addr.size
        );
      }
      r.set_addr(Some(addr));
      r.set_time_aggregate(outcome.ta);
      finish_dirty(outcome.retained);
      shared
        .stats
        .pages_written
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
      Ok(())
    }
    RecResult::Multi(parts) => {
      if let Some(old) = old_addr {
        btree.bm.free(&old)?;
      }
      finish_dirty(false);
      shared
        .stats
        .pages_written
        .fetch_add(parts.len() as u64, std::sync::atomic::Ordering::Relaxed);
      let new_refs: Vec<Arc<Ref>> = parts
        .into_iter()
        .map(|(key, addr)| Ref::new_disk(key, addr, page.is_leaf()))
        .collect();
      match parent {
        Some(parent_page) => {
          let internal = parent_page.internal();
          let index = internal.index();
          let mut entries = Vec::with_capacity(index.len() + new_refs.len());
          for entry in index.entries.iter() {
            if Arc::ptr_eq(entry, r) {
              entries.extend(new_refs.iter().cloned());
            } else {
              entries.push(entry.clone());
            }
          }
          internal.replace_index(PageIndex::new(entries));
          if parent_page.mark_dirty(0) {
            shared.cache.page_dirtied();
          }
          r.set_state(RefState::Split);
          r.set_page(None);
          shared.cache.page_out(page.memory_footprint());
          Ok(())
        }
        None => {
          // Root split: grow the tree by one level
          let page_type = if btree.is_row() {
            PageType::RowInternal
          } else {
            PageType::ColInternal
          };
          let new_root_page = Page::new_internal(page_type, PageIndex::new(new_refs));
          shared.cache.page_in(new_root_page.memory_footprint());
          if new_root_page.mark_dirty(0) {
            shared.cache.page_dirtied();
          }
          let root_key = if btree.is_row() {
            RefKey::Row(Vec::new())
          } else {
            RefKey::Col(1)
          };
          let new_root = Ref::new_mem(root_key, new_root_page);
          r.set_state(RefState::Split);
          r.set_page(None);
          shared.cache.page_out(page.memory_footprint());
          btree.replace_root(new_root);
          Ok(())
        }
      }
    }
  }
}

/// Reconcile a whole tree for a checkpoint and return the root address
pub fn checkpoint_tree(shared: &EngineShared, btree: &Arc<Btree>) -> Result<Option<Addr>> {
  // Root splits re-enter until the root reconciles to a single block
  for _ in 0..64 {
    let root = btree.root_ref();
    rec_subtree(shared, btree, None, &root)?;
    if Arc::ptr_eq(&root, &btree.root_ref()) {
      return Ok(root.addr());
    }
  }
  Err(TernError::Internal("root kept splitting".to_string()))
}
