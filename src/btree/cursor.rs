//! Tree cursors
//!
//! Cursors position within a leaf by key (row stores) or record number
//! (column stores), merge the on-disk slot array with the insert skiplists,
//! and resolve values through MVCC visibility: newest visible update on the
//! chain, else the on-disk value's time window, else the history store.

use std::sync::Arc;

use crate::engine::EngineShared;
use crate::error::{Result, RollbackReason, TernError};
use crate::mvcc::visibility::{check_write_conflict, tw_visible, visible_update};
use crate::mvcc::Transaction;
use crate::page::cell::{apply_modify, pack_modify, unpack_modify};
use crate::page::hazard::HazardTable;
use crate::page::insert::InsertNode;
use crate::page::refs::Ref;
use crate::page::update::{install, Update, UpdateKind};
use crate::page::{OnDiskValue, Page, PageKind, RowLeaf};
use crate::types::{ModifyOp, RecNo};

use super::descent::{LeafRef, LeafVisit, SearchKey};
use super::Btree;

/// A leaf pinned by the cursor between operations
struct Held {
  r: Arc<Ref>,
  page: Arc<Page>,
  hazard_slot: usize,
}

/// Cursor over one tree
pub struct TreeCursor {
  pub btree: Arc<Btree>,
  hazard: Arc<HazardTable>,
  held: Option<Held>,
  /// Row position: the last key returned or sought
  last_key: Option<Vec<u8>>,
  /// Column position: the last record number returned; 0 = before first
  last_recno: RecNo,
}

impl TreeCursor {
  pub fn new(btree: Arc<Btree>, hazard: Arc<HazardTable>) -> Self {
    btree.cursor_opened();
    Self {
      btree,
      hazard,
      held: None,
      last_key: None,
      last_recno: 0,
    }
  }

  /// Drop the held leaf and its hazard reference
  pub fn release(&mut self) {
    if let Some(held) = self.held.take() {
      self.hazard.release(held.hazard_slot);
      drop(held);
    }
  }

  /// Forget position and held page
  pub fn reset(&mut self) {
    self.release();
    self.last_key = None;
    self.last_recno = 0;
  }

  fn hold(&mut self, leaf: LeafRef) -> Result<&Held> {
    self.release();
    let hazard_slot = self.hazard.acquire(&leaf.r)?;
    self.held = Some(Held {
      r: leaf.r,
      page: leaf.page,
      hazard_slot,
    });
    Ok(self.held.as_ref().expect("just held"))
  }

  fn check_cache(&self, shared: &EngineShared) -> Result<()> {
    if shared.cache.hard_full() {
      return Err(TernError::Rollback(RollbackReason::CacheOverflow));
    }
    Ok(())
  }

  fn require_row(&self) -> Result<()> {
    if self.btree.is_row() {
      Ok(())
    } else {
      Err(TernError::InvalidArgument(
        "row-store operation on a column store".to_string(),
      ))
    }
  }

  fn require_col(&self) -> Result<()> {
    if self.btree.is_row() {
      Err(TernError::InvalidArgument(
        "column-store operation on a row store".to_string(),
      ))
    } else {
      Ok(())
    }
  }

  // ==========================================================================
  // Row reads
  // ==========================================================================

  /// Exact-match lookup; positions the cursor at `key` for range use
  pub fn search(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    key: &[u8],
  ) -> Result<Vec<u8>> {
    self.require_row()?;
    self.check_cache(shared)?;
    txn.ensure_snapshot(&shared.txn);
    self.last_key = Some(key.to_vec());
    let leaf = match self.btree.descend(shared, txn, SearchKey::Row(key), false)? {
      LeafVisit::Leaf(leaf) => leaf,
      LeafVisit::Truncated => return Err(TernError::NotFound),
    };
    let held = self.hold(leaf)?;
    let page = held.page.clone();
    let leaf = page.row_leaf();
    let value = match leaf.search(key) {
      Ok(slot) => read_slot_value(shared, &self.btree, txn, leaf, slot)?,
      Err(gap) => match leaf.insert_list(gap).search(&key.to_vec()) {
        Some(node) => read_insert_value(shared, &self.btree, txn, node)?,
        None => None,
      },
    };
    value.ok_or(TernError::NotFound)
  }

  /// Next visible record in ascending key order
  pub fn next(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
  ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    self.require_row()?;
    self.check_cache(shared)?;
    txn.ensure_snapshot(&shared.txn);
    loop {
      let after = self.last_key.clone().unwrap_or_default();
      let have_leaf = match &self.held {
        Some(held) => super::descent::row_leaf_max_key(&held.page)
          .map(|max| max > after)
          .unwrap_or(false),
        None => false,
      };
      if !have_leaf {
        self.release();
        match self.btree.leaf_after_row(shared, txn, &after)? {
          Some(leaf) => {
            self.hold(leaf)?;
          }
          None => return Ok(None),
        }
      }
      let page = self.held.as_ref().expect("held leaf").page.clone();
      let leaf = page.row_leaf();
      match next_candidate(leaf, &after) {
        Some(RowPos::Slot(slot)) => {
          let key = leaf.slots[slot].key.to_vec();
          let value = read_slot_value(shared, &self.btree, txn, leaf, slot)?;
          self.last_key = Some(key.clone());
          if let Some(value) = value {
            return Ok(Some((key, value)));
          }
        }
        Some(RowPos::Insert(node)) => {
          let key = node.key().clone();
          let value = read_insert_value(shared, &self.btree, txn, node)?;
          self.last_key = Some(key.clone());
          if let Some(value) = value {
            return Ok(Some((key, value)));
          }
        }
        None => {
          // Leaf exhausted; remember its upper bound and move right
          if let Some(max) = super::descent::row_leaf_max_key(&page) {
            if max > after {
              self.last_key = Some(max);
            }
          }
          self.release();
        }
      }
    }
  }

  /// Previous visible record in descending key order
  pub fn prev(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
  ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    self.require_row()?;
    self.check_cache(shared)?;
    txn.ensure_snapshot(&shared.txn);
    loop {
      let before = self.last_key.clone();
      let have_leaf = match (&self.held, &before) {
        (Some(held), Some(key)) => super::descent::row_leaf_min_key(&held.page)
          .map(|min| min < *key)
          .unwrap_or(false),
        (Some(_), None) => false,
        (None, _) => false,
      };
      if !have_leaf {
        self.release();
        match self
          .btree
          .leaf_before_row(shared, txn, before.as_deref())?
        {
          Some(leaf) => {
            self.hold(leaf)?;
          }
          None => return Ok(None),
        }
      }
      let page = self.held.as_ref().expect("held leaf").page.clone();
      let leaf = page.row_leaf();
      match prev_candidate(leaf, before.as_deref()) {
        Some(RowPos::Slot(slot)) => {
          let key = leaf.slots[slot].key.to_vec();
          let value = read_slot_value(shared, &self.btree, txn, leaf, slot)?;
          self.last_key = Some(key.clone());
          if let Some(value) = value {
            return Ok(Some((key, value)));
          }
        }
        Some(RowPos::Insert(node)) => {
          let key = node.key().clone();
          let value = read_insert_value(shared, &self.btree, txn, node)?;
          self.last_key = Some(key.clone());
          if let Some(value) = value {
            return Ok(Some((key, value)));
          }
        }
        None => {
          if let Some(min) = super::descent::row_leaf_min_key(&page) {
            match &before {
              Some(b) if min < *b => self.last_key = Some(min),
              None => self.last_key = Some(min),
              _ => {}
            }
          }
          self.release();
        }
      }
    }
  }

  // ==========================================================================
  // Row writes
  // ==========================================================================

  /// Insert or overwrite
  pub fn insert(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    key: &[u8],
    value: &[u8],
  ) -> Result<()> {
    self.row_modify(shared, txn, key, UpdateKind::Standard, value.to_vec())
  }

  /// Overwrite; identical chain semantics to insert
  pub fn update(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    key: &[u8],
    value: &[u8],
  ) -> Result<()> {
    self.row_modify(shared, txn, key, UpdateKind::Standard, value.to_vec())
  }

  /// Delete; `NotFound` when no visible value exists
  pub fn remove(&mut self, shared: &EngineShared, txn: &mut Transaction, key: &[u8]) -> Result<()> {
    self.search(shared, txn, key)?;
    self.row_modify(shared, txn, key, UpdateKind::Tombstone, Vec::new())
  }

  /// Apply partial edits to an existing value
  pub fn modify(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    key: &[u8],
    ops: &[ModifyOp],
  ) -> Result<()> {
    self.search(shared, txn, key)?;
    self.row_modify(shared, txn, key, UpdateKind::Modify, pack_modify(ops))
  }

  /// Take a reserve placeholder: detects conflicts without writing a value
  pub fn reserve(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    key: &[u8],
  ) -> Result<()> {
    self.search(shared, txn, key)?;
    self.row_modify(shared, txn, key, UpdateKind::Reserve, Vec::new())
  }

  fn row_modify(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    key: &[u8],
    kind: UpdateKind,
    data: Vec<u8>,
  ) -> Result<()> {
    self.require_row()?;
    self.check_cache(shared)?;
    let id = txn.id_for_write(&shared.txn)?;
    txn.ensure_snapshot(&shared.txn);
    self.last_key = Some(key.to_vec());
    let leaf_ref = match self.btree.descend(shared, txn, SearchKey::Row(key), true)? {
      LeafVisit::Leaf(leaf) => leaf,
      LeafVisit::Truncated => {
        return Err(TernError::Internal("write descent hit truncated leaf".to_string()))
      }
    };
    let held = self.hold(leaf_ref)?;
    let page = held.page.clone();
    let leaf = page.row_leaf();

    let upd = Update::new(kind, data, id);
    let bytes = upd.memory_footprint();
    let upd_ref = match leaf.search(key) {
      Ok(slot) => {
        let slot_ref = &leaf.slots[slot];
        if let Some(value) = &slot_ref.value {
          // A newer on-disk stop also conflicts; the common case is an
          // empty chain over a live on-disk value
          crate::mvcc::visibility::check_tw_write_conflict(txn, &value.time_window())?;
        }
        install(&slot_ref.upd, upd, |head| check_write_conflict(txn, head))?
      }
      Err(gap) => {
        let (node, created) = leaf.insert_list(gap).insert_or_get(key.to_vec());
        if created {
          let node_bytes = key.len() + 64;
          page.add_footprint(node_bytes);
          shared.cache.add_bytes(node_bytes);
        }
        install(node.upd_head(), upd, |head| check_write_conflict(txn, head))?
      }
    };
    txn.add_mod_update(upd_ref);
    shared.cache.add_bytes(bytes);
    shared.cache.dirty_add(bytes);
    if page.mark_dirty(bytes) {
      shared.cache.page_dirtied();
    }
    Ok(())
  }

  // ==========================================================================
  // Column reads and writes
  // ==========================================================================

  /// Exact record lookup
  pub fn col_search(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    recno: RecNo,
  ) -> Result<Vec<u8>> {
    self.require_col()?;
    self.check_cache(shared)?;
    txn.ensure_snapshot(&shared.txn);
    self.last_recno = recno;
    let leaf = match self.btree.descend(shared, txn, SearchKey::Col(recno), false)? {
      LeafVisit::Leaf(leaf) => leaf,
      LeafVisit::Truncated => return Err(TernError::NotFound),
    };
    let held = self.hold(leaf)?;
    let page = held.page.clone();
    read_col_value(shared, &self.btree, txn, &page, recno)?.ok_or(TernError::NotFound)
  }

  /// Next visible record by record number
  pub fn col_next(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
  ) -> Result<Option<(RecNo, Vec<u8>)>> {
    self.require_col()?;
    self.check_cache(shared)?;
    txn.ensure_snapshot(&shared.txn);
    loop {
      let after = self.last_recno;
      let have_leaf = self
        .held
        .as_ref()
        .map(|held| super::descent::col_leaf_max_recno(&held.page) > after)
        .unwrap_or(false);
      if !have_leaf {
        self.release();
        match self.btree.leaf_after_col(shared, txn, after)? {
          Some(leaf) => {
            self.hold(leaf)?;
          }
          None => return Ok(None),
        }
      }
      let page = self.held.as_ref().expect("held leaf").page.clone();
      let max = super::descent::col_leaf_max_recno(&page);
      let mut recno = after + 1;
      while recno <= max {
        if let Some(value) = read_col_value(shared, &self.btree, txn, &page, recno)? {
          self.last_recno = recno;
          return Ok(Some((recno, value)));
        }
        recno += 1;
      }
      self.last_recno = max.max(after);
      self.release();
    }
  }

  /// Insert or overwrite a record
  pub fn col_insert(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    recno: RecNo,
    value: &[u8],
  ) -> Result<()> {
    if recno == 0 {
      return Err(TernError::InvalidArgument("record numbers start at 1".to_string()));
    }
    self.col_modify_common(shared, txn, recno, UpdateKind::Standard, value.to_vec())
  }

  /// Append a record past the current end of the table
  pub fn col_append(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    value: &[u8],
  ) -> Result<RecNo> {
    self.require_col()?;
    self.check_cache(shared)?;
    txn.ensure_snapshot(&shared.txn);
    // The rightmost leaf knows the current maximum record number
    let recno = match self
      .btree
      .descend(shared, txn, SearchKey::Col(u64::MAX - 1), true)?
    {
      LeafVisit::Leaf(leaf) => super::descent::col_leaf_max_recno(&leaf.page) + 1,
      LeafVisit::Truncated => 1,
    };
    self.col_modify_common(shared, txn, recno, UpdateKind::Standard, value.to_vec())?;
    Ok(recno)
  }

  /// Delete a record
  pub fn col_remove(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    recno: RecNo,
  ) -> Result<()> {
    self.col_search(shared, txn, recno)?;
    self.col_modify_common(shared, txn, recno, UpdateKind::Tombstone, Vec::new())
  }

  fn col_modify_common(
    &mut self,
    shared: &EngineShared,
    txn: &mut Transaction,
    recno: RecNo,
    kind: UpdateKind,
    data: Vec<u8>,
  ) -> Result<()> {
    self.require_col()?;
    self.check_cache(shared)?;
    if self.btree.opts.key_format == crate::config::KeyFormat::RecNoFixed
      && kind == UpdateKind::Standard
    {
      let bits = self.btree.opts.fixed_bitsize;
      if data.len() != 1 || (bits < 8 && data[0] >= 1 << bits) {
        return Err(TernError::InvalidArgument(format!(
          "fixed-length value must be one byte of at most {bits} bits"
        )));
      }
    }
    let id = txn.id_for_write(&shared.txn)?;
    txn.ensure_snapshot(&shared.txn);
    self.last_recno = recno;
    let leaf_ref = match self.btree.descend(shared, txn, SearchKey::Col(recno), true)? {
      LeafVisit::Leaf(leaf) => leaf,
      LeafVisit::Truncated => {
        return Err(TernError::Internal("write descent hit truncated leaf".to_string()))
      }
    };
    let held = self.hold(leaf_ref)?;
    let page = held.page.clone();

    let upd = Update::new(kind, data, id);
    let bytes = upd.memory_footprint();
    let upd_ref = match &page.kind {
      PageKind::ColVarLeaf(leaf) => {
        if let Some(cell) = leaf.search(recno) {
          if let Some(value) = &cell.value {
            crate::mvcc::visibility::check_tw_write_conflict(txn, &value.time_window())?;
          }
        }
        let (node, created) = leaf.mods.insert_or_get(recno);
        if created {
          page.add_footprint(64);
          shared.cache.add_bytes(64);
        }
        install(node.upd_head(), upd, |head| check_write_conflict(txn, head))?
      }
      PageKind::ColFixLeaf(leaf) => {
        let leaf = leaf.lock();
        let (node, created) = leaf.mods.insert_or_get(recno);
        if created {
          page.add_footprint(64);
          shared.cache.add_bytes(64);
        }
        install(node.upd_head(), upd, |head| check_write_conflict(txn, head))?
      }
      _ => return Err(TernError::Internal("column write on row page".to_string())),
    };
    txn.add_mod_update(upd_ref);
    shared.cache.add_bytes(bytes);
    shared.cache.dirty_add(bytes);
    if page.mark_dirty(bytes) {
      shared.cache.page_dirtied();
    }
    Ok(())
  }
}

impl Drop for TreeCursor {
  fn drop(&mut self) {
    self.release();
    self.btree.cursor_closed();
  }
}

// ============================================================================
// Candidate selection on a row leaf
// ============================================================================

pub(crate) enum RowPos<'a> {
  Slot(usize),
  Insert(&'a InsertNode<Vec<u8>>),
}

/// Smallest key strictly greater than `after` on the leaf
pub(crate) fn next_candidate<'a>(leaf: &'a RowLeaf, after: &[u8]) -> Option<RowPos<'a>> {
  // First slot beyond `after`
  let slot_idx = leaf.slots.partition_point(|slot| slot.key.as_ref() <= after);
  // Insert keys between `after` and that slot live in the gap at slot_idx
  let list = leaf.insert_list(slot_idx);
  let insert = {
    let (_, ge) = list.search_pair(&after.to_vec());
    match ge {
      Some(node) if node.key().as_slice() == after => node.next_node(),
      other => other,
    }
  };
  match (insert, leaf.slots.get(slot_idx)) {
    (Some(node), Some(slot)) => {
      if node.key().as_slice() < slot.key.as_ref() {
        Some(RowPos::Insert(node))
      } else {
        Some(RowPos::Slot(slot_idx))
      }
    }
    (Some(node), None) => Some(RowPos::Insert(node)),
    (None, Some(_)) => Some(RowPos::Slot(slot_idx)),
    (None, None) => None,
  }
}

/// Largest key strictly less than `before` (or the leaf maximum when
/// `before` is `None`)
pub(crate) fn prev_candidate<'a>(leaf: &'a RowLeaf, before: Option<&[u8]>) -> Option<RowPos<'a>> {
  let (slot_idx, gap) = match before {
    Some(key) => {
      let idx = leaf.slots.partition_point(|slot| slot.key.as_ref() < key);
      // idx is the first slot >= key; candidate slot is idx - 1, and the
      // gap holding keys just below `key` is idx
      (idx.checked_sub(1), idx)
    }
    None => (leaf.slots.len().checked_sub(1), leaf.slots.len()),
  };
  let list = leaf.insert_list(gap);
  let insert = match before {
    Some(key) => list.search_lt(&key.to_vec()),
    None => list.last(),
  };
  match (insert, slot_idx) {
    (Some(node), Some(slot)) => {
      if node.key().as_slice() > leaf.slots[slot].key.as_ref() {
        Some(RowPos::Insert(node))
      } else {
        Some(RowPos::Slot(slot))
      }
    }
    (Some(node), None) => Some(RowPos::Insert(node)),
    (None, Some(slot)) => Some(RowPos::Slot(slot)),
    (None, None) => None,
  }
}

// ============================================================================
// Value resolution
// ============================================================================

/// Visible value for an on-disk row slot
pub(crate) fn read_slot_value(
  shared: &EngineShared,
  btree: &Btree,
  txn: &Transaction,
  leaf: &RowLeaf,
  slot: usize,
) -> Result<Option<Vec<u8>>> {
  let slot_ref = &leaf.slots[slot];
  if let Some(upd) = visible_update(txn, &slot_ref.upd)? {
    return materialize(upd, || resolve_disk_bytes(btree, leaf, slot_ref.value.as_ref()));
  }
  read_disk_value(shared, btree, txn, leaf, slot_ref.value.as_ref(), &slot_ref.key)
}

/// Visible value for an insert-list node (no on-disk backing)
pub(crate) fn read_insert_value(
  _shared: &EngineShared,
  _btree: &Btree,
  txn: &Transaction,
  node: &InsertNode<Vec<u8>>,
) -> Result<Option<Vec<u8>>> {
  match visible_update(txn, node.upd_head())? {
    Some(upd) => materialize(upd, || Ok(None)),
    None => Ok(None),
  }
}

/// Turn the chosen update into value bytes, replaying modify chains down to
/// their base value. `disk_base` resolves the on-disk value when the chain
/// bottoms out without a full value.
fn materialize(
  chosen: &crate::page::update::Update,
  disk_base: impl FnOnce() -> Result<Option<Vec<u8>>>,
) -> Result<Option<Vec<u8>>> {
  match chosen.kind() {
    UpdateKind::Standard => Ok(Some(chosen.data().to_vec())),
    UpdateKind::Tombstone => Ok(None),
    UpdateKind::Reserve => Ok(None),
    UpdateKind::Modify => {
      let mut edits = vec![unpack_modify(chosen.data())?];
      let mut base: Option<Vec<u8>> = None;
      let mut hit_tombstone = false;
      for older in chosen.older() {
        if older.is_aborted() || older.kind() == UpdateKind::Reserve {
          continue;
        }
        match older.kind() {
          UpdateKind::Modify => edits.push(unpack_modify(older.data())?),
          UpdateKind::Standard => {
            base = Some(older.data().to_vec());
            break;
          }
          UpdateKind::Tombstone => {
            hit_tombstone = true;
            break;
          }
          UpdateKind::Reserve => unreachable!(),
        }
      }
      let base = match base {
        Some(base) => base,
        None if hit_tombstone => Vec::new(),
        None => disk_base()?.unwrap_or_default(),
      };
      let mut value = base;
      for ops in edits.iter().rev() {
        value = apply_modify(&value, ops);
      }
      Ok(Some(value))
    }
  }
}

fn resolve_disk_bytes(
  btree: &Btree,
  leaf: &RowLeaf,
  disk: Option<&OnDiskValue>,
) -> Result<Option<Vec<u8>>> {
  match disk {
    Some(OnDiskValue::Inline { offset, len, .. }) => {
      Ok(Some(leaf.image[*offset..*offset + *len].to_vec()))
    }
    Some(OnDiskValue::Overflow { addr, .. }) => Ok(Some(btree.read_overflow(addr)?)),
    None => Ok(None),
  }
}

/// On-disk value under time-window visibility, with a history-store
/// fallback for readers behind the current version
fn read_disk_value(
  shared: &EngineShared,
  btree: &Btree,
  txn: &Transaction,
  leaf: &RowLeaf,
  disk: Option<&OnDiskValue>,
  key: &[u8],
) -> Result<Option<Vec<u8>>> {
  let Some(disk) = disk else {
    return Ok(None);
  };
  let tw = disk.time_window();
  if tw_visible(txn.read_ts, &tw) {
    return resolve_disk_bytes(btree, leaf, Some(disk));
  }
  if txn.read_ts != crate::constants::TS_NONE {
    return crate::recon::hs::hs_search(shared, btree.id, key, txn.read_ts);
  }
  Ok(None)
}

/// Visible value for a column record: mods chain first, then the disk image
pub(crate) fn read_col_value(
  shared: &EngineShared,
  btree: &Btree,
  txn: &Transaction,
  page: &Arc<Page>,
  recno: RecNo,
) -> Result<Option<Vec<u8>>> {
  match &page.kind {
    PageKind::ColVarLeaf(leaf) => {
      if let Some(node) = leaf.mods.search(&recno) {
        if let Some(upd) = visible_update(txn, node.upd_head())? {
          return materialize(upd, || match leaf.search(recno).and_then(|c| c.value.as_ref()) {
            Some(OnDiskValue::Inline { offset, len, .. }) => {
              Ok(Some(leaf.image[*offset..*offset + *len].to_vec()))
            }
            Some(OnDiskValue::Overflow { addr, .. }) => Ok(Some(btree.read_overflow(addr)?)),
            None => Ok(None),
          });
        }
      }
      let Some(cell) = leaf.search(recno) else {
        return Ok(None);
      };
      let Some(value) = &cell.value else {
        return Ok(None);
      };
      let tw = value.time_window();
      if tw_visible(txn.read_ts, &tw) {
        return match value {
          OnDiskValue::Inline { offset, len, .. } => {
            Ok(Some(leaf.image[*offset..*offset + *len].to_vec()))
          }
          OnDiskValue::Overflow { addr, .. } => Ok(Some(btree.read_overflow(addr)?)),
        };
      }
      if txn.read_ts != crate::constants::TS_NONE {
        let key = recno.to_be_bytes();
        return crate::recon::hs::hs_search(shared, btree.id, &key, txn.read_ts);
      }
      Ok(None)
    }
    PageKind::ColFixLeaf(leaf) => {
      let leaf = leaf.lock();
      if let Some(node) = leaf.mods.search(&recno) {
        if let Some(upd) = visible_update(txn, node.upd_head())? {
          let in_image = recno >= leaf.start_recno && recno < leaf.last_recno();
          return materialize(upd, || {
            Ok(if in_image {
              Some(vec![leaf.bit_value(recno)])
            } else {
              None
            })
          });
        }
      }
      if recno >= leaf.start_recno && recno < leaf.last_recno() {
        return Ok(Some(vec![leaf.bit_value(recno)]));
      }
      Ok(None)
    }
    _ => Err(TernError::Internal("column read on row page".to_string())),
  }
}
