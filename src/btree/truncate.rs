//! Range truncate
//!
//! Whole subtrees inside the range are fast-truncated: the child ref flips
//! to `Deleted` carrying the transaction's metadata, without reading the
//! subtree. Boundary records fall back to per-key tombstones through a
//! cursor sweep. Readers that still need the pre-truncate image instantiate
//! it lazily (see `Btree::page_in`).

use std::sync::Arc;

use crate::engine::EngineShared;
use crate::error::Result;
use crate::mvcc::Transaction;
use crate::page::refs::{PageDel, Ref, RefState};
use crate::page::Page;
use crate::types::RecNo;

use super::cursor::TreeCursor;
use super::{Btree, PageIn};

impl Btree {
  /// Remove every row key in `[start, stop]` (inclusive bounds)
  pub fn truncate_rows(
    self: &Arc<Self>,
    shared: &EngineShared,
    txn: &mut Transaction,
    start: &[u8],
    stop: &[u8],
  ) -> Result<()> {
    let id = txn.id_for_write(&shared.txn)?;
    txn.ensure_snapshot(&shared.txn);

    // Fast pass: flip fully covered subtrees to Deleted
    let root = self.root_ref();
    self.truncate_walk(shared, txn, id, &root, None, start, stop)?;

    // Slow pass: tombstone the boundary records one by one
    let hazard = shared.hazards.register();
    let mut cursor = TreeCursor::new(Arc::clone(self), hazard.clone());
    let result = (|| {
      let mut key = start.to_vec();
      loop {
        match cursor.search(shared, txn, &key) {
          Ok(_) => cursor.remove(shared, txn, &key)?,
          Err(crate::error::TernError::NotFound) => {}
          Err(e) => return Err(e),
        }
        match cursor.next(shared, txn)? {
          Some((next_key, _)) if next_key.as_slice() <= stop => key = next_key,
          _ => break,
        }
      }
      Ok(())
    })();
    drop(cursor);
    shared.hazards.unregister(&hazard);
    result
  }

  /// Remove every record in `[start, stop]` of a column store
  pub fn truncate_recnos(
    self: &Arc<Self>,
    shared: &EngineShared,
    txn: &mut Transaction,
    start: RecNo,
    stop: RecNo,
  ) -> Result<()> {
    txn.id_for_write(&shared.txn)?;
    txn.ensure_snapshot(&shared.txn);
    let hazard = shared.hazards.register();
    let mut cursor = TreeCursor::new(Arc::clone(self), hazard.clone());
    let result = (|| {
      for recno in start..=stop {
        match cursor.col_remove(shared, txn, recno) {
          Ok(()) | Err(crate::error::TernError::NotFound) => {}
          Err(e) => return Err(e),
        }
      }
      Ok(())
    })();
    drop(cursor);
    shared.hazards.unregister(&hazard);
    result
  }

  /// Walk internal pages flipping fully covered children. `lo`/`hi` bound
  /// the subtree under `r`; `hi = None` means unbounded above.
  fn truncate_walk(
    &self,
    shared: &EngineShared,
    txn: &mut Transaction,
    txn_id: u64,
    r: &Arc<Ref>,
    _parent: Option<&Page>,
    start: &[u8],
    stop: &[u8],
  ) -> Result<()> {
    let page = match self.page_in(shared, txn, r, false)? {
      PageIn::Page(page) => page,
      // Already truncated, or split race: nothing to do here
      PageIn::Empty | PageIn::Restart => return Ok(()),
    };
    if page.is_leaf() {
      return Ok(()); // boundary leaves are handled by the cursor sweep
    }
    let index = page.internal().index();
    for (i, child) in index.entries.iter().enumerate() {
      let lo = child.key().as_row();
      let hi = index.entries.get(i + 1).map(|next| next.key().as_row());
      let fully_covered = lo >= start && matches!(hi, Some(hi) if hi <= stop && !hi.is_empty());
      if fully_covered {
        if self.try_fast_delete(shared, txn, txn_id, child)? {
          continue;
        }
      }
      // Overlapping (or not fast-deletable) internal children recurse;
      // leaves are left to the sweep
      let overlaps = match hi {
        Some(hi) => lo <= stop && hi > start,
        None => lo <= stop,
      };
      if overlaps && !child.child_is_leaf() {
        self.truncate_walk(shared, txn, txn_id, child, Some(&page), start, stop)?;
      }
    }
    Ok(())
  }

  /// Try to flip one child to `Deleted` without reading it. Works for
  /// on-disk children and for clean resident children nobody has pinned.
  fn try_fast_delete(
    &self,
    shared: &EngineShared,
    txn: &mut Transaction,
    txn_id: u64,
    child: &Arc<Ref>,
  ) -> Result<bool> {
    let del = PageDel {
      txn_id,
      commit_ts: 0,
      durable_ts: 0,
      committed: false,
    };
    if child.cas_state(RefState::Disk, RefState::Locked) {
      child.set_page_del(Some(del));
      child.set_state(RefState::Deleted);
      txn.add_mod_page_del(Arc::clone(child));
      return Ok(true);
    }
    if child.cas_state(RefState::Mem, RefState::Locked) {
      let can_drop = !shared.hazards.pinned(child)
        && child.addr().is_some()
        && child.page().map(|p| !p.is_dirty()).unwrap_or(false);
      if !can_drop {
        child.set_state(RefState::Mem);
        return Ok(false);
      }
      if let Some(page) = child.page() {
        shared.cache.page_out(page.memory_footprint());
      }
      child.set_page(None);
      child.set_page_del(Some(del));
      child.set_state(RefState::Deleted);
      txn.add_mod_page_del(Arc::clone(child));
      return Ok(true);
    }
    Ok(false)
  }
}
