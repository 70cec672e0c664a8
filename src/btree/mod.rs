//! B-trees
//!
//! A `Btree` owns one block file and the root ref of its page tree. Pages
//! fault in through the `Ref` state machine: `Disk -> Locked -> Mem`, with
//! concurrent readers yielding on `Locked` and restarting on `Split`.
//! Fast-truncated children instantiate lazily for readers that predate the
//! truncation.

pub mod bulk;
pub mod cursor;
pub mod descent;
pub mod truncate;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::{Addr, BlockManager, CheckpointCookie};
use crate::config::{KeyFormat, TableOptions};
use crate::constants::TXN_NONE;
use crate::engine::EngineShared;
use crate::error::{Result, TernError};
use crate::mvcc::Transaction;
use crate::page::refs::{Ref, RefKey, RefState};
use crate::page::update::{install, Update, UpdateKind, UpdateRef};
use crate::page::{Page, PageType};
use crate::types::BtreeId;

/// Spin-then-yield backoff for `Locked` refs and cache waits
pub(crate) fn yield_briefly(spins: &mut u32) {
  *spins += 1;
  if *spins < 10 {
    std::hint::spin_loop();
  } else if *spins < 100 {
    std::thread::yield_now();
  } else {
    std::thread::sleep(std::time::Duration::from_micros(100));
  }
}

/// Outcome of bringing a child ref into memory
pub(crate) enum PageIn {
  /// Page is resident and pinned by the returned Arc
  Page(Arc<Page>),
  /// Fast-truncate is visible to this reader: treat the subtree as empty
  Empty,
  /// The ref was split away; restart the descent
  Restart,
}

/// One open B-tree
pub struct Btree {
  pub id: BtreeId,
  pub uri: String,
  pub opts: TableOptions,
  pub bm: Arc<BlockManager>,
  root: RwLock<Arc<Ref>>,
  open_cursors: AtomicU64,
}

impl Btree {
  fn leaf_type(opts: &TableOptions) -> PageType {
    match opts.key_format {
      KeyFormat::Bytes => PageType::RowLeaf,
      KeyFormat::RecNo => PageType::ColVarLeaf,
      KeyFormat::RecNoFixed => PageType::ColFixLeaf,
    }
  }

  fn root_key(opts: &TableOptions) -> RefKey {
    match opts.key_format {
      KeyFormat::Bytes => RefKey::Row(Vec::new()),
      _ => RefKey::Col(1),
    }
  }

  pub fn is_row(&self) -> bool {
    self.opts.key_format == KeyFormat::Bytes
  }

  /// Create a new tree with an empty in-memory root leaf
  pub fn create(
    id: BtreeId,
    uri: String,
    opts: TableOptions,
    bm: Arc<BlockManager>,
  ) -> Arc<Self> {
    let root_page = Page::empty_leaf(Self::leaf_type(&opts), opts.fixed_bitsize);
    let root = Ref::new_mem(Self::root_key(&opts), root_page);
    Arc::new(Self {
      id,
      uri,
      opts,
      bm,
      root: RwLock::new(root),
      open_cursors: AtomicU64::new(0),
    })
  }

  /// Open a tree at a checkpoint
  pub fn open(
    id: BtreeId,
    uri: String,
    opts: TableOptions,
    bm: Arc<BlockManager>,
    cookie: Option<&CheckpointCookie>,
  ) -> Arc<Self> {
    let root = match cookie.and_then(|c| c.root_addr) {
      Some(addr) => {
        // The root block's page type is discovered at first fault; assume
        // internal until read (the hint only matters for reconciliation,
        // which sees the loaded page)
        Ref::new_disk(Self::root_key(&opts), addr, false)
      }
      None => {
        let root_page = Page::empty_leaf(Self::leaf_type(&opts), opts.fixed_bitsize);
        Ref::new_mem(Self::root_key(&opts), root_page)
      }
    };
    Arc::new(Self {
      id,
      uri,
      opts,
      bm,
      root: RwLock::new(root),
      open_cursors: AtomicU64::new(0),
    })
  }

  pub fn root_ref(&self) -> Arc<Ref> {
    self.root.read().clone()
  }

  /// Swap the root ref; used by root splits and bulk load
  pub fn replace_root(&self, root: Arc<Ref>) {
    *self.root.write() = root;
  }

  pub fn cursor_opened(&self) {
    self.open_cursors.fetch_add(1, Ordering::AcqRel);
  }

  pub fn cursor_closed(&self) {
    self.open_cursors.fetch_sub(1, Ordering::AcqRel);
  }

  pub fn cursors_open(&self) -> u64 {
    self.open_cursors.load(Ordering::Acquire)
  }

  /// Read and instantiate the page at `addr`
  pub fn read_page(&self, shared: &EngineShared, addr: &Addr) -> Result<Arc<Page>> {
    let payload = self.bm.read(addr)?;
    let allocation_size = self.bm.allocation_size();
    let bm = &self.bm;
    let page = Page::from_image(
      payload,
      allocation_size,
      self.opts.fixed_bitsize,
      &mut |ovfl_addr| bm.read(ovfl_addr),
    )?;
    shared.cache.page_in(page.memory_footprint());
    shared.stats.pages_read.fetch_add(1, Ordering::Relaxed);
    page.touch(shared.cache.next_read_gen());
    Ok(page)
  }

  /// Resolve an overflow value block to its bytes
  pub fn read_overflow(&self, addr: &Addr) -> Result<Vec<u8>> {
    self.bm.read(addr)
  }

  /// Bring the child behind `r` into memory, honoring the ref state
  /// machine. `txn` decides fast-truncate visibility; writers pass
  /// `for_write` to force instantiation of truncated children.
  pub(crate) fn page_in(
    &self,
    shared: &EngineShared,
    txn: &Transaction,
    r: &Arc<Ref>,
    for_write: bool,
  ) -> Result<PageIn> {
    let mut spins = 0u32;
    loop {
      match r.state() {
        RefState::Mem => {
          if let Some(page) = r.page() {
            page.touch(shared.cache.next_read_gen());
            return Ok(PageIn::Page(page));
          }
          // Racing eviction finished between the state load and the page
          // read; try again
          yield_briefly(&mut spins);
        }
        RefState::Disk => {
          if !r.cas_state(RefState::Disk, RefState::Locked) {
            yield_briefly(&mut spins);
            continue;
          }
          let addr = match r.addr() {
            Some(addr) => addr,
            None => {
              r.set_state(RefState::Disk);
              return Err(TernError::Internal("disk ref without address".to_string()));
            }
          };
          match self.read_page(shared, &addr) {
            Ok(page) => {
              r.set_page(Some(page));
              r.set_state(RefState::Mem);
            }
            Err(e) => {
              r.set_state(RefState::Disk);
              return Err(e);
            }
          }
        }
        RefState::Locked => yield_briefly(&mut spins),
        RefState::Deleted => {
          if !for_write && self.truncate_visible(txn, r) {
            return Ok(PageIn::Empty);
          }
          self.instantiate_deleted(shared, r)?;
        }
        RefState::Split => return Ok(PageIn::Restart),
      }
    }
  }

  /// Is the fast-truncate on `r` visible to this reader? Uncommitted
  /// truncations are visible only to their own transaction.
  fn truncate_visible(&self, txn: &Transaction, r: &Arc<Ref>) -> bool {
    let Some(del) = r.page_del() else {
      return false;
    };
    if del.txn_id != TXN_NONE && del.txn_id == txn.id() {
      return true;
    }
    if !del.committed {
      return false;
    }
    if let Some(snapshot) = txn.snapshot() {
      if del.txn_id != TXN_NONE && !snapshot.sees(del.txn_id) {
        return false;
      }
    }
    txn.read_ts == crate::constants::TS_NONE || del.commit_ts <= txn.read_ts
  }

  /// Materialize a fast-truncated child: read the pre-truncate image and
  /// lay a tombstone on every record, stamped with the truncation's
  /// transaction metadata. Deferred to the first reader that needs the
  /// pre-truncate snapshot.
  fn instantiate_deleted(&self, shared: &EngineShared, r: &Arc<Ref>) -> Result<()> {
    if !r.cas_state(RefState::Deleted, RefState::Locked) {
      return Ok(()); // another thread is instantiating; retry via caller
    }
    let del = r.page_del();
    let addr = match r.addr() {
      Some(addr) => addr,
      None => {
        r.set_state(RefState::Deleted);
        return Err(TernError::Internal("deleted ref without address".to_string()));
      }
    };
    let page = match self.read_page(shared, &addr) {
      Ok(page) => page,
      Err(e) => {
        r.set_state(RefState::Deleted);
        return Err(e);
      }
    };

    let (txn_id, commit_ts, durable_ts, committed) = match del {
      Some(d) => (d.txn_id, d.commit_ts, d.durable_ts, d.committed),
      None => (TXN_NONE, 0, 0, true),
    };
    let mut tombstone_bytes = 0usize;
    let mut stamp = |upd_ref: UpdateRef| {
      if committed {
        upd_ref.get().commit(commit_ts, durable_ts);
      } else {
        // The truncating transaction is still running; it stamps these at
        // commit through the ref's deferred-update list
        r.push_del_update(upd_ref);
      }
    };
    match &page.kind {
      crate::page::PageKind::RowLeaf(leaf) => {
        for slot in &leaf.slots {
          let upd = Update::new(UpdateKind::Tombstone, Vec::new(), txn_id);
          tombstone_bytes += upd.memory_footprint();
          let upd_ref = install(&slot.upd, upd, |_| Ok(()))?;
          stamp(upd_ref);
        }
      }
      crate::page::PageKind::ColVarLeaf(leaf) => {
        for cell in &leaf.cells {
          if cell.value.is_none() {
            continue;
          }
          for recno in cell.start..cell.start + cell.rle {
            let (node, _) = leaf.mods.insert_or_get(recno);
            let upd = Update::new(UpdateKind::Tombstone, Vec::new(), txn_id);
            tombstone_bytes += upd.memory_footprint();
            let upd_ref = install(node.upd_head(), upd, |_| Ok(()))?;
            stamp(upd_ref);
          }
        }
      }
      crate::page::PageKind::ColFixLeaf(leaf) => {
        let leaf = leaf.lock();
        for recno in leaf.start_recno..leaf.start_recno + leaf.entries {
          let (node, _) = leaf.mods.insert_or_get(recno);
          let upd = Update::new(UpdateKind::Tombstone, Vec::new(), txn_id);
          tombstone_bytes += upd.memory_footprint();
          let upd_ref = install(node.upd_head(), upd, |_| Ok(()))?;
          stamp(upd_ref);
        }
      }
      crate::page::PageKind::Internal(internal) => {
        // Truncated internal subtrees instantiate one level at a time: the
        // truncate descriptor propagates to each child, which instantiates
        // in turn when a reader reaches it
        if let Some(d) = del {
          for child in internal.index().entries.iter() {
            if child.page_del().is_none() {
              child.set_page_del(Some(d));
            }
            child.cas_state(RefState::Disk, RefState::Deleted);
          }
        }
      }
    }
    page.add_footprint(tombstone_bytes);
    shared.cache.add_bytes(tombstone_bytes);
    if page.mark_dirty(0) {
      shared.cache.page_dirtied();
    }
    r.set_page(Some(page));
    r.set_state(RefState::Mem);
    Ok(())
  }
}
