//! Salvage
//!
//! Best-effort reconstruction of a table whose checkpoint is unreadable.
//! The file is scanned at allocation-unit granularity for blocks with valid
//! checksums; surviving leaf pages contribute their records (newest write
//! generation wins per key), and the table is rebuilt by bulk-loading the
//! survivors into a fresh file which replaces the original.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};

use crate::block::{Addr, BlockManager};
use crate::btree::bulk::BulkCursor;
use crate::btree::Btree;
use crate::config::KeyFormat;
use crate::engine::Engine;
use crate::error::{BusyReason, Result, TernError};
use crate::meta::{meta_get, meta_put, uri_file_name};
use crate::page::{Page, PageKind};
use crate::util::binary::read_u32;

impl Engine {
  /// Rebuild `uri` from whatever blocks still verify. Existing handles must
  /// be closed; the table is reopened rebuilt.
  pub fn salvage(&self, uri: &str) -> Result<()> {
    self.shared.check_poisoned()?;
    let _ckpt = self.ckpt_lock.lock();
    let name = uri_file_name(uri)?;
    {
      let mut tables = self.tables.write();
      if let Some(btree) = tables.get(uri) {
        if btree.cursors_open() > 0 {
          return Err(TernError::Busy(BusyReason::HandleInUse));
        }
        tables.remove(uri);
      }
    }
    let mut entry = meta_get(&self.shared, &self.meta, uri)?
      .ok_or_else(|| TernError::ObjectNotFound(uri.to_string()))?;

    // Open the damaged file without a checkpoint: only the description
    // sector has to survive
    let path = self.home.join(name);
    let fh = Arc::new(crate::fh::FileHandle::open(&path, true)?);
    let bm = BlockManager::open(fh, entry.btree_id, None, None)?;
    let row = entry.config.key_format == KeyFormat::Bytes;

    let (rows, recnos) = scan_for_records(&bm, &entry.config, row);
    info!(
      "salvage {uri}: recovered {} records",
      if row { rows.len() } else { recnos.len() }
    );

    // Rebuild into a fresh file and swap it into place
    let rebuilt_path = self.home.join(format!("{name}.salvage"));
    if rebuilt_path.exists() {
      std::fs::remove_file(&rebuilt_path)?;
    }
    let fh = Arc::new(crate::fh::FileHandle::create(&rebuilt_path)?);
    let compressor = self
      .shared
      .compressors
      .resolve(&entry.config.block_compressor)?;
    let new_bm = BlockManager::create(
      fh,
      entry.btree_id,
      entry.config.allocation_size as u64,
      compressor,
    )?;
    let btree = Btree::create(
      entry.btree_id,
      uri.to_string(),
      entry.config.clone(),
      Arc::new(new_bm),
    );

    let mut bulk = BulkCursor::open(Arc::clone(&btree))?;
    if row {
      for (key, (_gen, value)) in &rows {
        bulk.insert_row(key, value)?;
      }
    } else {
      for (_recno, (_gen, value)) in &recnos {
        bulk.insert_col(value)?;
      }
    }
    bulk.close(&self.shared)?;

    let root = crate::recon::checkpoint_tree(&self.shared, &btree)?;
    let cookie = btree.bm.checkpoint_start(root.as_ref())?;
    btree.bm.checkpoint_resolve()?;
    entry.checkpoints.clear();
    entry.set_checkpoint("", &cookie.pack(btree.bm.allocation_size()));
    meta_put(&self.shared, &self.meta, uri, &entry)?;

    std::fs::rename(&rebuilt_path, &path)?;
    crate::fh::sync_dir(&self.home)?;
    self.tables.write().insert(uri.to_string(), btree);
    info!("salvage {uri}: complete");
    Ok(())
  }
}

type RowRecords = BTreeMap<Vec<u8>, (u64, Vec<u8>)>;
type ColRecords = BTreeMap<u64, (u64, Vec<u8>)>;

/// Scan every allocation unit for blocks whose checksums verify, keeping
/// the newest generation of every record found on leaf pages
fn scan_for_records(
  bm: &BlockManager,
  config: &crate::config::TableOptions,
  row: bool,
) -> (RowRecords, ColRecords) {
  let mut rows: RowRecords = BTreeMap::new();
  let mut recnos: ColRecords = BTreeMap::new();
  let unit = bm.allocation_size();
  let file_size = bm.size();

  let mut off = unit;
  while off < file_size {
    match try_block(bm, off, unit, file_size) {
      Some((payload, size)) => {
        collect_page(bm, config, row, &payload, &mut rows, &mut recnos);
        off += size;
      }
      None => off += unit,
    }
  }
  (rows, recnos)
}

/// Attempt to read and verify a block starting at `off`
fn try_block(bm: &BlockManager, off: u64, unit: u64, file_size: u64) -> Option<(Vec<u8>, u64)> {
  let header = bm.file_handle().read(off, 12).ok()?;
  let disk_size = u64::from(read_u32(&header, 0));
  let checksum = read_u32(&header, 4);
  if disk_size == 0 || disk_size % unit != 0 || off + disk_size > file_size {
    return None;
  }
  let image = bm.file_handle().read(off, disk_size as usize).ok()?;
  let addr = Addr {
    object_id: bm.object_id(),
    off,
    size: disk_size,
    checksum,
  };
  match bm.verify_image(&addr, &image) {
    Ok(payload) => Some((payload, disk_size)),
    Err(_) => None,
  }
}

fn collect_page(
  bm: &BlockManager,
  config: &crate::config::TableOptions,
  row: bool,
  payload: &[u8],
  rows: &mut RowRecords,
  recnos: &mut ColRecords,
) {
  let page = match Page::from_image(
    payload.to_vec(),
    bm.allocation_size(),
    config.fixed_bitsize,
    &mut |ovfl| bm.read(ovfl),
  ) {
    Ok(page) => page,
    Err(_) => return, // not a page (extent list, overflow value, ...)
  };
  let keep_row = |rows: &mut RowRecords, key: Vec<u8>, gen: u64, value: Vec<u8>| {
    match rows.get(&key) {
      Some((existing, _)) if *existing >= gen => {}
      _ => {
        rows.insert(key, (gen, value));
      }
    }
  };
  match &page.kind {
    PageKind::RowLeaf(leaf) if row => {
      let gen = page.disk_gen;
      for (i, slot) in leaf.slots.iter().enumerate() {
        let value = match slot.value {
          Some(crate::page::OnDiskValue::Inline { offset, len, tw }) => {
            if !tw.is_live() {
              continue;
            }
            leaf.image[offset..offset + len].to_vec()
          }
          Some(crate::page::OnDiskValue::Overflow { addr, tw }) => {
            if !tw.is_live() {
              continue;
            }
            match bm.read(&addr) {
              Ok(value) => value,
              Err(e) => {
                warn!("salvage: overflow value lost for slot {i}: {e}");
                continue;
              }
            }
          }
          None => continue,
        };
        keep_row(rows, slot.key.to_vec(), gen, value);
      }
    }
    PageKind::ColVarLeaf(leaf) if !row => {
      let gen = page.disk_gen;
      for cell in &leaf.cells {
        let Some(value) = &cell.value else { continue };
        if !value.time_window().is_live() {
          continue;
        }
        let bytes = match value {
          crate::page::OnDiskValue::Inline { offset, len, .. } => {
            leaf.image[*offset..*offset + *len].to_vec()
          }
          crate::page::OnDiskValue::Overflow { addr, .. } => match bm.read(addr) {
            Ok(bytes) => bytes,
            Err(_) => continue,
          },
        };
        for recno in cell.start..cell.start + cell.rle {
          match recnos.get(&recno) {
            Some((existing, _)) if *existing >= gen => {}
            _ => {
              recnos.insert(recno, (gen, bytes.clone()));
            }
          }
        }
      }
    }
    PageKind::ColFixLeaf(leaf) if !row => {
      let gen = page.disk_gen;
      let leaf = leaf.lock();
      for recno in leaf.start_recno..leaf.last_recno() {
        let value = vec![leaf.bit_value(recno)];
        match recnos.get(&recno) {
          Some((existing, _)) if *existing >= gen => {}
          _ => {
            recnos.insert(recno, (gen, value));
          }
        }
      }
    }
    _ => {}
  }
}
