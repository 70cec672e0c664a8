//! Bulk loading
//!
//! A bulk cursor is permitted only on an empty table. Sorted records append
//! directly into leaf images under construction, bypassing update chains;
//! finished chunks are written through the block manager and stitched into
//! a fresh root index when the cursor closes.

use std::sync::Arc;

use crate::config::KeyFormat;
use crate::constants::BLOCK_HEADER_SIZE;
use crate::engine::EngineShared;
use crate::error::{Result, TernError};
use crate::page::cell::{CellBuilder, DiskPageHeader, DiskPageType, PAGE_HEADER_SIZE};
use crate::page::refs::{PageIndex, Ref, RefKey};
use crate::page::{Page, PageKind, PageType};
use crate::types::{RecNo, TimeWindow};

use super::Btree;

/// Sorted direct loader for an empty table
pub struct BulkCursor {
  btree: Arc<Btree>,
  builder: CellBuilder,
  chunk_entries: u32,
  chunk_first_key: Option<RefKey>,
  last_key: Vec<u8>,
  next_recno: RecNo,
  /// Packed bits for fixed-length column stores
  fix_bitmap: Vec<u8>,
  fix_entries: u64,
  finished: Vec<Arc<Ref>>,
  split_limit: usize,
}

impl BulkCursor {
  pub fn open(btree: Arc<Btree>) -> Result<Self> {
    // Only an empty tree qualifies: a resident root leaf with no records
    let root = btree.root_ref();
    let empty = root
      .page()
      .map(|page| match &page.kind {
        PageKind::RowLeaf(leaf) => leaf.slots.is_empty() && leaf.inserts[0].is_empty(),
        PageKind::ColVarLeaf(leaf) => leaf.cells.is_empty() && leaf.mods.is_empty(),
        PageKind::ColFixLeaf(leaf) => {
          let leaf = leaf.lock();
          leaf.entries == 0 && leaf.mods.is_empty()
        }
        PageKind::Internal(_) => false,
      })
      .unwrap_or(false);
    if !empty {
      return Err(TernError::InvalidArgument(
        "bulk load requires an empty table".to_string(),
      ));
    }
    let split_limit = btree.opts.leaf_page_max * btree.opts.split_pct / 100;
    let builder = Self::new_builder(&btree);
    btree.cursor_opened();
    Ok(Self {
      btree,
      builder,
      chunk_entries: 0,
      chunk_first_key: None,
      last_key: Vec::new(),
      next_recno: 1,
      fix_bitmap: Vec::new(),
      fix_entries: 0,
      finished: Vec::new(),
      split_limit,
    })
  }

  fn new_builder(btree: &Btree) -> CellBuilder {
    CellBuilder::new(
      BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE,
      btree.opts.prefix_compression,
      btree.bm.allocation_size(),
    )
  }

  /// Append one row record; keys must arrive in strictly ascending order
  pub fn insert_row(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
    if self.btree.opts.key_format != KeyFormat::Bytes {
      return Err(TernError::InvalidArgument(
        "row bulk insert into a column store".to_string(),
      ));
    }
    if !self.last_key.is_empty() && key <= self.last_key.as_slice() {
      return Err(TernError::InvalidArgument(
        "bulk keys must be sorted and unique".to_string(),
      ));
    }
    if self.chunk_first_key.is_none() {
      // The leftmost chunk covers everything below its neighbors
      self.chunk_first_key = Some(if self.finished.is_empty() {
        RefKey::Row(Vec::new())
      } else {
        RefKey::Row(key.to_vec())
      });
    }
    self.builder.key(key);
    if value.len() > self.btree.opts.leaf_value_max {
      let addr = self.write_overflow(value)?;
      self.builder.value_ovfl(&addr, &TimeWindow::new());
    } else {
      self.builder.value(value, &TimeWindow::new(), 1);
    }
    self.chunk_entries += 1;
    self.last_key = key.to_vec();
    if self.builder.len() >= self.split_limit {
      self.flush_chunk()?;
    }
    Ok(())
  }

  /// Append one column record; returns its record number
  pub fn insert_col(&mut self, value: &[u8]) -> Result<RecNo> {
    let recno = self.next_recno;
    match self.btree.opts.key_format {
      KeyFormat::RecNo => {
        if self.chunk_first_key.is_none() {
          self.chunk_first_key = Some(RefKey::Col(recno));
        }
        if value.len() > self.btree.opts.leaf_value_max {
          let addr = self.write_overflow(value)?;
          self.builder.value_ovfl(&addr, &TimeWindow::new());
        } else {
          self.builder.value(value, &TimeWindow::new(), 1);
        }
        self.chunk_entries += 1;
        self.next_recno += 1;
        if self.builder.len() >= self.split_limit {
          self.flush_chunk()?;
        }
      }
      KeyFormat::RecNoFixed => {
        let bits = self.btree.opts.fixed_bitsize;
        if value.len() != 1 || (bits < 8 && value[0] >= 1 << bits) {
          return Err(TernError::InvalidArgument(format!(
            "fixed-length value must be one byte of at most {bits} bits"
          )));
        }
        if self.chunk_first_key.is_none() {
          self.chunk_first_key = Some(RefKey::Col(recno));
        }
        self.push_fix_value(value[0]);
        self.next_recno += 1;
        if self.fix_bitmap.len() + PAGE_HEADER_SIZE + 1 >= self.split_limit {
          self.flush_chunk()?;
        }
      }
      KeyFormat::Bytes => {
        return Err(TernError::InvalidArgument(
          "column bulk insert into a row store".to_string(),
        ))
      }
    }
    Ok(recno)
  }

  fn push_fix_value(&mut self, value: u8) {
    let bits = self.btree.opts.fixed_bitsize as usize;
    let bit_off = self.fix_entries as usize * bits;
    let need = (bit_off + bits).div_ceil(8);
    if self.fix_bitmap.len() < need {
      self.fix_bitmap.resize(need, 0);
    }
    let mask = ((1u16 << bits) - 1) as u8;
    let wide = u16::from(value & mask) << (bit_off % 8);
    self.fix_bitmap[bit_off / 8] |= wide as u8;
    if bit_off % 8 + bits > 8 {
      self.fix_bitmap[bit_off / 8 + 1] |= (wide >> 8) as u8;
    }
    self.fix_entries += 1;
  }

  fn write_overflow(&mut self, value: &[u8]) -> Result<crate::block::Addr> {
    let mut buf = vec![0u8; BLOCK_HEADER_SIZE];
    buf.extend_from_slice(value);
    self.btree.bm.write(&buf, true)
  }

  fn disk_page_type(&self) -> DiskPageType {
    match self.btree.opts.key_format {
      KeyFormat::Bytes => DiskPageType::RowLeaf,
      KeyFormat::RecNo => DiskPageType::ColVarLeaf,
      KeyFormat::RecNoFixed => DiskPageType::ColFixLeaf,
    }
  }

  fn flush_chunk(&mut self) -> Result<()> {
    let is_fix = self.btree.opts.key_format == KeyFormat::RecNoFixed;
    let records: u64 = if is_fix {
      self.fix_entries
    } else {
      u64::from(self.chunk_entries)
    };
    if records == 0 {
      return Ok(());
    }
    let (mut image, entries) = if is_fix {
      let mut image = vec![0u8; BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE + 1];
      image[BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE] = self.btree.opts.fixed_bitsize;
      image.extend_from_slice(&self.fix_bitmap);
      let entries = self.fix_entries as u32;
      self.fix_bitmap.clear();
      self.fix_entries = 0;
      (image, entries)
    } else {
      let builder = std::mem::replace(&mut self.builder, Self::new_builder(&self.btree));
      (builder.into_buf(), self.chunk_entries)
    };
    let header = DiskPageHeader {
      write_gen: 1,
      entries,
      page_type: self.disk_page_type(),
      recno: if self.btree.opts.key_format == KeyFormat::Bytes {
        0
      } else {
        self.next_recno - records
      },
    };
    header.pack(&mut image[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE]);
    let addr = self.btree.bm.write(&image, true)?;
    let key = self
      .chunk_first_key
      .take()
      .expect("chunk has a first key");
    self.finished.push(Ref::new_disk(key, addr, true));
    self.chunk_entries = 0;
    Ok(())
  }

  /// Flush the final chunk and publish the new tree root
  pub fn close(mut self, shared: &EngineShared) -> Result<()> {
    self.flush_chunk()?;
    if self.finished.is_empty() {
      return Ok(()); // nothing loaded; the empty root stands
    }
    let page_type = if self.btree.is_row() {
      PageType::RowInternal
    } else {
      PageType::ColInternal
    };
    let refs = std::mem::take(&mut self.finished);
    let root_page = Page::new_internal(page_type, PageIndex::new(refs));
    shared.cache.page_in(root_page.memory_footprint());
    if root_page.mark_dirty(0) {
      shared.cache.page_dirtied();
    }
    let root_key = if self.btree.is_row() {
      RefKey::Row(Vec::new())
    } else {
      RefKey::Col(1)
    };
    self.btree.replace_root(Ref::new_mem(root_key, root_page));
    Ok(())
  }
}

impl Drop for BulkCursor {
  fn drop(&mut self) {
    self.btree.cursor_closed();
  }
}
