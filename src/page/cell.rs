//! Page cells
//!
//! A disk page image is a fixed header followed by packed cells, parsed
//! strictly left to right. A cell's descriptor byte carries its kind in the
//! low nibble and presence flags in the high nibble; keys and values carry
//! varint lengths, address cells carry a child cookie plus a time aggregate,
//! and leaf-row keys may be prefix-compressed against the previous key.

use crate::block::Addr;
use crate::error::{Result, TernError};
use crate::types::{ModifyOp, RecNo, TimeAggregate, TimeWindow, Timestamp};
use crate::util::binary::{read_u32, read_u64, write_u32, write_u64};
use crate::util::varint::{get_uvarint, put_uvarint};

// ============================================================================
// Disk page header
// ============================================================================

pub const PAGE_HEADER_SIZE: usize = 24;

/// On-disk page type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskPageType {
  RowInternal = 1,
  RowLeaf = 2,
  ColInternal = 3,
  ColFixLeaf = 4,
  ColVarLeaf = 5,
}

impl DiskPageType {
  pub fn from_u8(value: u8) -> Result<Self> {
    Ok(match value {
      1 => Self::RowInternal,
      2 => Self::RowLeaf,
      3 => Self::ColInternal,
      4 => Self::ColFixLeaf,
      5 => Self::ColVarLeaf,
      _ => {
        return Err(TernError::Corruption(format!(
          "unknown page type {value}"
        )))
      }
    })
  }

  pub fn is_leaf(&self) -> bool {
    matches!(self, Self::RowLeaf | Self::ColFixLeaf | Self::ColVarLeaf)
  }
}

/// Fixed header at the start of every page image
#[derive(Debug, Clone, Copy)]
pub struct DiskPageHeader {
  pub write_gen: u64,
  pub entries: u32,
  pub page_type: DiskPageType,
  /// Starting record number for column pages; 0 for row pages
  pub recno: RecNo,
}

impl DiskPageHeader {
  pub fn pack(&self, out: &mut [u8]) {
    write_u64(out, 0, self.write_gen);
    write_u32(out, 8, self.entries);
    out[12] = self.page_type as u8;
    out[13] = 0;
    out[14] = 0;
    out[15] = 0;
    write_u64(out, 16, self.recno);
  }

  pub fn parse(data: &[u8]) -> Result<Self> {
    if data.len() < PAGE_HEADER_SIZE {
      return Err(TernError::Corruption("short page header".to_string()));
    }
    Ok(Self {
      write_gen: read_u64(data, 0),
      entries: read_u32(data, 8),
      page_type: DiskPageType::from_u8(data[12])?,
      recno: read_u64(data, 16),
    })
  }
}

// ============================================================================
// Cell kinds and flags
// ============================================================================

const KIND_KEY: u8 = 1;
const KIND_KEY_OVFL: u8 = 2;
const KIND_VALUE: u8 = 3;
const KIND_VALUE_OVFL: u8 = 4;
const KIND_ADDR_INT: u8 = 5;
const KIND_ADDR_LEAF: u8 = 6;
const KIND_ADDR_DEL: u8 = 7;
const KIND_DEL_RUN: u8 = 8;

const FLAG_PREFIX: u8 = 0x10;
const FLAG_TIME: u8 = 0x20;
const FLAG_RLE: u8 = 0x40;
const FLAG_RECNO: u8 = 0x80;

/// A decoded cell. Value payloads are ranges into the page image so leaf
/// pages can reference them without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
  /// Fully materialized key (prefix compression already resolved)
  Key(Vec<u8>),
  KeyOvfl(Addr),
  Value {
    offset: usize,
    len: usize,
    tw: TimeWindow,
    /// Run-length for column stores; at least 1
    rle: u64,
  },
  ValueOvfl {
    addr: Addr,
    tw: TimeWindow,
  },
  AddrInternal {
    addr: Addr,
    ta: TimeAggregate,
    recno: RecNo,
  },
  AddrLeaf {
    addr: Addr,
    ta: TimeAggregate,
    recno: RecNo,
  },
  /// Fast-truncated child: address plus the truncation's commit times
  AddrDeleted {
    addr: Addr,
    commit_ts: Timestamp,
    durable_ts: Timestamp,
    recno: RecNo,
  },
  /// Run of deleted records on a column-store leaf
  DelRun(u64),
}

// ============================================================================
// Builder
// ============================================================================

/// Packs cells into a growing page image. Keys must be appended in order;
/// the builder tracks the previous key for prefix compression.
pub struct CellBuilder {
  buf: Vec<u8>,
  last_key: Vec<u8>,
  prefix_compression: bool,
  allocation_size: u64,
  entries: u32,
}

impl CellBuilder {
  /// `reserve` bytes are left at the front for block and page headers
  pub fn new(reserve: usize, prefix_compression: bool, allocation_size: u64) -> Self {
    Self {
      buf: vec![0u8; reserve],
      last_key: Vec::new(),
      prefix_compression,
      allocation_size,
      entries: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.buf.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries == 0
  }

  pub fn entries(&self) -> u32 {
    self.entries
  }

  pub fn into_buf(self) -> Vec<u8> {
    self.buf
  }

  fn common_prefix(&self, key: &[u8]) -> usize {
    self
      .last_key
      .iter()
      .zip(key.iter())
      .take_while(|(a, b)| a == b)
      .count()
  }

  pub fn key(&mut self, key: &[u8]) {
    let prefix = if self.prefix_compression {
      // Leave at least one suffix byte so keys stay distinguishable
      self.common_prefix(key).min(key.len().saturating_sub(1))
    } else {
      0
    };
    let mut desc = KIND_KEY;
    if prefix > 0 {
      desc |= FLAG_PREFIX;
    }
    self.buf.push(desc);
    if prefix > 0 {
      put_uvarint(&mut self.buf, prefix as u64);
    }
    put_uvarint(&mut self.buf, (key.len() - prefix) as u64);
    self.buf.extend_from_slice(&key[prefix..]);
    self.last_key.clear();
    self.last_key.extend_from_slice(key);
    self.entries += 1;
  }

  pub fn key_ovfl(&mut self, addr: &Addr) {
    self.buf.push(KIND_KEY_OVFL);
    addr.pack(self.allocation_size, &mut self.buf);
    // Overflow keys break the prefix chain
    self.last_key.clear();
    self.entries += 1;
  }

  pub fn value(&mut self, data: &[u8], tw: &TimeWindow, rle: u64) {
    let mut desc = KIND_VALUE;
    if !tw.is_default() {
      desc |= FLAG_TIME;
    }
    if rle > 1 {
      desc |= FLAG_RLE;
    }
    self.buf.push(desc);
    if !tw.is_default() {
      put_uvarint(&mut self.buf, tw.start_ts);
      put_uvarint(&mut self.buf, tw.stop_ts);
    }
    if rle > 1 {
      put_uvarint(&mut self.buf, rle);
    }
    put_uvarint(&mut self.buf, data.len() as u64);
    self.buf.extend_from_slice(data);
    self.entries += 1;
  }

  pub fn value_ovfl(&mut self, addr: &Addr, tw: &TimeWindow) {
    let mut desc = KIND_VALUE_OVFL;
    if !tw.is_default() {
      desc |= FLAG_TIME;
    }
    self.buf.push(desc);
    if !tw.is_default() {
      put_uvarint(&mut self.buf, tw.start_ts);
      put_uvarint(&mut self.buf, tw.stop_ts);
    }
    addr.pack(self.allocation_size, &mut self.buf);
    self.entries += 1;
  }

  pub fn addr(&mut self, leaf: bool, addr: &Addr, ta: &TimeAggregate, recno: Option<RecNo>) {
    let mut desc = if leaf { KIND_ADDR_LEAF } else { KIND_ADDR_INT };
    let has_ta = *ta != TimeAggregate::empty();
    if has_ta {
      desc |= FLAG_TIME;
    }
    if recno.is_some() {
      desc |= FLAG_RECNO;
    }
    self.buf.push(desc);
    if let Some(recno) = recno {
      put_uvarint(&mut self.buf, recno);
    }
    if has_ta {
      put_uvarint(&mut self.buf, ta.oldest_start_ts);
      put_uvarint(&mut self.buf, ta.newest_stop_ts);
    }
    addr.pack(self.allocation_size, &mut self.buf);
    self.entries += 1;
  }

  pub fn addr_deleted(
    &mut self,
    addr: &Addr,
    commit_ts: Timestamp,
    durable_ts: Timestamp,
    recno: Option<RecNo>,
  ) {
    let mut desc = KIND_ADDR_DEL;
    if recno.is_some() {
      desc |= FLAG_RECNO;
    }
    self.buf.push(desc);
    if let Some(recno) = recno {
      put_uvarint(&mut self.buf, recno);
    }
    put_uvarint(&mut self.buf, commit_ts);
    put_uvarint(&mut self.buf, durable_ts);
    addr.pack(self.allocation_size, &mut self.buf);
    self.entries += 1;
  }

  pub fn del_run(&mut self, count: u64) {
    self.buf.push(KIND_DEL_RUN);
    put_uvarint(&mut self.buf, count);
    self.entries += 1;
  }
}

// ============================================================================
// Reader
// ============================================================================

/// Sequential cell decoder. Maintains a scratch buffer holding the last
/// fully materialized key for prefix compression.
pub struct CellReader<'a> {
  data: &'a [u8],
  at: usize,
  end: usize,
  last_key: Vec<u8>,
  allocation_size: u64,
}

impl<'a> CellReader<'a> {
  /// Read cells from `data[start..end]`
  pub fn new(data: &'a [u8], start: usize, end: usize, allocation_size: u64) -> Self {
    Self {
      data,
      at: start,
      end,
      last_key: Vec::new(),
      allocation_size,
    }
  }

  pub fn offset(&self) -> usize {
    self.at
  }

  fn varint(&mut self) -> Result<u64> {
    let (value, used) = get_uvarint(&self.data[..self.end], self.at)?;
    self.at += used;
    Ok(value)
  }

  fn addr(&mut self) -> Result<Addr> {
    let (addr, used) = Addr::unpack(&self.data[self.at..self.end], self.allocation_size)?;
    self.at += used;
    Ok(addr)
  }

  /// Decode the next cell; None at end of page
  pub fn next_cell(&mut self) -> Result<Option<Cell>> {
    if self.at >= self.end {
      return Ok(None);
    }
    let desc = self.data[self.at];
    self.at += 1;
    let kind = desc & 0x0f;
    let cell = match kind {
      KIND_KEY => {
        let prefix = if desc & FLAG_PREFIX != 0 {
          self.varint()? as usize
        } else {
          0
        };
        if prefix > self.last_key.len() {
          return Err(TernError::Corruption(format!(
            "key prefix {prefix} exceeds previous key"
          )));
        }
        let suffix_len = self.varint()? as usize;
        if self.at + suffix_len > self.end {
          return Err(TernError::Corruption("key overruns page".to_string()));
        }
        let mut key = Vec::with_capacity(prefix + suffix_len);
        key.extend_from_slice(&self.last_key[..prefix]);
        key.extend_from_slice(&self.data[self.at..self.at + suffix_len]);
        self.at += suffix_len;
        self.last_key.clone_from(&key);
        Cell::Key(key)
      }
      KIND_KEY_OVFL => {
        self.last_key.clear();
        Cell::KeyOvfl(self.addr()?)
      }
      KIND_VALUE => {
        let tw = self.time_window(desc)?;
        let rle = if desc & FLAG_RLE != 0 { self.varint()? } else { 1 };
        if rle == 0 {
          return Err(TernError::Corruption("zero run length".to_string()));
        }
        let len = self.varint()? as usize;
        if self.at + len > self.end {
          return Err(TernError::Corruption("value overruns page".to_string()));
        }
        let offset = self.at;
        self.at += len;
        Cell::Value {
          offset,
          len,
          tw,
          rle,
        }
      }
      KIND_VALUE_OVFL => {
        let tw = self.time_window(desc)?;
        Cell::ValueOvfl {
          addr: self.addr()?,
          tw,
        }
      }
      KIND_ADDR_INT | KIND_ADDR_LEAF => {
        let recno = if desc & FLAG_RECNO != 0 { self.varint()? } else { 0 };
        let ta = if desc & FLAG_TIME != 0 {
          TimeAggregate {
            oldest_start_ts: self.varint()?,
            newest_stop_ts: self.varint()?,
          }
        } else {
          TimeAggregate::empty()
        };
        let addr = self.addr()?;
        if kind == KIND_ADDR_LEAF {
          Cell::AddrLeaf { addr, ta, recno }
        } else {
          Cell::AddrInternal { addr, ta, recno }
        }
      }
      KIND_ADDR_DEL => {
        let recno = if desc & FLAG_RECNO != 0 { self.varint()? } else { 0 };
        let commit_ts = self.varint()?;
        let durable_ts = self.varint()?;
        let addr = self.addr()?;
        Cell::AddrDeleted {
          addr,
          commit_ts,
          durable_ts,
          recno,
        }
      }
      KIND_DEL_RUN => {
        let count = self.varint()?;
        if count == 0 {
          return Err(TernError::Corruption("empty deleted run".to_string()));
        }
        Cell::DelRun(count)
      }
      _ => {
        return Err(TernError::Corruption(format!(
          "unknown cell kind {kind}"
        )))
      }
    };
    Ok(Some(cell))
  }

  fn time_window(&mut self, desc: u8) -> Result<TimeWindow> {
    if desc & FLAG_TIME != 0 {
      Ok(TimeWindow {
        start_ts: self.varint()?,
        stop_ts: self.varint()?,
      })
    } else {
      Ok(TimeWindow::new())
    }
  }
}

// ============================================================================
// Modify edits
// ============================================================================

/// Pack modify edits as `(offset, remove_size, data_size, data)` tuples
pub fn pack_modify(ops: &[ModifyOp]) -> Vec<u8> {
  let mut out = Vec::new();
  put_uvarint(&mut out, ops.len() as u64);
  for op in ops {
    put_uvarint(&mut out, op.offset as u64);
    put_uvarint(&mut out, op.remove_size as u64);
    put_uvarint(&mut out, op.data.len() as u64);
    out.extend_from_slice(&op.data);
  }
  out
}

pub fn unpack_modify(data: &[u8]) -> Result<Vec<ModifyOp>> {
  let mut at = 0usize;
  let (count, used) = get_uvarint(data, at)?;
  at += used;
  let mut ops = Vec::with_capacity(count as usize);
  for _ in 0..count {
    let (offset, used) = get_uvarint(data, at)?;
    at += used;
    let (remove_size, used) = get_uvarint(data, at)?;
    at += used;
    let (data_size, used) = get_uvarint(data, at)?;
    at += used;
    let end = at + data_size as usize;
    let bytes = data
      .get(at..end)
      .ok_or_else(|| TernError::Corruption("modify edit overrun".to_string()))?;
    at = end;
    ops.push(ModifyOp {
      offset: offset as usize,
      remove_size: remove_size as usize,
      data: bytes.to_vec(),
    });
  }
  Ok(ops)
}

/// Apply edits to a base value: replace `remove_size` bytes at `offset`
/// with the edit's data, extending with zero bytes when the offset lies
/// past the end
pub fn apply_modify(base: &[u8], ops: &[ModifyOp]) -> Vec<u8> {
  let mut value = base.to_vec();
  for op in ops {
    if op.offset > value.len() {
      value.resize(op.offset, 0);
    }
    let remove_end = (op.offset + op.remove_size).min(value.len());
    value.splice(op.offset..remove_end, op.data.iter().copied());
  }
  value
}
