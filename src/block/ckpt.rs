//! Block-manager checkpoints
//!
//! A checkpoint folds the discard list into the available space, writes the
//! `alloc` and `avail` extent lists as ordinary blocks, and packages their
//! addresses with the tree root into a checkpoint cookie. The cookie is
//! stored by the caller (metadata table, and ultimately the turtle file);
//! swapping it in after a successful sync is what makes the checkpoint
//! atomic. Extent-list blocks are always allocated by extending the file so
//! the serialized avail list is not mutated by its own write.

use log::debug;

use crate::constants::BLOCK_HEADER_SIZE;
use crate::error::{Result, TernError};
use crate::fh::SyncKind;
use crate::util::varint::{get_uvarint, put_uvarint, MAX_VARINT_LEN};

use super::extent::{Extent, ExtentList};
use super::{finish_header, Addr, BlockFlags, BlockManager};

/// Everything needed to reopen a file at a checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCookie {
  /// Root page address; None for an empty tree
  pub root_addr: Option<Addr>,
  /// Address of the serialized alloc list
  pub alloc_addr: Addr,
  /// Address of the serialized avail list
  pub avail_addr: Addr,
  /// Logical file size at checkpoint time
  pub file_size: u64,
  /// Write generation of the checkpoint
  pub write_gen: u64,
}

impl CheckpointCookie {
  pub fn pack(&self, allocation_size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    match &self.root_addr {
      Some(root) => {
        out.push(1);
        root.pack(allocation_size, &mut out);
      }
      None => out.push(0),
    }
    self.alloc_addr.pack(allocation_size, &mut out);
    self.avail_addr.pack(allocation_size, &mut out);
    put_uvarint(&mut out, self.file_size);
    put_uvarint(&mut out, self.write_gen);
    out
  }

  pub fn unpack(cookie: &[u8], allocation_size: u64) -> Result<Self> {
    let mut at = 0usize;
    let has_root = *cookie
      .get(at)
      .ok_or_else(|| TernError::Corruption("empty checkpoint cookie".to_string()))?;
    at += 1;
    let root_addr = if has_root != 0 {
      let (addr, used) = Addr::unpack(&cookie[at..], allocation_size)
        .map_err(|_| TernError::Corruption("checkpoint root address".to_string()))?;
      at += used;
      Some(addr)
    } else {
      None
    };
    let (alloc_addr, used) = Addr::unpack(&cookie[at..], allocation_size)?;
    at += used;
    let (avail_addr, used) = Addr::unpack(&cookie[at..], allocation_size)?;
    at += used;
    let (file_size, used) = get_uvarint(cookie, at)?;
    at += used;
    let (write_gen, _) = get_uvarint(cookie, at)?;
    Ok(Self {
      root_addr,
      alloc_addr,
      avail_addr,
      file_size,
      write_gen,
    })
  }
}

// ============================================================================
// Extent-list serialization
// ============================================================================

/// Serialize a list: name, sorted (off, size) varint pairs, (0, 0) sentinel
fn pack_extent_list(list: &ExtentList) -> Vec<u8> {
  let mut out = vec![0u8; BLOCK_HEADER_SIZE];
  let name = list.name().as_bytes();
  put_uvarint(&mut out, name.len() as u64);
  out.extend_from_slice(name);
  for ext in list.iter() {
    put_uvarint(&mut out, ext.off);
    put_uvarint(&mut out, ext.size);
  }
  put_uvarint(&mut out, 0);
  put_uvarint(&mut out, 0);
  out
}

/// Parse a serialized extent list payload into a fresh list
pub(crate) fn unpack_extent_list(payload: &[u8]) -> Result<ExtentList> {
  let mut at = 0usize;
  let (name_len, used) = get_uvarint(payload, at)?;
  at += used;
  let name_end = at + name_len as usize;
  let name = payload
    .get(at..name_end)
    .ok_or_else(|| TernError::Corruption("extent list name".to_string()))?;
  let name = std::str::from_utf8(name)
    .map_err(|_| TernError::Corruption("extent list name encoding".to_string()))?;
  let mut list = ExtentList::new(name);
  at = name_end;
  loop {
    let (off, used) = get_uvarint(payload, at)?;
    at += used;
    let (size, used) = get_uvarint(payload, at)?;
    at += used;
    if off == 0 && size == 0 {
      break;
    }
    list.insert(off, size)?;
  }
  Ok(list)
}

// ============================================================================
// Checkpoint driver
// ============================================================================

impl BlockManager {
  /// Write the checkpoint's extent lists and build its cookie. The caller
  /// must follow with `checkpoint_resolve` once the data is synced; until
  /// then the previous checkpoint remains the recovery point.
  pub fn checkpoint_start(&self, root_addr: Option<&Addr>) -> Result<CheckpointCookie> {
    let mut live = self.live.lock();

    // The previous checkpoint's extent-list blocks are superseded
    let stale = std::mem::take(&mut live.ckpt_list_blocks);
    for ext in stale {
      live.avail.merge(ext.off, ext.size)?;
    }

    // Blocks both allocated and freed in this generation were never part of
    // a durable checkpoint; cancel them out of both lists
    let discards: Vec<Extent> = live.discard.iter().collect();
    for d in discards {
      for a in live.alloc.overlapping(d.off, d.size) {
        let off = d.off.max(a.off);
        let end = d.end().min(a.end());
        live.alloc.remove_range(off, end - off)?;
        live.discard.remove_range(off, end - off)?;
        live.avail.merge(off, end - off)?;
      }
    }

    // Fold discards into the available space
    while let Some(ext) = live.discard.pop_first() {
      live.avail.merge(ext.off, ext.size)?;
    }

    // Reserve space for both list blocks before serializing, so the
    // serialized avail list excludes the blocks themselves. The margin
    // absorbs varint growth from the reservations; padding to the
    // allocation unit supplies the rest.
    let margin = 4 * MAX_VARINT_LEN;
    let avail_need = self.write_size(pack_extent_list(&live.avail).len() + margin) as u64;
    let avail_off = self.reserve_space(&mut live, avail_need)?;
    live.alloc.append(avail_off, avail_need)?;

    let alloc_need = self.write_size(pack_extent_list(&live.alloc).len() + margin) as u64;
    let alloc_off = self.reserve_space(&mut live, alloc_need)?;
    live.alloc.append(alloc_off, alloc_need)?;

    let avail_addr = self.write_list_at(&live.avail, avail_off, avail_need)?;
    let alloc_addr = self.write_list_at(&live.alloc, alloc_off, alloc_need)?;
    live.ckpt_list_blocks = vec![
      Extent::new(avail_off, avail_need),
      Extent::new(alloc_off, alloc_need),
    ];

    let cookie = CheckpointCookie {
      root_addr: root_addr.copied(),
      alloc_addr,
      avail_addr,
      file_size: live.file_size,
      write_gen: live.write_gen,
    };
    debug!(
      "checkpoint start: object {} gen {} root {:?}",
      self.object_id(),
      live.write_gen,
      cookie.root_addr.map(|a| a.off)
    );
    Ok(cookie)
  }

  /// Allocate aligned space from avail, extending the file as a last resort
  fn reserve_space(&self, live: &mut super::Live, size: u64) -> Result<u64> {
    match live.avail.alloc(size) {
      Ok(off) => Ok(off),
      Err(TernError::NoSpace) => {
        let off = live.file_size;
        live.file_size += size;
        self.file_handle().extend(live.file_size)?;
        Ok(off)
      }
      Err(e) => Err(e),
    }
  }

  /// Serialize one list into its reserved extent
  fn write_list_at(&self, list: &ExtentList, off: u64, size: u64) -> Result<Addr> {
    let mut image = pack_extent_list(list);
    if image.len() > size as usize {
      return Err(TernError::Internal(format!(
        "extent list {} outgrew its reservation",
        list.name()
      )));
    }
    image.resize(size as usize, 0);
    finish_header(&mut image, size as u32, BlockFlags::empty(), &[]);
    self.file_handle().write(off, &image)?;
    Ok(Addr {
      object_id: self.object_id(),
      off,
      size,
      checksum: crate::util::binary::read_u32(&image, 4),
    })
  }

  /// Make the checkpoint durable and roll the live state forward
  pub fn checkpoint_resolve(&self) -> Result<()> {
    self.file_handle().sync(SyncKind::Full)?;
    let mut live = self.live.lock();
    live.alloc = ExtentList::new("alloc");
    live.write_gen += 1;
    self
      .stats
      .checkpoints
      .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    Ok(())
  }

  /// Restore free space from a checkpoint cookie at open
  pub fn checkpoint_load(&self, cookie: &CheckpointCookie) -> Result<()> {
    let avail_payload = self.read(&cookie.avail_addr)?;
    let avail = unpack_extent_list(&avail_payload)?;
    if avail.name() != "avail" {
      return Err(TernError::Corruption(format!(
        "expected avail list, found {}",
        avail.name()
      )));
    }

    let mut live = self.live.lock();
    live.avail = avail;
    live.alloc = ExtentList::new("alloc");
    live.discard = ExtentList::new("discard");
    live.file_size = cookie.file_size;
    live.write_gen = cookie.write_gen + 1;
    // The cookie's own list blocks are superseded by the next checkpoint
    live.ckpt_list_blocks = vec![
      Extent::new(cookie.avail_addr.off, cookie.avail_addr.size),
      Extent::new(cookie.alloc_addr.off, cookie.alloc_addr.size),
    ];
    drop(live);

    // Bytes past the checkpointed size were never part of the checkpoint
    if self.file_handle().size()? > cookie.file_size && !self.file_handle().is_read_only() {
      self.file_handle().truncate(cookie.file_size)?;
    }
    Ok(())
  }

  /// Discard in-memory checkpoint state at close
  pub fn checkpoint_unload(&self) {
    let mut live = self.live.lock();
    live.alloc = ExtentList::new("alloc");
    live.discard = ExtentList::new("discard");
  }

  /// Read back the alloc list of a checkpoint; verify and salvage use this
  /// to identify the checkpoint's own blocks
  pub fn checkpoint_alloc_list(&self, cookie: &CheckpointCookie) -> Result<ExtentList> {
    let payload = self.read(&cookie.alloc_addr)?;
    unpack_extent_list(&payload)
  }
}
