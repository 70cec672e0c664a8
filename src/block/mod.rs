//! Block manager: aligned, checksummed block I/O over extent lists
//!
//! A block file is a file-description sector at offset 0 followed by data
//! blocks, each prefixed by a 12-byte header `{disk_size, checksum, flags}`.
//! Free space lives in three extent lists: `alloc` (allocated since the last
//! checkpoint), `avail` (allocatable), and `discard` (freed this generation,
//! allocatable only after the next checkpoint so concurrent readers holding
//! cookies stay safe).

pub mod addr;
pub mod ckpt;
pub mod extent;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::constants::{
  BLOCK_HEADER_SIZE, DESC_SECTOR_SIZE, MAGIC_TERNDB, MIN_READER_MAJOR, VERSION_MAJOR,
  VERSION_MINOR,
};
use crate::error::{Result, TernError};
use crate::fh::{FileHandle, SyncKind};
use crate::types::BtreeId;
use crate::util::binary::{read_u16, read_u32, write_u16, write_u32};
use crate::util::compress::Compressor;
use crate::util::crc::crc32c;

pub use addr::Addr;
pub use ckpt::CheckpointCookie;
pub use extent::{Extent, ExtentList};

bitflags! {
  /// Block header flag byte
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct BlockFlags: u8 {
    /// Checksum covers the uncompressed logical payload only
    const DATA_CHECKSUM = 0x01;
    /// Payload is compressed; a u32 logical length follows the header
    const COMPRESSED = 0x02;
  }
}

/// Cheap counters surfaced through `Engine::stats`
#[derive(Debug, Default)]
pub struct BlockStats {
  pub blocks_allocated: AtomicU64,
  pub blocks_freed: AtomicU64,
  pub bytes_read: AtomicU64,
  pub bytes_written: AtomicU64,
  pub checkpoints: AtomicU64,
}

/// Live free-space state, protected by one per-file lock
pub(crate) struct Live {
  pub alloc: ExtentList,
  pub avail: ExtentList,
  pub discard: ExtentList,
  /// Logical end of file; extension point
  pub file_size: u64,
  pub write_gen: u64,
  /// Extent-list blocks written by the previous checkpoint; freed by the
  /// next one
  pub ckpt_list_blocks: Vec<Extent>,
}

/// Block manager for one file
pub struct BlockManager {
  fh: Arc<FileHandle>,
  id: BtreeId,
  allocation_size: u64,
  compressor: Option<Arc<dyn Compressor>>,
  pub(crate) live: Mutex<Live>,
  dropped: AtomicBool,
  pub stats: BlockStats,
}

impl BlockManager {
  /// Create a new block file and write its description sector
  pub fn create(
    fh: Arc<FileHandle>,
    id: BtreeId,
    allocation_size: u64,
    compressor: Option<Arc<dyn Compressor>>,
  ) -> Result<Self> {
    write_desc(&fh, allocation_size)?;
    fh.extend(allocation_size)?;
    fh.sync(SyncKind::Full)?;
    Ok(Self {
      fh,
      id,
      allocation_size,
      compressor,
      live: Mutex::new(Live {
        alloc: ExtentList::new("alloc"),
        avail: ExtentList::new("avail"),
        discard: ExtentList::new("discard"),
        file_size: allocation_size,
        write_gen: 1,
        ckpt_list_blocks: Vec::new(),
      }),
      dropped: AtomicBool::new(false),
      stats: BlockStats::default(),
    })
  }

  /// Open an existing block file, optionally restoring free space from a
  /// checkpoint cookie
  pub fn open(
    fh: Arc<FileHandle>,
    id: BtreeId,
    compressor: Option<Arc<dyn Compressor>>,
    cookie: Option<&CheckpointCookie>,
  ) -> Result<Self> {
    let allocation_size = read_desc(&fh)?;
    let file_size = fh.size()?;
    let manager = Self {
      fh,
      id,
      allocation_size,
      compressor,
      live: Mutex::new(Live {
        alloc: ExtentList::new("alloc"),
        avail: ExtentList::new("avail"),
        discard: ExtentList::new("discard"),
        file_size,
        write_gen: 1,
        ckpt_list_blocks: Vec::new(),
      }),
      dropped: AtomicBool::new(false),
      stats: BlockStats::default(),
    };
    if let Some(cookie) = cookie {
      manager.checkpoint_load(cookie)?;
    } else {
      // No checkpoint: everything past the description sector is
      // unreachable and treated as free
      let mut live = manager.live.lock();
      let tail = file_size.saturating_sub(allocation_size);
      if tail > 0 {
        live.avail.insert(allocation_size, tail)?;
      }
    }
    Ok(manager)
  }

  /// Open a file whose checkpoint cookie is still packed: the allocation
  /// unit needed to unpack it comes from the file's description sector
  pub fn open_with_cookie_bytes(
    fh: Arc<FileHandle>,
    id: BtreeId,
    compressor: Option<Arc<dyn Compressor>>,
    cookie_bytes: Option<&[u8]>,
  ) -> Result<(Self, Option<ckpt::CheckpointCookie>)> {
    let allocation_size = read_desc(&fh)?;
    let cookie = match cookie_bytes {
      Some(bytes) => Some(ckpt::CheckpointCookie::unpack(bytes, allocation_size)?),
      None => None,
    };
    let manager = Self::open(fh, id, compressor, cookie.as_ref())?;
    Ok((manager, cookie))
  }

  pub fn object_id(&self) -> BtreeId {
    self.id
  }

  pub fn allocation_size(&self) -> u64 {
    self.allocation_size
  }

  pub fn file_handle(&self) -> &Arc<FileHandle> {
    &self.fh
  }

  /// Current logical file length
  pub fn size(&self) -> u64 {
    self.live.lock().file_size
  }

  /// Round a requested logical size up to the allocation unit
  pub fn write_size(&self, len: usize) -> usize {
    let unit = self.allocation_size as usize;
    len.div_ceil(unit) * unit
  }

  pub fn set_dropped(&self) {
    self.dropped.store(true, Ordering::Release);
  }

  pub fn is_dropped(&self) -> bool {
    self.dropped.load(Ordering::Acquire)
  }

  /// True if the cookie cannot reference a live block of this file
  pub fn addr_invalid(&self, addr: &Addr) -> bool {
    if self.is_dropped() || addr.object_id != self.id {
      return true;
    }
    if addr.off < self.allocation_size
      || addr.size == 0
      || addr.off % self.allocation_size != 0
      || addr.size % self.allocation_size != 0
    {
      return true;
    }
    addr.off + addr.size > self.live.lock().file_size
  }

  /// Printable address form; diagnostics only
  pub fn addr_string(&self, cookie: &[u8]) -> String {
    match Addr::unpack(cookie, self.allocation_size) {
      Ok((addr, _)) => addr.display(),
      Err(_) => format!("[invalid cookie: {} bytes]", cookie.len()),
    }
  }

  // ==========================================================================
  // Write path
  // ==========================================================================

  /// Write one block. `buf` carries the logical payload after a reserved
  /// `BLOCK_HEADER_SIZE` prefix; the header is filled in in place. With
  /// `data_checksum` the checksum covers the uncompressed payload only,
  /// letting a compressed block be verified after decompression.
  pub fn write(&self, buf: &[u8], data_checksum: bool) -> Result<Addr> {
    debug_assert!(buf.len() >= BLOCK_HEADER_SIZE);
    let payload = &buf[BLOCK_HEADER_SIZE..];
    let (mut image, mut flags) = self.build_image(payload)?;
    // The data checksum covers the uncompressed payload; without
    // compression the padded image has no recorded logical length, so the
    // full-block checksum applies
    if data_checksum && flags.contains(BlockFlags::COMPRESSED) {
      flags |= BlockFlags::DATA_CHECKSUM;
    }

    let disk_size = self.write_size(image.len()) as u64;
    image.resize(disk_size as usize, 0);
    finish_header(&mut image, disk_size as u32, flags, payload);

    let off = self.alloc_space(disk_size)?;
    self.fh.write(off, &image)?;
    self.stats.blocks_allocated.fetch_add(1, Ordering::Relaxed);
    self
      .stats
      .bytes_written
      .fetch_add(disk_size, Ordering::Relaxed);

    let checksum = read_u32(&image, 4);
    Ok(Addr {
      object_id: self.id,
      off,
      size: disk_size,
      checksum,
    })
  }

  /// Compress the payload when a compressor is configured and it helps
  fn build_image(&self, payload: &[u8]) -> Result<(Vec<u8>, BlockFlags)> {
    if let Some(compressor) = &self.compressor {
      if let Some(packed) = compressor.transform_out(payload)? {
        let mut image = Vec::with_capacity(BLOCK_HEADER_SIZE + 4 + packed.len());
        image.resize(BLOCK_HEADER_SIZE, 0);
        image.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        image.extend_from_slice(&packed);
        return Ok((image, BlockFlags::COMPRESSED));
      }
    }
    let mut image = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    image.resize(BLOCK_HEADER_SIZE, 0);
    image.extend_from_slice(payload);
    Ok((image, BlockFlags::empty()))
  }

  /// Allocate `size` aligned bytes, extending the file when the avail list
  /// cannot satisfy the request
  fn alloc_space(&self, size: u64) -> Result<u64> {
    let mut live = self.live.lock();
    let off = match live.avail.alloc(size) {
      Ok(off) => off,
      Err(TernError::NoSpace) => {
        let off = live.file_size;
        live.file_size += size;
        self.fh.extend(live.file_size)?;
        off
      }
      Err(e) => return Err(e),
    };
    live.alloc.append(off, size)?;
    Ok(off)
  }

  // ==========================================================================
  // Read path
  // ==========================================================================

  /// Read and verify a block, returning its logical payload
  pub fn read(&self, addr: &Addr) -> Result<Vec<u8>> {
    if self.is_dropped() {
      return Err(TernError::ObjectDropped(format!("object {}", self.id)));
    }
    if self.addr_invalid(addr) {
      return Err(TernError::Corruption(format!(
        "invalid block address {}",
        addr.display()
      )));
    }
    let image = match self.fh.read_mapped(addr.off, addr.size as usize) {
      Some(view) => view,
      None => self.fh.read(addr.off, addr.size as usize)?,
    };
    self
      .stats
      .bytes_read
      .fetch_add(addr.size, Ordering::Relaxed);
    self.verify_image(addr, &image)
  }

  /// Verify a block image against its address and return the payload
  pub(crate) fn verify_image(&self, addr: &Addr, image: &[u8]) -> Result<Vec<u8>> {
    if image.len() < BLOCK_HEADER_SIZE {
      return Err(TernError::Corruption("short block".to_string()));
    }
    let disk_size = u64::from(read_u32(image, 0));
    let stored_checksum = read_u32(image, 4);
    let flags = BlockFlags::from_bits_truncate(image[8]);

    if disk_size != addr.size {
      return Err(TernError::Corruption(format!(
        "block size {} does not match address {}",
        disk_size,
        addr.display()
      )));
    }
    if stored_checksum != addr.checksum {
      return Err(TernError::Corruption(format!(
        "block checksum {stored_checksum:#010x} does not match address {}",
        addr.display()
      )));
    }

    let payload = self.unpack_payload(image, flags)?;

    let computed = if flags.contains(BlockFlags::DATA_CHECKSUM) {
      crc32c(&payload)
    } else {
      checksum_full_block(image)
    };
    if computed != stored_checksum {
      return Err(TernError::Corruption(format!(
        "block checksum mismatch at {}: stored {stored_checksum:#010x}, computed {computed:#010x}",
        addr.display()
      )));
    }
    Ok(payload)
  }

  fn unpack_payload(&self, image: &[u8], flags: BlockFlags) -> Result<Vec<u8>> {
    if flags.contains(BlockFlags::COMPRESSED) {
      let Some(compressor) = &self.compressor else {
        return Err(TernError::Corruption(
          "compressed block but no compressor configured".to_string(),
        ));
      };
      if image.len() < BLOCK_HEADER_SIZE + 4 {
        return Err(TernError::Corruption("short compressed block".to_string()));
      }
      let logical_len = read_u32(image, BLOCK_HEADER_SIZE) as usize;
      compressor.transform_in(&image[BLOCK_HEADER_SIZE + 4..], logical_len)
    } else {
      Ok(image[BLOCK_HEADER_SIZE..].to_vec())
    }
  }

  // ==========================================================================
  // Free path
  // ==========================================================================

  /// Free a block. The extent joins the discard list and becomes allocatable
  /// only at the next checkpoint.
  pub fn free(&self, addr: &Addr) -> Result<()> {
    if self.addr_invalid(addr) {
      return Err(TernError::Corruption(format!(
        "free of invalid address {}",
        addr.display()
      )));
    }
    let mut live = self.live.lock();
    live.discard.merge(addr.off, addr.size)?;
    self.stats.blocks_freed.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  /// Flush written blocks to stable storage
  pub fn sync(&self) -> Result<()> {
    self.fh.sync(SyncKind::Data)
  }
}

/// Compute the full-block checksum: CRC-32C over the image with the
/// checksum field zeroed
pub(crate) fn checksum_full_block(image: &[u8]) -> u32 {
  crate::util::crc::crc32c_two(&image[..4], &image[8..])
}

pub(crate) fn finish_header(image: &mut [u8], disk_size: u32, flags: BlockFlags, payload: &[u8]) {
  write_u32(image, 0, disk_size);
  write_u32(image, 4, 0);
  image[8] = flags.bits();
  let checksum = if flags.contains(BlockFlags::DATA_CHECKSUM) {
    crc32c(payload)
  } else {
    checksum_full_block(image)
  };
  write_u32(image, 4, checksum);
}

// ============================================================================
// File-description sector
// ============================================================================

fn write_desc(fh: &FileHandle, allocation_size: u64) -> Result<()> {
  let mut desc = vec![0u8; DESC_SECTOR_SIZE];
  desc[..16].copy_from_slice(&MAGIC_TERNDB);
  write_u16(&mut desc, 16, VERSION_MAJOR);
  write_u16(&mut desc, 18, VERSION_MINOR);
  write_u32(&mut desc, 20, allocation_size as u32);
  desc[24] = 0; // checksum algorithm: CRC-32C
  let checksum = crc32c(&desc[..28]);
  write_u32(&mut desc, 28, checksum);
  fh.write(0, &desc)
}

fn read_desc(fh: &FileHandle) -> Result<u64> {
  let desc = fh.read(0, DESC_SECTOR_SIZE)?;
  if desc[..16] != MAGIC_TERNDB {
    return Err(TernError::Corruption("bad file magic".to_string()));
  }
  let major = read_u16(&desc, 16);
  if major < MIN_READER_MAJOR || major > VERSION_MAJOR {
    return Err(TernError::Corruption(format!(
      "unsupported file version {major}"
    )));
  }
  let allocation_size = u64::from(read_u32(&desc, 20));
  if !allocation_size.is_power_of_two() {
    return Err(TernError::Corruption(format!(
      "bad allocation size {allocation_size}"
    )));
  }
  let stored = read_u32(&desc, 28);
  if crc32c(&desc[..28]) != stored {
    return Err(TernError::Corruption("file description checksum".to_string()));
  }
  Ok(allocation_size)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::compress::DeflateCompressor;

  fn new_manager(dir: &std::path::Path) -> BlockManager {
    let fh = Arc::new(FileHandle::create(dir.join("test.tern")).unwrap());
    BlockManager::create(fh, 1, 4096, None).unwrap()
  }

  fn payload_buf(data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_HEADER_SIZE];
    buf.extend_from_slice(data);
    buf
  }

  #[test]
  fn write_read_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let manager = new_manager(dir.path());
    let buf = payload_buf(b"hello block manager");
    let addr = manager.write(&buf, false).unwrap();
    assert_eq!(addr.size % 4096, 0);
    let payload = manager.read(&addr).unwrap();
    assert_eq!(&payload[..19], b"hello block manager");
  }

  #[test]
  fn corrupted_block_fails_adjacent_survives() {
    let dir = tempfile::tempdir().unwrap();
    let manager = new_manager(dir.path());
    let a = manager.write(&payload_buf(&[0xa5; 4000]), false).unwrap();
    let b = manager.write(&payload_buf(&[0x5a; 4000]), false).unwrap();

    // Flip one payload byte in block a
    let mut image = manager.fh.read(a.off, a.size as usize).unwrap();
    image[100] ^= 0xff;
    manager.fh.write(a.off, &image).unwrap();

    assert!(matches!(manager.read(&a), Err(TernError::Corruption(_))));
    assert!(manager.read(&b).is_ok());
  }

  #[test]
  fn data_checksum_covers_uncompressed_payload() {
    let dir = tempfile::tempdir().unwrap();
    let fh = Arc::new(FileHandle::create(dir.path().join("c.tern")).unwrap());
    let manager =
      BlockManager::create(fh, 1, 4096, Some(Arc::new(DeflateCompressor))).unwrap();
    let data: Vec<u8> = b"compress me ".iter().copied().cycle().take(8000).collect();
    let addr = manager.write(&payload_buf(&data), true).unwrap();
    // Compressible payload lands in a single allocation unit
    assert_eq!(addr.size, 4096);
    assert_eq!(manager.read(&addr).unwrap(), data);
  }

  #[test]
  fn freed_space_is_reused_only_after_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let manager = new_manager(dir.path());
    let freed: Vec<Addr> = (0..3)
      .map(|i| manager.write(&payload_buf(&[i as u8; 4000]), false).unwrap())
      .collect();
    let keep = manager.write(&payload_buf(&[9u8; 4000]), false).unwrap();
    for addr in &freed {
      manager.free(addr).unwrap();
    }
    // Still on discard: the next write extends the file instead
    let b = manager.write(&payload_buf(&[2u8; 4000]), false).unwrap();
    assert!(freed.iter().all(|f| f.off != b.off));
    let cookie = manager.checkpoint_start(Some(&keep)).unwrap();
    manager.checkpoint_resolve().unwrap();
    assert!(cookie.avail_addr.size > 0);
    // After the checkpoint the discarded extents are allocatable again
    let c = manager.write(&payload_buf(&[3u8; 4000]), false).unwrap();
    assert!(freed.iter().any(|f| f.off == c.off));
  }

  #[test]
  fn addr_invalid_checks_bounds_and_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let manager = new_manager(dir.path());
    let addr = manager.write(&payload_buf(b"x"), false).unwrap();
    assert!(!manager.addr_invalid(&addr));
    assert!(manager.addr_invalid(&Addr { off: 0, ..addr }));
    assert!(manager.addr_invalid(&Addr { off: addr.off + 1, ..addr }));
    assert!(manager.addr_invalid(&Addr {
      off: 1 << 40,
      ..addr
    }));
    manager.set_dropped();
    assert!(manager.addr_invalid(&addr));
    assert!(matches!(
      manager.read(&addr),
      Err(TernError::ObjectDropped(_))
    ));
  }
}
