//! Address cookies
//!
//! Opaque byte strings that locate a block: `(object_id, offset, size,
//! checksum)` packed as varints. Offset and size are expressed in allocation
//! units so they fit in 32 bits on ordinary files. Cookies are produced only
//! by the block manager and embedded in internal-page address cells.

use crate::error::{Result, TernError};
use crate::types::BtreeId;
use crate::util::varint::{get_uvarint, put_uvarint};

/// Decoded block address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
  pub object_id: BtreeId,
  /// Byte offset in the file
  pub off: u64,
  /// Byte size of the block; a multiple of the allocation unit
  pub size: u64,
  pub checksum: u32,
}

impl Addr {
  /// Pack into cookie bytes using the file's allocation unit
  pub fn pack(&self, allocation_size: u64, out: &mut Vec<u8>) {
    debug_assert_eq!(self.off % allocation_size, 0);
    debug_assert_eq!(self.size % allocation_size, 0);
    put_uvarint(out, u64::from(self.object_id));
    put_uvarint(out, self.off / allocation_size);
    put_uvarint(out, self.size / allocation_size);
    put_uvarint(out, u64::from(self.checksum));
  }

  /// Unpack cookie bytes; returns the address and the bytes consumed
  pub fn unpack(cookie: &[u8], allocation_size: u64) -> Result<(Self, usize)> {
    let mut at = 0usize;
    let (object_id, used) = get_uvarint(cookie, at)?;
    at += used;
    let (off_units, used) = get_uvarint(cookie, at)?;
    at += used;
    let (size_units, used) = get_uvarint(cookie, at)?;
    at += used;
    let (checksum, used) = get_uvarint(cookie, at)?;
    at += used;
    let object_id = u32::try_from(object_id)
      .map_err(|_| TernError::Corruption("address object id overflow".to_string()))?;
    let checksum = u32::try_from(checksum)
      .map_err(|_| TernError::Corruption("address checksum overflow".to_string()))?;
    Ok((
      Self {
        object_id,
        off: off_units * allocation_size,
        size: size_units * allocation_size,
        checksum,
      },
      at,
    ))
  }

  pub fn to_cookie(&self, allocation_size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    self.pack(allocation_size, &mut out);
    out
  }

  /// Printable form, for diagnostics only
  pub fn display(&self) -> String {
    format!(
      "[{}: {}-{}, {} bytes, checksum {:#010x}]",
      self.object_id,
      self.off,
      self.off + self.size,
      self.size,
      self.checksum
    )
  }
}
