//! Variable-length unsigned integers
//!
//! LEB128-style: seven value bits per byte, high bit set on continuation.
//! Used by the cell codec, address cookies, and extent-list blocks.

use crate::error::{Result, TernError};

/// Maximum encoded size of a u64
pub const MAX_VARINT_LEN: usize = 10;

#[inline]
pub fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
  while value >= 0x80 {
    out.push((value as u8) | 0x80);
    value >>= 7;
  }
  out.push(value as u8);
}

/// Decode a varint at `offset`; returns (value, bytes consumed)
#[inline]
pub fn get_uvarint(data: &[u8], offset: usize) -> Result<(u64, usize)> {
  let mut value: u64 = 0;
  let mut shift: u32 = 0;
  let mut used = 0usize;
  loop {
    let byte = *data
      .get(offset + used)
      .ok_or_else(|| TernError::Corruption("truncated varint".to_string()))?;
    used += 1;
    if shift == 63 && byte > 1 {
      return Err(TernError::Corruption("varint overflow".to_string()));
    }
    value |= u64::from(byte & 0x7f) << shift;
    if byte & 0x80 == 0 {
      return Ok((value, used));
    }
    shift += 7;
    if used > MAX_VARINT_LEN {
      return Err(TernError::Corruption("varint too long".to_string()));
    }
  }
}

/// Encoded size of `value` without materializing it
#[inline]
pub fn uvarint_len(value: u64) -> usize {
  if value == 0 {
    return 1;
  }
  (64 - value.leading_zeros() as usize).div_ceil(7)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roundtrip_boundaries() {
    let cases = [
      0u64,
      1,
      0x7f,
      0x80,
      0x3fff,
      0x4000,
      u32::MAX as u64,
      u64::MAX - 1,
      u64::MAX,
    ];
    for &v in &cases {
      let mut buf = Vec::new();
      put_uvarint(&mut buf, v);
      assert_eq!(buf.len(), uvarint_len(v), "len mismatch for {v}");
      let (back, used) = get_uvarint(&buf, 0).unwrap();
      assert_eq!(back, v);
      assert_eq!(used, buf.len());
    }
  }

  #[test]
  fn truncated_input_is_corruption() {
    let mut buf = Vec::new();
    put_uvarint(&mut buf, u64::MAX);
    buf.truncate(buf.len() - 1);
    assert!(get_uvarint(&buf, 0).is_err());
  }
}
