//! CRC-32C (Castagnoli) for block checksums
//!
//! Polynomial 0x82F63B55 (reflected), init and final xor 0xFFFFFFFF. Block
//! headers store this value; the turtle file uses plain CRC-32 via
//! `crc32fast` instead.

const fn build_table() -> [u32; 256] {
  let mut table = [0u32; 256];
  let mut i = 0;
  while i < 256 {
    let mut crc = i as u32;
    let mut j = 0;
    while j < 8 {
      crc = if crc & 1 != 0 {
        (crc >> 1) ^ 0x82F6_3B55
      } else {
        crc >> 1
      };
      j += 1;
    }
    table[i] = crc;
    i += 1;
  }
  table
}

static CRC32C_TABLE: [u32; 256] = build_table();

/// CRC-32C of `data`
pub fn crc32c(data: &[u8]) -> u32 {
  let mut crc = 0xFFFF_FFFFu32;
  for &byte in data {
    crc = CRC32C_TABLE[((crc ^ u32::from(byte)) & 0xff) as usize] ^ (crc >> 8);
  }
  !crc
}

/// CRC-32C across two regions, as if concatenated
pub fn crc32c_two(a: &[u8], b: &[u8]) -> u32 {
  let mut crc = 0xFFFF_FFFFu32;
  for &byte in a.iter().chain(b.iter()) {
    crc = CRC32C_TABLE[((crc ^ u32::from(byte)) & 0xff) as usize] ^ (crc >> 8);
  }
  !crc
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn known_vectors() {
    // RFC 3720 B.4 test vectors
    assert_eq!(crc32c(&[0u8; 32]), 0x8A91_36AA);
    assert_eq!(crc32c(&[0xffu8; 32]), 0x62A8_AB43);
    assert_eq!(crc32c(b"123456789"), 0xE306_9283);
  }

  #[test]
  fn split_matches_whole() {
    let data = b"terndb block checksum region";
    assert_eq!(crc32c(data), crc32c_two(&data[..7], &data[7..]));
  }
}
