//! Engine and table configuration

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Result, TernError};

// ============================================================================
// Engine options
// ============================================================================

/// Options for opening an engine home directory
#[derive(Debug, Clone)]
pub struct EngineOptions {
  /// Create the home directory and metadata if missing
  pub create: bool,
  /// Open in read-only mode
  pub read_only: bool,
  /// Cache ceiling in bytes
  pub cache_max: u64,
  /// Maximum time a cursor waits on a full cache before rolling back (us)
  pub cache_max_wait_us: u64,
  /// Run the background eviction server
  pub eviction_server: bool,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      create: true,
      read_only: false,
      cache_max: DEFAULT_CACHE_MAX,
      cache_max_wait_us: DEFAULT_CACHE_MAX_WAIT_US,
      eviction_server: true,
    }
  }
}

impl EngineOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn create(mut self, value: bool) -> Self {
    self.create = value;
    self
  }

  pub fn read_only(mut self, value: bool) -> Self {
    self.read_only = value;
    self
  }

  pub fn cache_max(mut self, bytes: u64) -> Self {
    self.cache_max = bytes;
    self
  }

  pub fn cache_max_wait_us(mut self, us: u64) -> Self {
    self.cache_max_wait_us = us;
    self
  }

  pub fn eviction_server(mut self, value: bool) -> Self {
    self.eviction_server = value;
    self
  }
}

// ============================================================================
// Table options
// ============================================================================

/// Key format of a table: byte-string keys (row store) or record numbers
/// (column store)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyFormat {
  /// Lexicographically ordered byte strings
  Bytes,
  /// 1-based record numbers, variable-length values
  RecNo,
  /// 1-based record numbers, fixed-width values of `fixed_bitsize` bits
  RecNoFixed,
}

/// Per-table configuration, persisted as JSON in the metadata table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOptions {
  pub key_format: KeyFormat,
  /// Value width in bits for `KeyFormat::RecNoFixed` (1..=8)
  pub fixed_bitsize: u8,
  /// File allocation unit
  pub allocation_size: usize,
  /// Maximum leaf page image size
  pub leaf_page_max: usize,
  /// Maximum internal page image size
  pub internal_page_max: usize,
  /// Values larger than this go to overflow blocks
  pub leaf_value_max: usize,
  /// Reconciliation split point, percent of leaf_page_max
  pub split_pct: usize,
  /// Leaf-row key prefix compression
  pub prefix_compression: bool,
  /// Block compressor registered under this name, empty for none
  pub block_compressor: String,
}

impl Default for TableOptions {
  fn default() -> Self {
    Self {
      key_format: KeyFormat::Bytes,
      fixed_bitsize: 8,
      allocation_size: DEFAULT_ALLOCATION_SIZE,
      leaf_page_max: DEFAULT_LEAF_PAGE_MAX,
      internal_page_max: DEFAULT_INTERNAL_PAGE_MAX,
      leaf_value_max: DEFAULT_LEAF_VALUE_MAX,
      split_pct: DEFAULT_SPLIT_PCT,
      prefix_compression: true,
      block_compressor: String::new(),
    }
  }
}

impl TableOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn key_format(mut self, value: KeyFormat) -> Self {
    self.key_format = value;
    self
  }

  pub fn fixed_bitsize(mut self, bits: u8) -> Self {
    self.fixed_bitsize = bits;
    self
  }

  pub fn allocation_size(mut self, bytes: usize) -> Self {
    self.allocation_size = bytes;
    self
  }

  pub fn leaf_page_max(mut self, bytes: usize) -> Self {
    self.leaf_page_max = bytes;
    self
  }

  pub fn internal_page_max(mut self, bytes: usize) -> Self {
    self.internal_page_max = bytes;
    self
  }

  pub fn leaf_value_max(mut self, bytes: usize) -> Self {
    self.leaf_value_max = bytes;
    self
  }

  pub fn split_pct(mut self, pct: usize) -> Self {
    self.split_pct = pct.clamp(50, 100);
    self
  }

  pub fn prefix_compression(mut self, value: bool) -> Self {
    self.prefix_compression = value;
    self
  }

  pub fn block_compressor<S: Into<String>>(mut self, name: S) -> Self {
    self.block_compressor = name.into();
    self
  }

  /// Validate option combinations before a table is created
  pub fn validate(&self) -> Result<()> {
    if !self.allocation_size.is_power_of_two()
      || self.allocation_size < MIN_ALLOCATION_SIZE
      || self.allocation_size > MAX_ALLOCATION_SIZE
    {
      return Err(TernError::InvalidArgument(format!(
        "allocation_size {} must be a power of two in [{}, {}]",
        self.allocation_size, MIN_ALLOCATION_SIZE, MAX_ALLOCATION_SIZE
      )));
    }
    if self.leaf_page_max < self.allocation_size {
      return Err(TernError::InvalidArgument(
        "leaf_page_max smaller than allocation_size".to_string(),
      ));
    }
    if self.internal_page_max < self.allocation_size {
      return Err(TernError::InvalidArgument(
        "internal_page_max smaller than allocation_size".to_string(),
      ));
    }
    if self.key_format == KeyFormat::RecNoFixed && !(1..=8).contains(&self.fixed_bitsize) {
      return Err(TernError::InvalidArgument(format!(
        "fixed_bitsize {} out of range 1..=8",
        self.fixed_bitsize
      )));
    }
    Ok(())
  }

  pub fn to_json(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }

  pub fn from_json(text: &str) -> Result<Self> {
    Ok(serde_json::from_str(text)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn table_options_roundtrip_json() {
    let opts = TableOptions::new()
      .key_format(KeyFormat::RecNo)
      .leaf_page_max(64 * 1024)
      .block_compressor("deflate");
    let json = opts.to_json().unwrap();
    let back = TableOptions::from_json(&json).unwrap();
    assert_eq!(back.key_format, KeyFormat::RecNo);
    assert_eq!(back.leaf_page_max, 64 * 1024);
    assert_eq!(back.block_compressor, "deflate");
  }

  #[test]
  fn validate_rejects_bad_allocation_size() {
    let opts = TableOptions::new().allocation_size(3000);
    assert!(opts.validate().is_err());
  }
}
