//! Pluggable block compression
//!
//! Compressors are byte-stream transforms registered by name and resolved
//! once at file open. The built-in `"deflate"` compressor wraps flate2.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::{Result, TernError};

/// A byte-stream transform applied to block payloads
pub trait Compressor: Send + Sync {
  fn name(&self) -> &str;

  /// Compress `src`; returns None when compression would not shrink it
  fn transform_out(&self, src: &[u8]) -> Result<Option<Vec<u8>>>;

  /// Decompress `src` into exactly `dst_len` bytes
  fn transform_in(&self, src: &[u8], dst_len: usize) -> Result<Vec<u8>>;
}

// ============================================================================
// Deflate
// ============================================================================

pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
  fn name(&self) -> &str {
    "deflate"
  }

  fn transform_out(&self, src: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(src.len() / 2), Compression::fast());
    encoder.write_all(src)?;
    let out = encoder.finish()?;
    if out.len() >= src.len() {
      return Ok(None);
    }
    Ok(Some(out))
  }

  fn transform_in(&self, src: &[u8], dst_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(dst_len);
    DeflateDecoder::new(src).read_to_end(&mut out)?;
    if out.len() != dst_len {
      return Err(TernError::Corruption(format!(
        "decompressed {} bytes, expected {}",
        out.len(),
        dst_len
      )));
    }
    Ok(out)
  }
}

// ============================================================================
// Registry
// ============================================================================

/// Name-to-compressor registry; populated at engine open
pub struct CompressorRegistry {
  by_name: RwLock<HashMap<String, Arc<dyn Compressor>>>,
}

impl CompressorRegistry {
  pub fn with_builtins() -> Self {
    let registry = Self {
      by_name: RwLock::new(HashMap::new()),
    };
    registry.register(Arc::new(DeflateCompressor));
    registry
  }

  pub fn register(&self, compressor: Arc<dyn Compressor>) {
    self
      .by_name
      .write()
      .insert(compressor.name().to_string(), compressor);
  }

  /// Resolve a configured compressor name; empty means none
  pub fn resolve(&self, name: &str) -> Result<Option<Arc<dyn Compressor>>> {
    if name.is_empty() {
      return Ok(None);
    }
    self.by_name.read().get(name).cloned().map(Some).ok_or_else(|| {
      TernError::InvalidArgument(format!("unknown block compressor: {name}"))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deflate_roundtrip() {
    let compressor = DeflateCompressor;
    let src: Vec<u8> = std::iter::repeat_with(|| b"terndb ".iter().copied())
      .take(128)
      .flatten()
      .collect();
    let packed = compressor.transform_out(&src).unwrap().expect("compressible");
    assert!(packed.len() < src.len());
    let back = compressor.transform_in(&packed, src.len()).unwrap();
    assert_eq!(back, src);
  }

  #[test]
  fn incompressible_returns_none() {
    let compressor = DeflateCompressor;
    // 16 random-ish bytes cannot shrink under deflate overhead
    let src = [0x5au8, 1, 99, 42, 7, 250, 13, 77, 3, 9, 200, 31, 64, 128, 2, 255];
    assert!(compressor.transform_out(&src).unwrap().is_none());
  }

  #[test]
  fn registry_resolves_builtin() {
    let registry = CompressorRegistry::with_builtins();
    assert!(registry.resolve("deflate").unwrap().is_some());
    assert!(registry.resolve("").unwrap().is_none());
    assert!(registry.resolve("nope").is_err());
  }
}
