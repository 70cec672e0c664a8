//! Metadata table
//!
//! A hidden row store mapping table URIs to their configuration and
//! checkpoint cookies. The metadata table uses the same file format as any
//! other table; its own latest checkpoint cookie lives in the turtle file.

pub mod turtle;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::btree::cursor::TreeCursor;
use crate::btree::Btree;
use crate::config::TableOptions;
use crate::engine::EngineShared;
use crate::error::{Result, TernError};
use crate::types::BtreeId;

use turtle::{hex_decode, hex_encode};

/// One metadata record, stored as JSON under the table's URI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaEntry {
  pub btree_id: BtreeId,
  pub config: TableOptions,
  /// Checkpoint cookies by name; the unnamed checkpoint lives under ""
  pub checkpoints: HashMap<String, String>,
}

impl MetaEntry {
  pub fn new(btree_id: BtreeId, config: TableOptions) -> Self {
    Self {
      btree_id,
      config,
      checkpoints: HashMap::new(),
    }
  }

  pub fn set_checkpoint(&mut self, name: &str, cookie: &[u8]) {
    self.checkpoints.insert(name.to_string(), hex_encode(cookie));
  }

  pub fn checkpoint(&self, name: &str) -> Result<Option<Vec<u8>>> {
    match self.checkpoints.get(name) {
      Some(hex) => Ok(Some(hex_decode(hex)?)),
      None => Ok(None),
    }
  }

  pub fn to_json(&self) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(self)?)
  }

  pub fn from_json(data: &[u8]) -> Result<Self> {
    Ok(serde_json::from_slice(data)?)
  }
}

/// Validate a table URI and return its file name
pub fn uri_file_name(uri: &str) -> Result<&str> {
  let name = uri
    .strip_prefix("file:")
    .ok_or_else(|| TernError::InvalidArgument(format!("URI must start with file:, got {uri}")))?;
  if name.is_empty()
    || name.contains('/')
    || name.contains('\\')
    || name.starts_with('.')
  {
    return Err(TernError::InvalidArgument(format!("bad table file name: {name}")));
  }
  Ok(name)
}

/// Store or replace a metadata entry
pub fn meta_put(
  shared: &EngineShared,
  meta: &Arc<Btree>,
  uri: &str,
  entry: &MetaEntry,
) -> Result<()> {
  let hazard = shared.hazards.register();
  let mut cursor = TreeCursor::new(Arc::clone(meta), hazard.clone());
  let mut txn = shared.internal_txn();
  let result = cursor
    .insert(shared, &mut txn, uri.as_bytes(), &entry.to_json()?)
    .map(|_| txn.commit(&shared.txn, crate::constants::TS_NONE, crate::constants::TS_NONE))
    .and_then(|r| r);
  if result.is_err() {
    txn.rollback(&shared.txn);
  }
  drop(cursor);
  shared.hazards.unregister(&hazard);
  result
}

/// Fetch a metadata entry
pub fn meta_get(shared: &EngineShared, meta: &Arc<Btree>, uri: &str) -> Result<Option<MetaEntry>> {
  let hazard = shared.hazards.register();
  let mut cursor = TreeCursor::new(Arc::clone(meta), hazard.clone());
  let mut txn = shared.internal_txn();
  let result = match cursor.search(shared, &mut txn, uri.as_bytes()) {
    Ok(value) => MetaEntry::from_json(&value).map(Some),
    Err(TernError::NotFound) => Ok(None),
    Err(e) => Err(e),
  };
  txn.rollback(&shared.txn);
  drop(cursor);
  shared.hazards.unregister(&hazard);
  result
}

/// Remove a metadata entry
pub fn meta_remove(shared: &EngineShared, meta: &Arc<Btree>, uri: &str) -> Result<()> {
  let hazard = shared.hazards.register();
  let mut cursor = TreeCursor::new(Arc::clone(meta), hazard.clone());
  let mut txn = shared.internal_txn();
  let result = cursor
    .remove(shared, &mut txn, uri.as_bytes())
    .map(|_| txn.commit(&shared.txn, crate::constants::TS_NONE, crate::constants::TS_NONE))
    .and_then(|r| r);
  if result.is_err() {
    txn.rollback(&shared.txn);
  }
  drop(cursor);
  shared.hazards.unregister(&hazard);
  result
}

/// Every metadata entry, for open-time scans
pub fn meta_list(shared: &EngineShared, meta: &Arc<Btree>) -> Result<Vec<(String, MetaEntry)>> {
  let hazard = shared.hazards.register();
  let mut cursor = TreeCursor::new(Arc::clone(meta), hazard.clone());
  let mut txn = shared.internal_txn();
  let mut out = Vec::new();
  let result = loop {
    match cursor.next(shared, &mut txn) {
      Ok(Some((key, value))) => {
        let uri = String::from_utf8(key)
          .map_err(|_| TernError::Corruption("metadata key is not UTF-8".to_string()));
        match uri {
          Ok(uri) => match MetaEntry::from_json(&value) {
            Ok(entry) => out.push((uri, entry)),
            Err(e) => break Err(e),
          },
          Err(e) => break Err(e),
        }
      }
      Ok(None) => break Ok(()),
      Err(e) => break Err(e),
    }
  };
  txn.rollback(&shared.txn);
  drop(cursor);
  shared.hazards.unregister(&hazard);
  result.map(|_| out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn uri_validation() {
    assert_eq!(uri_file_name("file:users.tern").unwrap(), "users.tern");
    assert!(uri_file_name("table:users").is_err());
    assert!(uri_file_name("file:").is_err());
    assert!(uri_file_name("file:../evil").is_err());
    assert!(uri_file_name("file:sub/dir").is_err());
  }

  #[test]
  fn meta_entry_json_roundtrip() {
    let mut entry = MetaEntry::new(7, TableOptions::default());
    entry.set_checkpoint("", &[0xde, 0xad]);
    entry.set_checkpoint("backup", &[0xbe, 0xef]);
    let json = entry.to_json().unwrap();
    let back = MetaEntry::from_json(&json).unwrap();
    assert_eq!(back.btree_id, 7);
    assert_eq!(back.checkpoint("").unwrap().unwrap(), vec![0xde, 0xad]);
    assert_eq!(back.checkpoint("backup").unwrap().unwrap(), vec![0xbe, 0xef]);
    assert!(back.checkpoint("missing").unwrap().is_none());
  }
}
