//! History store
//!
//! Older versions that some reader may still need are spilled to a hidden
//! row store keyed by `(btree id, user key, start timestamp)`. Keys are
//! zero-escaped so composite ordering matches the tuple ordering, and the
//! value carries the version's stop and durable timestamps ahead of its
//! bytes.

use std::sync::Arc;

use crate::btree::cursor::{prev_candidate, read_insert_value, read_slot_value, RowPos};
use crate::btree::descent::{LeafVisit, SearchKey};
use crate::btree::Btree;
use crate::engine::EngineShared;
use crate::error::{Result, TernError};
use crate::mvcc::{Isolation, Transaction};
use crate::page::update::{install, Update, UpdateKind};
use crate::types::{BtreeId, Timestamp};
use crate::util::varint::{get_uvarint, put_uvarint};

use super::HsSpill;

/// `(btree id, escaped key)` prefix shared by every version of one key
fn hs_prefix(btree_id: BtreeId, key: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(4 + key.len() + 2);
  out.extend_from_slice(&btree_id.to_be_bytes());
  for &byte in key {
    out.push(byte);
    if byte == 0 {
      // Escape embedded zero bytes so the terminator sorts below them
      out.push(0xff);
    }
  }
  out.push(0);
  out.push(0);
  out
}

/// Full history-store key: prefix plus big-endian start timestamp
pub(crate) fn hs_key(btree_id: BtreeId, key: &[u8], start_ts: Timestamp) -> Vec<u8> {
  let mut out = hs_prefix(btree_id, key);
  out.extend_from_slice(&start_ts.to_be_bytes());
  out
}

fn pack_hs_value(spill: &HsSpill) -> Vec<u8> {
  let mut out = Vec::with_capacity(spill.value.len() + 8);
  put_uvarint(&mut out, spill.stop_ts);
  put_uvarint(&mut out, spill.durable_ts);
  out.extend_from_slice(&spill.value);
  out
}

fn unpack_hs_value(data: &[u8]) -> Result<(Timestamp, Timestamp, Vec<u8>)> {
  let (stop_ts, used) = get_uvarint(data, 0)?;
  let (durable_ts, used2) = get_uvarint(data, used)?;
  Ok((stop_ts, durable_ts, data[used + used2..].to_vec()))
}

/// A throwaway transaction for internal history-store access; never
/// registered, so it cannot pin the oldest id
fn internal_txn(shared: &EngineShared) -> Transaction {
  let mut txn = Transaction::new(Arc::clone(&shared.hs_txn));
  txn
    .begin(Isolation::Snapshot, false)
    .expect("fresh transaction begins");
  txn
}

/// Spill one older version into the history store. A no-op while the
/// history store itself is being reconciled or before it exists.
pub(crate) fn hs_insert(
  shared: &EngineShared,
  btree_id: BtreeId,
  key: &[u8],
  spill: &HsSpill,
) -> Result<()> {
  let Some(hs) = shared.hs() else {
    return Ok(());
  };
  if hs.id == btree_id {
    return Ok(());
  }
  // Versions with no timestamps cannot be asked for again
  if spill.start_ts == crate::constants::TS_NONE && spill.stop_ts == crate::constants::TS_NONE {
    return Ok(());
  }
  let record_key = hs_key(btree_id, key, spill.start_ts);
  let txn = internal_txn(shared);
  let leaf_ref = match hs.descend(shared, &txn, SearchKey::Row(&record_key), true)? {
    LeafVisit::Leaf(leaf) => leaf,
    LeafVisit::Truncated => {
      return Err(TernError::Internal("history store truncated".to_string()))
    }
  };
  let page = leaf_ref.page;
  let leaf = page.row_leaf();

  let upd = Update::new(UpdateKind::Standard, pack_hs_value(spill), crate::constants::TXN_NONE);
  // History writes are committed by construction
  upd.commit(spill.start_ts, spill.durable_ts);
  let bytes = upd.memory_footprint();
  match leaf.search(&record_key) {
    Ok(slot) => {
      install(&leaf.slots[slot].upd, upd, |_| Ok(()))?;
    }
    Err(gap) => {
      let (node, created) = leaf.insert_list(gap).insert_or_get(record_key.clone());
      if created {
        let node_bytes = record_key.len() + 64;
        page.add_footprint(node_bytes);
        shared.cache.add_bytes(node_bytes);
      }
      install(node.upd_head(), upd, |_| Ok(()))?;
    }
  }
  shared.cache.add_bytes(bytes);
  shared.cache.dirty_add(bytes);
  if page.mark_dirty(bytes) {
    shared.cache.page_dirtied();
  }
  Ok(())
}

/// Find the version of `(btree_id, key)` visible at `read_ts`: the record
/// with the greatest start timestamp at or below it, provided its stop
/// timestamp is still ahead of the reader.
pub(crate) fn hs_search(
  shared: &EngineShared,
  btree_id: BtreeId,
  key: &[u8],
  read_ts: Timestamp,
) -> Result<Option<Vec<u8>>> {
  let Some(hs) = shared.hs() else {
    return Ok(None);
  };
  let prefix = hs_prefix(btree_id, key);
  // Smallest key strictly above every candidate at or below read_ts
  let mut bound = hs_key(btree_id, key, read_ts);
  bound.push(0);

  let mut txn = internal_txn(shared);
  txn.ensure_snapshot(&shared.txn);

  let leaf_ref = match hs.descend(shared, &txn, SearchKey::Row(&bound), false)? {
    LeafVisit::Leaf(leaf) => leaf,
    LeafVisit::Truncated => return Ok(None),
  };
  let mut page = leaf_ref.page;
  // The greatest candidate below the bound may sit in the left sibling
  for _ in 0..2 {
    let leaf = page.row_leaf();
    let candidate = prev_candidate(leaf, Some(&bound));
    let (found_key, value) = match candidate {
      Some(RowPos::Slot(slot)) => (
        leaf.slots[slot].key.to_vec(),
        read_slot_value(shared, &hs, &txn, leaf, slot)?,
      ),
      Some(RowPos::Insert(node)) => (
        node.key().clone(),
        read_insert_value(shared, &hs, &txn, node)?,
      ),
      None => {
        match hs.leaf_before_row(shared, &txn, Some(&bound))? {
          Some(prev_leaf) => {
            page = prev_leaf.page;
            continue;
          }
          None => return Ok(None),
        }
      }
    };
    if !found_key.starts_with(&prefix) {
      return Ok(None); // a different key's history
    }
    let Some(value) = value else {
      return Ok(None);
    };
    let (stop_ts, _durable_ts, bytes) = unpack_hs_value(&value)?;
    if stop_ts > read_ts {
      return Ok(Some(bytes));
    }
    // The reader falls into a window where the key was deleted
    return Ok(None);
  }
  Ok(None)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hs_keys_order_by_btree_key_then_ts() {
    let a10 = hs_key(1, b"a", 10);
    let a20 = hs_key(1, b"a", 20);
    let b5 = hs_key(1, b"b", 5);
    let other_tree = hs_key(2, b"a", 5);
    assert!(a10 < a20);
    assert!(a20 < b5);
    assert!(b5 < other_tree);
  }

  #[test]
  fn zero_bytes_keep_tuple_ordering() {
    // "a" < "a\0" < "a\0b" < "ab" must hold after encoding
    let plain = hs_key(1, b"a", 10);
    let with_zero = hs_key(1, b"a\0", 10);
    let zero_then_more = hs_key(1, b"a\0b", 10);
    let longer = hs_key(1, b"ab", 10);
    assert!(plain < with_zero);
    assert!(with_zero < zero_then_more);
    assert!(zero_then_more < longer);
  }

  #[test]
  fn hs_value_roundtrip() {
    let spill = HsSpill {
      start_ts: 5,
      durable_ts: 6,
      stop_ts: 9,
      value: b"old version".to_vec(),
    };
    let packed = pack_hs_value(&spill);
    let (stop, durable, bytes) = unpack_hs_value(&packed).unwrap();
    assert_eq!(stop, 9);
    assert_eq!(durable, 6);
    assert_eq!(bytes, b"old version");
  }
}
