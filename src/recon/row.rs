//! Row-store leaf reconciliation

use std::sync::Arc;

use crate::btree::Btree;
use crate::constants::{BLOCK_HEADER_SIZE, TS_MAX, TS_NONE};
use crate::engine::EngineShared;
use crate::error::Result;
use crate::mvcc::visibility::upd_visible_all;
use crate::page::cell::DiskPageType;
use crate::page::refs::RefKey;
use crate::page::update::UpdateKind;
use crate::page::{OnDiskValue, Page, RowLeaf};
use crate::types::{TimeAggregate, TimeWindow};

use super::{hs, squash_modify, update_select, ChunkWriter, HsSpill, RecOutcome};

/// Reconcile a row leaf: walk slots and insert lists in key order, select
/// one committed value per key, spill still-needed older versions to the
/// history store, and pack the survivors into chunked images.
pub(crate) fn rec_row_leaf(
  shared: &EngineShared,
  btree: &Btree,
  page: &Arc<Page>,
  no_split: bool,
) -> Result<RecOutcome> {
  let leaf = page.row_leaf();
  let mut writer = if no_split {
    ChunkWriter::unsplit(btree, DiskPageType::RowLeaf, page.disk_gen + 1)
  } else {
    ChunkWriter::new(btree, DiskPageType::RowLeaf, page.disk_gen + 1, false)
  };
  let mut retained = false;
  let mut ta = TimeAggregate::empty();

  for gap in 0..=leaf.slots.len() {
    for node in leaf.inserts[gap].iter() {
      emit_record(
        shared,
        btree,
        page,
        leaf,
        &mut writer,
        &mut ta,
        &mut retained,
        node.key(),
        node.upd_head(),
        None,
      )?;
    }
    if gap < leaf.slots.len() {
      let slot = &leaf.slots[gap];
      let key = slot.key.to_vec();
      emit_record(
        shared,
        btree,
        page,
        leaf,
        &mut writer,
        &mut ta,
        &mut retained,
        &key,
        &slot.upd,
        slot.value.as_ref(),
      )?;
    }
  }

  Ok(RecOutcome {
    result: writer.finish()?,
    retained,
    ta,
  })
}

#[allow(clippy::too_many_arguments)]
fn emit_record(
  shared: &EngineShared,
  btree: &Btree,
  page: &Arc<Page>,
  leaf: &RowLeaf,
  writer: &mut ChunkWriter<'_>,
  ta: &mut TimeAggregate,
  retained: &mut bool,
  key: &[u8],
  chain: &std::sync::atomic::AtomicPtr<crate::page::update::Update>,
  disk: Option<&OnDiskValue>,
) -> Result<()> {
  let disk_base = || -> Result<Vec<u8>> {
    match disk {
      Some(disk) => disk_bytes(btree, leaf, disk),
      None => Ok(Vec::new()),
    }
  };
  let mut selection = update_select(shared, chain, &disk_base)?;
  *retained |= selection.retained;

  // A superseded on-disk value is itself an older version readers may need
  if selection.selected.is_some() && !selection.saw_visible_all {
    if let Some(disk) = disk {
      let tw = disk.time_window();
      let stop = selection.oldest_committed_start;
      if stop != TS_NONE && tw.start_ts < stop {
        selection.spills.push(HsSpill {
          start_ts: tw.start_ts,
          durable_ts: tw.start_ts,
          stop_ts: stop,
          value: disk_bytes(btree, leaf, disk)?,
        });
      }
    }
  }

  match &selection.selected {
    None => {
      // No committed update: the on-disk value stays untouched
      if let Some(disk) = disk {
        let tw = disk.time_window();
        write_disk_value(leaf, writer, key, disk, &tw)?;
        ta.merge_window(&tw);
      }
    }
    Some(selected) => match selected.upd.kind() {
      UpdateKind::Standard | UpdateKind::Modify => {
        let value = if selected.upd.kind() == UpdateKind::Modify {
          squash_modify(selected.upd, &disk_base)?
        } else {
          selected.upd.data().to_vec()
        };
        let tw = TimeWindow {
          start_ts: selected.start_ts,
          stop_ts: TS_MAX,
        };
        write_value_bytes(btree, page, writer, key, &value, disk, &tw)?;
        ta.merge_window(&tw);
      }
      UpdateKind::Tombstone => {
        if upd_visible_all(&shared.txn, selected.upd) {
          // Everyone sees the delete: the key is removed outright and its
          // history with it
          discard_overflow(page, disk);
          selection.spills.clear();
        } else {
          // The version under the tombstone stays in the page with a
          // bounded time window
          let stop = if selected.start_ts == TS_NONE {
            TS_MAX
          } else {
            selected.start_ts
          };
          if !selection.spills.is_empty() {
            let prev = selection.spills.remove(0);
            let tw = TimeWindow {
              start_ts: prev.start_ts,
              stop_ts: stop,
            };
            write_value_bytes(btree, page, writer, key, &prev.value, disk, &tw)?;
            ta.merge_window(&tw);
          } else if let Some(disk) = disk {
            let mut tw = disk.time_window();
            tw.stop_ts = stop;
            write_disk_value(leaf, writer, key, disk, &tw)?;
            ta.merge_window(&tw);
          }
        }
      }
      UpdateKind::Reserve => unreachable!("reserve updates are never selected"),
    },
  }

  for spill in &selection.spills {
    hs::hs_insert(shared, btree.id, key, spill)?;
  }
  Ok(())
}

fn disk_bytes(btree: &Btree, leaf: &RowLeaf, disk: &OnDiskValue) -> Result<Vec<u8>> {
  match disk {
    OnDiskValue::Inline { offset, len, .. } => Ok(leaf.image[*offset..*offset + *len].to_vec()),
    OnDiskValue::Overflow { addr, .. } => btree.read_overflow(addr),
  }
}

/// Re-emit an existing on-disk value, reusing its overflow block
fn write_disk_value(
  leaf: &RowLeaf,
  writer: &mut ChunkWriter<'_>,
  key: &[u8],
  disk: &OnDiskValue,
  tw: &TimeWindow,
) -> Result<()> {
  writer.begin_record(RefKey::Row(key.to_vec()));
  writer.builder().key(key);
  match disk {
    OnDiskValue::Inline { offset, len, .. } => {
      let bytes = leaf.image[*offset..*offset + *len].to_vec();
      writer.builder().value(&bytes, tw, 1);
    }
    OnDiskValue::Overflow { addr, .. } => {
      writer.builder().value_ovfl(addr, tw);
    }
  }
  writer.end_record()
}

/// Emit a freshly materialized value, writing an overflow block when it
/// exceeds the in-line maximum; any prior overflow block is superseded
fn write_value_bytes(
  btree: &Btree,
  page: &Arc<Page>,
  writer: &mut ChunkWriter<'_>,
  key: &[u8],
  value: &[u8],
  old_disk: Option<&OnDiskValue>,
  tw: &TimeWindow,
) -> Result<()> {
  discard_overflow(page, old_disk);
  writer.begin_record(RefKey::Row(key.to_vec()));
  writer.builder().key(key);
  if value.len() > btree.opts.leaf_value_max {
    let mut buf = vec![0u8; BLOCK_HEADER_SIZE];
    buf.extend_from_slice(value);
    let addr = btree.bm.write(&buf, true)?;
    writer.builder().value_ovfl(&addr, tw);
  } else {
    writer.builder().value(value, tw, 1);
  }
  writer.end_record()
}

/// The old overflow block is no longer referenced by the new image
fn discard_overflow(page: &Arc<Page>, disk: Option<&OnDiskValue>) {
  if let Some(OnDiskValue::Overflow { addr, .. }) = disk {
    let addr = *addr;
    page.with_modify(|m| {
      if !m.ovfl_discard.contains(&addr) {
        m.ovfl_discard.push(addr);
      }
    });
  }
}
