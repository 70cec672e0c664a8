//! Column-store leaf reconciliation

use std::sync::Arc;

use crate::btree::Btree;
use crate::constants::{BLOCK_HEADER_SIZE, TS_MAX, TS_NONE};
use crate::engine::EngineShared;
use crate::error::Result;
use crate::mvcc::visibility::upd_visible_all;
use crate::page::cell::{DiskPageType, PAGE_HEADER_SIZE};
use crate::page::refs::RefKey;
use crate::page::update::UpdateKind;
use crate::page::{ColVarLeaf, OnDiskValue, Page};
use crate::types::{RecNo, TimeAggregate, TimeWindow};

use super::{hs, squash_modify, update_select, ChunkWriter, RecOutcome, RecResult, Selection};

/// What one record contributes to the new image
enum ColRecord {
  Deleted,
  Value(Vec<u8>, TimeWindow),
  /// Keep the existing overflow reference
  KeepOverflow(crate::block::Addr, TimeWindow),
}

/// Reconcile a variable-length column leaf. Records merge the disk cells
/// with the mods skiplist in record-number order; deleted records compress
/// into run-length cells.
pub(crate) fn rec_col_var(
  shared: &EngineShared,
  btree: &Btree,
  page: &Arc<Page>,
  no_split: bool,
) -> Result<RecOutcome> {
  let leaf = page.col_var_leaf();
  let mut writer = if no_split {
    ChunkWriter::unsplit(btree, DiskPageType::ColVarLeaf, page.disk_gen + 1)
  } else {
    ChunkWriter::new(btree, DiskPageType::ColVarLeaf, page.disk_gen + 1, false)
  };
  let mut retained = false;
  let mut ta = TimeAggregate::empty();

  let start = leaf.start_recno;
  let disk_end = leaf.last_recno();
  let mods_end = leaf
    .mods
    .last()
    .map(|node| *node.key() + 1)
    .unwrap_or(disk_end);
  let end = disk_end.max(mods_end);

  let mut del_run: u64 = 0;
  let mut del_run_start: RecNo = 0;
  for recno in start..end {
    let record = resolve_record(shared, btree, page, leaf, recno, &mut retained)?;
    match record {
      ColRecord::Deleted => {
        if del_run == 0 {
          del_run_start = recno;
        }
        del_run += 1;
      }
      ColRecord::Value(value, tw) => {
        flush_del_run(&mut writer, &mut del_run, del_run_start)?;
        writer.begin_record(RefKey::Col(recno));
        if value.len() > btree.opts.leaf_value_max {
          let mut buf = vec![0u8; BLOCK_HEADER_SIZE];
          buf.extend_from_slice(&value);
          let addr = btree.bm.write(&buf, true)?;
          writer.builder().value_ovfl(&addr, &tw);
        } else {
          writer.builder().value(&value, &tw, 1);
        }
        ta.merge_window(&tw);
        writer.end_record()?;
      }
      ColRecord::KeepOverflow(addr, tw) => {
        flush_del_run(&mut writer, &mut del_run, del_run_start)?;
        writer.begin_record(RefKey::Col(recno));
        writer.builder().value_ovfl(&addr, &tw);
        ta.merge_window(&tw);
        writer.end_record()?;
      }
    }
  }
  // A trailing deleted run carries no information: the table simply ends

  Ok(RecOutcome {
    result: writer.finish()?,
    retained,
    ta,
  })
}

fn flush_del_run(writer: &mut ChunkWriter<'_>, del_run: &mut u64, start: RecNo) -> Result<()> {
  if *del_run > 0 {
    writer.begin_record(RefKey::Col(start));
    writer.builder().del_run(*del_run);
    writer.end_record()?;
    *del_run = 0;
  }
  Ok(())
}

fn resolve_record(
  shared: &EngineShared,
  btree: &Btree,
  page: &Arc<Page>,
  leaf: &ColVarLeaf,
  recno: RecNo,
  retained: &mut bool,
) -> Result<ColRecord> {
  let disk_cell = leaf.search(recno);
  let disk_value = disk_cell.and_then(|cell| cell.value.as_ref());
  let disk_base = || -> Result<Vec<u8>> {
    match disk_value {
      Some(OnDiskValue::Inline { offset, len, .. }) => {
        Ok(leaf.image[*offset..*offset + *len].to_vec())
      }
      Some(OnDiskValue::Overflow { addr, .. }) => btree.read_overflow(addr),
      None => Ok(Vec::new()),
    }
  };

  let selection: Option<Selection<'_>> = match leaf.mods.search(&recno) {
    Some(node) => Some(update_select(shared, node.upd_head(), &disk_base)?),
    None => None,
  };

  let Some(mut selection) = selection else {
    // Untouched record: carry the disk state forward
    return Ok(match disk_value {
      None => ColRecord::Deleted,
      Some(OnDiskValue::Overflow { addr, tw }) => ColRecord::KeepOverflow(*addr, *tw),
      Some(OnDiskValue::Inline { .. }) => ColRecord::Value(disk_base()?, disk_value.map(|v| v.time_window()).unwrap_or_default()),
    });
  };
  *retained |= selection.retained;

  let record = match &selection.selected {
    None => match disk_value {
      None => ColRecord::Deleted,
      Some(OnDiskValue::Overflow { addr, tw }) => ColRecord::KeepOverflow(*addr, *tw),
      Some(value) => ColRecord::Value(disk_base()?, value.time_window()),
    },
    Some(selected) => match selected.upd.kind() {
      UpdateKind::Standard => ColRecord::Value(
        selected.upd.data().to_vec(),
        TimeWindow {
          start_ts: selected.start_ts,
          stop_ts: TS_MAX,
        },
      ),
      UpdateKind::Modify => ColRecord::Value(
        squash_modify(selected.upd, &disk_base)?,
        TimeWindow {
          start_ts: selected.start_ts,
          stop_ts: TS_MAX,
        },
      ),
      UpdateKind::Tombstone => {
        if upd_visible_all(&shared.txn, selected.upd) {
          if let Some(OnDiskValue::Overflow { addr, .. }) = disk_value {
            let addr = *addr;
            page.with_modify(|m| {
              if !m.ovfl_discard.contains(&addr) {
                m.ovfl_discard.push(addr);
              }
            });
          }
          selection.spills.clear();
          ColRecord::Deleted
        } else {
          let stop = if selected.start_ts == TS_NONE {
            TS_MAX
          } else {
            selected.start_ts
          };
          if !selection.spills.is_empty() {
            let prev = selection.spills.remove(0);
            ColRecord::Value(
              prev.value.clone(),
              TimeWindow {
                start_ts: prev.start_ts,
                stop_ts: stop,
              },
            )
          } else if let Some(value) = disk_value {
            let mut tw = value.time_window();
            tw.stop_ts = stop;
            ColRecord::Value(disk_base()?, tw)
          } else {
            ColRecord::Deleted
          }
        }
      }
      UpdateKind::Reserve => unreachable!("reserve updates are never selected"),
    },
  };

  let key = recno.to_be_bytes();
  for spill in &selection.spills {
    hs::hs_insert(shared, btree.id, &key, spill)?;
  }
  Ok(record)
}

/// Reconcile a fixed-length column leaf into one packed bitmap image
pub(crate) fn rec_col_fix(
  shared: &EngineShared,
  btree: &Btree,
  page: &Arc<Page>,
) -> Result<RecOutcome> {
  let leaf = page.col_fix_leaf().lock();
  let mut retained = false;

  let start = leaf.start_recno;
  let disk_end = leaf.last_recno();
  let mods_end = leaf
    .mods
    .last()
    .map(|node| *node.key() + 1)
    .unwrap_or(disk_end);
  let end = disk_end.max(mods_end);
  let entries = end.saturating_sub(start);
  if entries == 0 {
    return Ok(RecOutcome {
      result: RecResult::Empty,
      retained: false,
      ta: TimeAggregate::empty(),
    });
  }

  let bits = leaf.bitsize as usize;
  let mut bitmap = vec![0u8; (entries as usize * bits).div_ceil(8)];
  let mut set_value = |recno: RecNo, value: u8| {
    let index = (recno - start) as usize;
    let bit_off = index * bits;
    let mask = ((1u16 << bits) - 1) as u8;
    let wide = u16::from(value & mask) << (bit_off % 8);
    bitmap[bit_off / 8] |= wide as u8;
    if bit_off % 8 + bits > 8 {
      bitmap[bit_off / 8 + 1] |= (wide >> 8) as u8;
    }
  };

  for recno in start..end {
    let in_image = recno < disk_end;
    let disk_base = || -> Result<Vec<u8>> {
      Ok(if in_image {
        vec![leaf.bit_value(recno)]
      } else {
        Vec::new()
      })
    };
    match leaf.mods.search(&recno) {
      Some(node) => {
        let selection = update_select(shared, node.upd_head(), &disk_base)?;
        retained |= selection.retained;
        match &selection.selected {
          None => {
            if in_image {
              set_value(recno, leaf.bit_value(recno));
            }
          }
          Some(selected) => match selected.upd.kind() {
            UpdateKind::Standard => {
              set_value(recno, selected.upd.data().first().copied().unwrap_or(0))
            }
            UpdateKind::Modify => {
              let value = squash_modify(selected.upd, &disk_base)?;
              set_value(recno, value.first().copied().unwrap_or(0));
            }
            // Fixed-length stores have no out-of-band deleted state; a
            // removed record reads as zero
            UpdateKind::Tombstone => {}
            UpdateKind::Reserve => unreachable!(),
          },
        }
      }
      None => {
        if in_image {
          set_value(recno, leaf.bit_value(recno));
        }
      }
    }
  }

  let mut image = vec![0u8; BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE + 1];
  image[BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE] = leaf.bitsize;
  image.extend_from_slice(&bitmap);
  let mut writer = ChunkWriter::unsplit(btree, DiskPageType::ColFixLeaf, page.disk_gen + 1);
  writer.flush_raw(image, entries as u32, RefKey::Col(start))?;

  Ok(RecOutcome {
    result: writer.finish()?,
    retained,
    ta: TimeAggregate::empty(),
  })
}
