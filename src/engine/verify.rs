//! Table verification
//!
//! A full scan of a table's last checkpoint: every reachable block is read
//! and checksum-verified, every page parses, keys stay inside the bounds
//! their parents claim, and no reachable block overlaps the checkpoint's
//! free space. Findings are collected rather than failing fast, then any
//! error is surfaced as `Corruption`.

use std::sync::Arc;

use crate::block::{Addr, CheckpointCookie, ExtentList};
use crate::btree::Btree;
use crate::engine::Engine;
use crate::error::{Result, TernError};
use crate::meta::meta_get;
use crate::page::refs::RefKey;
use crate::page::{Page, PageKind};
use crate::types::CheckResult;

impl Engine {
  /// Verify `uri` against its last checkpoint. Returns the findings on a
  /// clean pass; any error fails with `Corruption`.
  pub fn verify(&self, uri: &str) -> Result<CheckResult> {
    self.shared.check_poisoned()?;
    let btree = self.open_table(uri)?;
    let entry = meta_get(&self.shared, &self.meta, uri)?
      .ok_or_else(|| TernError::ObjectNotFound(uri.to_string()))?;
    let cookie_bytes = entry.checkpoint("")?;

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    match cookie_bytes {
      None => warnings.push("table has no checkpoint; nothing to verify".to_string()),
      Some(bytes) => {
        match CheckpointCookie::unpack(&bytes, btree.bm.allocation_size()) {
          Err(e) => errors.push(format!("checkpoint cookie unreadable: {e}")),
          Ok(cookie) => self.verify_checkpoint(&btree, &cookie, &mut errors, &mut warnings),
        }
      }
    }

    let result = CheckResult {
      valid: errors.is_empty(),
      errors,
      warnings,
    };
    if !result.valid {
      return Err(TernError::Corruption(result.errors.join("; ")));
    }
    Ok(result)
  }

  fn verify_checkpoint(
    &self,
    btree: &Arc<Btree>,
    cookie: &CheckpointCookie,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
  ) {
    // The checkpoint's free space must not overlap anything reachable
    let avail = match btree
      .bm
      .read(&cookie.avail_addr)
      .and_then(|payload| crate::block::ckpt::unpack_extent_list(&payload))
    {
      Ok(list) => Some(list),
      Err(e) => {
        errors.push(format!("avail extent list unreadable: {e}"));
        None
      }
    };
    if let Some(avail) = &avail {
      let mut total = 0;
      for ext in avail.iter() {
        total += ext.size;
        if ext.off + ext.size > cookie.file_size {
          errors.push(format!(
            "avail extent [{}, {}) past checkpoint file size {}",
            ext.off,
            ext.off + ext.size,
            cookie.file_size
          ));
        }
      }
      if total != avail.bytes() {
        errors.push("avail extent list byte counter mismatch".to_string());
      }
    }

    let Some(root) = cookie.root_addr else {
      warnings.push("empty tree".to_string());
      return;
    };
    let mut last_key: Option<Vec<u8>> = None;
    let mut last_recno: u64 = 0;
    self.verify_subtree(
      btree,
      &root,
      None,
      None,
      avail.as_ref(),
      cookie.file_size,
      &mut last_key,
      &mut last_recno,
      errors,
      warnings,
      0,
    );
  }

  #[allow(clippy::too_many_arguments)]
  fn verify_subtree(
    &self,
    btree: &Arc<Btree>,
    addr: &Addr,
    low: Option<&[u8]>,
    high: Option<&[u8]>,
    avail: Option<&ExtentList>,
    file_size: u64,
    last_key: &mut Option<Vec<u8>>,
    last_recno: &mut u64,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
    depth: usize,
  ) {
    if depth > 64 {
      errors.push("tree deeper than 64 levels".to_string());
      return;
    }
    if addr.off + addr.size > file_size {
      errors.push(format!(
        "block {} outside checkpoint file size {file_size}",
        addr.display()
      ));
      return;
    }
    if let Some(avail) = avail {
      if avail.overlaps(addr.off, addr.size) {
        errors.push(format!(
          "reachable block {} overlaps free space",
          addr.display()
        ));
      }
    }
    let payload = match btree.bm.read(addr) {
      Ok(payload) => payload,
      Err(e) => {
        errors.push(format!("block {} unreadable: {e}", addr.display()));
        return;
      }
    };
    let bm = &btree.bm;
    let page = match Page::from_image(
      payload,
      bm.allocation_size(),
      btree.opts.fixed_bitsize,
      &mut |ovfl| bm.read(ovfl),
    ) {
      Ok(page) => page,
      Err(e) => {
        errors.push(format!("page {} unparsable: {e}", addr.display()));
        return;
      }
    };

    match &page.kind {
      PageKind::RowLeaf(leaf) => {
        for slot in &leaf.slots {
          let key = slot.key.as_ref();
          if let Some(low) = low {
            if !low.is_empty() && key < low {
              errors.push(format!(
                "leaf {} holds a key below its parent bound",
                addr.display()
              ));
            }
          }
          if let Some(high) = high {
            if key >= high {
              errors.push(format!(
                "leaf {} holds a key at or above the next subtree",
                addr.display()
              ));
            }
          }
          if let Some(prev) = last_key.as_deref() {
            if key <= prev {
              errors.push(format!(
                "key ordering violation entering leaf {}",
                addr.display()
              ));
            }
          }
          *last_key = Some(key.to_vec());
        }
      }
      PageKind::ColVarLeaf(leaf) => {
        if leaf.start_recno < *last_recno {
          errors.push(format!(
            "column leaf {} starts behind record {}",
            addr.display(),
            *last_recno
          ));
        }
        *last_recno = leaf.last_recno();
      }
      PageKind::ColFixLeaf(leaf) => {
        let leaf = leaf.lock();
        if leaf.start_recno < *last_recno {
          errors.push(format!(
            "column leaf {} starts behind record {}",
            addr.display(),
            *last_recno
          ));
        }
        *last_recno = leaf.last_recno();
      }
      PageKind::Internal(internal) => {
        let index = internal.index();
        let entries = &index.entries;
        for (i, child) in entries.iter().enumerate() {
          let child_low = match child.key() {
            RefKey::Row(key) => Some(key.as_slice()),
            RefKey::Col(_) => None,
          };
          let child_high = entries.get(i + 1).and_then(|next| match next.key() {
            RefKey::Row(key) => Some(key.as_slice()),
            RefKey::Col(_) => None,
          });
          match child.addr() {
            Some(child_addr) => self.verify_subtree(
              btree,
              &child_addr,
              child_low,
              child_high.or(high),
              avail,
              file_size,
              last_key,
              last_recno,
              errors,
              warnings,
              depth + 1,
            ),
            None => errors.push("internal page entry without address".to_string()),
          }
        }
      }
    }
    // Pages built here never entered the cache accounting; dropping the
    // local Arc releases them
    drop(page);
  }
}
