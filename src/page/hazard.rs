//! Hazard references
//!
//! Each session owns a fixed array of hazard slots. Before dereferencing a
//! page the reader stores the `Ref` address into a free slot; eviction scans
//! every registered table under an acquire fence and refuses to remove any
//! page whose ref appears. Acquisition must precede the first dereference
//! and release is mandatory when the cursor moves off the page.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::HAZARD_SLOTS;
use crate::error::{Result, TernError};

use super::refs::Ref;

pub struct HazardTable {
  slots: [AtomicUsize; HAZARD_SLOTS],
}

impl Default for HazardTable {
  fn default() -> Self {
    Self::new()
  }
}

impl HazardTable {
  pub fn new() -> Self {
    Self {
      slots: std::array::from_fn(|_| AtomicUsize::new(0)),
    }
  }

  /// Pin `r`; returns the slot for release
  pub fn acquire(&self, r: &Arc<Ref>) -> Result<usize> {
    let address = Arc::as_ptr(r) as usize;
    for (slot, entry) in self.slots.iter().enumerate() {
      if entry
        .compare_exchange(0, address, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
      {
        return Ok(slot);
      }
    }
    Err(TernError::Internal(
      "session hazard table is full".to_string(),
    ))
  }

  pub fn release(&self, slot: usize) {
    self.slots[slot].store(0, Ordering::Release);
  }

  fn pins(&self, address: usize) -> bool {
    self
      .slots
      .iter()
      .any(|entry| entry.load(Ordering::Acquire) == address)
  }
}

/// All sessions' hazard tables; eviction scans it
#[derive(Default)]
pub struct HazardRegistry {
  tables: RwLock<Vec<Arc<HazardTable>>>,
}

impl HazardRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self) -> Arc<HazardTable> {
    let table = Arc::new(HazardTable::new());
    self.tables.write().push(Arc::clone(&table));
    table
  }

  pub fn unregister(&self, table: &Arc<HazardTable>) {
    self
      .tables
      .write()
      .retain(|t| !Arc::ptr_eq(t, table));
  }

  /// True if any session holds a hazard reference on `r`
  pub fn pinned(&self, r: &Arc<Ref>) -> bool {
    let address = Arc::as_ptr(r) as usize;
    self.tables.read().iter().any(|table| table.pins(address))
  }
}
