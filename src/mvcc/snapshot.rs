//! Transaction snapshots
//!
//! A snapshot is the classic `{min, max, concurrent-set}` triple: ids below
//! `min` are settled, ids at or above `max` had not started, and ids in the
//! set were in flight when the snapshot was taken. A read transaction's
//! snapshot is fixed at first use.

use crate::types::TxnId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
  /// Smallest id still running when the snapshot was taken
  pub min_id: TxnId,
  /// All ids >= max were not started
  pub max_id: TxnId,
  /// Ids in [min, max) that were in flight, sorted
  pub concurrent: Vec<TxnId>,
}

impl Snapshot {
  /// A snapshot that sees everything below `max`
  pub fn all_before(max_id: TxnId) -> Self {
    Self {
      min_id: max_id,
      max_id,
      concurrent: Vec::new(),
    }
  }

  /// Is a committed update by `id` visible to this snapshot?
  pub fn sees(&self, id: TxnId) -> bool {
    if id >= self.max_id {
      return false;
    }
    if id < self.min_id {
      return true;
    }
    self.concurrent.binary_search(&id).is_err()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_boundaries() {
    let snap = Snapshot {
      min_id: 5,
      max_id: 10,
      concurrent: vec![6, 8],
    };
    assert!(snap.sees(4));
    assert!(snap.sees(5));
    assert!(!snap.sees(6)); // in flight
    assert!(snap.sees(7));
    assert!(!snap.sees(8)); // in flight
    assert!(snap.sees(9));
    assert!(!snap.sees(10)); // not started
    assert!(!snap.sees(11));
  }
}
