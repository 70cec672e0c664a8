//! Global timestamp management
//!
//! `oldest <= stable` always holds; updates older than `oldest` may be
//! discarded by reconciliation and recovery restores to `stable`. Updates
//! take a single writer lock; readers use plain atomic loads.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::constants::TS_NONE;
use crate::error::{Result, TernError};
use crate::types::Timestamp;

#[derive(Default)]
pub struct GlobalTimestamps {
  oldest_ts: AtomicU64,
  stable_ts: AtomicU64,
  /// Oldest read timestamp pinned by an active reader
  pinned_ts: AtomicU64,
  write_lock: Mutex<()>,
}

impl GlobalTimestamps {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn oldest(&self) -> Timestamp {
    self.oldest_ts.load(Ordering::Relaxed)
  }

  pub fn stable(&self) -> Timestamp {
    self.stable_ts.load(Ordering::Relaxed)
  }

  pub fn pinned(&self) -> Timestamp {
    self.pinned_ts.load(Ordering::Relaxed)
  }

  /// Oldest timestamp any component may rely on: the older of `oldest` and
  /// any pinned reader
  pub fn pinned_or_oldest(&self) -> Timestamp {
    let pinned = self.pinned();
    let oldest = self.oldest();
    if pinned != TS_NONE && pinned < oldest {
      pinned
    } else {
      oldest
    }
  }

  /// Move `oldest` and/or `stable` forward; both are monotonic and
  /// `oldest <= stable` is enforced
  pub fn set(&self, oldest: Option<Timestamp>, stable: Option<Timestamp>) -> Result<()> {
    let _guard = self.write_lock.lock();
    let new_oldest = oldest.unwrap_or_else(|| self.oldest());
    let new_stable = stable.unwrap_or_else(|| self.stable());
    if new_stable != TS_NONE && new_oldest > new_stable {
      return Err(TernError::InvalidArgument(format!(
        "oldest timestamp {new_oldest} newer than stable {new_stable}"
      )));
    }
    if let Some(ts) = oldest {
      if ts < self.oldest() {
        return Err(TernError::InvalidArgument(
          "oldest timestamp may not move backwards".to_string(),
        ));
      }
      self.oldest_ts.store(ts, Ordering::Relaxed);
    }
    if let Some(ts) = stable {
      if ts < self.stable() {
        return Err(TernError::InvalidArgument(
          "stable timestamp may not move backwards".to_string(),
        ));
      }
      self.stable_ts.store(ts, Ordering::Relaxed);
    }
    Ok(())
  }

  pub(crate) fn set_pinned(&self, ts: Timestamp) {
    self.pinned_ts.store(ts, Ordering::Relaxed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ordering_is_enforced() {
    let ts = GlobalTimestamps::new();
    ts.set(None, Some(100)).unwrap();
    ts.set(Some(50), None).unwrap();
    assert!(ts.set(Some(200), None).is_err()); // oldest > stable
    assert!(ts.set(Some(40), None).is_err()); // backwards
    ts.set(Some(100), Some(150)).unwrap();
    assert_eq!(ts.oldest(), 100);
    assert_eq!(ts.stable(), 150);
  }

  #[test]
  fn pinned_caps_oldest() {
    let ts = GlobalTimestamps::new();
    ts.set(Some(10), Some(100)).unwrap();
    assert_eq!(ts.pinned_or_oldest(), 10);
    ts.set_pinned(5);
    assert_eq!(ts.pinned_or_oldest(), 5);
    ts.set_pinned(50);
    assert_eq!(ts.pinned_or_oldest(), 10);
  }
}
