//! Error types for TernDB

use thiserror::Error;

/// Sub-status carried by `TernError::Rollback`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
  /// Lost an update-chain race with another session
  WriteConflict,
  /// Eviction could not keep up with dirty data
  CacheOverflow,
  /// This transaction pins the global oldest id and the cache is stuck
  OldestForEviction,
  /// The per-operation timer fired at a yield point
  OperationTimeout,
}

impl RollbackReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::WriteConflict => "WRITE_CONFLICT",
      Self::CacheOverflow => "CACHE_OVERFLOW",
      Self::OldestForEviction => "OLDEST_FOR_EVICTION",
      Self::OperationTimeout => "OPERATION_TIMEOUT",
    }
  }
}

/// Sub-status carried by `TernError::Busy`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
  /// Another checkpoint holds the checkpoint lock
  CheckpointRunning,
  /// The object is being dropped
  DropInProgress,
  /// The data handle has open cursors
  HandleInUse,
}

impl BusyReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::CheckpointRunning => "CHECKPOINT_RUNNING",
      Self::DropInProgress => "DROP_IN_PROGRESS",
      Self::HandleInUse => "HANDLE_IN_USE",
    }
  }
}

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum TernError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("key not found")]
  NotFound,

  #[error("transaction rolled back: {}", .0.as_str())]
  Rollback(RollbackReason),

  #[error("prepared update encountered")]
  PrepareConflict,

  #[error("resource busy: {}", .0.as_str())]
  Busy(BusyReason),

  #[error("corruption detected: {0}")]
  Corruption(String),

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("object dropped: {0}")]
  ObjectDropped(String),

  #[error("object not found: {0}")]
  ObjectNotFound(String),

  #[error("object already exists: {0}")]
  ObjectExists(String),

  #[error("no space in extent list")]
  NoSpace,

  #[error("read-only")]
  ReadOnly,

  #[error("no transaction is active")]
  NoTransaction,

  #[error("a transaction is already active")]
  TransactionInProgress,

  #[error("connection lock failed: {0}")]
  LockFailed(String),

  #[error("config error: {0}")]
  Config(#[from] serde_json::Error),

  #[error("panic: engine poisoned by {0}")]
  Panic(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl TernError {
  /// Numeric code for the session last-error side channel
  pub fn code(&self) -> i32 {
    match self {
      Self::Io(_) => -1,
      Self::NotFound => -2,
      Self::Rollback(_) => -3,
      Self::PrepareConflict => -4,
      Self::Busy(_) => -5,
      Self::Corruption(_) => -6,
      Self::InvalidArgument(_) => -7,
      Self::ObjectDropped(_) => -8,
      Self::ObjectNotFound(_) => -9,
      Self::ObjectExists(_) => -10,
      Self::NoSpace => -11,
      Self::ReadOnly => -12,
      Self::NoTransaction => -13,
      Self::TransactionInProgress => -14,
      Self::LockFailed(_) => -15,
      Self::Config(_) => -16,
      Self::Panic(_) => -17,
      Self::Internal(_) => -18,
    }
  }

  /// Sub-level code, 0 when the error carries none
  pub fn sub_code(&self) -> i32 {
    match self {
      Self::Rollback(r) => match r {
        RollbackReason::WriteConflict => 1,
        RollbackReason::CacheOverflow => 2,
        RollbackReason::OldestForEviction => 3,
        RollbackReason::OperationTimeout => 4,
      },
      Self::Busy(b) => match b {
        BusyReason::CheckpointRunning => 1,
        BusyReason::DropInProgress => 2,
        BusyReason::HandleInUse => 3,
      },
      _ => 0,
    }
  }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, TernError>;
