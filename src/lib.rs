//! TernDB - Embeddable transactional key/value storage engine
//!
//! # Architecture
//!
//! TernDB stores ordered tables in per-table files managed by a
//! **block manager + B-tree + MVCC** core:
//!
//! - **Block manager**: aligned, checksummed block I/O over skiplist-backed
//!   extent lists; free space is itself checkpointed into the file
//! - **B-tree**: row and column stores, cursor-oriented access, in-memory
//!   update chains reconciled back into block images
//! - **MVCC**: snapshot isolation with commit/durable/stable/oldest
//!   timestamps and a history store for older versions
//! - **Checkpoints**: durable point-in-time images; the metadata table and
//!   turtle file bootstrap recovery
//!
//! # Features
//!
//! - Snapshot-isolated transactions with prepare/commit timestamps
//! - Hazard-reference based eviction with cursor assist
//! - Pluggable block compression (deflate built in)
//! - Verify and salvage passes for damaged files

#![deny(clippy::all)]

// Core modules
pub mod config;
pub mod constants;
pub mod error;
pub mod types;
pub mod util;

// Storage layer
pub mod block;
pub mod fh;
pub mod page;

// Tree and transaction layers
pub mod btree;
pub mod mvcc;
pub mod recon;

// Cache management
pub mod evict;

// Catalog and engine surface
pub mod engine;
pub mod meta;

// Re-export commonly used items
pub use config::{EngineOptions, KeyFormat, TableOptions};
pub use engine::session::{Cursor, LastError, Session};
pub use engine::Engine;
pub use error::{BusyReason, Result, RollbackReason, TernError};
pub use mvcc::Isolation;
pub use types::{ModifyOp, Timestamp};
