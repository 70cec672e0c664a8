//! Magic numbers and constants for TernDB

use crate::types::{Timestamp, TxnId};

// ============================================================================
// Magic bytes
// ============================================================================

/// Magic bytes for data files: "TernDB format 1\0" (16 bytes)
pub const MAGIC_TERNDB: [u8; 16] = [
  0x54, 0x65, 0x72, 0x6e, 0x44, 0x42, 0x20, 0x66, // "TernDB f"
  0x6f, 0x72, 0x6d, 0x61, 0x74, 0x20, 0x31, 0x00, // "ormat 1\0"
];

/// First line of the turtle bootstrap file
pub const TURTLE_HEADER: &str = "TernDB turtle";

// ============================================================================
// Current versions
// ============================================================================

pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Oldest file major version this build can read
pub const MIN_READER_MAJOR: u16 = 1;

// ============================================================================
// File layout
// ============================================================================

/// Default allocation unit (matches OS pages and SSD blocks)
pub const DEFAULT_ALLOCATION_SIZE: usize = 4096;

/// Minimum allocation unit
pub const MIN_ALLOCATION_SIZE: usize = 512;

/// Maximum allocation unit (128KB)
pub const MAX_ALLOCATION_SIZE: usize = 128 * 1024;

/// Size of the block header prefix on every block
pub const BLOCK_HEADER_SIZE: usize = 12;

/// Size of the file-description block at offset 0 (one allocation unit)
pub const DESC_SECTOR_SIZE: usize = 512;

/// Invalid file offset sentinel
pub const OFFSET_INVALID: u64 = 0;

// ============================================================================
// Page limits
// ============================================================================

/// Default maximum leaf page image size
pub const DEFAULT_LEAF_PAGE_MAX: usize = 32 * 1024;

/// Default maximum internal page image size
pub const DEFAULT_INTERNAL_PAGE_MAX: usize = 16 * 1024;

/// Default maximum in-line value size; larger values go to overflow blocks
pub const DEFAULT_LEAF_VALUE_MAX: usize = 8 * 1024;

/// Reconciliation split point as a percentage of the page maximum
pub const DEFAULT_SPLIT_PCT: usize = 90;

/// Single-chunk images below this fraction of leaf_page_max flag the parent
/// for merge consideration
pub const MERGE_THRESHOLD_PCT: usize = 10;

// ============================================================================
// Cache defaults
// ============================================================================

/// Default cache size (64MB)
pub const DEFAULT_CACHE_MAX: u64 = 64 * 1024 * 1024;

/// Start evicting when in-memory bytes exceed this percentage of the cache
pub const CACHE_EVICT_TRIGGER_PCT: u64 = 95;

/// Evict down to this percentage of the cache
pub const CACHE_EVICT_TARGET_PCT: u64 = 80;

/// Dirty-byte percentage that biases eviction toward dirty pages
pub const CACHE_DIRTY_TRIGGER_PCT: u64 = 20;

/// Maximum time a cursor spin-waits on a full cache before rolling back
pub const DEFAULT_CACHE_MAX_WAIT_US: u64 = 2_000_000;

/// Reconcile a page once its in-memory delta exceeds this fraction of its
/// disk image (keeps update chains short)
pub const DELTA_RECONCILE_PCT: usize = 50;

// ============================================================================
// Skiplists
// ============================================================================

/// Maximum skiplist depth for extent lists and insert lists
pub const SKIP_MAXDEPTH: usize = 10;

/// 1-in-4 chance of promoting a skiplist node one level
pub const SKIP_PROBABILITY: u32 = 4;

// ============================================================================
// Hazard references
// ============================================================================

/// Hazard slots per session
pub const HAZARD_SLOTS: usize = 32;

// ============================================================================
// Reserved transaction ids and timestamps
// ============================================================================

/// No transaction id
pub const TXN_NONE: TxnId = 0;

/// First assignable transaction id
pub const TXN_FIRST: TxnId = 1;

/// Reserved id marking an aborted update; readers skip it
pub const TXN_ABORTED: TxnId = u64::MAX;

/// Largest assignable transaction id
pub const TXN_MAX: TxnId = u64::MAX - 1;

/// No timestamp
pub const TS_NONE: Timestamp = 0;

/// Maximum timestamp; a stop time of TS_MAX means "still live"
pub const TS_MAX: Timestamp = u64::MAX;

// ============================================================================
// Reserved object names
// ============================================================================

/// Metadata table file name
pub const METADATA_FILE: &str = "tern.meta";

/// Metadata table URI
pub const METADATA_URI: &str = "file:tern.meta";

/// Turtle bootstrap file name
pub const TURTLE_FILE: &str = "tern.turtle";

/// Temporary turtle file written before the atomic rename
pub const TURTLE_FILE_TMP: &str = "tern.turtle.set";

/// History store file name
pub const HS_FILE: &str = "tern.hs";

/// History store URI
pub const HS_URI: &str = "file:tern.hs";

/// Home-directory lock file name
pub const LOCK_FILE: &str = "tern.lock";

// ============================================================================
// Initial ids (0 is reserved/null)
// ============================================================================

pub const INITIAL_BTREE_ID: u32 = 1;

/// Btree id reserved for the metadata table
pub const METADATA_BTREE_ID: u32 = 0;
