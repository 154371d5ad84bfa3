//! # ratarkit — seekable archive indexing core
//!
//! Builds a persistent SQLite metadata index over TAR archives (and thin
//! sibling container formats) and single-stream compressed files, so that
//! after one linear scan, opening any member is an O(log N) lookup plus
//! bounded I/O rather than a re-scan from the start of the stream.
//!
//! Guarantees:
//! - The index schema (`index::schema::SCHEMA_VERSION`) is versioned;
//!   opening an index built by an incompatible version is rejected, not
//!   silently reinterpreted.
//! - An index left in the `Building` state (temp tables still present) is
//!   never treated as valid — it is deleted and rebuilt on next open.
//! - `MismatchingIndex` (a different backend's index) is never deleted by
//!   the backend that rejected it; ownership of that decision belongs to
//!   the caller.
//! - No archive writes. No streaming-only mode. No cross-backend index
//!   portability.

pub mod blob;
pub mod compress;
pub mod error;
pub mod index;
pub mod model;
pub mod mount;
pub mod probe;
pub mod stencil;
pub mod tarindex;
pub mod util;

pub use error::{RatarkitError, Result};
pub use model::FileEntry;

/// Soft cap on a single in-memory buffer before [`blob::WriteSqliteBlobs`]
/// flushes it as a row (§6.4).
pub const MAX_BLOB_SIZE: u64 = 256 * 1024 * 1024;

/// Capacity of the parent-directory dedup LRU used while building the
/// index, and the size it's trimmed back to on eviction (§6.4).
pub const PARENT_LRU_SIZE: usize = 16;
pub const PARENT_LRU_RESET_TO: usize = 8;
