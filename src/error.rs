//! Error taxonomy shared by every module — never leak a backend-specific
//! error type across the [`crate::mount::MountSource`] boundary.

use thiserror::Error;

/// Crate-wide error type.
///
/// [`RatarkitError::InvalidIndex`] is *recoverable*: the caller deletes the
/// bad index file (unless remote) and either rebuilds or tries the next
/// candidate path. [`RatarkitError::MismatchingIndex`] is *not*
/// recoverable by the caller that raised it — the index file is left
/// untouched and control returns to a factory that can try a different
/// backend.
#[derive(Error, Debug)]
pub enum RatarkitError {
    #[error("invalid index: {0}")]
    InvalidIndex(String),

    #[error("index backend mismatch: index was built by '{found}', opening as '{expected}'")]
    MismatchingIndex { found: String, expected: String },

    #[error("index not open")]
    IndexNotOpen,

    #[error("compression error: {0}")]
    Compression(String),

    #[error("invalid seek: {0}")]
    InvalidSeek(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RatarkitError>;
