//! Crate-wide error type.
//!
//! Grounded on odysa-roltdb's `thiserror` dependency (declared in Cargo.toml
//! but never wired up there). Callers need to match on a specific error kind
//! directly rather than recover from a type-erased `anyhow::Error`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid database file (bad magic number)")]
    Invalid,

    #[error("unsupported file format version")]
    VersionMismatch,

    #[error("meta page checksum mismatch")]
    Checksum,

    #[error("corrupt page: {0}")]
    Corruption(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database file is not open")]
    FileNotOpen,

    #[error("database is closed")]
    Closed,

    #[error("database is read-only")]
    ReadOnly,

    #[error("transaction is closed")]
    TxClosed,

    #[error("transaction is not writable")]
    TxNotWritable,

    #[error("bucket already exists")]
    BucketExists,

    #[error("bucket not found")]
    BucketNotFound,

    #[error(
        "incompatible value: key already refers to something other than a bucket (or vice versa)"
    )]
    BucketNameConflict,

    #[error("key required")]
    KeyRequired,

    #[error("key too large")]
    KeyTooLarge,

    #[error("value too large")]
    ValueTooLarge,

    #[error("key not found")]
    NotFound,

    #[error("transaction cancelled")]
    Cancelled,

    #[error("timed out waiting for database lock")]
    Timeout,
}
