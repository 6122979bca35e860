//! An embedded, single-file, transactional key/value store built around a
//! copy-on-write B+tree, shadow-paged meta pages and an MVCC reader/writer
//! model: unlimited concurrent read-only transactions plus one writer at a
//! time, never blocking each other.

mod bucket;
mod cursor;
mod data;
mod db;
mod error;
mod free_list;
mod inode;
mod meta;
mod node;
mod page;
mod transaction;
mod utils;

pub use bucket::Bucket;
pub use cursor::{Cursor, Entry};
pub use data::{BucketStats, Stats};
pub use db::{Database, Options};
pub use error::{Error, Result};
pub use transaction::Transaction;
pub use utils::CancellationToken;
