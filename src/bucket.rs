//! A public handle onto one bucket's keyspace.
//!
//! odysa-roltdb's `Bucket` owned an `Rc<RefCell<..>>`-reachable node cache and
//! a `buckets: HashMap<String, Bucket>` of nested children living alongside
//! it. This version keeps the same "a bucket is named children plus a node
//! tree" shape, but the state lives on the `Transaction` (see
//! `transaction::BucketState`) and a `Bucket` is just a path into it — cheap
//! to construct, cheap to hand back from `Transaction::bucket`.

use crate::cursor::Cursor;
use crate::data::BucketStats;
use crate::error::Result;
use crate::transaction::Transaction;

/// A named collection of key/value pairs (and, recursively, of nested
/// buckets) within one transaction.
#[derive(Clone)]
pub struct Bucket<'tx> {
    tx: &'tx Transaction,
    path: Vec<Vec<u8>>,
}

impl<'tx> Bucket<'tx> {
    pub(crate) fn at(tx: &'tx Transaction, path: Vec<Vec<u8>>) -> Self {
        Bucket { tx, path }
    }

    fn child_path(&self, name: &[u8]) -> Vec<Vec<u8>> {
        let mut p = self.path.clone();
        p.push(name.to_vec());
        p
    }

    pub fn tx(&self) -> &'tx Transaction {
        self.tx
    }

    /// Looks up `key` in this bucket. Returns `None` if absent, or if `key`
    /// currently names a nested bucket instead of a value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.get_impl(&self.path, key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.put_impl(&self.path, key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.delete_impl(&self.path, key)
    }

    /// Opens an existing nested bucket.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        let path = self.child_path(name);
        self.tx.with_bucket_state(&path, |_, _| Ok(()))?;
        Ok(Bucket::at(self.tx, path))
    }

    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.tx.create_bucket_impl(&self.path, name, false)?;
        Ok(Bucket::at(self.tx, self.child_path(name)))
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.tx.create_bucket_impl(&self.path, name, true)?;
        Ok(Bucket::at(self.tx, self.child_path(name)))
    }

    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.tx.delete_bucket_impl(&self.path, name)
    }

    pub fn cursor(&self) -> Cursor<'tx> {
        Cursor::new(self.tx, self.path.clone())
    }

    pub fn stats(&self) -> Result<BucketStats> {
        self.tx.bucket_stats(&self.path)
    }

    /// Increments and returns this bucket's persisted sequence counter.
    /// Writable transactions only.
    pub fn next_sequence(&self) -> Result<u64> {
        self.tx.next_sequence_impl(&self.path)
    }

    /// Overwrites this bucket's persisted sequence counter. Writable
    /// transactions only.
    pub fn set_sequence(&self, value: u64) -> Result<()> {
        self.tx.set_sequence_impl(&self.path, value)
    }

    /// Calls `f` with every key/value pair directly in this bucket, in key
    /// order. `value` is `None` for entries that are themselves nested
    /// buckets.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], Option<&[u8]>) -> Result<()>) -> Result<()> {
        let mut cursor = self.cursor();
        let mut item = cursor.first()?;
        while let Some((key, value)) = item {
            f(&key, value.as_deref())?;
            item = cursor.next()?;
        }
        Ok(())
    }
}
