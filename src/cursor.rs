//! Ordered traversal over one bucket's key/value pairs.
//!
//! odysa-roltdb's `Cursor` carries a `Vec<ElementRef>` stack of
//! `PageNode`-plus-index frames but never finished `search`/`next`. This
//! version keeps the stack-of-frames shape; since every page a transaction
//! touches is materialized into a `Node` (see `transaction.rs`), frames only
//! ever need to carry a node id, not a `PageNode` enum.
//!
//! Each frame's index uses `-1` as "not yet entered" so `next()`/`prev()` are
//! the same walk run forwards or backwards: stepping the top frame's index
//! by ±1, returning the entry there if it's a leaf, descending into the
//! indicated child and pushing a fresh frame if it's a branch, or popping
//! and continuing in the parent if the index has run off either end.

use crate::error::{Error, Result};
use crate::node::NodeId;
use crate::transaction::Transaction;

/// One key, and its value unless the key actually names a nested bucket (in
/// which case the value is `None` — look the bucket up by name instead).
pub type Entry = (Vec<u8>, Option<Vec<u8>>);

pub struct Cursor<'tx> {
    tx: &'tx Transaction,
    path: Vec<Vec<u8>>,
    stack: Vec<(NodeId, isize)>,
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(tx: &'tx Transaction, path: Vec<Vec<u8>>) -> Self {
        Cursor { tx, path, stack: Vec::new() }
    }

    pub fn first(&mut self) -> Result<Option<Entry>> {
        let root = self.tx.bucket_root_node(&self.path)?;
        self.stack = vec![(root, -1)];
        self.next()
    }

    pub fn last(&mut self) -> Result<Option<Entry>> {
        let root = self.tx.bucket_root_node(&self.path)?;
        let count = self.tx.node_count(root) as isize;
        self.stack = vec![(root, count)];
        self.prev()
    }

    pub fn next(&mut self) -> Result<Option<Entry>> {
        loop {
            let Some(&(node, idx)) = self.stack.last() else { return Ok(None) };
            let count = self.tx.node_count(node) as isize;
            let new_idx = idx + 1;
            if new_idx >= count {
                self.stack.pop();
                if self.stack.is_empty() {
                    return Ok(None);
                }
                continue;
            }
            self.stack.last_mut().unwrap().1 = new_idx;
            if self.tx.node_is_leaf(node) {
                let (key, value, is_bucket) = self.tx.node_leaf_entry(node, new_idx as usize);
                return Ok(Some((key, if is_bucket { None } else { value })));
            }
            let child = self.tx.materialize_child(node, new_idx as usize)?;
            self.stack.push((child, -1));
        }
    }

    pub fn prev(&mut self) -> Result<Option<Entry>> {
        loop {
            let Some(&(node, idx)) = self.stack.last() else { return Ok(None) };
            let new_idx = idx - 1;
            if new_idx < 0 {
                self.stack.pop();
                if self.stack.is_empty() {
                    return Ok(None);
                }
                continue;
            }
            self.stack.last_mut().unwrap().1 = new_idx;
            if self.tx.node_is_leaf(node) {
                let (key, value, is_bucket) = self.tx.node_leaf_entry(node, new_idx as usize);
                return Ok(Some((key, if is_bucket { None } else { value })));
            }
            let child = self.tx.materialize_child(node, new_idx as usize)?;
            let count = self.tx.node_count(child) as isize;
            self.stack.push((child, count));
        }
    }

    /// Positions the cursor at the first key greater than or equal to
    /// `target`, returning it (or `None` if `target` is past every key).
    pub fn seek(&mut self, target: &[u8]) -> Result<Option<Entry>> {
        let root = self.tx.bucket_root_node(&self.path)?;
        self.stack.clear();
        let mut node = root;
        loop {
            if self.tx.node_is_leaf(node) {
                let idx = self.tx.leaf_seek_index(node, target);
                self.stack.push((node, idx as isize - 1));
                break;
            }
            let idx = self.tx.branch_seek_index(node, target);
            self.stack.push((node, idx as isize));
            node = self.tx.materialize_child(node, idx)?;
        }
        self.next()
    }

    /// Removes the entry the cursor is currently positioned on.
    pub fn delete(&mut self) -> Result<()> {
        let &(node, idx) = self.stack.last().ok_or(Error::NotFound)?;
        if idx < 0 || !self.tx.node_is_leaf(node) {
            return Err(Error::NotFound);
        }
        self.tx.delete_at(node, idx as usize)?;
        self.stack.last_mut().unwrap().1 = idx - 1;
        Ok(())
    }
}
