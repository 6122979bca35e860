//! In-memory, mutable image of a B+tree node.
//!
//! odysa-roltdb represents this with `Rc<RefCell<..>>` parent/child links and
//! raw-pointer page views. This version holds no self-references at all: a
//! `Node` is plain data, and the owning arena (a `Vec<Node>` indexed by
//! `usize`) lives on the `Transaction` in `transaction.rs`, which also
//! implements the commit-time split/spill/rebalance algorithms that need to
//! allocate pages and read siblings. That keeps this module free of unsafe
//! code and borrow-checker fights over cyclic ownership.

use crate::inode::Inode;
use crate::page::{self, PageEntry, PageId, PageView, BRANCH_ELEM_SIZE, LEAF_ELEM_SIZE, PAGE_HEADER_SIZE};

/// Index into a transaction's node arena.
pub(crate) type NodeId = usize;

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) is_leaf: bool,
    /// Pgid this node currently occupies on disk, or 0 if it has never been
    /// written (a brand-new node created this transaction).
    pub(crate) pgid: PageId,
    pub(crate) parent: Option<NodeId>,
    /// Children materialized into the arena so far (not necessarily all of
    /// this node's children — untouched siblings are never materialized).
    pub(crate) children: Vec<NodeId>,
    pub(crate) inodes: Vec<Inode>,
    pub(crate) unbalanced: bool,
    /// Number of overflow pages the on-disk page this node was read from
    /// occupied beyond its first page, or 0 for a node that has never been
    /// written. Lets the writer free the right run of pages at commit time
    /// without re-reading the original page.
    pub(crate) orig_overflow: u32,
}

impl Node {
    pub(crate) fn new_leaf() -> Self {
        Node {
            is_leaf: true,
            pgid: 0,
            parent: None,
            children: Vec::new(),
            inodes: Vec::new(),
            unbalanced: false,
            orig_overflow: 0,
        }
    }

    pub(crate) fn new_branch() -> Self {
        Node {
            is_leaf: false,
            ..Node::new_leaf()
        }
    }

    pub(crate) fn from_page(view: PageView) -> crate::error::Result<Self> {
        let is_leaf = view.is_leaf();
        let mut inodes = Vec::with_capacity(view.count());
        for i in 0..view.count() {
            if is_leaf {
                let (flags, key, value) = view.leaf_element(i)?;
                inodes.push(Inode::leaf(key.to_vec(), value.to_vec(), flags));
            } else {
                let (key, pgid) = view.branch_element(i)?;
                inodes.push(Inode::branch(key.to_vec(), pgid));
            }
        }
        Ok(Node {
            is_leaf,
            pgid: view.id(),
            parent: None,
            children: Vec::new(),
            inodes,
            unbalanced: false,
            orig_overflow: view.overflow(),
        })
    }

    pub(crate) fn first_key(&self) -> Option<Vec<u8>> {
        self.inodes.first().map(|i| i.key().to_vec())
    }

    fn elem_size(&self) -> usize {
        if self.is_leaf { LEAF_ELEM_SIZE } else { BRANCH_ELEM_SIZE }
    }

    /// Serialized size this node would occupy as a single page, ignoring
    /// page-size splitting.
    pub(crate) fn size(&self) -> usize {
        let elem = self.elem_size();
        let mut size = PAGE_HEADER_SIZE;
        for inode in &self.inodes {
            size += elem + inode.size();
        }
        size
    }

    /// Serialized size of just `self.inodes[..n]`.
    pub(crate) fn size_through(&self, n: usize) -> usize {
        let elem = self.elem_size();
        let mut size = PAGE_HEADER_SIZE;
        for inode in &self.inodes[..n] {
            size += elem + inode.size();
        }
        size
    }

    /// Inserts or replaces (by `old_key`) a leaf entry.
    pub(crate) fn put_leaf(&mut self, old_key: &[u8], new_key: &[u8], value: Vec<u8>, flags: u32) {
        debug_assert!(self.is_leaf);
        match self.inodes.binary_search_by(|i| i.key().cmp(old_key)) {
            Ok(idx) => {
                let inode = Inode::leaf(new_key.to_vec(), value, flags);
                self.inodes[idx] = inode;
            }
            Err(idx) => {
                self.inodes.insert(idx, Inode::leaf(new_key.to_vec(), value, flags));
            }
        }
    }

    /// Inserts or replaces (by `old_key`) a branch entry pointing at `pgid`.
    pub(crate) fn put_branch(&mut self, old_key: &[u8], new_key: &[u8], pgid: PageId) {
        debug_assert!(!self.is_leaf);
        match self.inodes.binary_search_by(|i| i.key().cmp(old_key)) {
            Ok(idx) => {
                self.inodes[idx].set_key(new_key.to_vec());
                self.inodes[idx].set_pgid(pgid);
            }
            Err(idx) => {
                self.inodes.insert(idx, Inode::branch(new_key.to_vec(), pgid));
            }
        }
    }

    pub(crate) fn del(&mut self, key: &[u8]) -> bool {
        match self.inodes.binary_search_by(|i| i.key().cmp(key)) {
            Ok(idx) => {
                self.inodes.remove(idx);
                self.unbalanced = true;
                true
            }
            Err(_) => false,
        }
    }

    /// Removes the branch entry that still points at `old_child_pgid`
    /// (called after a child node has moved to a new pgid, or split into
    /// several), returning its index if found.
    pub(crate) fn remove_child_by_pgid(&mut self, old_child_pgid: PageId) -> Option<usize> {
        let idx = self.inodes.iter().position(|i| i.pgid() == old_child_pgid)?;
        self.inodes.remove(idx);
        Some(idx)
    }

    pub(crate) fn insert_branch_at(&mut self, idx: usize, key: Vec<u8>, pgid: PageId) {
        self.inodes.insert(idx, Inode::branch(key, pgid));
    }

    fn to_page_entries(&self) -> Vec<PageEntry<'_>> {
        self.inodes
            .iter()
            .map(|i| PageEntry {
                flags: i.flags(),
                key: i.key(),
                value: i.value().unwrap_or(&[]),
                pgid: i.pgid(),
            })
            .collect()
    }

    pub(crate) fn encode(&self, id: PageId, page_size: usize) -> Vec<u8> {
        let entries = self.to_page_entries();
        if self.is_leaf {
            page::encode_leaf_page(id, page_size, &entries)
        } else {
            page::encode_branch_page(id, page_size, &entries)
        }
    }

    /// Encodes this node packed tight with no trailing padding, for inline
    /// bucket storage.
    pub(crate) fn encode_inline(&self) -> Vec<u8> {
        let entries = self.to_page_entries();
        let total = page::leaf_page_size(&entries);
        page::encode_leaf_page(0, total, &entries)
    }
}
