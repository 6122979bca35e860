//! A single view of the database, read-only or writable.
//!
//! odysa-roltdb's `ITransaction` keeps a flat `HashMap<PageId, VPage>` of
//! dirty pages and leans on `Rc<RefCell<Bucket>>` cycles to let a bucket
//! reach back to its owning transaction. This version keeps that
//! "pages touched this transaction live in a side table" idea, but the side
//! table is the node arena from `node.rs`: every page this transaction reads
//! is decoded once into a `Node` and cached by pgid in `node_cache`, and all
//! mutation happens against that arena. Nothing here holds a `Rc` back to
//! itself; a `Bucket` is just a transaction reference plus a path of bucket
//! names, re-resolved against the arena on every call.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use log::{trace, warn};
use memmap2::Mmap;

use crate::bucket::Bucket;
use crate::data::BucketStats;
use crate::db::{Database, ReaderGuard, WriterGuard};
use crate::error::{Error, Result};
use crate::free_list::{FreeList, TxId};
use crate::inode::Inode;
use crate::meta::Meta;
use crate::node::{Node, NodeId};
use crate::page::{self, BucketHeader, PageId, PageView};
use crate::utils::CancellationToken;

pub const MAX_KEY_SIZE: usize = 32 * 1024;
pub const MAX_VALUE_SIZE: usize = (1usize << 31) - 2;

/// State the transaction keeps for one open bucket: the header as of the
/// last commit it saw, plus whatever this transaction has materialized.
pub(crate) struct BucketState {
    pub(crate) header: BucketHeader,
    pub(crate) root: Option<NodeId>,
    pub(crate) inline_payload: Option<Vec<u8>>,
    pub(crate) children: HashMap<Vec<u8>, BucketState>,
}

impl BucketState {
    fn from_header(header: BucketHeader) -> Self {
        BucketState { header, root: None, inline_payload: None, children: HashMap::new() }
    }
}

fn encode_bucket_value(state: &BucketState) -> Vec<u8> {
    let mut v = state.header.encode().to_vec();
    if let Some(inline) = &state.inline_payload {
        v.extend_from_slice(inline);
    }
    v
}

pub struct Transaction {
    db: Database,
    writable: bool,
    txid: TxId,
    meta: Meta,
    mmap: Arc<Mmap>,
    page_size: usize,
    freelist: RefCell<FreeList>,
    arena: RefCell<Vec<Node>>,
    node_cache: RefCell<HashMap<PageId, NodeId>>,
    next_pgid: Cell<PageId>,
    root: RefCell<BucketState>,
    cancel: Option<CancellationToken>,
    _reader_guard: ReaderGuard,
    _writer_guard: Option<WriterGuard>,
}

impl Transaction {
    pub(crate) fn new(
        db: Database,
        writable: bool,
        txid: TxId,
        meta: Meta,
        mmap: Arc<Mmap>,
        freelist: FreeList,
        reader_guard: ReaderGuard,
        writer_guard: Option<WriterGuard>,
        cancel: Option<CancellationToken>,
    ) -> Self {
        let page_size = db.page_size();
        let next_pgid = meta.pgid;
        Transaction {
            db,
            writable,
            txid,
            meta,
            mmap,
            page_size,
            freelist: RefCell::new(freelist),
            arena: RefCell::new(Vec::new()),
            node_cache: RefCell::new(HashMap::new()),
            next_pgid: Cell::new(next_pgid),
            root: RefCell::new(BucketState::from_header(meta.root)),
            cancel,
            _reader_guard: reader_guard,
            _writer_guard: writer_guard,
        }
    }

    pub fn id(&self) -> TxId {
        self.txid
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Top-level bucket, representing the whole keyspace.
    pub fn root_bucket(&self) -> Bucket<'_> {
        Bucket::at(self, Vec::new())
    }

    pub fn bucket<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.root_bucket().bucket(name)
    }

    pub fn create_bucket<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.root_bucket().create_bucket(name)
    }

    pub fn create_bucket_if_not_exists<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.root_bucket().create_bucket_if_not_exists(name)
    }

    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.root_bucket().delete_bucket(name)
    }

    // -- page / node plumbing -------------------------------------------------

    pub(crate) fn page_view(&self, pgid: PageId) -> Result<PageView<'_>> {
        let offset = pgid as usize * self.page_size;
        let header = self
            .mmap
            .get(offset..offset + page::PAGE_HEADER_SIZE)
            .ok_or_else(|| Error::Corruption("page header out of bounds".into()))?;
        let overflow = page::read_u32(header, 12) as usize;
        let len = self.page_size * (1 + overflow);
        let slice = self
            .mmap
            .get(offset..offset + len)
            .ok_or_else(|| Error::Corruption("page body out of bounds".into()))?;
        Ok(PageView::new(slice))
    }

    fn push_node(&self, node: Node) -> NodeId {
        let mut arena = self.arena.borrow_mut();
        arena.push(node);
        arena.len() - 1
    }

    /// Materializes the page at `pgid` into the arena, caching by pgid so a
    /// page visited twice in one transaction shares a single `Node`, and
    /// records the link in `parent`'s materialized-children list so commit's
    /// spill pass knows to recurse into it.
    pub(crate) fn materialize_page(&self, pgid: PageId, parent: Option<NodeId>) -> Result<NodeId> {
        if let Some(&id) = self.node_cache.borrow().get(&pgid) {
            return Ok(id);
        }
        let view = self.page_view(pgid)?;
        let mut node = Node::from_page(view)?;
        node.parent = parent;
        let id = self.push_node(node);
        self.node_cache.borrow_mut().insert(pgid, id);
        if let Some(p) = parent {
            self.arena.borrow_mut()[p].children.push(id);
        }
        Ok(id)
    }

    fn ensure_root(&self, state: &mut BucketState) -> Result<NodeId> {
        if let Some(id) = state.root {
            return Ok(id);
        }
        let id = if let Some(inline) = state.inline_payload.take() {
            let view = PageView::new(&inline);
            let mut node = Node::from_page(view)?;
            node.parent = None;
            self.push_node(node)
        } else if state.header.root == 0 {
            self.push_node(Node::new_leaf())
        } else {
            self.materialize_page(state.header.root, None)?
        };
        state.root = Some(id);
        Ok(id)
    }

    fn branch_index_for(node: &Node, key: &[u8]) -> usize {
        match node.inodes.binary_search_by(|i| i.key().cmp(key)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    /// Descends from `node_id` (the bucket's root, or any node) to the leaf
    /// that would hold `key`, materializing branch children on the way.
    pub(crate) fn descend_to_leaf(&self, mut node_id: NodeId, key: &[u8]) -> Result<NodeId> {
        loop {
            let next = {
                let arena = self.arena.borrow();
                let node = &arena[node_id];
                if node.is_leaf {
                    None
                } else if node.inodes.is_empty() {
                    return Err(Error::Corruption("empty branch node".into()));
                } else {
                    let idx = Self::branch_index_for(node, key);
                    Some(node.inodes[idx].pgid())
                }
            };
            match next {
                None => return Ok(node_id),
                Some(child_pgid) => {
                    node_id = self.materialize_page(child_pgid, Some(node_id))?;
                }
            }
        }
    }

    fn find(&self, root_id: NodeId, key: &[u8]) -> Result<(NodeId, Option<usize>)> {
        let leaf_id = self.descend_to_leaf(root_id, key)?;
        let idx = {
            let arena = self.arena.borrow();
            arena[leaf_id].inodes.binary_search_by(|i| i.key().cmp(key)).ok()
        };
        Ok((leaf_id, idx))
    }

    /// Opens (materializing from the parent's leaf entry if needed) the
    /// nested bucket named `key` under `parent`, without yet touching its
    /// own root node.
    fn open_child_bucket(&self, parent: &mut BucketState, key: &[u8]) -> Result<()> {
        if parent.children.contains_key(key) {
            return Ok(());
        }
        let root_id = self.ensure_root(parent)?;
        let (leaf_id, idx) = self.find(root_id, key)?;
        let idx = idx.ok_or(Error::BucketNotFound)?;
        let (is_bucket, value) = {
            let arena = self.arena.borrow();
            let inode = &arena[leaf_id].inodes[idx];
            (inode.is_bucket(), inode.value().unwrap_or(&[]).to_vec())
        };
        if !is_bucket {
            return Err(Error::BucketNameConflict);
        }
        if value.len() < page::BUCKET_HEADER_SIZE {
            return Err(Error::Corruption("truncated bucket header".into()));
        }
        let header = BucketHeader::decode(&value[..page::BUCKET_HEADER_SIZE])?;
        let mut state = BucketState::from_header(header);
        if header.root == 0 && value.len() > page::BUCKET_HEADER_SIZE {
            state.inline_payload = Some(value[page::BUCKET_HEADER_SIZE..].to_vec());
        }
        parent.children.insert(key.to_vec(), state);
        Ok(())
    }

    /// Resolves `path` (a sequence of bucket names from the database root)
    /// into a materialized `BucketState`, opening any not-yet-touched
    /// segment along the way, then runs `f` against it.
    pub(crate) fn with_bucket_state<R>(
        &self,
        path: &[Vec<u8>],
        f: impl FnOnce(&Transaction, &mut BucketState) -> Result<R>,
    ) -> Result<R> {
        let mut root = self.root.borrow_mut();
        self.with_bucket_state_rec(&mut root, path, f)
    }

    fn with_bucket_state_rec<R>(
        &self,
        state: &mut BucketState,
        path: &[Vec<u8>],
        f: impl FnOnce(&Transaction, &mut BucketState) -> Result<R>,
    ) -> Result<R> {
        match path.split_first() {
            None => f(self, state),
            Some((seg, rest)) => {
                self.open_child_bucket(state, seg)?;
                let child = state.children.get_mut(seg).expect("just opened");
                self.with_bucket_state_rec(child, rest, f)
            }
        }
    }

    // -- key/value operations --------------------------------------------------

    pub(crate) fn get_impl(&self, path: &[Vec<u8>], key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_bucket_state(path, |tx, state| {
            let root_id = tx.ensure_root(state)?;
            let (leaf_id, idx) = tx.find(root_id, key)?;
            match idx {
                None => Ok(None),
                Some(i) => {
                    let arena = tx.arena.borrow();
                    let inode = &arena[leaf_id].inodes[i];
                    // A key currently naming a sub-bucket never yields a value here
                    // (spec §4.5) - callers reach it through `bucket()` instead.
                    if inode.is_bucket() {
                        return Ok(None);
                    }
                    Ok(inode.value().map(<[u8]>::to_vec))
                }
            }
        })
    }

    pub(crate) fn put_impl(&self, path: &[Vec<u8>], key: &[u8], value: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        self.with_bucket_state(path, |tx, state| {
            let root_id = tx.ensure_root(state)?;
            let (leaf_id, idx) = tx.find(root_id, key)?;
            if let Some(i) = idx {
                let arena = tx.arena.borrow();
                if arena[leaf_id].inodes[i].is_bucket() {
                    return Err(Error::BucketNameConflict);
                }
            }
            tx.arena.borrow_mut()[leaf_id].put_leaf(key, key, value.to_vec(), 0);
            Ok(())
        })
    }

    pub(crate) fn delete_impl(&self, path: &[Vec<u8>], key: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        self.with_bucket_state(path, |tx, state| {
            let root_id = tx.ensure_root(state)?;
            let (leaf_id, idx) = tx.find(root_id, key)?;
            if let Some(i) = idx {
                let arena = tx.arena.borrow();
                if arena[leaf_id].inodes[i].is_bucket() {
                    return Err(Error::BucketNameConflict);
                }
            }
            tx.arena.borrow_mut()[leaf_id].del(key);
            Ok(())
        })
    }

    pub(crate) fn create_bucket_impl(&self, path: &[Vec<u8>], name: &[u8], if_not_exists: bool) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        if name.is_empty() {
            return Err(Error::KeyRequired);
        }
        self.with_bucket_state(path, |tx, parent| {
            if parent.children.contains_key(name) {
                return if if_not_exists { Ok(()) } else { Err(Error::BucketExists) };
            }
            let root_id = tx.ensure_root(parent)?;
            let (leaf_id, idx) = tx.find(root_id, name)?;
            if let Some(i) = idx {
                let (is_bucket, value) = {
                    let arena = tx.arena.borrow();
                    let inode = &arena[leaf_id].inodes[i];
                    (inode.is_bucket(), inode.value().unwrap_or(&[]).to_vec())
                };
                if !is_bucket {
                    return Err(Error::BucketNameConflict);
                }
                if !if_not_exists {
                    return Err(Error::BucketExists);
                }
                let header = BucketHeader::decode(&value[..page::BUCKET_HEADER_SIZE])?;
                let mut state = BucketState::from_header(header);
                if header.root == 0 && value.len() > page::BUCKET_HEADER_SIZE {
                    state.inline_payload = Some(value[page::BUCKET_HEADER_SIZE..].to_vec());
                }
                parent.children.insert(name.to_vec(), state);
                return Ok(());
            }
            let new_state = BucketState::from_header(BucketHeader { root: 0, sequence: 0 });
            let value = encode_bucket_value(&new_state);
            tx.arena.borrow_mut()[leaf_id].put_leaf(name, name, value, page::LEAF_FLAG_BUCKET);
            parent.children.insert(name.to_vec(), new_state);
            Ok(())
        })
    }

    pub(crate) fn delete_bucket_impl(&self, path: &[Vec<u8>], name: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        self.with_bucket_state(path, |tx, parent| {
            tx.open_child_bucket(parent, name)?;
            let root_id = tx.ensure_root(parent)?;
            let (leaf_id, idx) = tx.find(root_id, name)?;
            let idx = idx.ok_or(Error::BucketNotFound)?;
            {
                let arena = tx.arena.borrow();
                if !arena[leaf_id].inodes[idx].is_bucket() {
                    return Err(Error::BucketNameConflict);
                }
            }
            if let Some(mut child) = parent.children.remove(name) {
                tx.free_bucket_subtree(&mut child)?;
            }
            tx.arena.borrow_mut()[leaf_id].del(name);
            Ok(())
        })
    }

    /// Frees every page reachable from `state`'s tree, recursing into nested
    /// buckets. Pages never written to disk (pgid 0, brand new this
    /// transaction) are simply discarded.
    fn free_bucket_subtree(&self, state: &mut BucketState) -> Result<()> {
        for (_, child) in state.children.iter_mut() {
            self.free_bucket_subtree(child)?;
        }
        if state.inline_payload.is_some() {
            return Ok(());
        }
        let root_pgid = if let Some(id) = state.root { self.arena.borrow()[id].pgid } else { state.header.root };
        if root_pgid == 0 {
            return Ok(());
        }
        self.free_page_tree(root_pgid)
    }

    /// Walks an on-disk page tree (not yet necessarily materialized) and
    /// frees every page in it, recursing into any nested (non-inline)
    /// sub-bucket a leaf element points to so `deleteBucket` frees a whole
    /// subtree, not just its own top level (spec §4.5).
    fn free_page_tree(&self, pgid: PageId) -> Result<()> {
        let view = self.page_view(pgid)?;
        self.freelist.borrow_mut().free(self.txid, pgid, view.overflow());
        if view.is_branch() {
            for i in 0..view.count() {
                let (_, child_pgid) = view.branch_element(i)?;
                self.free_page_tree(child_pgid)?;
            }
        } else if view.is_leaf() {
            for i in 0..view.count() {
                let (flags, _, value) = view.leaf_element(i)?;
                if flags & page::LEAF_FLAG_BUCKET != 0 && value.len() >= page::BUCKET_HEADER_SIZE {
                    let header = BucketHeader::decode(&value[..page::BUCKET_HEADER_SIZE])?;
                    if header.root != 0 {
                        self.free_page_tree(header.root)?;
                    }
                }
            }
        }
        Ok(())
    }

    // -- accessors used by `cursor.rs` -----------------------------------------

    pub(crate) fn bucket_root_node(&self, path: &[Vec<u8>]) -> Result<NodeId> {
        self.with_bucket_state(path, |tx, state| tx.ensure_root(state))
    }

    pub(crate) fn node_is_leaf(&self, id: NodeId) -> bool {
        self.arena.borrow()[id].is_leaf
    }

    pub(crate) fn node_count(&self, id: NodeId) -> usize {
        self.arena.borrow()[id].inodes.len()
    }

    pub(crate) fn node_leaf_entry(&self, id: NodeId, idx: usize) -> (Vec<u8>, Option<Vec<u8>>, bool) {
        let arena = self.arena.borrow();
        let inode = &arena[id].inodes[idx];
        (inode.key().to_vec(), inode.value().map(<[u8]>::to_vec), inode.is_bucket())
    }

    pub(crate) fn materialize_child(&self, parent: NodeId, idx: usize) -> Result<NodeId> {
        let pgid = self.arena.borrow()[parent].inodes[idx].pgid();
        self.materialize_page(pgid, Some(parent))
    }

    pub(crate) fn leaf_seek_index(&self, id: NodeId, target: &[u8]) -> usize {
        self.arena.borrow()[id].inodes.partition_point(|i| i.key() < target)
    }

    pub(crate) fn branch_seek_index(&self, id: NodeId, target: &[u8]) -> usize {
        Self::branch_index_for(&self.arena.borrow()[id], target)
    }

    /// Deletes the entry at `idx` in leaf `id` by key (errors if the
    /// transaction is read-only).
    pub(crate) fn delete_at(&self, id: NodeId, idx: usize) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        let key = self.arena.borrow()[id].inodes[idx].key().to_vec();
        self.arena.borrow_mut()[id].del(&key);
        Ok(())
    }

    /// Bumps and returns the bucket's persisted sequence counter. Only valid
    /// in a writable transaction.
    pub(crate) fn next_sequence_impl(&self, path: &[Vec<u8>]) -> Result<u64> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        self.with_bucket_state(path, |_, state| {
            state.header.sequence += 1;
            Ok(state.header.sequence)
        })
    }

    pub(crate) fn set_sequence_impl(&self, path: &[Vec<u8>], value: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        self.with_bucket_state(path, |_, state| {
            state.header.sequence = value;
            Ok(())
        })
    }

    pub(crate) fn bucket_stats(&self, path: &[Vec<u8>]) -> Result<BucketStats> {
        self.with_bucket_state(path, |tx, state| {
            let root_id = tx.ensure_root(state)?;
            let mut stats = BucketStats::default();
            stats.bucket_count = state.children.len();
            tx.count_node(root_id, 1, &mut stats)?;
            Ok(stats)
        })
    }

    fn count_node(&self, id: NodeId, depth: usize, stats: &mut BucketStats) -> Result<()> {
        stats.depth = stats.depth.max(depth);
        let (is_leaf, child_pgids): (bool, Vec<PageId>) = {
            let arena = self.arena.borrow();
            let node = &arena[id];
            if node.is_leaf {
                for inode in &node.inodes {
                    if inode.is_bucket() {
                        stats.bucket_count += 1;
                    } else {
                        stats.key_count += 1;
                    }
                }
                (true, Vec::new())
            } else {
                (false, node.inodes.iter().map(Inode::pgid).collect())
            }
        };
        if !is_leaf {
            for pgid in child_pgids {
                let child = self.materialize_page(pgid, Some(id))?;
                self.count_node(child, depth + 1, stats)?;
            }
        }
        Ok(())
    }

    /// Validates on-disk structural invariants reachable from the currently
    /// committed meta: every page in use is either free, pending, or
    /// reachable exactly once from a bucket root, and leaf keys are in
    /// ascending order.
    pub fn check(&self) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        let mut seen: std::collections::HashSet<PageId> = std::collections::HashSet::new();
        self.check_bucket(self.meta.root.root, &mut seen, &mut problems)?;
        Ok(problems)
    }

    fn check_bucket(&self, root: PageId, seen: &mut std::collections::HashSet<PageId>, problems: &mut Vec<String>) -> Result<()> {
        if root == 0 {
            return Ok(());
        }
        self.check_page(root, &mut None, seen, problems)
    }

    fn check_page(
        &self,
        pgid: PageId,
        last_key: &mut Option<Vec<u8>>,
        seen: &mut std::collections::HashSet<PageId>,
        problems: &mut Vec<String>,
    ) -> Result<()> {
        if !seen.insert(pgid) {
            problems.push(format!("page {pgid} reachable from more than one parent"));
            return Ok(());
        }
        let view = self.page_view(pgid)?;
        if view.is_leaf() {
            for i in 0..view.count() {
                let (flags, key, value) = view.leaf_element(i)?;
                if let Some(prev) = last_key {
                    if key <= prev.as_slice() {
                        problems.push(format!("page {pgid}: key out of order at index {i}"));
                    }
                }
                *last_key = Some(key.to_vec());
                if flags & page::LEAF_FLAG_BUCKET != 0 {
                    if value.len() >= page::BUCKET_HEADER_SIZE {
                        let header = BucketHeader::decode(&value[..page::BUCKET_HEADER_SIZE])?;
                        if header.root != 0 {
                            self.check_bucket(header.root, seen, problems)?;
                        }
                    } else {
                        problems.push(format!("page {pgid}: truncated bucket header at index {i}"));
                    }
                }
            }
        } else if view.is_branch() {
            let mut child_last_key = None;
            for i in 0..view.count() {
                let (_, child_pgid) = view.branch_element(i)?;
                self.check_page(child_pgid, &mut child_last_key, seen, problems)?;
            }
        } else {
            problems.push(format!("page {pgid}: unexpected flags {:#x}", view.flags()));
        }
        Ok(())
    }

    // -- commit / rollback ------------------------------------------------------

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn allocate_pages(&self, n: usize, freelist: &mut FreeList) -> PageId {
        if let Some(pgid) = freelist.allocate(n) {
            return pgid;
        }
        let pgid = self.next_pgid.get();
        self.next_pgid.set(pgid + n as u64);
        pgid
    }

    /// Frees a node's on-disk page (span `1 + orig_overflow`), if it was
    /// ever written. A node created and dropped within the same transaction
    /// (`pgid == 0`) has nothing on disk to free.
    fn free_node_page(&self, id: NodeId) {
        let (pgid, overflow) = {
            let arena = self.arena.borrow();
            (arena[id].pgid, arena[id].orig_overflow)
        };
        if pgid != 0 {
            self.freelist.borrow_mut().free(self.txid, pgid, overflow);
        }
    }

    fn rebalance_node(&self, id: NodeId) {
        let children = self.arena.borrow()[id].children.clone();
        for c in children {
            self.rebalance_node(c);
        }
        let is_empty = self.arena.borrow()[id].inodes.is_empty();
        if !is_empty {
            return;
        }
        let parent = self.arena.borrow()[id].parent;
        if let Some(p) = parent {
            let pgid = self.arena.borrow()[id].pgid;
            {
                let mut arena = self.arena.borrow_mut();
                arena[p].remove_child_by_pgid(pgid);
                arena[p].unbalanced = true;
                arena[p].children.retain(|&c| c != id);
            }
            self.free_node_page(id);
        }
    }

    /// Detaches emptied nodes, then collapses a chain of single-child
    /// branch roots down to their sole remaining child. Simplified relative
    /// to a full rebalance: no 25% sibling-merge threshold. Every node
    /// displaced this way (detached-empty or collapsed-away) has its old
    /// on-disk page(s), if any, freed into this transaction's pending list
    /// (spec §4.4: "free the empty node's page(s)").
    fn rebalance_bucket(&self, state: &mut BucketState) {
        for child in state.children.values_mut() {
            self.rebalance_bucket(child);
        }
        let Some(mut root_id) = state.root else { return };
        self.rebalance_node(root_id);
        loop {
            let (is_empty_branch, single_child_pgid) = {
                let arena = self.arena.borrow();
                let node = &arena[root_id];
                if node.is_leaf {
                    (false, None)
                } else if node.inodes.is_empty() {
                    (true, None)
                } else if node.inodes.len() == 1 {
                    (false, Some(node.inodes[0].pgid()))
                } else {
                    (false, None)
                }
            };
            // A branch root every one of whose children emptied in this same
            // transaction has nothing left to collapse down to (there is no
            // lone child to promote), unlike the usual single-child case;
            // without sibling-merging (this rebalance's one intentional cut,
            // see DESIGN.md) that is a real state a root can reach, not just
            // a theoretical one, so it becomes an empty leaf instead of
            // persisting as a malformed zero-entry branch page.
            if is_empty_branch {
                self.free_node_page(root_id);
                let new_root = self.push_node(Node::new_leaf());
                root_id = new_root;
                state.root = Some(root_id);
                break;
            }
            let Some(child_pgid) = single_child_pgid else { break };
            let child_id = match self.materialize_page(child_pgid, None) {
                Ok(id) => id,
                Err(_) => break,
            };
            self.free_node_page(root_id);
            self.arena.borrow_mut()[child_id].parent = None;
            root_id = child_id;
            state.root = Some(root_id);
        }
    }

    /// Recursively rewrites `id`'s subtree into freshly allocated pages,
    /// splitting any node whose serialized size exceeds one page (a greedy
    /// accumulate-then-cut heuristic rather than searching for the smallest
    /// sufficient prefix). Returns the `(first_key, pgid)` pairs the caller
    /// should install in place of this node's previous single entry.
    fn spill_node(
        &self,
        id: NodeId,
        freelist: &mut FreeList,
        dirty_pages: &mut Vec<(PageId, Vec<u8>)>,
    ) -> Result<Vec<(Vec<u8>, PageId)>> {
        self.check_cancelled()?;

        let children = self.arena.borrow()[id].children.clone();
        for child_id in children {
            let old_pgid = self.arena.borrow()[child_id].pgid;
            let results = self.spill_node(child_id, freelist, dirty_pages)?;
            let insert_at = {
                let mut arena = self.arena.borrow_mut();
                arena[id].remove_child_by_pgid(old_pgid).unwrap_or(arena[id].inodes.len())
            };
            for (offset, (key, pgid)) in results.into_iter().enumerate() {
                self.arena.borrow_mut()[id].insert_branch_at(insert_at + offset, key, pgid);
            }
        }

        let (is_leaf, old_pgid, old_overflow, inodes, parent) = {
            let mut arena = self.arena.borrow_mut();
            let node = &mut arena[id];
            (
                node.is_leaf,
                node.pgid,
                node.orig_overflow,
                std::mem::take(&mut node.inodes),
                node.parent,
            )
        };
        if old_pgid != 0 {
            freelist.free(self.txid, old_pgid, old_overflow);
        }

        let groups = split_inodes(inodes, is_leaf, self.page_size);
        let mut out = Vec::with_capacity(groups.len());
        for (i, group) in groups.into_iter().enumerate() {
            // Only the database's own root can reach here with zero inodes
            // (every other empty node is detached from its parent during
            // rebalance); give it an empty first key rather than indexing
            // into nothing, since nothing ever reads the root's own key.
            let first_key = group.first().map_or_else(Vec::new, |i| i.key().to_vec());
            let target_id = if i == 0 {
                id
            } else {
                let mut n = if is_leaf { Node::new_leaf() } else { Node::new_branch() };
                n.parent = parent;
                self.push_node(n)
            };
            self.arena.borrow_mut()[target_id].inodes = group;
            let size = self.arena.borrow()[target_id].size();
            let total_pages = 1 + page::overflow_for(size, self.page_size) as usize;
            let pgid = self.allocate_pages(total_pages, freelist);
            let buf = self.arena.borrow()[target_id].encode(pgid, self.page_size);
            self.arena.borrow_mut()[target_id].pgid = pgid;
            dirty_pages.push((pgid, buf));
            out.push((first_key, pgid));
        }
        Ok(out)
    }

    /// Builds one or more levels of fresh branch pages over `level` (the
    /// results of splitting a bucket's root), so the bucket keeps a single
    /// root pgid even when its root node split into more pieces than fit in
    /// one branch page.
    fn grow_root(&self, mut level: Vec<(Vec<u8>, PageId)>, freelist: &mut FreeList, dirty_pages: &mut Vec<(PageId, Vec<u8>)>) -> Result<PageId> {
        loop {
            let mut node = Node::new_branch();
            for (key, pgid) in &level {
                node.inodes.push(Inode::branch(key.clone(), *pgid));
            }
            if level.len() == 1 || node.size() <= self.page_size {
                let size = node.size();
                let total_pages = 1 + page::overflow_for(size, self.page_size) as usize;
                let pgid = self.allocate_pages(total_pages, freelist);
                let buf = node.encode(pgid, self.page_size);
                dirty_pages.push((pgid, buf));
                return Ok(pgid);
            }
            let groups = split_inodes(node.inodes, false, self.page_size);
            let mut next_level = Vec::with_capacity(groups.len());
            for group in groups {
                let first_key = group[0].key().to_vec();
                let mut n = Node::new_branch();
                n.inodes = group;
                let size = n.size();
                let total_pages = 1 + page::overflow_for(size, self.page_size) as usize;
                let pgid = self.allocate_pages(total_pages, freelist);
                let buf = n.encode(pgid, self.page_size);
                dirty_pages.push((pgid, buf));
                next_level.push((first_key, pgid));
            }
            level = next_level;
        }
    }

    /// A bucket whose root is a single leaf small enough to pack into its
    /// parent's leaf value directly, with no sub-buckets of its own (spec
    /// §4.5 "Inline buckets").
    fn try_inline(&self, root_id: NodeId, state: &BucketState) -> Option<Vec<u8>> {
        if !state.children.is_empty() {
            return None;
        }
        let arena = self.arena.borrow();
        let node = &arena[root_id];
        if !node.is_leaf || node.inodes.iter().any(Inode::is_bucket) {
            return None;
        }
        let bytes = node.encode_inline();
        if bytes.len() <= self.page_size / 4 {
            Some(bytes)
        } else {
            None
        }
    }

    /// Recursively spills a bucket's root (and every nested bucket under
    /// it) into fresh pages. `is_root` is `true` only for the database's own
    /// top-level bucket, which has no parent leaf entry to pack an inline
    /// payload into and so is never eligible for the inline-bucket
    /// optimization, since the root bucket is stored inside the meta page
    /// rather than under any parent.
    fn spill_bucket_tree(&self, state: &mut BucketState, is_root: bool, freelist: &mut FreeList, dirty_pages: &mut Vec<(PageId, Vec<u8>)>) -> Result<()> {
        let keys: Vec<Vec<u8>> = state.children.keys().cloned().collect();
        for key in keys {
            let mut child = state.children.remove(&key).unwrap();
            self.spill_bucket_tree(&mut child, false, freelist, dirty_pages)?;
            if let Some(root_id) = state.root {
                let value = encode_bucket_value(&child);
                self.arena.borrow_mut()[root_id].put_leaf(&key, &key, value, page::LEAF_FLAG_BUCKET);
            }
            state.children.insert(key, child);
        }

        if let Some(root_id) = state.root {
            let inline_bytes = if is_root { None } else { self.try_inline(root_id, state) };
            if let Some(inline_bytes) = inline_bytes {
                // This node's previous on-disk page (if it had one) is being
                // replaced by an inline payload rather than a fresh spilled
                // page, so it needs freeing here - `spill_node`, which
                // normally does this, is never called on this path.
                let (old_pgid, old_overflow) = {
                    let arena = self.arena.borrow();
                    (arena[root_id].pgid, arena[root_id].orig_overflow)
                };
                if old_pgid != 0 {
                    freelist.free(self.txid, old_pgid, old_overflow);
                }
                state.header = BucketHeader { root: 0, sequence: state.header.sequence };
                state.inline_payload = Some(inline_bytes);
            } else {
                let results = self.spill_node(root_id, freelist, dirty_pages)?;
                let new_root = if results.len() == 1 {
                    results[0].1
                } else {
                    self.grow_root(results, freelist, dirty_pages)?
                };
                state.header.root = new_root;
                state.inline_payload = None;
            }
        }
        Ok(())
    }

    /// Writes every change made through this transaction to disk and
    /// publishes a new meta page. Consumes the transaction: there is no
    /// reuse after commit or rollback.
    pub fn commit(self) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        self.check_cancelled()?;
        self.rebalance_bucket(&mut self.root.borrow_mut());
        self.check_cancelled()?;

        let mut freelist = self.freelist.borrow().clone();
        let mut dirty_pages = Vec::new();
        self.spill_bucket_tree(&mut self.root.borrow_mut(), true, &mut freelist, &mut dirty_pages)?;
        self.check_cancelled()?;

        if self.meta.freelist != 0 {
            if let Ok(view) = self.page_view(self.meta.freelist) {
                freelist.free(self.txid, self.meta.freelist, view.overflow());
            } else {
                warn!("could not re-read prior freelist page {} to free it", self.meta.freelist);
            }
        }
        let fl_page_count = freelist.page_count(self.page_size).max(1);
        let fl_pgid = self.allocate_pages(fl_page_count, &mut freelist);
        let fl_buf = freelist.encode(fl_pgid, self.page_size);
        dirty_pages.push((fl_pgid, fl_buf));

        let mut meta = self.meta;
        meta.root = self.root.borrow().header;
        meta.freelist = fl_pgid;
        meta.pgid = self.next_pgid.get();
        meta.txid = self.txid;

        trace!("commit tx {}: {} dirty pages, pgid high water {}", self.txid, dirty_pages.len(), meta.pgid);
        self.db.commit_write(meta, dirty_pages, freelist, self.txid)
    }

    /// Discards every change; nothing this transaction touched was ever
    /// written to the shared file or mmap, so this simply drops the
    /// transaction's private arena, freelist copy and bucket tree.
    pub fn rollback(self) -> Result<()> {
        Ok(())
    }
}

/// Greedily packs `inodes` into page-sized groups: runs are cut as soon as
/// the next entry would overflow the page, rather than searching for the
/// split point that minimizes the number of resulting pages.
fn split_inodes(inodes: Vec<Inode>, is_leaf: bool, page_size: usize) -> Vec<Vec<Inode>> {
    let elem_size = if is_leaf { page::LEAF_ELEM_SIZE } else { page::BRANCH_ELEM_SIZE };
    let threshold = page_size.saturating_sub(page::PAGE_HEADER_SIZE);
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0usize;
    for inode in inodes {
        let sz = elem_size + inode.size();
        if !current.is_empty() && current_size + sz > threshold {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += sz;
        current.push(inode);
    }
    if !current.is_empty() || groups.is_empty() {
        groups.push(current);
    }
    groups
}
