//! A single entry inside an in-memory `Node`.
//!
//! Grounded on odysa-roltdb's `Inode(Either<BranchINode, LeafINode>)` split,
//! kept here, but holding owned `Vec<u8>` key/value bytes instead of a
//! raw-pointer `Entry` (which aliased mmap memory unsafely across the
//! node's lifetime — not safe once a node is mutated and re-ordered).

use either::Either;

use crate::page::{PageId, LEAF_FLAG_BUCKET};

#[derive(Debug, Clone)]
pub(crate) struct Inode(pub(crate) Either<BranchInode, LeafInode>);

impl Inode {
    pub(crate) fn branch(key: Vec<u8>, pgid: PageId) -> Self {
        Self(Either::Left(BranchInode { key, pgid }))
    }

    pub(crate) fn leaf(key: Vec<u8>, value: Vec<u8>, flags: u32) -> Self {
        Self(Either::Right(LeafInode { key, value, flags }))
    }

    pub(crate) fn key(&self) -> &[u8] {
        match &self.0 {
            Either::Left(b) => &b.key,
            Either::Right(l) => &l.key,
        }
    }

    pub(crate) fn set_key(&mut self, key: Vec<u8>) {
        match &mut self.0 {
            Either::Left(b) => b.key = key,
            Either::Right(l) => l.key = key,
        }
    }

    pub(crate) fn value(&self) -> Option<&[u8]> {
        match &self.0 {
            Either::Left(_) => None,
            Either::Right(l) => Some(&l.value),
        }
    }

    pub(crate) fn pgid(&self) -> PageId {
        match &self.0 {
            Either::Left(b) => b.pgid,
            Either::Right(_) => 0,
        }
    }

    pub(crate) fn set_pgid(&mut self, pgid: PageId) {
        if let Either::Left(b) = &mut self.0 {
            b.pgid = pgid;
        }
    }

    pub(crate) fn flags(&self) -> u32 {
        match &self.0 {
            Either::Left(_) => 0,
            Either::Right(l) => l.flags,
        }
    }

    pub(crate) fn is_bucket(&self) -> bool {
        self.flags() & LEAF_FLAG_BUCKET != 0
    }

    pub(crate) fn size(&self) -> usize {
        self.key().len() + self.value().map_or(0, <[u8]>::len)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BranchInode {
    pub(crate) key: Vec<u8>,
    pub(crate) pgid: PageId,
}

#[derive(Debug, Clone)]
pub(crate) struct LeafInode {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
    pub(crate) flags: u32,
}
