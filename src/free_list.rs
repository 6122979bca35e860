//! Tracks free and pending-release pages.
//!
//! Kept as a pair of ordered sets (`ids`, `pending`) the way odysa-roltdb
//! does, but `free`/`read`/`write` are completed against the `page` codec
//! module instead of left as stubs/placeholders.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::page::{self, PageId, PageView};

pub(crate) type TxId = u64;

#[derive(Debug, Default, Clone)]
pub(crate) struct FreeList {
    /// Pages free for immediate allocation.
    ids: BTreeSet<PageId>,
    /// Pages released by a txn but still possibly visible to a reader,
    /// keyed by the releasing transaction's id.
    pending: BTreeMap<TxId, Vec<PageId>>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the free set from a decoded freelist page. Only the `ids` are
    /// persisted; `pending` never survives a commit (it is reconciled into
    /// either `ids` or the new commit's freed set before the write).
    pub fn read(&mut self, view: PageView) -> Result<()> {
        self.ids = view.freelist_ids()?.into_iter().collect();
        self.pending.clear();
        Ok(())
    }

    /// Best-fit contiguous allocation: exact-length runs beat longer ones;
    /// among equal-length candidates the lowest address wins.
    pub fn allocate(&mut self, n: usize) -> Option<PageId> {
        if n == 0 || self.ids.is_empty() {
            return None;
        }
        let ids: Vec<PageId> = self.ids.iter().copied().collect();
        let mut best: Option<(usize, usize)> = None; // (run start index, run length)
        let mut i = 0;
        while i < ids.len() {
            let mut j = i;
            while j + 1 < ids.len() && ids[j + 1] == ids[j] + 1 {
                j += 1;
            }
            let run_len = j - i + 1;
            if run_len >= n {
                let better = match best {
                    None => true,
                    Some((_, blen)) => {
                        if blen == n {
                            false
                        } else if run_len == n {
                            true
                        } else {
                            run_len < blen
                        }
                    }
                };
                if better {
                    best = Some((i, run_len));
                    if run_len == n {
                        break;
                    }
                }
            }
            i = j + 1;
        }
        let (start_idx, _) = best?;
        let start = ids[start_idx];
        for k in 0..n as u64 {
            self.ids.remove(&(start + k));
        }
        Some(start)
    }

    /// Marks `pgid..=pgid+overflow` as released by `txid`, not yet free.
    pub fn free(&mut self, txid: TxId, pgid: PageId, overflow: u32) {
        let list = self.pending.entry(txid).or_default();
        for i in 0..=overflow as u64 {
            list.push(pgid + i);
        }
    }

    /// Moves every pending page released strictly before `oldest_reader_txid`
    /// into the free set.
    pub fn release(&mut self, oldest_reader_txid: TxId) {
        let releasable: Vec<TxId> = self
            .pending
            .range(..oldest_reader_txid)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in releasable {
            if let Some(ids) = self.pending.remove(&txid) {
                self.ids.extend(ids);
            }
        }
    }

    /// Drops a txn's pending pages without freeing them (used on rollback,
    /// where the pages were never actually released from the tree's point
    /// of view — they just go back to being live pages of the prior tree).
    pub fn rollback(&mut self, txid: TxId) {
        self.pending.remove(&txid);
    }

    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    fn all_ids_sorted(&self) -> Vec<PageId> {
        let mut all: Vec<PageId> = self.ids.iter().copied().collect();
        for list in self.pending.values() {
            all.extend(list.iter().copied());
        }
        all.sort_unstable();
        all
    }

    /// Number of pages (1 + overflow) the freelist will occupy once
    /// serialized, so the writer can reserve space for it before knowing
    /// its own final pgid.
    pub fn page_count(&self, page_size: usize) -> usize {
        let n = self.count();
        let header_extra = if n >= page::FREELIST_OVERFLOW_COUNT as usize { 1 } else { 0 };
        let total = page::PAGE_HEADER_SIZE + (n + header_extra) * 8;
        1 + page::overflow_for(total, page_size) as usize
    }

    pub fn encode(&self, id: PageId, page_size: usize) -> Vec<u8> {
        page::encode_freelist_page(id, page_size, &self.all_ids_sorted())
    }
}
