//! Top-level database handle (spec §2 "Database", §6 "Open options").
//!
//! odysa-roltdb's `DB`/`Idb` split (a thin `Rc` wrapper around the real
//! state) is kept, but `Idb` is renamed `Shared` and built around `Arc` so
//! a `Database` can be cloned across reader threads, matching the
//! multi-reader/single-writer model spec §5 requires (the teacher's
//! `Rc`/`has_write: AtomicBool` pair only modeled a single thread).

use fs2::FileExt;
use log::{debug, trace, warn};
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::data::Stats;
use crate::error::{Error, Result};
use crate::free_list::{FreeList, TxId};
use crate::meta::Meta;
use crate::page::{self, PageId};
use crate::transaction::Transaction;
use crate::utils::CancellationToken;

const ONE_GIB: u64 = 1 << 30;

/// Open-time configuration (spec §6 "Open options").
#[derive(Debug, Clone)]
pub struct Options {
    pub read_only: bool,
    pub initial_mmap_size: u64,
    pub page_size: u32,
    pub no_grow_sync: bool,
    pub strict_mode: bool,
    /// How long `Database::open` waits on the file lock before giving up.
    /// `None` waits forever, matching `fs2::FileExt::lock_exclusive`.
    pub timeout: Option<Duration>,
    #[cfg(unix)]
    pub file_mode: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            read_only: false,
            initial_mmap_size: 0,
            page_size: page_size::get() as u32,
            no_grow_sync: false,
            strict_mode: false,
            timeout: None,
            #[cfg(unix)]
            file_mode: 0o600,
        }
    }
}

struct DbState {
    meta: Meta,
    active_meta_slot: u64,
    freelist: FreeList,
    /// reader handle id -> the txid it observed at begin.
    readers: std::collections::BTreeMap<u64, TxId>,
    next_reader_id: u64,
}

struct Shared {
    path: PathBuf,
    file: Mutex<File>,
    mmap: RwLock<Arc<Mmap>>,
    page_size: usize,
    read_only: bool,
    no_grow_sync: bool,
    #[allow(dead_code)] // consulted by Transaction::commit when strict_mode is set
    strict_mode: bool,
    writer_gate: Mutex<bool>,
    writer_cv: Condvar,
    state: Mutex<DbState>,
    poisoned: AtomicBool,
    closed: AtomicBool,
    next_txid_hint: AtomicU64,
}

/// Top-level handle: owns the file, the mmap, the meta pair, the single
/// writer mutex and the reader registry (spec §2 "Database").
#[derive(Clone)]
pub struct Database(Arc<Shared>);

pub(crate) struct WriterGuard(Database);

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let mut locked = self.0 .0.writer_gate.lock();
        *locked = false;
        self.0 .0.writer_cv.notify_one();
    }
}

pub(crate) struct ReaderGuard {
    db: Database,
    id: u64,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.db.0.state.lock().readers.remove(&self.id);
    }
}

impl Database {
    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Database> {
        Database::open(path, Options::default())
    }

    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Database> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();

        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(!options.read_only);
        if !existed {
            open_opts.create(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                open_opts.mode(options.file_mode);
            }
        }
        let file = open_opts.open(&path)?;

        Self::acquire_lock(&file, options.read_only, options.timeout)?;

        if !existed {
            debug!("initializing new database file at {}", path.display());
            Self::init_file(&file, options.page_size)?;
        }

        let file_len = file.metadata()?.len();
        let map_len = file_len.max(options.initial_mmap_size).max(options.page_size as u64 * 4);
        let map_len = crate::utils::round_up_to_page(map_len, options.page_size as u64);
        if map_len > file_len {
            file.set_len(map_len)?;
        }
        let mmap = unsafe { Mmap::map(&file)? };

        let (meta, active_slot) = active_meta(&mmap, options.page_size as usize)?;
        let page_size = meta.page_size as usize;

        let mut freelist = FreeList::new();
        if meta.freelist != 0 {
            let fl_view = page_view_in(&mmap, meta.freelist, page_size)?;
            freelist.read(fl_view)?;
        }

        let shared = Shared {
            path,
            file: Mutex::new(file),
            mmap: RwLock::new(Arc::new(mmap)),
            page_size,
            read_only: options.read_only,
            no_grow_sync: options.no_grow_sync,
            strict_mode: options.strict_mode,
            writer_gate: Mutex::new(false),
            writer_cv: Condvar::new(),
            state: Mutex::new(DbState {
                meta,
                active_meta_slot: active_slot,
                freelist,
                readers: Default::default(),
                next_reader_id: 0,
            }),
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_txid_hint: AtomicU64::new(0),
        };
        Ok(Database(Arc::new(shared)))
    }

    fn acquire_lock(file: &File, read_only: bool, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let result = if read_only {
                file.try_lock_shared()
            } else {
                file.try_lock_exclusive()
            };
            match result {
                Ok(()) => return Ok(()),
                Err(_) if deadline.is_none() => {
                    // block until available
                    let r = if read_only {
                        file.lock_shared()
                    } else {
                        file.lock_exclusive()
                    };
                    return r.map_err(Error::Io);
                }
                Err(e) => {
                    if let Some(dl) = deadline {
                        if Instant::now() >= dl {
                            return Err(Error::Timeout);
                        }
                    }
                    std::thread::sleep(Duration::from_millis(5));
                    let _ = e;
                }
            }
        }
    }

    fn init_file(file: &File, page_size: u32) -> Result<()> {
        let page_size = page_size as usize;
        let mut buf = vec![0u8; page_size * 4];

        let mut meta0 = Meta::new(page_size as u32);
        meta0.root = page::BucketHeader { root: 3, sequence: 0 };
        meta0.freelist = 2;
        meta0.pgid = 4;
        meta0.txid = 0;
        buf[0..page_size].copy_from_slice(&meta0.encode(0, page_size));

        let mut meta1 = meta0;
        meta1.txid = 1;
        buf[page_size..page_size * 2].copy_from_slice(&meta1.encode(1, page_size));

        let freelist_buf = page::encode_freelist_page(2, page_size, &[]);
        buf[page_size * 2..page_size * 3].copy_from_slice(&freelist_buf);

        let leaf_buf = page::encode_leaf_page(3, page_size, &[]);
        buf[page_size * 3..page_size * 4].copy_from_slice(&leaf_buf);

        let mut f = file;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&buf)?;
        f.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn is_read_only(&self) -> bool {
        self.0.read_only
    }

    pub(crate) fn page_size(&self) -> usize {
        self.0.page_size
    }

    pub(crate) fn mmap_snapshot(&self) -> Arc<Mmap> {
        self.0.mmap.read().clone()
    }

    pub fn stats(&self) -> Stats {
        let state = self.0.state.lock();
        Stats {
            free_page_count: state.freelist.free_count(),
            pending_page_count: state.freelist.pending_count(),
            tx_id: state.meta.txid,
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.0.file.lock().sync_all()?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.0.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.0.poisoned.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Begins a transaction. Blocks on the writer gate if `writable`.
    pub fn begin(&self, writable: bool) -> Result<Transaction> {
        self.begin_inner(writable, None)
    }

    pub fn begin_with_context(&self, writable: bool, cancel: CancellationToken) -> Result<Transaction> {
        self.begin_inner(writable, Some(cancel))
    }

    fn begin_inner(&self, writable: bool, cancel: Option<CancellationToken>) -> Result<Transaction> {
        self.ensure_open()?;
        if writable && self.0.read_only {
            return Err(Error::ReadOnly);
        }

        let writer_guard = if writable {
            let mut locked = self.0.writer_gate.lock();
            while *locked {
                self.0.writer_cv.wait(&mut locked);
            }
            *locked = true;
            Some(WriterGuard(self.clone()))
        } else {
            None
        };

        let mmap = self.mmap_snapshot();
        let (meta, freelist, reader_guard, txid) = {
            let mut state = self.0.state.lock();
            let read_txid = state.meta.txid;
            let reader_id = state.next_reader_id;
            state.next_reader_id += 1;
            state.readers.insert(reader_id, read_txid);
            let reader_guard = ReaderGuard { db: self.clone(), id: reader_id };

            let mut meta = state.meta;
            let freelist = if writable {
                meta.txid = read_txid + 1;
                state.freelist.clone()
            } else {
                FreeList::new()
            };
            (meta, freelist, reader_guard, meta.txid)
        };

        trace!("begin tx {} (writable={})", txid, writable);
        Ok(Transaction::new(self.clone(), writable, txid, meta, mmap, freelist, reader_guard, writer_guard, cancel))
    }

    pub fn view<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let tx = self.begin(false)?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    pub fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let tx = self.begin(true)?;
        match f(&tx) {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    pub fn view_with_context<F, T>(&self, cancel: CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let tx = self.begin_with_context(false, cancel)?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    pub fn update_with_context<F, T>(&self, cancel: CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let tx = self.begin_with_context(true, cancel)?;
        match f(&tx) {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// Grows the file (and remaps) so that it covers at least `min_pgid`
    /// pages. Doubles the mapped size up to 1 GiB, then grows in 1 GiB
    /// increments (spec §4.1 "Growth policy").
    pub(crate) fn ensure_mapped(&self, min_pgid: PageId) -> Result<()> {
        let min_size = min_pgid * self.0.page_size as u64;
        let current = self.0.mmap.read().len() as u64;
        if current >= min_size {
            return Ok(());
        }
        let mut size = current.max(self.0.page_size as u64 * 4);
        while size < min_size {
            if size < ONE_GIB {
                size *= 2;
            } else {
                size += ONE_GIB;
            }
        }
        size = crate::utils::round_up_to_page(size, self.0.page_size as u64);

        let file = self.0.file.lock();
        file.set_len(size)?;
        if !self.0.no_grow_sync {
            file.sync_all()?;
        } else {
            warn!("skipping fsync after growing {} to {size} bytes (no_grow_sync)", self.0.path.display());
        }
        let new_mmap = unsafe { Mmap::map(&*file)? };
        drop(file);
        *self.0.mmap.write() = Arc::new(new_mmap);
        Ok(())
    }

    /// Writes dirty pages and the new meta atomically (spec §4.7, writer
    /// commit algorithm steps 4-6). On any I/O failure the database is
    /// poisoned: the prior meta remains active and further writes fail.
    pub(crate) fn commit_write(
        &self,
        mut meta: Meta,
        dirty_pages: Vec<(PageId, Vec<u8>)>,
        mut freelist: FreeList,
        txid: TxId,
    ) -> Result<()> {
        self.ensure_mapped(meta.pgid)?;

        let do_write = || -> Result<()> {
            let mut file = self.0.file.lock();
            for (pgid, bytes) in &dirty_pages {
                file.seek(SeekFrom::Start(*pgid * self.0.page_size as u64))?;
                file.write_all(bytes)?;
            }
            file.sync_all()?;
            Ok(())
        };
        if let Err(e) = do_write() {
            self.0.poisoned.store(true, Ordering::SeqCst);
            return Err(e);
        }

        let mut state = self.0.state.lock();
        let oldest_reader = state.readers.values().copied().min().unwrap_or(txid + 1);
        freelist.release(oldest_reader);

        meta.txid = txid;
        let next_slot = 1 - state.active_meta_slot;
        let meta_buf = meta.encode(next_slot, self.0.page_size);

        let write_meta = || -> Result<()> {
            let mut file = self.0.file.lock();
            file.seek(SeekFrom::Start(next_slot * self.0.page_size as u64))?;
            file.write_all(&meta_buf)?;
            file.sync_all()?;
            Ok(())
        };
        if let Err(e) = write_meta() {
            self.0.poisoned.store(true, Ordering::SeqCst);
            return Err(e);
        }

        state.active_meta_slot = next_slot;
        state.meta = meta;
        state.freelist = freelist;
        debug!("committed txid {txid}, {} dirty pages", dirty_pages.len());
        Ok(())
    }
}

fn page_view_in(mmap: &[u8], pgid: PageId, page_size: usize) -> Result<crate::page::PageView<'_>> {
    let offset = pgid as usize * page_size;
    let header = mmap
        .get(offset..offset + page::PAGE_HEADER_SIZE)
        .ok_or_else(|| Error::Corruption("page header out of bounds".into()))?;
    let overflow = page::read_u32(header, 12) as usize;
    let len = page_size * (1 + overflow);
    let slice = mmap
        .get(offset..offset + len)
        .ok_or_else(|| Error::Corruption("page body out of bounds".into()))?;
    Ok(crate::page::PageView::new(slice))
}

fn try_meta(mmap: &[u8], page_size: usize, slot: u64) -> Option<Meta> {
    let start = slot as usize * page_size;
    let end = start.checked_add(page_size)?;
    let buf = mmap.get(start..end)?;
    let m = Meta::decode(slot, buf).ok()?;
    m.validate().ok()?;
    Some(m)
}

fn active_meta(mmap: &[u8], page_size: usize) -> Result<(Meta, u64)> {
    match (try_meta(mmap, page_size, 0), try_meta(mmap, page_size, 1)) {
        (Some(a), Some(b)) => {
            if a.txid >= b.txid {
                Ok((a, 0))
            } else {
                Ok((b, 1))
            }
        }
        (Some(a), None) => Ok((a, 0)),
        (None, Some(b)) => Ok((b, 1)),
        (None, None) => {
            let end = page_size.min(mmap.len());
            let m = Meta::decode(0, &mmap[..end])?;
            m.validate()?;
            Ok((m, 0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_four_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.db");
        let db = Database::open(&path, Options { page_size: 4096, ..Default::default() }).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 4096 * 4);
        let stats = db.stats();
        assert_eq!(stats.tx_id, 1);
    }

    #[test]
    fn reopen_after_close_increments_txid_on_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.db");
        {
            let db = Database::open_default(&path).unwrap();
            db.update(|tx| {
                tx.create_bucket(b"b")?;
                Ok(())
            })
            .unwrap();
            db.close().unwrap();
        }
        let db2 = Database::open_default(&path).unwrap();
        let txid_before = db2.stats().tx_id;
        db2.update(|tx| {
            tx.bucket(b"b")?.put(b"k", b"v")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db2.stats().tx_id, txid_before + 1);
    }
}
