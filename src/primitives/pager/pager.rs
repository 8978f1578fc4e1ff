use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::meta::{read_meta_page, write_meta_page, Meta};
use crate::primitives::cache::{CacheOptions, CacheStats, PageCache};
use crate::primitives::concurrency::SingleWriter;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::wal::{Wal, WalOptions, WalStats};
use crate::types::{
    page::{self, PageHeader, PageKind},
    IndexError, Lsn, PageId, Result,
};

/// Durability mode for commits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync the log after every commit.
    #[default]
    Full,
    /// Sync the log only before data pages are written and at checkpoints.
    Normal,
    /// Never sync.
    Off,
}

impl Synchronous {
    /// Name used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }
}

/// Pager configuration.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Page size for newly created files. Existing files keep their own.
    pub page_size: u32,
    /// Page cache sizing.
    pub cache: CacheOptions,
    /// Log sync policy.
    pub synchronous: Synchronous,
    /// Verify page checksums on every load.
    pub verify_checksums: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            cache: CacheOptions::default(),
            synchronous: Synchronous::Full,
            verify_checksums: true,
        }
    }
}

/// Counters exposed through the inspection tooling.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PagerStats {
    /// Page cache counters.
    pub cache: CacheStats,
    /// Write-ahead log counters.
    pub wal: WalStats,
    /// Pages read from the data file.
    pub pages_read: u64,
    /// Pages written to the data file.
    pub pages_written: u64,
    /// Committed transactions.
    pub commits: u64,
    /// Rolled back transactions.
    pub rollbacks: u64,
    /// Completed checkpoints.
    pub checkpoints: u64,
    /// Log frames replayed when the file was opened.
    pub recovered_frames: u64,
}

type PageBuf = Box<[u8]>;

/// State of the open file transaction. `None` marks a page allocated from
/// the end of the file inside the transaction.
struct TxnState {
    before: FxHashMap<PageId, Option<(PageBuf, bool)>>,
    order: Vec<PageId>,
    meta_before: Meta,
}

/// Page store with a write-back cache and a write-ahead log.
///
/// All mutation happens inside a transaction. The first time a transaction
/// touches a page its before-image is saved and the page is pinned, so no
/// uncommitted bytes ever reach the data file. `commit` appends the touched
/// pages and page 0 to the log as one unit; `rollback` restores the saved
/// images. `checkpoint` writes dirty pages home and empties the log.
pub struct Pager {
    path: PathBuf,
    data: Arc<dyn FileIo>,
    wal: Wal,
    meta: Meta,
    cache: PageCache<PageBuf>,
    options: PagerOptions,
    txn: Option<TxnState>,
    stats: PagerStats,
    _lock: SingleWriter,
}

/// Path of the write-ahead log belonging to `path`.
pub fn wal_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("refindex"));
    name.push("-wal");
    let mut out = path.to_path_buf();
    out.set_file_name(name);
    out
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn write_page(io: &dyn FileIo, salt: u64, id: PageId, page: &[u8]) -> Result<()> {
    let mut copy = page.to_vec();
    page::stamp_crc32(&mut copy, salt)?;
    io.write_at(id.0 * copy.len() as u64, &copy)
}

impl Pager {
    /// Creates an empty index file, replacing anything at `path`.
    pub fn create(path: &Path, options: PagerOptions) -> Result<Self> {
        let lock = SingleWriter::acquire(path)?;
        let meta = Meta::new(options.page_size)?;
        remove_if_exists(&wal_path(path))?;
        let data: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
        data.truncate(0)?;
        let mut buf = vec![0u8; meta.page_size as usize];
        write_meta_page(&mut buf, &meta)?;
        data.write_at(0, &buf)?;
        data.sync_all()?;
        let wal_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(wal_path(path))?);
        let wal = Wal::open(
            wal_io,
            WalOptions {
                page_size: meta.page_size,
                wal_salt: meta.wal_salt,
                start_lsn: Lsn(1),
            },
        )?;
        info!(path = %path.display(), page_size = meta.page_size, "pager.create");
        Ok(Self::assemble(path, data, wal, meta, options, lock))
    }

    /// Opens an existing file and replays committed log frames into it.
    ///
    /// Fails with `IndexError::Unavailable` while another pager, in this or
    /// another process, has the same file open.
    pub fn open(path: &Path, options: PagerOptions) -> Result<Self> {
        let lock = SingleWriter::acquire(path)?;
        let data: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
        let meta = Self::load_meta(data.as_ref(), options.page_size)?;
        let wal_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(wal_path(path))?);
        let mut wal = Wal::open(
            wal_io,
            WalOptions {
                page_size: meta.page_size,
                wal_salt: meta.wal_salt,
                start_lsn: Lsn(meta.last_lsn.0 + 1),
            },
        )?;
        let frames = wal.committed_frames()?;
        let recovered = frames.len() as u64;
        let meta = if frames.is_empty() {
            meta
        } else {
            for frame in &frames {
                data.write_at(frame.page_id.0 * meta.page_size as u64, &frame.payload)?;
            }
            data.sync_all()?;
            let replayed = Self::load_meta(data.as_ref(), meta.page_size)?;
            info!(
                path = %path.display(),
                frames = recovered,
                last_lsn = replayed.last_lsn.0,
                "pager.recovered"
            );
            replayed
        };
        wal.reset(Lsn(meta.last_lsn.0 + 1))?;
        let mut pager = Self::assemble(path, data, wal, meta, options, lock);
        pager.stats.recovered_frames = recovered;
        debug!(meta = %pager.meta, "pager.open");
        Ok(pager)
    }

    /// Deletes the data file and its log. Refused while a pager has the
    /// file open.
    pub fn destroy(path: &Path) -> Result<()> {
        let _lock = SingleWriter::acquire(path)?;
        remove_if_exists(path)?;
        remove_if_exists(&wal_path(path))
    }

    fn assemble(
        path: &Path,
        data: Arc<dyn FileIo>,
        wal: Wal,
        meta: Meta,
        options: PagerOptions,
        lock: SingleWriter,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            data,
            wal,
            meta,
            cache: PageCache::new(options.cache),
            options,
            txn: None,
            stats: PagerStats::default(),
            _lock: lock,
        }
    }

    fn load_meta(data: &dyn FileIo, page_size_hint: u32) -> Result<Meta> {
        let len = data.len()?;
        let mut head = vec![0u8; page::PAGE_HDR_LEN];
        if len < head.len() as u64 {
            return Err(IndexError::Corruption("index file shorter than a page header"));
        }
        data.read_at(0, &mut head)?;
        let header = PageHeader::decode(&head)?;
        if header.page_size != page_size_hint {
            debug!(
                stored = header.page_size,
                configured = page_size_hint,
                "pager.page_size_from_file"
            );
        }
        if len < header.page_size as u64 {
            return Err(IndexError::Corruption("meta page truncated"));
        }
        let mut buf = vec![0u8; header.page_size as usize];
        data.read_at(0, &mut buf)?;
        read_meta_page(&buf)
    }

    /// Data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size of the open file.
    pub fn page_size(&self) -> usize {
        self.meta.page_size as usize
    }

    /// Current metadata, including uncommitted changes.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Mutable metadata; only inside a transaction.
    pub fn meta_mut(&mut self) -> Result<&mut Meta> {
        if self.txn.is_none() {
            return Err(IndexError::Invalid("meta update outside transaction"));
        }
        Ok(&mut self.meta)
    }

    /// True between `begin` and `commit` or `rollback`.
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PagerStats {
        let mut stats = self.stats.clone();
        stats.cache = self.cache.stats();
        stats.wal = self.wal.stats();
        stats
    }

    /// Returns the bytes of page `id`, loading it when not resident.
    pub fn page(&mut self, id: PageId) -> Result<&[u8]> {
        self.ensure_resident(id)?;
        self.cache
            .peek(id)
            .map(|buf| &buf[..])
            .ok_or(IndexError::Corruption("page vanished from cache"))
    }

    fn ensure_resident(&mut self, id: PageId) -> Result<()> {
        if id.0 == 0 {
            return Err(IndexError::Invalid("page 0 is managed by the pager"));
        }
        if id >= self.meta.next_page {
            return Err(IndexError::CorruptionOwned(format!(
                "page {} is beyond the allocated range ({})",
                id, self.meta.next_page
            )));
        }
        if self.cache.get(id).is_some() {
            return Ok(());
        }
        let buf = self.load(id)?;
        self.insert(id, buf)
    }

    fn load(&mut self, id: PageId) -> Result<PageBuf> {
        let page_size = self.page_size();
        let mut buf = vec![0u8; page_size];
        match self.data.read_at(id.0 * page_size as u64, &mut buf) {
            Ok(()) => {}
            Err(IndexError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(IndexError::CorruptionOwned(format!(
                    "page {id} lies past the end of the index file"
                )));
            }
            Err(err) => return Err(err),
        }
        page::verify(&mut buf, id, self.meta.salt, self.options.verify_checksums)?;
        self.stats.pages_read += 1;
        Ok(buf.into_boxed_slice())
    }

    fn insert(&mut self, id: PageId, buf: PageBuf) -> Result<()> {
        let Pager {
            cache,
            data,
            wal,
            meta,
            options,
            stats,
            ..
        } = self;
        let salt = meta.salt;
        let synchronous = options.synchronous;
        cache.put(id, buf, |victim, page| {
            if synchronous != Synchronous::Off {
                wal.sync_if_needed()?;
            }
            write_page(data.as_ref(), salt, victim, page)?;
            stats.pages_written += 1;
            Ok(())
        })
    }

    /// Starts a write transaction. Nested transactions are rejected.
    pub fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(IndexError::Invalid("transaction already active"));
        }
        self.txn = Some(TxnState {
            before: FxHashMap::default(),
            order: Vec::new(),
            meta_before: self.meta.clone(),
        });
        Ok(())
    }

    /// Mutable bytes of page `id`. The page stays pinned until the
    /// transaction ends.
    pub fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        let touched = match &self.txn {
            Some(txn) => txn.before.contains_key(&id),
            None => return Err(IndexError::Invalid("page write outside transaction")),
        };
        if !touched {
            self.ensure_resident(id)?;
            let image = self
                .cache
                .peek(id)
                .cloned()
                .ok_or(IndexError::Corruption("page vanished from cache"))?;
            let was_dirty = self.cache.is_dirty(id);
            self.cache.pin(id);
            if let Some(txn) = self.txn.as_mut() {
                txn.before.insert(id, Some((image, was_dirty)));
                txn.order.push(id);
            }
        }
        self.cache.set_dirty(id, true);
        self.cache
            .peek_mut(id)
            .map(|buf| &mut buf[..])
            .ok_or(IndexError::Corruption("page vanished from cache"))
    }

    /// Allocates a page of `kind`, reusing the free list first. The returned
    /// page has a fresh header and a zeroed body.
    pub fn allocate(&mut self, kind: PageKind) -> Result<PageId> {
        if self.txn.is_none() {
            return Err(IndexError::Invalid("allocation outside transaction"));
        }
        let page_size = self.meta.page_size;
        let id = if self.meta.free_head.0 != 0 {
            let id = self.meta.free_head;
            let buf = self.page_mut(id)?;
            if page::kind_of(buf)? != PageKind::FreeList {
                return Err(IndexError::CorruptionOwned(format!(
                    "free list entry {id} is not a free page"
                )));
            }
            let next = page::next_of(buf);
            self.meta.free_head = PageId(next);
            id
        } else {
            let id = self.meta.next_page;
            self.meta.next_page = PageId(id.0 + 1);
            self.insert(id, vec![0u8; page_size as usize].into_boxed_slice())?;
            self.cache.pin(id);
            if let Some(txn) = self.txn.as_mut() {
                txn.before.insert(id, None);
                txn.order.push(id);
            }
            id
        };
        let buf = self.page_mut(id)?;
        buf.fill(0);
        PageHeader::new(id, kind, page_size)?.encode(buf)?;
        Ok(id)
    }

    /// Returns `id` to the free list.
    pub fn free(&mut self, id: PageId) -> Result<()> {
        let page_size = self.meta.page_size;
        let free_head = self.meta.free_head;
        let buf = self.page_mut(id)?;
        buf.fill(0);
        let mut header = PageHeader::new(id, PageKind::FreeList, page_size)?;
        header.next = free_head.0;
        header.encode(buf)?;
        self.meta.free_head = id;
        Ok(())
    }

    /// Makes the transaction durable according to [`Synchronous`] and returns
    /// its LSN. On failure the transaction is rolled back.
    pub fn commit(&mut self) -> Result<Lsn> {
        let Some(txn) = self.txn.take() else {
            return Err(IndexError::Invalid("commit without transaction"));
        };
        if txn.order.is_empty() && self.meta == txn.meta_before {
            return Ok(self.meta.last_lsn);
        }
        let lsn = Lsn(self.meta.last_lsn.0 + 1);
        self.meta.last_lsn = lsn;
        if let Err(err) = self.append_commit(&txn, lsn) {
            warn!(lsn = lsn.0, error = %err, "pager.commit_failed");
            self.restore(txn);
            return Err(err);
        }
        for id in &txn.order {
            self.cache.unpin(*id);
        }
        self.stats.commits += 1;
        debug!(lsn = lsn.0, pages = txn.order.len(), "pager.commit");
        Ok(lsn)
    }

    fn append_commit(&mut self, txn: &TxnState, lsn: Lsn) -> Result<()> {
        let salt = self.meta.salt;
        for id in &txn.order {
            if let Some(buf) = self.cache.peek_mut(*id) {
                page::stamp_crc32(buf, salt)?;
            }
        }
        let mut meta_buf = vec![0u8; self.page_size()];
        write_meta_page(&mut meta_buf, &self.meta)?;
        let mut frames: Vec<(PageId, &[u8])> = Vec::with_capacity(txn.order.len() + 1);
        for id in &txn.order {
            let buf = self
                .cache
                .peek(*id)
                .ok_or(IndexError::Corruption("pinned page missing at commit"))?;
            frames.push((*id, &buf[..]));
        }
        frames.push((PageId(0), &meta_buf));
        self.wal.append_commit(lsn, &frames)?;
        if self.options.synchronous == Synchronous::Full {
            self.wal.sync()?;
        }
        Ok(())
    }

    /// Discards every change made by the open transaction.
    pub fn rollback(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Err(IndexError::Invalid("rollback without transaction"));
        };
        self.restore(txn);
        Ok(())
    }

    fn restore(&mut self, txn: TxnState) {
        let pages = txn.order.len();
        for (id, before) in txn.before {
            match before {
                Some((image, was_dirty)) => {
                    if let Some(buf) = self.cache.peek_mut(id) {
                        *buf = image;
                    }
                    self.cache.set_dirty(id, was_dirty);
                    self.cache.unpin(id);
                }
                None => {
                    self.cache.discard(id);
                }
            }
        }
        self.meta = txn.meta_before;
        self.stats.rollbacks += 1;
        debug!(pages, "pager.rollback");
    }

    /// Writes every dirty page and page 0 home, then empties the log.
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(IndexError::Invalid("checkpoint inside transaction"));
        }
        self.wal.sync_if_needed()?;
        let Pager {
            cache,
            data,
            meta,
            stats,
            ..
        } = self;
        let salt = meta.salt;
        let written = cache.flush_dirty(|id, page| {
            write_page(data.as_ref(), salt, id, page)?;
            stats.pages_written += 1;
            Ok(())
        })?;
        self.meta.last_checkpoint_lsn = self.meta.last_lsn;
        let mut meta_buf = vec![0u8; self.page_size()];
        write_meta_page(&mut meta_buf, &self.meta)?;
        self.data.write_at(0, &meta_buf)?;
        self.data.sync_all()?;
        self.wal.reset(Lsn(self.meta.last_lsn.0 + 1))?;
        self.stats.checkpoints += 1;
        info!(
            lsn = self.meta.last_lsn.0,
            pages = written,
            "pager.checkpoint"
        );
        Ok(())
    }

    /// True when committed changes have not been checkpointed yet.
    pub fn has_pending_log(&self) -> bool {
        !self.wal.is_empty()
    }
}
