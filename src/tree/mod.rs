//! Database handle and the storage engine core.
//!
//! [`Database`] owns the engine behind a mutex; transactions and cursors
//! borrow the handle and take the lock per operation. The engine combines
//! the pager, the page cache, the free-page tracker, and the marker
//! protocol:
//!
//! - **Commit** writes every dirty page, then a new working marker to the
//!   ping or pong slot (even revisions to ping, odd to pong). No fsync
//!   happens here; a crash before the marker write simply loses the
//!   transaction.
//! - **Sync** makes the current working marker durable: fsync the data,
//!   write sync marker A, fsync, write sync marker B. Afterwards the
//!   residue pages carried by the marker become collectible.
//! - **Open** picks the newest recoverable marker: a checksum-valid sync
//!   marker if any, plus any working marker that does not reference a sync
//!   epoch beyond the last durable one, highest revision wins.

pub(crate) mod ops;
pub(crate) mod verify;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::cache::PageCache;
use crate::config::{Config, DEFAULT_PAGE_SIZE};
use crate::error::{Error, PageId, Result};
use crate::page::marker::{FileSpec, MarkerPage, RESIDUE_ON_OVERFLOW};
use crate::page::node::{CompareFn, NodePage};
use crate::page::overflow::OverflowPage;
use crate::page::{
    self, Page, PageType, FIRST_DATA_PAGE, INVALID_PAGE, PING_PAGE, PONG_PAGE, SYNC_A_PAGE,
    SYNC_B_PAGE,
};
use crate::pager::{OpenMode, Pager};
use crate::transaction::{Transaction, TransactionKind};

pub use verify::IntegrityReport;

/// Operation counters, exposed via [`Database::stats`].
///
/// The page-type counters and `depth` describe the current session: page
/// counters count page creations since open, `depth` is the number of
/// branch levels above the leaves.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Pages read from disk.
    pub reads: u64,
    /// Pages written to disk.
    pub writes: u64,
    /// Page cache hits.
    pub hits: u64,
    /// Page cache misses.
    pub misses: u64,
    /// `fsync` calls issued.
    pub fsyncs: u64,
    /// Successful syncs.
    pub syncs: u64,
    /// Successful commits.
    pub commits: u64,
    /// Live entries in the tree.
    pub entries: u64,
    /// Branch levels above the leaf level (0 for a single-leaf tree).
    pub depth: u32,
    /// Branch pages created since open.
    pub branch_pages: u64,
    /// Leaf pages created since open.
    pub leaf_pages: u64,
    /// Overflow pages created since open.
    pub overflow_pages: u64,
}

/// Snapshot of engine state taken when a write transaction begins,
/// restored on abort so an aborted transaction has zero effect.
struct TxnBackup {
    tracker: crate::tracker::FreeTracker,
    last_page: PageId,
    stats: Stats,
}

pub(crate) struct Engine {
    pub(crate) pager: Pager,
    pub(crate) spec: FileSpec,
    pub(crate) mode: OpenMode,
    config: Config,
    pub(crate) cache: PageCache,
    pub(crate) tracker: crate::tracker::FreeTracker,
    /// Page numbers with unflushed modifications; the pages themselves are
    /// pinned in the cache.
    pub(crate) dirty: BTreeSet<PageId>,
    /// The current marker: the tree state the next reader snapshots.
    pub(crate) marker: MarkerPage,
    /// The last marker promoted to the sync slots.
    synced: MarkerPage,
    pub(crate) last_synced_id: u64,
    /// Next page number handed out when the collectible set is empty.
    pub(crate) last_page: PageId,
    pub(crate) size: u64,
    pub(crate) cmp: Option<CompareFn>,
    pub(crate) writer_active: bool,
    /// Residue spill chains currently referenced by the ping/pong slots.
    working_chain: [Vec<PageId>; 2],
    txn_backup: Option<TxnBackup>,
    pub(crate) stats: Stats,
    closed: bool,
}

impl Engine {
    fn create(mut pager: Pager, mode: OpenMode, config: Config) -> Result<Self> {
        if mode == OpenMode::ReadOnly {
            return Err(Error::Corrupted { reason: "empty database file".to_string() });
        }

        let page_size = match config.page_size {
            Some(size) => {
                if !size.is_power_of_two() || size < 4096 || size > 65536 {
                    return Err(Error::Corrupted {
                        reason: format!("invalid page size: {size}"),
                    });
                }
                size
            }
            None => DEFAULT_PAGE_SIZE,
        };
        pager.set_page_size(page_size);

        let spec = FileSpec::new(page_size);
        let mut spec_buf = spec.serialize(page_size);
        pager.write_page(&mut spec_buf)?;

        let init_size = (page_size * FIRST_DATA_PAGE as usize) as u64;
        let mut initial = MarkerPage::new(SYNC_A_PAGE);
        initial.meta.size = init_size;
        for slot in [SYNC_A_PAGE, SYNC_B_PAGE, PING_PAGE, PONG_PAGE] {
            let mut marker = initial.clone();
            marker.number = slot;
            let mut buf = marker.serialize(page_size);
            pager.write_page(&mut buf)?;
        }
        pager.sync()?;

        debug!(page_size, "created new database file");

        Ok(Self {
            pager,
            spec,
            mode,
            cache: PageCache::new(config.cache_size),
            config,
            tracker: crate::tracker::FreeTracker::new(),
            dirty: BTreeSet::new(),
            marker: initial.clone(),
            synced: initial,
            last_synced_id: 0,
            last_page: FIRST_DATA_PAGE,
            size: init_size,
            cmp: None,
            writer_active: false,
            working_chain: [Vec::new(), Vec::new()],
            txn_backup: None,
            stats: Stats::default(),
            closed: false,
        })
    }

    fn recover(mut pager: Pager, mode: OpenMode, config: Config, block: Vec<u8>) -> Result<Self> {
        let spec_info = page::PageInfo::from_bytes(&block)?;
        if page::page_checksum(&block)? != spec_info.checksum {
            return Err(Error::Checksum { page_no: page::SPEC_PAGE });
        }
        let spec = FileSpec::deserialize(&block)?;
        let page_size = spec.page_size as usize;
        pager.set_page_size(page_size);

        // Read every marker slot, remembering residue spill chains so the
        // slots' chains can be reclaimed when the slots are rewritten.
        let mut chains: [Vec<PageId>; 2] = [Vec::new(), Vec::new()];
        let synced_candidate = Self::read_marker(&mut pager, SYNC_A_PAGE)
            .or_else(|| {
                warn!("sync marker A invalid, trying sync marker B");
                Self::read_marker(&mut pager, SYNC_B_PAGE)
            })
            .map(|(marker, _)| marker);

        let mut candidates: Vec<MarkerPage> = Vec::new();
        if let Some(marker) = synced_candidate.clone() {
            candidates.push(marker);
        }
        for slot in [PING_PAGE, PONG_PAGE] {
            if let Some((marker, chain)) = Self::read_marker(&mut pager, slot) {
                // A working marker from an epoch past the last durable sync
                // references pages that were never fsync'd; only trust it
                // when no synced state survived at all.
                let trusted = match &synced_candidate {
                    Some(synced) => marker.meta.sync_id <= synced.meta.sync_id,
                    None => true,
                };
                chains[(slot - PING_PAGE) as usize] = chain;
                if trusted {
                    candidates.push(marker);
                } else {
                    debug!(slot, revision = marker.meta.revision, "ignoring unsynced working marker");
                }
            }
        }

        let mut current: Option<MarkerPage> = None;
        for candidate in candidates {
            let better = match &current {
                Some(best) => candidate.meta.revision > best.meta.revision,
                None => true,
            };
            if better {
                current = Some(candidate);
            }
        }
        let mut current = current.ok_or_else(|| Error::Corrupted {
            reason: "no valid marker found".to_string(),
        })?;
        if current.number != SYNC_A_PAGE && current.number != SYNC_B_PAGE {
            warn!(
                slot = current.number,
                revision = current.meta.revision,
                "recovered from a working marker"
            );
        }

        let synced = synced_candidate.unwrap_or_else(|| current.clone());
        let last_synced_id = current.meta.sync_id;
        let size = current.meta.size;

        let mut tracker = crate::tracker::FreeTracker::new();
        let last_page = (size / page_size as u64) as PageId;
        if mode == OpenMode::ReadWrite {
            let file_size = pager.file_size()?;
            if size < file_size {
                pager.set_file_size(size)?;
            }
            tracker.fold_collectible(current.residue.iter().copied());
            current.residue.clear();
            current.meta.flags &= !RESIDUE_ON_OVERFLOW;
            current.overflow_page = INVALID_PAGE;
        }
        // Spill-chain pages past the recovered size were just truncated
        // away; their numbers must not re-enter circulation ahead of the
        // extension counter.
        for chain in &mut chains {
            chain.retain(|&pgno| pgno < last_page);
        }

        debug!(
            revision = current.meta.revision,
            sync_id = current.meta.sync_id,
            root = current.meta.root,
            "opened database"
        );

        let mut engine = Self {
            pager,
            spec,
            mode,
            cache: PageCache::new(config.cache_size),
            config,
            tracker,
            dirty: BTreeSet::new(),
            marker: current,
            synced,
            last_synced_id,
            last_page: (size / page_size as u64) as PageId,
            size,
            cmp: None,
            writer_active: false,
            working_chain: chains,
            txn_backup: None,
            stats: Stats::default(),
            closed: false,
        };
        debug_assert_eq!(engine.last_page, last_page);
        engine.stats.depth = engine.measure_depth()?;
        Ok(engine)
    }

    /// Reads and validates one marker slot, following a residue spill
    /// chain when present. Returns the marker plus the chain's page
    /// numbers, or `None` when anything fails to verify.
    fn read_marker(pager: &mut Pager, slot: PageId) -> Option<(MarkerPage, Vec<PageId>)> {
        let buf = pager.read_page(slot).ok()?;
        let mut marker = MarkerPage::deserialize(&buf).ok()?;
        let mut chain = Vec::new();
        if marker.meta.flags & RESIDUE_ON_OVERFLOW != 0 {
            let mut data = Vec::new();
            let mut next = marker.overflow_page;
            while next != INVALID_PAGE {
                let raw = pager.read_page(next).ok()?;
                let link = OverflowPage::deserialize(&raw).ok()?;
                chain.push(next);
                data.extend_from_slice(&link.data);
                next = link.next;
            }
            marker.residue = crate::page::marker::parse_residue(&data).ok()?;
        }
        Some((marker, chain))
    }

    /// Number of branch levels above the leaf level.
    fn measure_depth(&mut self) -> Result<u32> {
        if self.marker.meta.root == INVALID_PAGE {
            return Ok(0);
        }
        let mut depth = 0u32;
        let mut pgno = self.marker.meta.root;
        loop {
            let node = self.node(pgno)?;
            if node.is_leaf() {
                return Ok(depth);
            }
            pgno = node
                .first_entry()
                .ok_or_else(|| Error::Corrupted { reason: "branch with no entries".into() })?
                .1
                .overflow_page;
            depth += 1;
        }
    }

    // ── page access ────────────────────────────────────────────────────

    /// Ensures a page is cached, reading it from disk on a miss.
    fn load_page(&mut self, pgno: PageId) -> Result<()> {
        if self.cache.find(pgno).is_some() {
            return Ok(());
        }
        let buf = self.pager.read_page(pgno)?;
        let page = Page::deserialize(&buf, self.cmp)?;
        self.cache.insert(page);
        Ok(())
    }

    /// A clone of a node page (for read paths).
    pub(crate) fn node(&mut self, pgno: PageId) -> Result<NodePage> {
        self.load_page(pgno)?;
        match self.cache.get_mut(pgno) {
            Some(Page::Node(node)) => Ok(node.clone()),
            _ => Err(Error::Corrupted { reason: format!("page {pgno} is not a node page") }),
        }
    }

    /// Removes a node page from the cache for mutation; pair with
    /// [`Engine::put_node`].
    pub(crate) fn take_node(&mut self, pgno: PageId) -> Result<NodePage> {
        self.load_page(pgno)?;
        match self.cache.remove(pgno) {
            Some(Page::Node(node)) => Ok(node),
            Some(other) => {
                self.cache.insert(other);
                Err(Error::Corrupted { reason: format!("page {pgno} is not a node page") })
            }
            None => Err(Error::Corrupted { reason: format!("page {pgno} vanished from cache") }),
        }
    }

    pub(crate) fn put_node(&mut self, node: NodePage) {
        self.cache.insert(Page::Node(node));
    }

    /// A clone of an overflow page.
    pub(crate) fn overflow(&mut self, pgno: PageId) -> Result<OverflowPage> {
        self.load_page(pgno)?;
        match self.cache.get_mut(pgno) {
            Some(Page::Overflow(link)) => Ok(link.clone()),
            _ => Err(Error::Corrupted { reason: format!("page {pgno} is not an overflow page") }),
        }
    }

    pub(crate) fn put_overflow(&mut self, link: OverflowPage) {
        self.cache.insert(Page::Overflow(link));
    }

    /// Allocates a page number, preferring collectible pages over file
    /// extension.
    pub(crate) fn allocate_page_no(&mut self) -> PageId {
        match self.tracker.allocate() {
            Some(pgno) => pgno,
            None => {
                let pgno = self.last_page;
                self.last_page += 1;
                pgno
            }
        }
    }

    /// Creates a fresh dirty node page of the given kind.
    pub(crate) fn new_node_page(&mut self, kind: PageType) -> NodePage {
        let pgno = self.allocate_page_no();
        debug_assert!(pgno >= FIRST_DATA_PAGE);
        self.cache.remove(pgno);
        self.dirty.insert(pgno);
        match kind {
            PageType::Branch => self.stats.branch_pages += 1,
            PageType::Leaf => self.stats.leaf_pages += 1,
            _ => unreachable!("new_node_page with non-node type"),
        }
        NodePage::new(kind, pgno, self.last_synced_id + 1)
    }

    /// Creates a fresh dirty overflow page.
    pub(crate) fn new_overflow_page(&mut self) -> OverflowPage {
        let pgno = self.allocate_page_no();
        debug_assert!(pgno >= FIRST_DATA_PAGE);
        self.cache.remove(pgno);
        self.dirty.insert(pgno);
        self.stats.overflow_pages += 1;
        OverflowPage::new(pgno)
    }

    pub(crate) fn mark_dirty(&mut self, node: &mut NodePage) {
        node.dirty = true;
        self.dirty.insert(node.number);
    }

    // ── transactions ───────────────────────────────────────────────────

    pub(crate) fn begin(&mut self, kind: TransactionKind) -> Result<(PageId, u64, u64)> {
        if kind == TransactionKind::ReadWrite {
            if self.mode == OpenMode::ReadOnly {
                return Err(Error::ReadOnly);
            }
            if self.writer_active {
                return Err(Error::WriterBusy);
            }
            debug_assert!(self.dirty.is_empty());
            self.pager.try_lock_exclusive()?;
            self.writer_active = true;
            self.txn_backup = Some(TxnBackup {
                tracker: self.tracker.clone(),
                last_page: self.last_page,
                stats: self.stats.clone(),
            });
        }
        Ok((self.marker.meta.root, self.marker.meta.tag, self.marker.meta.revision))
    }

    pub(crate) fn commit(&mut self, root: PageId, tag: u64) -> Result<()> {
        if !self.writer_active {
            return Err(Error::ReadOnly);
        }

        // Flush every dirty page. Overflow pages are dropped from the
        // cache after the write; they are large and rarely re-read.
        let dirty: Vec<PageId> = self.dirty.iter().copied().collect();
        for pgno in dirty {
            let page = self.cache.get_mut(pgno).ok_or_else(|| Error::Corrupted {
                reason: format!("dirty page {pgno} missing from cache"),
            })?;
            let mut buf = page.serialize(self.spec.page_size as usize)?;
            let drop_after = matches!(page, Page::Overflow(_));
            page.mark_clean();
            self.pager.write_page(&mut buf)?;
            if drop_after {
                self.cache.remove(pgno);
            }
        }
        self.dirty.clear();

        let mut marker = self.marker.clone();
        marker.meta.revision += 1;
        marker.meta.sync_id = self.last_synced_id + 1;
        marker.meta.root = root;
        marker.meta.tag = tag;
        marker.meta.size = self.pager.file_size()?;
        marker.meta.flags &= !RESIDUE_ON_OVERFLOW;
        marker.overflow_page = INVALID_PAGE;
        marker.residue = self.tracker.residue().clone();
        marker.number = if marker.meta.revision % 2 == 0 { PING_PAGE } else { PONG_PAGE };

        // The chain the outgoing occupant of this slot spilled (if any) is
        // unreferenced once the slot is rewritten.
        let slot_index = (marker.number - PING_PAGE) as usize;
        let stale_chain = std::mem::take(&mut self.working_chain[slot_index]);
        for pgno in stale_chain {
            self.tracker.free_now(pgno);
        }

        let chain = self.write_marker_page(&mut marker, None)?;
        self.working_chain[slot_index] = chain;

        self.size = self.pager.file_size()?;
        self.marker = marker;
        self.stats.commits += 1;
        debug!(
            revision = self.marker.meta.revision,
            root = self.marker.meta.root,
            tag,
            "committed"
        );

        self.end_write_txn();

        if self.config.auto_sync_rate > 0 && self.stats.commits % self.config.auto_sync_rate as u64 == 0
        {
            self.sync()?;
        }
        Ok(())
    }

    /// Serializes a marker into its slot, spilling the residue list into an
    /// overflow chain when it does not fit inline. Returns the chain's page
    /// numbers (empty when inline). `shared_chain` lets sync marker B
    /// reference the chain already written for sync marker A.
    fn write_marker_page(
        &mut self,
        marker: &mut MarkerPage,
        shared_chain: Option<PageId>,
    ) -> Result<Vec<PageId>> {
        let page_size = self.spec.page_size as usize;
        let mut chain_pages = Vec::new();

        if !MarkerPage::residue_fits_inline(page_size, marker.residue.len()) {
            marker.meta.flags |= RESIDUE_ON_OVERFLOW;
            match shared_chain {
                Some(head) => marker.overflow_page = head,
                None => {
                    let bytes = crate::page::marker::residue_to_bytes(&marker.residue);
                    let (head, pages) = self.write_chain_now(&bytes)?;
                    marker.overflow_page = head;
                    chain_pages = pages;
                }
            }
        } else {
            marker.meta.flags &= !RESIDUE_ON_OVERFLOW;
            marker.overflow_page = INVALID_PAGE;
        }

        let mut buf = marker.serialize(page_size);
        self.pager.write_page(&mut buf)?;
        Ok(chain_pages)
    }

    /// Writes `data` into a fresh overflow chain immediately, bypassing the
    /// dirty set (marker spill chains are written as part of the marker,
    /// not the transaction).
    fn write_chain_now(&mut self, data: &[u8]) -> Result<(PageId, Vec<PageId>)> {
        let page_size = self.spec.page_size as usize;
        let capacity = OverflowPage::capacity(page_size);

        let chunks: Vec<&[u8]> = data.chunks(capacity).collect();
        let mut numbers = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            let pgno = self.allocate_page_no();
            self.cache.remove(pgno);
            numbers.push(pgno);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let mut link = OverflowPage::new(numbers[i]);
            link.data = chunk.to_vec();
            link.next = numbers.get(i + 1).copied().unwrap_or(INVALID_PAGE);
            self.stats.overflow_pages += 1;
            let mut buf = link.serialize(page_size);
            self.pager.write_page(&mut buf)?;
        }
        Ok((numbers.first().copied().unwrap_or(INVALID_PAGE), numbers))
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Ok(());
        }
        if self.marker.meta.sync_id == self.last_synced_id {
            return Ok(());
        }

        self.pager.sync()?;

        let mut sync_a = self.marker.clone();
        sync_a.number = SYNC_A_PAGE;
        sync_a.meta.flags &= !RESIDUE_ON_OVERFLOW;
        sync_a.overflow_page = INVALID_PAGE;
        // The chain written here (if the residue spills) is reclaimed at
        // the next sync, via the synced marker's recorded chain head.
        let _ = self.write_marker_page(&mut sync_a, None)?;

        // The previous synced marker's spill chain is now unreferenced by
        // the sync slots.
        if self.synced.meta.flags & RESIDUE_ON_OVERFLOW != 0 {
            let stale = self.chain_page_numbers(self.synced.overflow_page)?;
            for pgno in stale {
                self.tracker.free_now(pgno);
            }
        }

        self.last_synced_id = self.marker.meta.sync_id;
        self.synced = sync_a.clone();
        self.tracker.promote_residue();
        self.marker.residue.clear();
        self.marker.meta.flags &= !RESIDUE_ON_OVERFLOW;
        self.marker.overflow_page = INVALID_PAGE;

        self.pager.sync()?;

        let mut sync_b = sync_a.clone();
        sync_b.number = SYNC_B_PAGE;
        let shared = (sync_a.meta.flags & RESIDUE_ON_OVERFLOW != 0).then_some(sync_a.overflow_page);
        self.write_marker_page(&mut sync_b, shared)?;

        self.size = self.pager.file_size()?;
        self.stats.syncs += 1;
        debug!(sync_id = self.last_synced_id, "synced");
        Ok(())
    }

    /// Walks an overflow chain collecting its page numbers (raw reads,
    /// no caching).
    fn chain_page_numbers(&mut self, head: PageId) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut next = head;
        while next != INVALID_PAGE {
            let raw = self.pager.read_page(next)?;
            let link = OverflowPage::deserialize(&raw)?;
            pages.push(next);
            next = link.next;
        }
        Ok(pages)
    }

    pub(crate) fn abort_write(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        for pgno in dirty {
            self.cache.remove(pgno);
        }
        if let Some(backup) = self.txn_backup.take() {
            self.tracker = backup.tracker;
            self.last_page = backup.last_page;
            self.stats = backup.stats;
        }
        self.end_write_txn();
    }

    fn end_write_txn(&mut self) {
        self.dirty.clear();
        self.txn_backup = None;
        self.writer_active = false;
        self.pager.unlock();
        self.cache.prune();
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut result = Ok(());
        if self.mode == OpenMode::ReadWrite && self.config.sync_on_close && !self.writer_active {
            result = self.sync();
        }
        self.dirty.clear();
        self.cache.clear();
        self.tracker.clear();
        self.pager.unlock();
        result
    }

    fn stats_snapshot(&self) -> Stats {
        let mut stats = self.stats.clone();
        stats.reads = self.pager.reads;
        stats.writes = self.pager.writes;
        stats.fsyncs = self.pager.fsyncs;
        stats.hits = self.cache.hits();
        stats.misses = self.cache.misses();
        stats
    }
}

/// A single-file embedded ordered key-value store.
///
/// One file holds the whole store: a copy-on-write B+-tree of opaque byte
/// keys and values, with crash safety provided by the dual-sync plus
/// dual-working marker protocol. Many read transactions may coexist with
/// at most one write transaction; writers in other processes are excluded
/// by an advisory file lock.
pub struct Database {
    inner: Mutex<Engine>,
    path: PathBuf,
}

impl Database {
    /// Opens (or in read-write mode creates) a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        Self::open_with_config(path, mode, Config::default())
    }

    /// Opens a database with explicit configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        mut config: Config,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if config.page_size.is_none() {
            config.page_size = Some(default_page_size(&path));
        }
        let mut pager = Pager::open(&path, mode)?;
        let engine = match pager.read_spec_block()? {
            None => Engine::create(pager, mode, config)?,
            Some(block) => Engine::recover(pager, mode, config, block)?,
        };
        Ok(Self { inner: Mutex::new(engine), path })
    }

    pub(crate) fn engine(&self) -> MutexGuard<'_, Engine> {
        self.inner.lock()
    }

    /// The path this database was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begins a transaction. At most one read-write transaction may be
    /// active; additional writers fail with [`Error::WriterBusy`].
    pub fn begin_transaction(&self, kind: TransactionKind) -> Result<Transaction<'_>> {
        let (root, tag, revision) = self.engine().begin(kind)?;
        Ok(Transaction::new(self, kind, root, tag, revision))
    }

    /// Installs a custom key comparator used for all subsequent
    /// operations. It must be deterministic and total, and must not change
    /// for the lifetime of a file once data has been written with it.
    pub fn set_compare_function(&self, cmp: CompareFn) {
        let mut engine = self.engine();
        engine.cmp = Some(cmp);
        // Cached clean pages hold keys built with the previous ordering;
        // they reload through the new comparator on demand.
        engine.cache.evict_clean();
    }

    /// One-shot insert in an implicit transaction committed with tag 0.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let txn = self.begin_transaction(TransactionKind::ReadWrite)?;
        txn.put(key, value)?;
        txn.commit(0)
    }

    /// One-shot lookup in an implicit read transaction.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.begin_transaction(TransactionKind::ReadOnly)?;
        txn.get(key)
    }

    /// One-shot removal in an implicit transaction committed with tag 0.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let txn = self.begin_transaction(TransactionKind::ReadWrite)?;
        txn.remove(key)?;
        txn.commit(0)
    }

    /// Promotes the current working marker to the sync slots, making every
    /// commit so far durable. No-op when nothing was committed since the
    /// last sync.
    pub fn sync(&self) -> Result<()> {
        self.engine().sync()
    }

    /// Snapshot rollback beyond [`Transaction::abort`] is not implemented;
    /// this always fails.
    pub fn rollback(&self) -> Result<()> {
        Err(Error::Unsupported { what: "rollback" })
    }

    /// Operation counters.
    pub fn stats(&self) -> Stats {
        self.engine().stats_snapshot()
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.engine().size
    }

    /// The tag of the current marker (the most recent commit's tag).
    pub fn tag(&self) -> u64 {
        self.engine().marker.meta.tag
    }

    /// Whether a write transaction is active.
    pub fn is_writing(&self) -> bool {
        self.engine().writer_active
    }

    /// The file's page size.
    pub fn page_size(&self) -> usize {
        self.engine().spec.page_size as usize
    }

    /// The last durable sync epoch (test and tooling visibility).
    pub fn last_synced_id(&self) -> u64 {
        self.engine().last_synced_id
    }

    /// Number of immediately reusable pages (test and tooling visibility).
    pub fn collectible_page_count(&self) -> usize {
        self.engine().tracker.collectible_count()
    }

    /// Walks the current tree checking structural invariants.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        self.engine().verify_integrity()
    }

    /// Closes the database, syncing first when configured and opened
    /// read-write.
    pub fn close(self) -> Result<()> {
        self.engine().close_inner()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.inner.lock().close_inner() {
            warn!(error = %e, "sync on close failed");
        }
    }
}

#[cfg(unix)]
fn default_page_size(path: &Path) -> usize {
    use std::os::unix::fs::MetadataExt;
    let block_size = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .metadata()
        .map(|m| m.blksize() as usize)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    if block_size > DEFAULT_PAGE_SIZE && block_size.is_power_of_two() && block_size <= 65536 {
        block_size
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[cfg(not(unix))]
fn default_page_size(_path: &Path) -> usize {
    DEFAULT_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn fixed_config() -> Config {
        Config { page_size: Some(4096), ..Config::default() }
    }

    #[test]
    fn test_create_produces_five_reserved_pages() {
        let dir = tempdir().unwrap();
        let db = Database::open_with_config(
            dir.path().join("t.vlm"),
            OpenMode::ReadWrite,
            fixed_config(),
        )
        .unwrap();
        assert_eq!(db.size(), 5 * 4096);
        assert_eq!(db.page_size(), 4096);
        assert_eq!(db.tag(), 0);
        assert_eq!(db.last_synced_id(), 0);
    }

    #[test]
    fn test_open_empty_read_only_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vlm");
        std::fs::File::create(&path).unwrap();
        assert!(Database::open(&path, OpenMode::ReadOnly).is_err());
    }

    #[test]
    fn test_reopen_preserves_spec() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vlm");
        {
            let db = Database::open_with_config(&path, OpenMode::ReadWrite, fixed_config())
                .unwrap();
            db.put(b"a", b"1").unwrap();
            db.close().unwrap();
        }
        let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
        assert_eq!(db.page_size(), 4096);
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_commit_advances_revision_and_alternates_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vlm");
        let db = Database::open_with_config(&path, OpenMode::ReadWrite, fixed_config()).unwrap();

        db.put(b"a", b"1").unwrap(); // revision 1 -> pong
        db.put(b"b", b"2").unwrap(); // revision 2 -> ping
        {
            let engine = db.engine();
            assert_eq!(engine.marker.meta.revision, 2);
            assert_eq!(engine.marker.number, PING_PAGE);
        }
        db.put(b"c", b"3").unwrap(); // revision 3 -> pong
        {
            let engine = db.engine();
            assert_eq!(engine.marker.meta.revision, 3);
            assert_eq!(engine.marker.number, PONG_PAGE);
        }
    }

    #[test]
    fn test_sync_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = Database::open_with_config(
            dir.path().join("t.vlm"),
            OpenMode::ReadWrite,
            fixed_config(),
        )
        .unwrap();
        db.put(b"a", b"1").unwrap();
        db.sync().unwrap();
        let synced = db.last_synced_id();
        assert_eq!(synced, 1);
        db.sync().unwrap();
        assert_eq!(db.last_synced_id(), synced);
        assert_eq!(db.stats().syncs, 1);
    }

    #[test]
    fn test_auto_sync_rate() {
        let dir = tempdir().unwrap();
        let config = Config { auto_sync_rate: 2, ..fixed_config() };
        let db = Database::open_with_config(dir.path().join("t.vlm"), OpenMode::ReadWrite, config)
            .unwrap();
        db.put(b"a", b"1").unwrap();
        assert_eq!(db.stats().syncs, 0);
        db.put(b"b", b"2").unwrap();
        assert_eq!(db.stats().syncs, 1);
        db.put(b"c", b"3").unwrap();
        assert_eq!(db.stats().syncs, 1);
        db.put(b"d", b"4").unwrap();
        assert_eq!(db.stats().syncs, 2);
    }

    #[test]
    fn test_rollback_is_unsupported() {
        let dir = tempdir().unwrap();
        let db = Database::open_with_config(
            dir.path().join("t.vlm"),
            OpenMode::ReadWrite,
            fixed_config(),
        )
        .unwrap();
        assert!(matches!(db.rollback(), Err(Error::Unsupported { .. })));
    }
}
