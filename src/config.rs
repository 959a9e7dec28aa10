//! Database configuration options.

/// Default page size used when the filesystem block size is unavailable
/// or smaller.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of deserialized pages kept in the cache.
pub const DEFAULT_CACHE_SIZE: usize = 64;

/// Tuning knobs for a [`Database`](crate::Database).
///
/// Only `page_size` affects the on-disk format, and only at creation time;
/// an existing file always uses the page size recorded on its spec page.
#[derive(Debug, Clone)]
pub struct Config {
    /// Page size for newly created files. `None` picks the larger of the
    /// filesystem block size and [`DEFAULT_PAGE_SIZE`]. Must be a power of
    /// two in `4096..=65536` when set.
    pub page_size: Option<usize>,
    /// Maximum number of clean pages to keep cached. Dirty pages are pinned
    /// and never counted against this limit.
    pub cache_size: usize,
    /// Trigger a `sync` automatically every N successful commits.
    /// 0 disables auto-sync.
    pub auto_sync_rate: u32,
    /// Sync on `close`/drop when the database was opened read-write.
    pub sync_on_close: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: None,
            cache_size: DEFAULT_CACHE_SIZE,
            auto_sync_rate: 0,
            sync_on_close: true,
        }
    }
}
