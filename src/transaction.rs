//! Transactions.
//!
//! A read transaction snapshots the current marker (root, tag, revision)
//! and never blocks the writer: copy-on-write guarantees the pages it
//! reaches are not rewritten within its epoch. A write transaction is
//! exclusive, enforced in-process by the engine's writer flag and across
//! processes by the advisory file lock; it sees and mutates its own root,
//! published only by [`Transaction::commit`].

use std::cell::Cell;

use tracing::warn;

use crate::error::{Error, PageId, Result};
use crate::tree::Database;

/// Transaction flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Snapshot reads; never blocks, never mutates.
    ReadOnly,
    /// The single writer.
    ReadWrite,
}

/// A transaction over a [`Database`].
///
/// Dropping an unfinished write transaction aborts it.
pub struct Transaction<'db> {
    db: &'db Database,
    kind: TransactionKind,
    root: Cell<PageId>,
    tag: u64,
    revision: u64,
    finished: Cell<bool>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(
        db: &'db Database,
        kind: TransactionKind,
        root: PageId,
        tag: u64,
        revision: u64,
    ) -> Self {
        Self { db, kind, root: Cell::new(root), tag, revision, finished: Cell::new(false) }
    }

    /// Whether this transaction can only read.
    pub fn is_read_only(&self) -> bool {
        self.kind == TransactionKind::ReadOnly
    }

    /// The tag of the commit this transaction snapshots.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// The revision this transaction snapshots.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn db(&self) -> &'db Database {
        self.db
    }

    pub(crate) fn root(&self) -> PageId {
        self.root.get()
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() || self.finished.get() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Inserts or replaces `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut root = self.root.get();
        let result = self.db.engine().put(&mut root, key, value);
        self.root.set(root);
        result
    }

    /// Looks up `key` within this transaction's snapshot (including its
    /// own uncommitted writes for a write transaction).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.engine().get(self.root.get(), key)
    }

    /// Removes `key`. Removing an absent key succeeds as a no-op.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut root = self.root.get();
        let result = self.db.engine().del(&mut root, key);
        self.root.set(root);
        result.map(|_| ())
    }

    /// Commits, attaching `tag` to the new marker. The commit is visible
    /// to transactions beginning afterwards, and durable after the next
    /// [`Database::sync`].
    pub fn commit(self, tag: u64) -> Result<()> {
        if self.is_read_only() {
            // Matching the abort path: finishing a reader is always fine.
            self.finished.set(true);
            return Ok(());
        }
        self.check_writable()?;
        let result = self.db.engine().commit(self.root.get(), tag);
        if result.is_err() {
            self.db.engine().abort_write();
        }
        self.finished.set(true);
        result
    }

    /// Discards every change made by this transaction. Guaranteed to leave
    /// no trace: dirty pages are dropped before ever being flushed.
    pub fn abort(self) {
        self.finish();
    }

    fn finish(&self) {
        if self.finished.replace(true) {
            return;
        }
        if self.kind == TransactionKind::ReadWrite {
            self.db.engine().abort_write();
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished.get() && self.kind == TransactionKind::ReadWrite {
            warn!("write transaction dropped without commit or abort; aborting");
        }
        self.finish();
    }
}
