//! Cursors: ordered traversal over a transaction's snapshot.
//!
//! A cursor holds its position as the leaf page number, the index within
//! that leaf, and a copy of the current key. Stepping re-searches by the
//! held key, so a cursor over a write transaction stays correct while the
//! transaction keeps mutating the tree underneath it; leaf boundaries are
//! crossed via the sibling page numbers the search descent resolves from
//! its spill stacks.

use crate::error::{PageId, Result};
use crate::page::INVALID_PAGE;
use crate::transaction::Transaction;
use crate::tree::ops::CursorHit;

/// A position within the tree of one transaction.
pub struct Cursor<'txn, 'db> {
    txn: &'txn Transaction<'db>,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    leaf: PageId,
    index: usize,
}

impl<'txn, 'db> Cursor<'txn, 'db> {
    /// Creates an unpositioned cursor over `txn`.
    pub fn new(txn: &'txn Transaction<'db>) -> Self {
        Self { txn, key: None, value: None, leaf: INVALID_PAGE, index: 0 }
    }

    /// The current key and value, if positioned.
    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        match (&self.key, &self.value) {
            (Some(key), Some(value)) => Some((key.as_slice(), value.as_slice())),
            _ => None,
        }
    }

    /// Whether the cursor is positioned on an entry.
    pub fn is_valid(&self) -> bool {
        self.key.is_some()
    }

    /// The leaf page and in-leaf index of the current position, if any.
    /// Positions are advisory: the next step re-searches by the held key.
    pub fn position(&self) -> Option<(PageId, usize)> {
        self.key.as_ref().map(|_| (self.leaf, self.index))
    }

    fn apply(&mut self, hit: Option<CursorHit>) -> bool {
        match hit {
            Some(hit) => {
                self.key = Some(hit.key);
                self.value = Some(hit.value);
                self.leaf = hit.leaf;
                self.index = hit.index;
                true
            }
            None => {
                self.key = None;
                self.value = None;
                self.leaf = INVALID_PAGE;
                self.index = 0;
                false
            }
        }
    }

    /// Positions at the smallest key. Returns false on an empty tree.
    pub fn first(&mut self) -> Result<bool> {
        let hit = self.txn.db().engine().cursor_first(self.txn.root())?;
        Ok(self.apply(hit))
    }

    /// Positions at the largest key. Returns false on an empty tree.
    pub fn last(&mut self) -> Result<bool> {
        let hit = self.txn.db().engine().cursor_last(self.txn.root())?;
        Ok(self.apply(hit))
    }

    /// Steps to the next key in comparator order. An unpositioned cursor
    /// starts at the first key.
    pub fn next(&mut self) -> Result<bool> {
        match self.key.take() {
            None => self.first(),
            Some(held) => {
                let hit = self.txn.db().engine().cursor_next(self.txn.root(), &held)?;
                Ok(self.apply(hit))
            }
        }
    }

    /// Steps to the previous key. An unpositioned cursor starts at the
    /// last key.
    pub fn prev(&mut self) -> Result<bool> {
        match self.key.take() {
            None => self.last(),
            Some(held) => {
                let hit = self.txn.db().engine().cursor_prev(self.txn.root(), &held)?;
                Ok(self.apply(hit))
            }
        }
    }

    /// Positions at `key` exactly; fails (and invalidates the position)
    /// when the key is absent.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        let hit = self.txn.db().engine().cursor_seek(self.txn.root(), key, true)?;
        Ok(self.apply(hit))
    }

    /// Positions at `key`, or at the smallest key greater than it; fails
    /// when no key at or above `key` exists.
    pub fn seek_range(&mut self, key: &[u8]) -> Result<bool> {
        let hit = self.txn.db().engine().cursor_seek(self.txn.root(), key, false)?;
        Ok(self.apply(hit))
    }
}
