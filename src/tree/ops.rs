//! Tree algorithms: search, copy-on-write touch, insert/split,
//! delete/rebalance, overflow chains, and the cursor stepping primitives.
//!
//! All mutation paths work on a descent path returned by [`Engine::search`]
//! rather than stored parent pointers: each path entry records a page
//! number and the routing key under which it is registered in its parent.
//! Sibling links are likewise never persisted; the descent builds spill
//! stacks (the child pointers adjacent to the taken route at every branch
//! level) from which a leaf's left/right neighbour is resolved on demand.

use std::ops::Bound;

use tracing::trace;

use crate::error::{Error, PageId, Result};
use crate::page::node::{
    self, HistoryNode, NodeKey, NodePage, NodeValue, HISTORY_NODE_SIZE,
};
use crate::page::{PageType, INVALID_PAGE};

use super::Engine;

/// One level of a descent: the page and the key under which it is
/// registered in its parent (`None` for the root).
#[derive(Debug, Clone)]
pub(crate) struct PathEntry {
    pub page_no: PageId,
    pub parent_key: Option<NodeKey>,
}

/// The result of a search descent. `left`/`right` are the leaf's
/// neighbours, resolved from the spill stacks, and only when the search
/// was asked for them.
pub(crate) struct Descent {
    pub path: Vec<PathEntry>,
    pub left: PageId,
    pub right: PageId,
}

impl Descent {
    pub(crate) fn leaf(&self) -> PageId {
        self.path.last().expect("descent path is never empty").page_no
    }
}

/// What a search descends toward.
pub(crate) enum SearchTarget<'a> {
    Key(&'a NodeKey),
    First,
    Last,
}

/// A cursor probe result: the entry plus the leaf position it was found at.
pub(crate) struct CursorHit {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub leaf: PageId,
    pub index: usize,
}

enum Side {
    Left,
    Right,
}

impl Engine {
    pub(crate) fn key(&self, data: &[u8]) -> NodeKey {
        NodeKey::new(self.cmp, data.to_vec())
    }

    fn causes_overflow(&self, value_len: usize) -> bool {
        value_len > self.spec.overflow_threshold as usize
    }

    fn page_size_usize(&self) -> usize {
        self.spec.page_size as usize
    }

    pub(crate) fn space_left_of(&self, page: &NodePage) -> usize {
        page.space_left(self.page_size_usize())
    }

    /// Fill factor check: a page above the fill threshold needs no
    /// rebalancing.
    pub(crate) fn full_enough(&self, page: &NodePage) -> bool {
        let capacity = page.capacity(self.page_size_usize()) as f64;
        let fill = 1.0 - self.space_left_of(page) as f64 / capacity;
        fill * 100.0 > f64::from(self.spec.fill_threshold)
    }

    fn check_put_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let max = self.spec.key_size as usize;
        if key.len() > max {
            return Err(Error::KeyTooLarge { size: key.len(), max });
        }
        Ok(())
    }

    // ── search ─────────────────────────────────────────────────────────

    /// Descends from `root` to a leaf. With `modify` set, every page on
    /// the way is touched (copied-on-write) and `root` is updated to the
    /// touched root. With `with_siblings` set, the leaf's neighbours are
    /// resolved from the spill stacks for cursor use.
    pub(crate) fn search(
        &mut self,
        root: &mut PageId,
        target: SearchTarget<'_>,
        modify: bool,
        with_siblings: bool,
    ) -> Result<Option<Descent>> {
        if *root == INVALID_PAGE {
            return Ok(None);
        }

        let mut current = *root;
        if modify {
            current = self.touch_node(current, None)?;
            *root = current;
        }

        let mut path = vec![PathEntry { page_no: current, parent_key: None }];
        let mut left_stack: Vec<PageId> = Vec::new();
        let mut right_stack: Vec<PageId> = Vec::new();

        loop {
            let page = self.node(current)?;
            if page.is_leaf() {
                break;
            }
            if page.entries.is_empty() {
                return Err(Error::Corrupted {
                    reason: format!("branch page {current} has no entries"),
                });
            }

            let (routing_key, child, left_of, right_of) = {
                let (key, value) = match &target {
                    SearchTarget::First => page.first_entry(),
                    SearchTarget::Last => page.last_entry(),
                    SearchTarget::Key(k) => page.routing_entry(k).or_else(|| page.first_entry()),
                }
                .expect("branch verified non-empty");

                let before = page
                    .entries
                    .range((Bound::Unbounded, Bound::Excluded(key)))
                    .next_back()
                    .map(|(_, v)| v.overflow_page);
                let after = page
                    .entries
                    .range((Bound::Excluded(key), Bound::Unbounded))
                    .next()
                    .map(|(_, v)| v.overflow_page);
                (key.clone(), value.overflow_page, before, after)
            };

            if with_siblings {
                left_stack.push(left_of.unwrap_or(INVALID_PAGE));
                right_stack.push(right_of.unwrap_or(INVALID_PAGE));
            }

            let mut child_no = child;
            if modify {
                child_no = self.touch_node(child_no, Some((current, &routing_key)))?;
            }
            path.push(PathEntry { page_no: child_no, parent_key: Some(routing_key) });
            current = child_no;
        }

        let (left, right) = if with_siblings {
            (
                self.resolve_sibling(left_stack, Side::Left)?,
                self.resolve_sibling(right_stack, Side::Right)?,
            )
        } else {
            (INVALID_PAGE, INVALID_PAGE)
        };

        Ok(Some(Descent { path, left, right }))
    }

    /// Resolves a leaf neighbour from a spill stack: pop levels where the
    /// taken route was already the outermost child, then descend back down
    /// along the inner edge.
    fn resolve_sibling(&mut self, mut stack: Vec<PageId>, side: Side) -> Result<PageId> {
        let mut levels_up = 0usize;
        while stack.last() == Some(&INVALID_PAGE) {
            stack.pop();
            levels_up += 1;
        }
        let Some(&top) = stack.last() else {
            return Ok(INVALID_PAGE);
        };

        let mut pgno = top;
        for _ in 0..levels_up {
            let page = self.node(pgno)?;
            let entry = match side {
                Side::Right => page.first_entry(),
                Side::Left => page.last_entry(),
            };
            pgno = entry
                .ok_or_else(|| Error::Corrupted {
                    reason: format!("branch page {pgno} has no entries"),
                })?
                .1
                .overflow_page;
        }
        Ok(pgno)
    }

    // ── copy-on-write ──────────────────────────────────────────────────

    /// Makes a node page writable. Dirty pages are returned as-is; pages
    /// from the current (uncommitted) epoch are marked dirty in place;
    /// anything older is copied to a freshly allocated page with the
    /// original prepended to its history, and the parent's child pointer
    /// is redirected. Returns the page number to use from now on.
    pub(crate) fn touch_node(
        &mut self,
        pgno: PageId,
        parent: Option<(PageId, &NodeKey)>,
    ) -> Result<PageId> {
        let mut page = self.take_node(pgno)?;
        if page.dirty {
            self.put_node(page);
            return Ok(pgno);
        }

        self.collect_history(&mut page);

        if page.sync_id > self.last_synced_id {
            // Never promoted to a durable marker; safe to rewrite in place.
            self.mark_dirty(&mut page);
            self.put_node(page);
            return Ok(pgno);
        }

        let old_no = page.number;
        let old_sync = page.sync_id;
        self.put_node(page.clone());

        let new_no = self.allocate_page_no();
        self.cache.remove(new_no);
        trace!(from = old_no, to = new_no, "touch");

        page.number = new_no;
        page.sync_id = self.last_synced_id + 1;
        match page.kind {
            PageType::Branch => self.stats.branch_pages += 1,
            _ => self.stats.leaf_pages += 1,
        }
        self.add_history_node(&mut page, HistoryNode { page_no: old_no, sync_id: old_sync });
        self.mark_dirty(&mut page);
        self.put_node(page);

        if let Some((parent_no, parent_key)) = parent {
            let mut parent_page = self.take_node(parent_no)?;
            debug_assert!(parent_page.dirty);
            if let Some(value) = parent_page.entries.get_mut(parent_key) {
                value.overflow_page = new_no;
            }
            self.put_node(parent_page);
        }

        Ok(new_no)
    }

    /// Reclaims history entries that no live marker can reference anymore.
    /// Entries from the current epoch are always collectible (never made
    /// durable); entries older than the last sync are collectible except
    /// for the newest one at the last-synced epoch, which is the on-disk
    /// version a reader of the previous snapshot still reaches.
    fn collect_history(&mut self, page: &mut NodePage) {
        if self.marker.meta.sync_id == 0 {
            return;
        }
        let last = self.last_synced_id;
        let mut can_collect = page.sync_id <= last;

        let history = std::mem::take(&mut page.history);
        for hn in history {
            if hn.sync_id != last {
                if can_collect || hn.sync_id > last {
                    self.tracker.free_now(hn.page_no);
                    if self.cache.contains(hn.page_no) && !self.dirty.contains(&hn.page_no) {
                        self.cache.remove(hn.page_no);
                    }
                    continue;
                }
                can_collect = true;
            }
            page.history.push(hn);
        }
    }

    /// Prepends a history node, or spills the page's entire history into
    /// the transaction's residue set when there is no room left for one.
    fn add_history_node(&mut self, page: &mut NodePage, hn: HistoryNode) {
        if self.space_left_of(page) >= HISTORY_NODE_SIZE {
            page.history.insert(0, hn);
        } else {
            for old in page.history.drain(..) {
                self.tracker.defer(old.page_no);
            }
            self.tracker.defer(hn.page_no);
        }
    }

    /// Retires a page that left the tree. Pages (and history entries) from
    /// the current epoch are immediately reusable; older ones must survive
    /// as residue until the next sync.
    fn remove_from_tree(&mut self, page: NodePage) {
        if page.sync_id > self.last_synced_id {
            self.tracker.free_now(page.number);
        } else {
            self.tracker.defer(page.number);
        }
        for hn in &page.history {
            if hn.sync_id > self.last_synced_id {
                self.tracker.free_now(hn.page_no);
            } else {
                self.tracker.defer(hn.page_no);
            }
        }
        self.dirty.remove(&page.number);
        self.cache.remove(page.number);
    }

    // ── node record helpers ────────────────────────────────────────────

    /// Inserts a record, spilling a large leaf value into a fresh overflow
    /// chain. Values arriving from split/merge/move redistribution carry
    /// their overflow flag and chain head and are inserted as-is.
    fn insert_node(&mut self, page: &mut NodePage, key: NodeKey, value: NodeValue) -> Result<()> {
        debug_assert!(page.dirty);
        let value = if page.is_leaf() && !value.is_spilled() && self.causes_overflow(value.data.len())
        {
            let head = self.put_data_on_overflow(&value.data)?;
            NodeValue::spilled(head)
        } else {
            value
        };
        page.insert_entry(key, value);
        Ok(())
    }

    /// Removes a record. Unless this is a transfer between siblings, a
    /// spilled value's whole chain is handed to the free-page tracker.
    fn remove_node(
        &mut self,
        page: &mut NodePage,
        key: &NodeKey,
        is_transfer: bool,
    ) -> Result<Option<NodeValue>> {
        debug_assert!(page.dirty);
        let Some(value) = page.remove_entry(key) else {
            return Ok(None);
        };
        if value.is_spilled() && !is_transfer {
            self.free_overflow_chain(value.overflow_page)?;
        }
        Ok(Some(value))
    }

    // ── overflow chains ────────────────────────────────────────────────

    /// Writes `data` into a new overflow chain through the dirty set,
    /// returning the chain head.
    pub(crate) fn put_data_on_overflow(&mut self, data: &[u8]) -> Result<PageId> {
        let capacity = crate::page::overflow::OverflowPage::capacity(self.page_size_usize());
        let mut head = INVALID_PAGE;
        let mut prev = INVALID_PAGE;
        for chunk in data.chunks(capacity) {
            let mut link = self.new_overflow_page();
            link.data = chunk.to_vec();
            let pgno = link.number;
            self.put_overflow(link);
            if head == INVALID_PAGE {
                head = pgno;
            } else {
                match self.cache.get_mut(prev) {
                    Some(crate::page::Page::Overflow(p)) => p.next = pgno,
                    _ => {
                        return Err(Error::Corrupted {
                            reason: "overflow chain link vanished while writing".to_string(),
                        })
                    }
                }
            }
            prev = pgno;
        }
        Ok(head)
    }

    /// Reads a whole chain's payload.
    pub(crate) fn read_overflow_data(&mut self, head: PageId) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut next = head;
        while next != INVALID_PAGE {
            let link = self.overflow(next)?;
            data.extend_from_slice(&link.data);
            next = link.next;
        }
        Ok(data)
    }

    /// Collects a chain's page numbers.
    pub(crate) fn overflow_page_numbers(&mut self, head: PageId) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut next = head;
        while next != INVALID_PAGE {
            let link = self.overflow(next)?;
            pages.push(next);
            next = link.next;
        }
        Ok(pages)
    }

    /// Frees every page of a chain: links written by the current
    /// transaction are reusable immediately, anything older defers to the
    /// residue set.
    fn free_overflow_chain(&mut self, head: PageId) -> Result<()> {
        for pgno in self.overflow_page_numbers(head)? {
            self.cache.remove(pgno);
            if self.dirty.remove(&pgno) {
                self.tracker.free_now(pgno);
            } else {
                self.tracker.defer(pgno);
            }
        }
        Ok(())
    }

    /// Materializes a leaf value, walking its chain when spilled.
    pub(crate) fn value_bytes(&mut self, value: &NodeValue) -> Result<Vec<u8>> {
        if value.is_spilled() {
            self.read_overflow_data(value.overflow_page)
        } else {
            Ok(value.data.clone())
        }
    }

    // ── point operations ───────────────────────────────────────────────

    pub(crate) fn get(&mut self, root: PageId, key_bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        if root == INVALID_PAGE || key_bytes.is_empty() {
            return Ok(None);
        }
        let key = self.key(key_bytes);
        let mut root = root;
        let Some(descent) = self.search(&mut root, SearchTarget::Key(&key), false, false)? else {
            return Ok(None);
        };
        let leaf = self.node(descent.leaf())?;
        let result = match leaf.entries.get(&key) {
            Some(value) => Some(self.value_bytes(value)?),
            None => None,
        };
        self.cache.prune();
        Ok(result)
    }

    pub(crate) fn put(&mut self, root: &mut PageId, key_bytes: &[u8], value: &[u8]) -> Result<()> {
        self.check_put_key(key_bytes)?;
        let key = self.key(key_bytes);

        if *root == INVALID_PAGE {
            let leaf = self.new_node_page(PageType::Leaf);
            *root = leaf.number;
            self.put_node(leaf);
        }

        let descent = self
            .search(root, SearchTarget::Key(&key), true, false)?
            .ok_or_else(|| Error::Corrupted { reason: "put lost the tree root".to_string() })?;

        let mut leaf = self.take_node(descent.leaf())?;
        if leaf.entries.contains_key(&key) {
            self.remove_node(&mut leaf, &key, false)?;
            self.stats.entries = self.stats.entries.saturating_sub(1);
        }

        let inline_len = if self.causes_overflow(value.len()) { 0 } else { value.len() };
        let needed = node::space_needed(key.data.len(), inline_len);
        let fits = needed <= self.space_left_of(&leaf);

        if fits {
            self.insert_node(&mut leaf, key, NodeValue::inline(value.to_vec()))?;
            self.put_node(leaf);
        } else {
            self.put_node(leaf);
            self.split(&descent.path, root, key, NodeValue::inline(value.to_vec()))?;
        }

        self.stats.entries += 1;
        self.cache.prune();
        Ok(())
    }

    pub(crate) fn del(&mut self, root: &mut PageId, key_bytes: &[u8]) -> Result<bool> {
        if *root == INVALID_PAGE || key_bytes.is_empty() {
            return Ok(false);
        }
        let key = self.key(key_bytes);
        let Some(descent) = self.search(root, SearchTarget::Key(&key), true, false)? else {
            return Ok(false);
        };

        let mut leaf = self.take_node(descent.leaf())?;
        let existed = self.remove_node(&mut leaf, &key, false)?.is_some();
        self.put_node(leaf);

        if existed {
            self.stats.entries = self.stats.entries.saturating_sub(1);
            self.rebalance(&descent.path, root)?;
        }
        self.cache.prune();
        Ok(existed)
    }

    // ── split ──────────────────────────────────────────────────────────

    /// Splits the page at the end of `path` to make room for `(key,
    /// value)`. Creates a new right sibling, promotes a separator into the
    /// parent (splitting the parent recursively when it is full), and
    /// grows the tree by a new root when the split page was the root.
    fn split(
        &mut self,
        path: &[PathEntry],
        root: &mut PageId,
        key: NodeKey,
        value: NodeValue,
    ) -> Result<()> {
        let page_no = path.last().expect("split of empty path").page_no;
        let mut left = self.take_node(page_no)?;
        debug_assert!(left.dirty);

        // Make sure there is a parent to promote the separator into.
        let parent_path: Vec<PathEntry>;
        let parent_no: PageId;
        if path.len() == 1 {
            let mut new_root = self.new_node_page(PageType::Branch);
            parent_no = new_root.number;
            new_root.insert_entry(NodeKey::lowest(self.cmp), NodeValue::child(left.number));
            self.put_node(new_root);
            *root = parent_no;
            self.stats.depth += 1;
            trace!(new_root = parent_no, "tree grew a level");
            parent_path = vec![PathEntry { page_no: parent_no, parent_key: None }];
        } else {
            parent_no = path[path.len() - 2].page_no;
            parent_path = path[..path.len() - 1].to_vec();
        }

        let mut right = self.new_node_page(left.kind);
        let right_no = right.number;

        // Work on a scratch copy holding the would-be contents; the left
        // page keeps only its history.
        let mut copy = left.clone();
        left.entries.clear();
        left.lower = 0;
        left.upper = 0;

        self.insert_node(&mut copy, key, value)?;

        let n = copy.entries.len();
        if n < 2 {
            return Err(Error::Corrupted {
                reason: format!("page {page_no} cannot hold a single legal entry"),
            });
        }
        let split_index = if copy.kind == PageType::Branch {
            // Branches hold only routing keys; a midpoint split is fine.
            n / 2 + 1
        } else {
            // Walk until the accumulated record space crosses half the
            // page, shifted down by half the overflow threshold.
            let threshold = (left.capacity(self.page_size_usize()) / 2)
                .saturating_sub(self.spec.overflow_threshold as usize / 2);
            let mut used = 0usize;
            let mut index = 0usize;
            for (k, v) in &copy.entries {
                if used >= threshold {
                    break;
                }
                used += node::space_needed(k.data.len(), v.data.len());
                index += 1;
            }
            index
        }
        .clamp(1, n - 1);

        let split_key = copy
            .entries
            .iter()
            .nth(split_index)
            .expect("split index within entries")
            .0
            .clone();
        let split_value = NodeValue::child(right_no);

        // Promote the separator. A full parent splits first and the
        // recursion places the separator into whichever half covers it.
        let parent = self.node(parent_no)?;
        if node::space_needed(split_key.data.len(), 0) >= self.space_left_of(&parent) {
            self.split(&parent_path, root, split_key, split_value)?;
        } else {
            let mut parent = self.take_node(parent_no)?;
            parent.insert_entry(split_key, split_value);
            self.put_node(parent);
        }

        // Redistribute the scratch copy. Values keep their shape (inline
        // or chain head), so no chain is rewritten here.
        for (index, (k, v)) in copy.entries.into_iter().enumerate() {
            if index < split_index {
                left.insert_entry(k, v);
            } else {
                right.insert_entry(k, v);
            }
        }

        self.put_node(left);
        self.put_node(right);
        Ok(())
    }

    // ── rebalance ──────────────────────────────────────────────────────

    /// Restores the fill invariant after a delete at the end of `path`.
    fn rebalance(&mut self, path: &[PathEntry], root: &mut PageId) -> Result<()> {
        let page_no = path.last().expect("rebalance of empty path").page_no;
        let page = self.node(page_no)?;

        if self.full_enough(&page) {
            return Ok(());
        }

        if path.len() == 1 {
            return self.rebalance_root(page, root);
        }

        let parent_no = path[path.len() - 2].page_no;
        let page_key = path
            .last()
            .and_then(|e| e.parent_key.clone())
            .ok_or_else(|| Error::Corrupted { reason: "non-root page without parent key".into() })?;
        let parent = self.node(parent_no)?;
        if parent.entries.len() < 2 {
            return Err(Error::Corrupted {
                reason: format!("branch page {parent_no} underflowed its children"),
            });
        }

        // Prefer the left neighbour; the leftmost child takes its right.
        let page_is_first = parent.first_entry().map(|(k, _)| k == &page_key).unwrap_or(false);
        let (neighbour_key, neighbour_no) = if page_is_first {
            let (k, v) = parent
                .entries
                .range((Bound::Excluded(&page_key), Bound::Unbounded))
                .next()
                .ok_or_else(|| Error::Corrupted { reason: "missing right neighbour".into() })?;
            (k.clone(), v.overflow_page)
        } else {
            let (k, v) = parent
                .entries
                .range((Bound::Unbounded, Bound::Excluded(&page_key)))
                .next_back()
                .ok_or_else(|| Error::Corrupted { reason: "missing left neighbour".into() })?;
            (k.clone(), v.overflow_page)
        };

        let neighbour = self.node(neighbour_no)?;
        let (source_key, source_value) = match if page_is_first {
            neighbour.first_entry()
        } else {
            neighbour.last_entry()
        } {
            Some((k, v)) => (k.clone(), v.clone()),
            None => (NodeKey::lowest(self.cmp), NodeValue::inline(Vec::new())),
        };

        let can_borrow = self.full_enough(&neighbour)
            && neighbour.entries.len() > 2
            && page.has_space_for(self.page_size_usize(), &source_key, &source_value);

        // Moving an entry can force a separator rewrite in the parent; the
        // replacement key may be larger than the one it replaces, so make
        // sure the parent can absorb the difference on either side.
        let mut can_update = true;
        if can_borrow {
            let parent_first_key =
                parent.first_entry().map(|(k, _)| k.clone()).expect("parent non-empty");
            let parent_space = self.space_left_of(&parent);

            if page_is_first && neighbour_key != parent_first_key {
                // Taking the right neighbour's first entry rewrites the
                // neighbour's separator.
                if source_key.data.len() > neighbour_key.data.len() {
                    let diff = source_key.data.len() - neighbour_key.data.len();
                    if diff > parent_space {
                        can_update = false;
                    }
                }
            }
            if can_update && !page_is_first {
                // Taking the left neighbour's last entry gives this page a
                // new smallest key, rewriting its own separator.
                if source_key.data.len() > page_key.data.len() {
                    let diff = source_key.data.len() - page_key.data.len();
                    if diff > parent_space {
                        can_update = false;
                    }
                }
            }
        }

        if can_borrow && can_update {
            return self.move_node(
                neighbour_no,
                neighbour_key,
                page_no,
                page_key,
                parent_no,
                source_key,
                source_value,
            );
        }

        // Merge the smaller side into the larger. The space reservation
        // accounts for the survivor later absorbing a history node for
        // each incarnation the merge drops, plus one for its own touch.
        let history_slack =
            |p: &NodePage| HISTORY_NODE_SIZE * (p.history.len() + 1);
        if self.space_left_of(&page) >= neighbour.space_used() + history_slack(&neighbour) {
            self.merge_pages(neighbour_no, neighbour_key, page_no, page_key, parent_no, path, root)
        } else if self.space_left_of(&neighbour) >= page.space_used() + history_slack(&page) {
            self.merge_pages(page_no, page_key, neighbour_no, neighbour_key, parent_no, path, root)
        } else {
            // Neither side can absorb the other; leave the page underfull.
            Ok(())
        }
    }

    /// Root-specific rebalancing: an empty leaf root empties the tree, a
    /// single-child branch root collapses one level.
    fn rebalance_root(&mut self, page: NodePage, root: &mut PageId) -> Result<()> {
        if page.is_leaf() && page.entries.is_empty() {
            trace!("tree emptied");
            *root = INVALID_PAGE;
            let page = self.take_node(page.number)?;
            self.remove_from_tree(page);
            return Ok(());
        }

        if !page.is_leaf() && page.entries.len() == 1 {
            let child_no =
                page.first_entry().expect("single-entry branch").1.overflow_page;
            let old_root = self.take_node(page.number)?;
            self.remove_from_tree(old_root);
            *root = child_no;
            self.stats.depth = self.stats.depth.saturating_sub(1);
            trace!(new_root = child_no, "tree lost a level");

            // A promoted branch becomes the root and must carry the −∞
            // routing key so every search finds a route.
            let child = self.node(child_no)?;
            if !child.is_leaf() {
                let first_key = child.first_entry().expect("branch non-empty").0.clone();
                if !first_key.is_lowest() {
                    let new_no = self.touch_node(child_no, None)?;
                    *root = new_no;
                    let mut child = self.take_node(new_no)?;
                    let value = child
                        .remove_entry(&first_key)
                        .expect("first key present");
                    child.insert_entry(NodeKey::lowest(self.cmp), value);
                    self.put_node(child);
                }
            }
        }

        Ok(())
    }

    /// Transfers one entry between siblings sharing `parent_no`, rewriting
    /// whichever separators the transfer invalidates.
    #[allow(clippy::too_many_arguments)]
    fn move_node(
        &mut self,
        src_no: PageId,
        src_key: NodeKey,
        dst_no: PageId,
        dst_key: NodeKey,
        parent_no: PageId,
        entry_key: NodeKey,
        entry_value: NodeValue,
    ) -> Result<()> {
        let src_no = self.touch_node(src_no, Some((parent_no, &src_key)))?;
        let dst_no = self.touch_node(dst_no, Some((parent_no, &dst_key)))?;
        let descending = src_key > dst_key;

        let mut dst = self.take_node(dst_no)?;
        self.insert_node(&mut dst, entry_key.clone(), entry_value)?;
        self.put_node(dst);

        if dst_key > entry_key {
            // The destination acquired a key below its separator.
            let lowest = self.find_lowest_key(dst_no)?;
            let mut parent = self.take_node(parent_no)?;
            parent.remove_entry(&dst_key);
            parent.insert_entry(lowest, NodeValue::child(dst_no));
            self.put_node(parent);
        }

        let mut src = self.take_node(src_no)?;
        self.remove_node(&mut src, &entry_key, true)?;
        self.put_node(src);

        if src_key <= entry_key && descending {
            // The source lost its first key.
            debug_assert!(!src_key.is_lowest());
            let lowest = self.find_lowest_key(src_no)?;
            let mut parent = self.take_node(parent_no)?;
            parent.remove_entry(&src_key);
            parent.insert_entry(lowest, NodeValue::child(src_no));
            self.put_node(parent);
        }

        Ok(())
    }

    /// The smallest key reachable from `start` (descends first children).
    fn find_lowest_key(&mut self, start: PageId) -> Result<NodeKey> {
        let mut pgno = start;
        loop {
            let page = self.node(pgno)?;
            let (key, value) = page
                .first_entry()
                .ok_or_else(|| Error::Corrupted { reason: format!("page {pgno} is empty") })?;
            if page.is_leaf() {
                return Ok(key.clone());
            }
            pgno = value.overflow_page;
        }
    }

    /// Merges `src` into `dst` (children of `parent_no`), removes the
    /// obsolete separator, retires the source page, and rebalances the
    /// parent.
    #[allow(clippy::too_many_arguments)]
    fn merge_pages(
        &mut self,
        src_no: PageId,
        src_key: NodeKey,
        dst_no: PageId,
        dst_key: NodeKey,
        parent_no: PageId,
        path: &[PathEntry],
        root: &mut PageId,
    ) -> Result<()> {
        // Only the destination mutates; the source is dropped wholesale.
        let dst_no = self.touch_node(dst_no, Some((parent_no, &dst_key)))?;

        let src = self.take_node(src_no)?;
        let mut dst = self.take_node(dst_no)?;
        for (key, value) in src.entries.iter() {
            dst.insert_entry(key.clone(), value.clone());
        }
        if src.flags & node::OVERFLOW != 0 {
            dst.flags |= node::OVERFLOW;
        }
        self.put_node(dst);

        let mut parent = self.take_node(parent_no)?;
        if src_key > dst_key {
            // Higher-keyed page folds downward: its separator just goes.
            parent.remove_entry(&src_key);
        } else {
            // Lower-keyed page folds upward: the survivor takes over the
            // source's (smaller) separator.
            parent.remove_entry(&dst_key);
            parent.remove_entry(&src_key);
            parent.insert_entry(src_key.clone(), NodeValue::child(dst_no));
        }
        self.put_node(parent);

        self.remove_from_tree(src);

        self.rebalance(&path[..path.len() - 1], root)
    }

    // ── cursor stepping ────────────────────────────────────────────────

    fn hit_from(
        &mut self,
        leaf: &NodePage,
        key: &NodeKey,
        value: &NodeValue,
    ) -> Result<CursorHit> {
        let index = leaf
            .entries
            .range((Bound::Unbounded, Bound::Excluded(key)))
            .count();
        Ok(CursorHit {
            key: key.data.clone(),
            value: self.value_bytes(value)?,
            leaf: leaf.number,
            index,
        })
    }

    pub(crate) fn cursor_first(&mut self, root: PageId) -> Result<Option<CursorHit>> {
        let mut root = root;
        let Some(descent) = self.search(&mut root, SearchTarget::First, false, false)? else {
            return Ok(None);
        };
        let leaf = self.node(descent.leaf())?;
        let hit = match leaf.first_entry() {
            Some((key, value)) => {
                let (key, value) = (key.clone(), value.clone());
                Some(self.hit_from(&leaf, &key, &value)?)
            }
            None => None,
        };
        self.cache.prune();
        Ok(hit)
    }

    pub(crate) fn cursor_last(&mut self, root: PageId) -> Result<Option<CursorHit>> {
        let mut root = root;
        let Some(descent) = self.search(&mut root, SearchTarget::Last, false, false)? else {
            return Ok(None);
        };
        let leaf = self.node(descent.leaf())?;
        let hit = match leaf.last_entry() {
            Some((key, value)) => {
                let (key, value) = (key.clone(), value.clone());
                Some(self.hit_from(&leaf, &key, &value)?)
            }
            None => None,
        };
        self.cache.prune();
        Ok(hit)
    }

    /// Steps to the first key strictly greater than `held`, crossing into
    /// the right sibling when the current leaf is exhausted.
    pub(crate) fn cursor_next(&mut self, root: PageId, held: &[u8]) -> Result<Option<CursorHit>> {
        let key = self.key(held);
        let mut root = root;
        let Some(descent) = self.search(&mut root, SearchTarget::Key(&key), false, true)? else {
            return Ok(None);
        };

        let leaf = self.node(descent.leaf())?;
        let successor = leaf
            .entries
            .range((Bound::Excluded(&key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));

        let hit = if let Some((k, v)) = successor {
            Some(self.hit_from(&leaf, &k, &v)?)
        } else if descent.right != INVALID_PAGE {
            let right = self.node(descent.right)?;
            match right.first_entry() {
                Some((k, v)) => {
                    let (k, v) = (k.clone(), v.clone());
                    Some(self.hit_from(&right, &k, &v)?)
                }
                None => None,
            }
        } else {
            None
        };
        self.cache.prune();
        Ok(hit)
    }

    /// Steps to the last key strictly less than `held`, crossing into the
    /// left sibling when needed.
    pub(crate) fn cursor_prev(&mut self, root: PageId, held: &[u8]) -> Result<Option<CursorHit>> {
        let key = self.key(held);
        let mut root = root;
        let Some(descent) = self.search(&mut root, SearchTarget::Key(&key), false, true)? else {
            return Ok(None);
        };

        let leaf = self.node(descent.leaf())?;
        let predecessor = leaf
            .entries
            .range((Bound::Unbounded, Bound::Excluded(&key)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));

        let hit = if let Some((k, v)) = predecessor {
            Some(self.hit_from(&leaf, &k, &v)?)
        } else if descent.left != INVALID_PAGE {
            let left = self.node(descent.left)?;
            match left.last_entry() {
                Some((k, v)) => {
                    let (k, v) = (k.clone(), v.clone());
                    Some(self.hit_from(&left, &k, &v)?)
                }
                None => None,
            }
        } else {
            None
        };
        self.cache.prune();
        Ok(hit)
    }

    /// Positions at `target` exactly, or (when `exact` is false) at the
    /// least key greater than or equal to it, crossing to the right
    /// sibling when needed.
    pub(crate) fn cursor_seek(
        &mut self,
        root: PageId,
        target: &[u8],
        exact: bool,
    ) -> Result<Option<CursorHit>> {
        if target.is_empty() {
            return Err(Error::EmptyKey);
        }
        let key = self.key(target);
        let mut root = root;
        let Some(descent) = self.search(&mut root, SearchTarget::Key(&key), false, true)? else {
            return Ok(None);
        };

        let leaf = self.node(descent.leaf())?;
        let hit = if let Some(value) = leaf.entries.get(&key) {
            let value = value.clone();
            Some(self.hit_from(&leaf, &key, &value)?)
        } else if !exact {
            let at_or_after = leaf
                .entries
                .range((Bound::Included(&key), Bound::Unbounded))
                .next()
                .map(|(k, v)| (k.clone(), v.clone()));
            match at_or_after {
                Some((k, v)) => Some(self.hit_from(&leaf, &k, &v)?),
                None if descent.right != INVALID_PAGE => {
                    let right = self.node(descent.right)?;
                    match right.first_entry() {
                        Some((k, v)) => {
                            let (k, v) = (k.clone(), v.clone());
                            Some(self.hit_from(&right, &k, &v)?)
                        }
                        None => None,
                    }
                }
                None => None,
            }
        } else {
            None
        };
        self.cache.prune();
        Ok(hit)
    }
}
