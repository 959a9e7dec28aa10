//! Structural integrity verification.
//!
//! Walks the current marker's tree re-reading every page from disk (so the
//! checksums are exercised, not just the cache) and checks the invariants
//! the engine promises: slotted-space bounds, strict in-node key ordering,
//! key-range containment between branches and their children, uniform leaf
//! depth, readable overflow chains, and disjointness of the residue set
//! from the reachable page set.

use std::collections::BTreeSet;

use crate::error::{PageId, Result};
use crate::page::node::{NodeKey, NodePage};
use crate::page::{Page, INVALID_PAGE};

use super::Engine;

/// Outcome of an integrity walk.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Pages visited.
    pub pages_checked: u64,
    /// Human-readable descriptions of every violation found.
    pub errors: Vec<String>,
}

impl IntegrityReport {
    /// Whether the walk found no violations.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Engine {
    /// Verifies the tree reachable from the current marker.
    pub(crate) fn verify_integrity(&mut self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let root = self.marker.meta.root;
        if root == INVALID_PAGE {
            return Ok(report);
        }

        let mut reachable = BTreeSet::new();
        let mut leaf_depths = BTreeSet::new();
        self.verify_subtree(root, None, None, 0, &mut reachable, &mut leaf_depths, &mut report)?;

        if leaf_depths.len() > 1 {
            report.errors.push(format!("leaves at differing depths: {leaf_depths:?}"));
        }

        for pgno in &self.marker.residue {
            if reachable.contains(pgno) {
                report
                    .errors
                    .push(format!("residue page {pgno} is reachable from the current root"));
            }
        }

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_subtree(
        &mut self,
        pgno: PageId,
        lower: Option<&NodeKey>,
        upper: Option<&NodeKey>,
        depth: u32,
        reachable: &mut BTreeSet<PageId>,
        leaf_depths: &mut BTreeSet<u32>,
        report: &mut IntegrityReport,
    ) -> Result<()> {
        if !reachable.insert(pgno) {
            report.errors.push(format!("page {pgno} reachable twice"));
            return Ok(());
        }
        report.pages_checked += 1;

        // Bypass the cache unless the page is dirty (dirty pages have no
        // on-disk incarnation yet).
        let page: NodePage = if self.dirty.contains(&pgno) {
            self.node(pgno)?
        } else {
            match self.pager.read_page(pgno) {
                Ok(buf) => match Page::deserialize(&buf, self.cmp) {
                    Ok(Page::Node(node)) => node,
                    Ok(_) => {
                        report.errors.push(format!("page {pgno} is not a node page"));
                        return Ok(());
                    }
                    Err(e) => {
                        report.errors.push(format!("page {pgno} undecodable: {e}"));
                        return Ok(());
                    }
                },
                Err(e) => {
                    report.errors.push(format!("page {pgno} unreadable: {e}"));
                    return Ok(());
                }
            }
        };

        let page_size = self.spec.page_size as usize;
        if page.space_used() > page.capacity(page_size) {
            report.errors.push(format!(
                "page {pgno} overfull: {} used of {}",
                page.space_used(),
                page.capacity(page_size)
            ));
        }

        // BTreeMap iteration is ordered by construction; what needs
        // checking is containment in the parent's key range.
        for key in page.entries.keys() {
            if page.is_leaf() && key.data.is_empty() {
                report.errors.push(format!("leaf page {pgno} holds an empty key"));
            }
            if let Some(lower) = lower {
                if key < lower {
                    report
                        .errors
                        .push(format!("page {pgno} key below its routing key: {key:?}"));
                }
            }
            if let Some(upper) = upper {
                if key >= upper {
                    report
                        .errors
                        .push(format!("page {pgno} key at or above its sibling bound: {key:?}"));
                }
            }
        }

        if page.is_leaf() {
            leaf_depths.insert(depth);
            for (key, value) in page.entries.clone() {
                if value.is_spilled() {
                    match self.overflow_page_numbers(value.overflow_page) {
                        Ok(pages) => {
                            for chain_pgno in pages {
                                if !reachable.insert(chain_pgno) {
                                    report.errors.push(format!(
                                        "overflow page {chain_pgno} reachable twice"
                                    ));
                                }
                            }
                        }
                        Err(e) => report.errors.push(format!(
                            "leaf {pgno} key {key:?}: overflow chain unreadable: {e}"
                        )),
                    }
                }
            }
            return Ok(());
        }

        let children: Vec<(NodeKey, Option<NodeKey>, PageId)> = {
            let mut out = Vec::with_capacity(page.entries.len());
            let mut iter = page.entries.iter().peekable();
            while let Some((key, value)) = iter.next() {
                let next_key = iter.peek().map(|(k, _)| (*k).clone());
                out.push((key.clone(), next_key, value.overflow_page));
            }
            out
        };

        for (child_lower, child_upper, child) in children {
            // The empty routing key is −∞: no lower bound for that child.
            let lower_bound =
                if child_lower.is_lowest() { None } else { Some(&child_lower) };
            self.verify_subtree(
                child,
                lower_bound,
                child_upper.as_ref(),
                depth + 1,
                reachable,
                leaf_depths,
                report,
            )?;
        }

        Ok(())
    }
}
