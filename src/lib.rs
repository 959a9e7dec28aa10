//! vellum: a single-file embedded ordered key-value store.
//!
//! vellum persists an ordered map from opaque byte keys to opaque byte
//! values in one file, built around a copy-on-write B+-tree with durable,
//! crash-safe commits:
//!
//! - **Copy-on-write**: modifying a node produces a new page; the old page
//!   stays live until no recoverable marker can reach it. Aborting a
//!   transaction is always safe and leaves zero on-disk mutation.
//! - **Dual-sync + dual-working markers**: each commit writes a working
//!   marker (ping/pong, alternating by revision parity); `sync` promotes
//!   the current working marker to the two sync slots with two fsyncs.
//!   Open picks the newest recoverable marker, falling back across
//!   corrupted slots.
//! - **Overflow chains** carry values up to many megabytes without
//!   disturbing node layout.
//! - **Snapshot reads**: read transactions pin the marker they started
//!   with; a single writer runs concurrently, excluded across processes by
//!   an advisory file lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            Database / Transaction            │
//! │   (open, put/get/remove, commit, cursors)    │
//! └────────────────────┬─────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────┐
//! │                 Tree engine                  │
//! │ (search, CoW touch, split, rebalance, merge) │
//! └────────────────────┬─────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────┐
//! │     Page cache · free tracker · markers      │
//! └────────────────────┬─────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────┐
//! │        Pager (pread/pwrite + CRC-32)         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use vellum::{Database, OpenMode, TransactionKind};
//!
//! let db = Database::open("data.vlm", OpenMode::ReadWrite)?;
//!
//! let txn = db.begin_transaction(TransactionKind::ReadWrite)?;
//! txn.put(b"key", b"value")?;
//! txn.commit(1)?;
//! db.sync()?;
//!
//! let txn = db.begin_transaction(TransactionKind::ReadOnly)?;
//! assert_eq!(txn.get(b"key")?, Some(b"value".to_vec()));
//! # Ok::<(), vellum::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// B+-tree mutation paths thread several coordinates (page, separator,
// parent) through helper calls.
#![allow(clippy::type_complexity)]
// Slice-narrowing conversions in the serializers operate on pre-validated
// sizes.
#![allow(clippy::manual_range_contains)]

pub mod cache;
pub mod config;
pub mod cursor;
pub mod error;
pub mod page;
pub mod pager;
pub mod tracker;
pub mod transaction;
pub mod tree;

// Re-export the public surface.
pub use config::Config;
pub use cursor::Cursor;
pub use error::{Error, PageId, Result};
pub use page::node::CompareFn;
pub use pager::OpenMode;
pub use transaction::{Transaction, TransactionKind};
pub use tree::{Database, IntegrityReport, Stats};

/// Engine version, independent of the on-disk format word.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
