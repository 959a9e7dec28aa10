//! Error types for the vellum storage engine.

use std::io;

use snafu::Snafu;

/// Page identifier type. Page `n` lives at byte offset `n * page_size`.
pub type PageId = u32;

/// Result type alias for vellum operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during storage engine operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying file.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Page checksum verification failed, or the page number echoed in the
    /// header does not match the requested page.
    #[snafu(display("Page {page_no} checksum mismatch"))]
    Checksum {
        /// The page whose integrity check failed.
        page_no: PageId,
    },

    /// The spec page carries an unknown magic/version word.
    #[snafu(display("Unsupported file version: {version:#x}"))]
    Version {
        /// The version word found on the spec page.
        version: u32,
    },

    /// Key exceeds the key-size limit recorded on the spec page.
    #[snafu(display("Key too large: {size} bytes (max {max})"))]
    KeyTooLarge {
        /// Actual size of the key in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Empty keys are reserved for internal routing and rejected at the
    /// public interface.
    #[snafu(display("Empty keys are not permitted"))]
    EmptyKey,

    /// Write attempted through a read-only transaction or database.
    #[snafu(display("Database is read-only"))]
    ReadOnly,

    /// A write transaction is already active (here or in another process).
    #[snafu(display("Write transaction already in progress"))]
    WriterBusy,

    /// The file is structurally damaged beyond a single page checksum.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// The operation is documented but not implemented.
    #[snafu(display("Unsupported operation: {what}"))]
    Unsupported {
        /// The operation that was requested.
        what: &'static str,
    },
}

// Automatic conversion from io::Error for ergonomic ? usage
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}
