//! On-disk page formats.
//!
//! Every page in the file is a fixed-size block beginning with a 16-byte
//! [`PageInfo`] header. The page number recorded in the header always equals
//! the page's byte offset divided by the page size, and the checksum word
//! covers a page-type-specific range so that partially used regions (the
//! free gap of a slotted node page, the unused tail of a marker) never
//! contribute.
//!
//! Layout of the first five pages is fixed:
//!
//! | page | contents                        |
//! |------|---------------------------------|
//! | 0    | spec page (version, page size)  |
//! | 1    | sync marker A                   |
//! | 2    | sync marker B                   |
//! | 3    | working marker "ping"           |
//! | 4    | working marker "pong"           |
//!
//! All further pages are branch, leaf, or overflow pages.

pub mod marker;
pub mod node;
pub mod overflow;

use crate::error::{Error, PageId, Result};

/// Sentinel for "no page".
pub const INVALID_PAGE: PageId = PageId::MAX;

/// Size of the common page header.
pub const PAGE_INFO_SIZE: usize = 16;

/// The spec page number.
pub const SPEC_PAGE: PageId = 0;
/// First sync marker page.
pub const SYNC_A_PAGE: PageId = 1;
/// Second sync marker page.
pub const SYNC_B_PAGE: PageId = 2;
/// Working marker written on commits with even revision.
pub const PING_PAGE: PageId = 3;
/// Working marker written on commits with odd revision.
pub const PONG_PAGE: PageId = 4;
/// First page available to the tree.
pub const FIRST_DATA_PAGE: PageId = 5;

/// Page type discriminant stored in [`PageInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageType {
    /// File spec page (page 0).
    Spec = 1,
    /// Sync or working marker.
    Marker = 2,
    /// B+-tree internal node.
    Branch = 3,
    /// B+-tree leaf node.
    Leaf = 4,
    /// Raw byte carrier for large values and spilled marker residue.
    Overflow = 5,
}

impl PageType {
    /// Converts the on-disk discriminant to a `PageType`.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Spec),
            2 => Ok(Self::Marker),
            3 => Ok(Self::Branch),
            4 => Ok(Self::Leaf),
            5 => Ok(Self::Overflow),
            _ => Err(Error::Corrupted { reason: format!("invalid page type: {value}") }),
        }
    }
}

/// Common header at offset 0 of every page.
///
/// Layout (16 bytes, little-endian):
///
/// ```text
/// Offset  Size   Field
/// ------  ----   -----
/// 0       4      checksum (CRC-32, range depends on page type)
/// 4       4      page type
/// 8       4      page number
/// 12      2      lower offset (index region / payload size)
/// 14      2      upper offset (record region size)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    /// CRC-32 over the type-specific checksummed range.
    pub checksum: u32,
    /// Page type.
    pub page_type: PageType,
    /// Page number; must match the page's position in the file.
    pub number: PageId,
    /// Forward-growing region size: the slot index bytes of a node page,
    /// or the payload length of an overflow page.
    pub lower: u16,
    /// Backward-growing region size: the record bytes at a node page's
    /// end, or a marker's inline residue payload length.
    pub upper: u16,
}

impl PageInfo {
    /// Creates a header for a fresh page.
    pub fn new(page_type: PageType, number: PageId) -> Self {
        Self { checksum: 0, page_type, number, lower: 0, upper: 0 }
    }

    /// Serializes the header into the first 16 bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.page_type as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&self.number.to_le_bytes());
        buf[12..14].copy_from_slice(&self.lower.to_le_bytes());
        buf[14..16].copy_from_slice(&self.upper.to_le_bytes());
    }

    /// Deserializes a header from the first 16 bytes of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_INFO_SIZE {
            return Err(Error::Corrupted { reason: "page shorter than header".to_string() });
        }
        Ok(Self {
            checksum: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            page_type: PageType::from_u32(u32::from_le_bytes(buf[4..8].try_into().unwrap()))?,
            number: PageId::from_le_bytes(buf[8..12].try_into().unwrap()),
            lower: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            upper: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        })
    }
}

/// Reads just the page-number field from a serialized page.
pub fn page_number(buf: &[u8]) -> PageId {
    PageId::from_le_bytes(buf[8..12].try_into().unwrap())
}

/// Computes the CRC-32 checksum of a serialized page.
///
/// The covered range depends on the page type so that the free gap between
/// the forward and backward regions of a node page, and the unused tail of
/// other pages, never affect the checksum:
///
/// - spec: header (minus checksum word) + spec fields
/// - marker: header + meta + inline residue payload (or the chain head word)
/// - branch/leaf: header + meta + history + slot index, XOR'd with a CRC of
///   the `upper` record bytes at the page end
/// - overflow: header + `lower` payload bytes
pub fn page_checksum(buf: &[u8]) -> Result<u32> {
    let info = PageInfo::from_bytes(buf)?;
    let crc = |range: &[u8]| -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(range);
        hasher.finalize()
    };

    let checksum = match info.page_type {
        PageType::Spec => crc(&buf[4..marker::SPEC_CONTENT_END]),
        PageType::Marker => {
            let flags = u32::from_le_bytes(buf[20..24].try_into().unwrap());
            let payload = if flags & marker::RESIDUE_ON_OVERFLOW != 0 {
                4
            } else {
                info.upper as usize
            };
            let end = marker::MARKER_HEADER_SIZE + payload;
            if end > buf.len() {
                return Err(Error::Corrupted { reason: "marker payload out of range".to_string() });
            }
            crc(&buf[4..end])
        }
        PageType::Branch | PageType::Leaf => {
            let history_size =
                u16::from_le_bytes(buf[24..26].try_into().unwrap()) as usize;
            let lower_end = node::NODE_FIXED_HEADER_SIZE
                + history_size * node::HISTORY_NODE_SIZE
                + info.lower as usize;
            let upper_start = buf.len().checked_sub(info.upper as usize);
            match upper_start {
                Some(upper_start) if lower_end <= upper_start => {
                    crc(&buf[4..lower_end]) ^ crc(&buf[upper_start..])
                }
                _ => {
                    return Err(Error::Corrupted {
                        reason: "node page offsets out of range".to_string(),
                    });
                }
            }
        }
        PageType::Overflow => {
            let end = overflow::OVERFLOW_HEADER_SIZE + info.lower as usize;
            if end > buf.len() {
                return Err(Error::Corrupted {
                    reason: "overflow payload out of range".to_string(),
                });
            }
            crc(&buf[4..end])
        }
    };

    Ok(checksum)
}

/// A deserialized page as held by the cache.
#[derive(Debug, Clone)]
pub enum Page {
    /// A branch or leaf node.
    Node(node::NodePage),
    /// An overflow chain link.
    Overflow(overflow::OverflowPage),
}

impl Page {
    /// The page number.
    pub fn number(&self) -> PageId {
        match self {
            Page::Node(p) => p.number,
            Page::Overflow(p) => p.number,
        }
    }

    /// Whether the page has unflushed modifications.
    pub fn is_dirty(&self) -> bool {
        match self {
            Page::Node(p) => p.dirty,
            Page::Overflow(p) => p.dirty,
        }
    }

    /// Clears the dirty flag after a flush.
    pub fn mark_clean(&mut self) {
        match self {
            Page::Node(p) => p.dirty = false,
            Page::Overflow(p) => p.dirty = false,
        }
    }

    /// Serializes the page into a fresh zeroed buffer of `page_size` bytes.
    /// The checksum word is left zero; the pager splices it on write.
    pub fn serialize(&self, page_size: usize) -> Result<Vec<u8>> {
        match self {
            Page::Node(p) => p.serialize(page_size),
            Page::Overflow(p) => Ok(p.serialize(page_size)),
        }
    }

    /// Deserializes a page read from disk. `cmp` is the engine's installed
    /// key comparator, threaded into every reconstructed node key.
    pub fn deserialize(buf: &[u8], cmp: Option<node::CompareFn>) -> Result<Self> {
        let info = PageInfo::from_bytes(buf)?;
        match info.page_type {
            PageType::Branch | PageType::Leaf => {
                Ok(Page::Node(node::NodePage::deserialize(buf, cmp)?))
            }
            PageType::Overflow => Ok(Page::Overflow(overflow::OverflowPage::deserialize(buf)?)),
            other => Err(Error::Corrupted {
                reason: format!("page type {other:?} cannot live in the tree"),
            }),
        }
    }
}
