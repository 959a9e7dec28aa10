//! Marker pages and the file spec page.
//!
//! Markers describe a consistent tree snapshot: the root page, a
//! monotonically increasing commit revision, the sync epoch the snapshot
//! belongs to, the caller's tag, the file size at commit time, and the
//! residue list (page numbers whose reuse must wait until the next durable
//! sync). Pages 1 and 2 hold the two sync markers; pages 3 and 4 hold the
//! ping/pong working markers that commits alternate between.
//!
//! A residue list that does not fit in the page body spills into an
//! overflow chain; the marker body then holds the chain head instead and
//! the [`RESIDUE_ON_OVERFLOW`] flag is set. The two sync markers share one
//! chain.

use std::collections::BTreeSet;

use crate::error::{Error, PageId, Result};

use super::{PageInfo, PageType, INVALID_PAGE, PAGE_INFO_SIZE};

/// Magic/version word on the spec page. Open fails on any other value.
pub const VERSION: u32 = 0xDEAD_C0DE;

/// Maximum key size recorded on the spec page.
pub const KEY_SIZE_LIMIT: u16 = 255;

/// Page-fill threshold (percent) below which rebalance kicks in.
pub const PAGE_FILL_THRESHOLD: u16 = 25;

/// End of the checksummed spec-page content.
pub const SPEC_CONTENT_END: usize = 32;

/// Marker flag: the residue list lives in an overflow chain.
pub const RESIDUE_ON_OVERFLOW: u32 = 0x0001;

/// Marker header size (page info + meta).
pub const MARKER_HEADER_SIZE: usize = PAGE_INFO_SIZE + 40;

/// Contents of the spec page (page 0), fixed at file creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpec {
    /// Magic/version word; must equal [`VERSION`].
    pub version: u32,
    /// Page size in bytes.
    pub page_size: u32,
    /// Maximum key size in bytes.
    pub key_size: u16,
    /// Rebalance threshold in percent.
    pub fill_threshold: u16,
    /// Values larger than this move to an overflow chain.
    pub overflow_threshold: u32,
}

impl FileSpec {
    /// Creates the spec for a new file with the given page size.
    pub fn new(page_size: usize) -> Self {
        Self {
            version: VERSION,
            page_size: page_size as u32,
            key_size: KEY_SIZE_LIMIT,
            fill_threshold: PAGE_FILL_THRESHOLD,
            overflow_threshold: (page_size / 4) as u32,
        }
    }

    /// Serializes the spec page into a zeroed `page_size` buffer
    /// (checksum left zero).
    pub fn serialize(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        PageInfo::new(PageType::Spec, super::SPEC_PAGE).write_to(&mut buf);
        buf[16..20].copy_from_slice(&self.version.to_le_bytes());
        buf[20..24].copy_from_slice(&self.page_size.to_le_bytes());
        buf[24..26].copy_from_slice(&self.key_size.to_le_bytes());
        buf[26..28].copy_from_slice(&self.fill_threshold.to_le_bytes());
        buf[28..32].copy_from_slice(&self.overflow_threshold.to_le_bytes());
        buf
    }

    /// Deserializes and validates the spec page.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let info = PageInfo::from_bytes(buf)?;
        if info.page_type != PageType::Spec || info.number != super::SPEC_PAGE {
            return Err(Error::Corrupted { reason: "page 0 is not a spec page".to_string() });
        }

        let version = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        if version != VERSION {
            return Err(Error::Version { version });
        }

        let spec = Self {
            version,
            page_size: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            key_size: u16::from_le_bytes(buf[24..26].try_into().unwrap()),
            fill_threshold: u16::from_le_bytes(buf[26..28].try_into().unwrap()),
            overflow_threshold: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        };

        if !spec.page_size.is_power_of_two() || spec.page_size < 4096 {
            return Err(Error::Corrupted {
                reason: format!("invalid page size on spec page: {}", spec.page_size),
            });
        }

        Ok(spec)
    }
}

/// Marker metadata.
#[derive(Debug, Clone, Copy)]
pub struct MarkerMeta {
    /// Root of the tree this marker describes, or [`INVALID_PAGE`].
    pub root: PageId,
    /// Marker flags ([`RESIDUE_ON_OVERFLOW`]).
    pub flags: u32,
    /// Commit revision; strictly increasing across commits.
    pub revision: u64,
    /// The sync epoch this snapshot belongs to.
    pub sync_id: u64,
    /// Caller-supplied tag echoed from the commit.
    pub tag: u64,
    /// File size in bytes at commit time; open truncates to this.
    pub size: u64,
}

impl Default for MarkerMeta {
    fn default() -> Self {
        Self { root: INVALID_PAGE, flags: 0, revision: 0, sync_id: 0, tag: 0, size: 0 }
    }
}

/// A marker page, including the deserialized residue set.
#[derive(Debug, Clone)]
pub struct MarkerPage {
    /// The marker page slot this lives in (1..=4).
    pub number: PageId,
    /// Marker metadata.
    pub meta: MarkerMeta,
    /// Page numbers whose reuse is deferred until after the next sync.
    pub residue: BTreeSet<PageId>,
    /// Head of the spilled residue chain, when [`RESIDUE_ON_OVERFLOW`]
    /// is set.
    pub overflow_page: PageId,
}

impl MarkerPage {
    /// Creates an empty marker for the given slot.
    pub fn new(number: PageId) -> Self {
        Self {
            number,
            meta: MarkerMeta::default(),
            residue: BTreeSet::new(),
            overflow_page: INVALID_PAGE,
        }
    }

    /// Bytes available for the inline residue list.
    pub fn capacity(page_size: usize) -> usize {
        page_size - MARKER_HEADER_SIZE
    }

    /// Whether the residue list of `count` pages fits inline.
    pub fn residue_fits_inline(page_size: usize, count: usize) -> bool {
        count * 4 <= Self::capacity(page_size)
    }

    /// Serializes the marker into a zeroed `page_size` buffer (checksum
    /// left zero).
    ///
    /// The caller decides the spill: when `meta.flags` has
    /// [`RESIDUE_ON_OVERFLOW`] set, the body holds `overflow_page` and the
    /// residue list itself must already live in that chain.
    pub fn serialize(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        let spilled = self.meta.flags & RESIDUE_ON_OVERFLOW != 0;
        let payload = if spilled { 4 } else { self.residue.len() * 4 };

        let info = PageInfo {
            checksum: 0,
            page_type: PageType::Marker,
            number: self.number,
            lower: 0,
            upper: payload as u16,
        };
        info.write_to(&mut buf);

        buf[16..20].copy_from_slice(&self.meta.root.to_le_bytes());
        buf[20..24].copy_from_slice(&self.meta.flags.to_le_bytes());
        buf[24..32].copy_from_slice(&self.meta.revision.to_le_bytes());
        buf[32..40].copy_from_slice(&self.meta.sync_id.to_le_bytes());
        buf[40..48].copy_from_slice(&self.meta.tag.to_le_bytes());
        buf[48..56].copy_from_slice(&self.meta.size.to_le_bytes());

        let mut offset = MARKER_HEADER_SIZE;
        if spilled {
            buf[offset..offset + 4].copy_from_slice(&self.overflow_page.to_le_bytes());
        } else {
            for pgno in &self.residue {
                buf[offset..offset + 4].copy_from_slice(&pgno.to_le_bytes());
                offset += 4;
            }
        }

        buf
    }

    /// Deserializes a marker page. When the residue is spilled, `residue`
    /// comes back empty and the caller reads the chain at `overflow_page`
    /// and feeds its data through [`parse_residue`].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let info = PageInfo::from_bytes(buf)?;
        if info.page_type != PageType::Marker {
            return Err(Error::Corrupted {
                reason: format!("page {} is not a marker", info.number),
            });
        }

        let meta = MarkerMeta {
            root: PageId::from_le_bytes(buf[16..20].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            revision: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            sync_id: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            tag: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            size: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
        };

        let mut marker = MarkerPage {
            number: info.number,
            meta,
            residue: BTreeSet::new(),
            overflow_page: INVALID_PAGE,
        };

        if meta.flags & RESIDUE_ON_OVERFLOW != 0 {
            marker.overflow_page =
                PageId::from_le_bytes(buf[56..60].try_into().unwrap());
        } else {
            let count = info.upper as usize / 4;
            if MARKER_HEADER_SIZE + count * 4 > buf.len() {
                return Err(Error::Corrupted {
                    reason: format!("marker {} residue out of range", info.number),
                });
            }
            let mut offset = MARKER_HEADER_SIZE;
            for _ in 0..count {
                marker
                    .residue
                    .insert(PageId::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()));
                offset += 4;
            }
        }

        Ok(marker)
    }
}

/// Serializes a residue set into the raw bytes carried by a spill chain.
pub fn residue_to_bytes(residue: &BTreeSet<PageId>) -> Vec<u8> {
    let mut out = Vec::with_capacity(residue.len() * 4);
    for pgno in residue {
        out.extend_from_slice(&pgno.to_le_bytes());
    }
    out
}

/// Parses the residue page numbers from spill-chain data.
pub fn parse_residue(data: &[u8]) -> Result<BTreeSet<PageId>> {
    if data.len() % 4 != 0 {
        return Err(Error::Corrupted { reason: "residue chain length not a multiple of 4".into() });
    }
    let mut out = BTreeSet::new();
    for chunk in data.chunks_exact(4) {
        out.insert(PageId::from_le_bytes(chunk.try_into().unwrap()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_round_trip() {
        let spec = FileSpec::new(4096);
        let buf = spec.serialize(4096);
        let back = FileSpec::deserialize(&buf).unwrap();
        assert_eq!(back, spec);
        assert_eq!(back.overflow_threshold, 1024);
        assert_eq!(back.key_size, 255);
    }

    #[test]
    fn test_spec_rejects_bad_version() {
        let mut spec = FileSpec::new(4096);
        spec.version = 0x1234_5678;
        let buf = spec.serialize(4096);
        match FileSpec::deserialize(&buf) {
            Err(Error::Version { version }) => assert_eq!(version, 0x1234_5678),
            other => panic!("expected Version error, got {other:?}"),
        }
    }

    #[test]
    fn test_marker_round_trip_inline_residue() {
        let mut marker = MarkerPage::new(super::super::PING_PAGE);
        marker.meta.root = 12;
        marker.meta.revision = 7;
        marker.meta.sync_id = 3;
        marker.meta.tag = 42;
        marker.meta.size = 9 * 4096;
        marker.residue.extend([6, 8, 11]);

        let buf = marker.serialize(4096);
        let back = MarkerPage::deserialize(&buf).unwrap();

        assert_eq!(back.number, super::super::PING_PAGE);
        assert_eq!(back.meta.root, 12);
        assert_eq!(back.meta.revision, 7);
        assert_eq!(back.meta.sync_id, 3);
        assert_eq!(back.meta.tag, 42);
        assert_eq!(back.meta.size, 9 * 4096);
        assert_eq!(back.residue, [6, 8, 11].into_iter().collect());
    }

    #[test]
    fn test_marker_round_trip_spilled_residue() {
        let mut marker = MarkerPage::new(super::super::SYNC_A_PAGE);
        marker.meta.flags |= RESIDUE_ON_OVERFLOW;
        marker.overflow_page = 77;

        let buf = marker.serialize(4096);
        let back = MarkerPage::deserialize(&buf).unwrap();

        assert!(back.meta.flags & RESIDUE_ON_OVERFLOW != 0);
        assert_eq!(back.overflow_page, 77);
        assert!(back.residue.is_empty());
    }

    #[test]
    fn test_residue_bytes_round_trip() {
        let residue: BTreeSet<PageId> = [9, 200, 3].into_iter().collect();
        let bytes = residue_to_bytes(&residue);
        assert_eq!(bytes.len(), 12);
        assert_eq!(parse_residue(&bytes).unwrap(), residue);
    }

    #[test]
    fn test_residue_fits_inline() {
        assert!(MarkerPage::residue_fits_inline(4096, 100));
        assert!(!MarkerPage::residue_fits_inline(4096, 2000));
    }
}
