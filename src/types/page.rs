//! On-disk page header shared by every page kind.
//!
//! Every page starts with a fixed 32 byte header. The body layout depends on
//! [`PageKind`]. Pages of the same kind that form a list (dictionary,
//! directory, overflow, free list) link through [`PageHeader::next`].

use std::convert::TryFrom;

use super::{IndexError, PageId, Result};

/// Magic bytes identifying an index page.
pub const PAGE_MAGIC: [u8; 4] = *b"XREF";
/// Page layout version. Any other value is treated as corruption.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Smallest accepted page size.
pub const MIN_PAGE_SIZE: u32 = 512;
/// Length of the fixed page header.
pub const PAGE_HDR_LEN: usize = 32;
/// Sentinel for "no next page".
pub const NO_PAGE: u64 = 0;

pub mod header {
    //! Byte offsets for fixed header fields.
    use std::ops::Range;

    /// Magic bytes.
    pub const MAGIC: Range<usize> = 0..4;
    /// Page layout version, little endian.
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    /// Page kind byte.
    pub const PAGE_KIND: usize = 6;
    /// Unused, always zero.
    pub const RESERVED: usize = 7;
    /// Page size in bytes.
    pub const PAGE_SIZE: Range<usize> = 8..12;
    /// Page number.
    pub const PAGE_NO: Range<usize> = 12..20;
    /// Next page of the chain.
    pub const NEXT: Range<usize> = 20..28;
    /// Salted page checksum.
    pub const CRC32: Range<usize> = 28..32;
}

/// Role of a page in the file.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Page 0: file metadata.
    Meta = 1,
    /// Released page waiting for reuse.
    FreeList = 2,
    /// Chained list of interned locations.
    Dictionary = 3,
    /// Chained array of record addresses.
    Directory = 4,
    /// Slotted page holding encoded records.
    Records = 5,
    /// Continuation of a record too large for a record page.
    Overflow = 6,
}

impl PageKind {
    /// Raw discriminant.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = IndexError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::Meta),
            2 => Ok(PageKind::FreeList),
            3 => Ok(PageKind::Dictionary),
            4 => Ok(PageKind::Directory),
            5 => Ok(PageKind::Records),
            6 => Ok(PageKind::Overflow),
            _ => Err(IndexError::Corruption("unknown page kind")),
        }
    }
}

/// Decoded page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Layout version the page was written with.
    pub format_version: u16,
    /// Role of the page.
    pub kind: PageKind,
    /// Page size the file was created with.
    pub page_size: u32,
    /// Number of this page.
    pub page_no: PageId,
    /// Next page in the chain, or [`NO_PAGE`].
    pub next: u64,
    /// Stored checksum.
    pub crc32: u32,
}

impl PageHeader {
    /// Header for a fresh page.
    pub fn new(page_no: PageId, kind: PageKind, page_size: u32) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE {
            return Err(IndexError::Invalid("page size below minimum"));
        }
        Ok(Self {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            page_size,
            page_no,
            next: NO_PAGE,
            crc32: 0,
        })
    }

    /// Writes the header into the first bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(IndexError::Invalid("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        hdr[header::PAGE_KIND] = self.kind.as_u8();
        hdr[header::RESERVED] = 0;
        hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
        hdr[header::NEXT].copy_from_slice(&self.next.to_be_bytes());
        hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    /// Parses and validates the header at the start of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(IndexError::Corruption("page header truncated"));
        }
        if src[header::MAGIC] != PAGE_MAGIC {
            return Err(IndexError::Corruption("invalid page magic"));
        }
        let format_version = be_u16(&src[header::FORMAT_VERSION]);
        if format_version != PAGE_FORMAT_VERSION {
            return Err(IndexError::Corruption("unsupported page format version"));
        }
        if src[header::RESERVED] != 0 {
            return Err(IndexError::Corruption("page header reserved byte not zero"));
        }
        let kind = PageKind::try_from(src[header::PAGE_KIND])?;
        let page_size = be_u32(&src[header::PAGE_SIZE]);
        if page_size < MIN_PAGE_SIZE {
            return Err(IndexError::Corruption("page size smaller than minimum"));
        }
        Ok(Self {
            format_version,
            kind,
            page_size,
            page_no: PageId(be_u64(&src[header::PAGE_NO])),
            next: be_u64(&src[header::NEXT]),
            crc32: be_u32(&src[header::CRC32]),
        })
    }
}

/// Reads the chain link of an encoded page.
pub fn next_of(buf: &[u8]) -> u64 {
    be_u64(&buf[header::NEXT])
}

/// Rewrites the chain link of an encoded page.
pub fn set_next(buf: &mut [u8], next: u64) {
    buf[header::NEXT].copy_from_slice(&next.to_be_bytes());
}

/// Reads the page kind byte without validating the rest of the header.
pub fn kind_of(buf: &[u8]) -> Result<PageKind> {
    PageKind::try_from(buf[header::PAGE_KIND])
}

/// Zeroes the checksum field before hashing.
pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
    if buf.len() < header::CRC32.end {
        return Err(IndexError::Invalid("page header buffer too small"));
    }
    buf[header::CRC32].fill(0);
    Ok(())
}

/// Computes and stores the page checksum in place.
pub fn stamp_crc32(buf: &mut [u8], salt: u64) -> Result<()> {
    clear_crc32(buf)?;
    let page_no = be_u64(&buf[header::PAGE_NO]);
    let crc = super::page_crc32(page_no, salt, buf);
    buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Validates the header and checksum of a page read from disk.
pub fn verify(buf: &mut [u8], expected: PageId, salt: u64, check_crc: bool) -> Result<PageHeader> {
    let hdr = PageHeader::decode(buf)?;
    if hdr.page_no != expected {
        return Err(IndexError::CorruptionOwned(format!(
            "page {} carries page number {}",
            expected, hdr.page_no
        )));
    }
    if hdr.page_size as usize != buf.len() {
        return Err(IndexError::Corruption("page size does not match file"));
    }
    if check_crc {
        clear_crc32(buf)?;
        let actual = super::page_crc32(expected.0, salt, buf);
        buf[header::CRC32].copy_from_slice(&hdr.crc32.to_be_bytes());
        if actual != hdr.crc32 {
            return Err(IndexError::CorruptionOwned(format!(
                "page {} checksum mismatch",
                expected
            )));
        }
    }
    Ok(hdr)
}

fn be_u16(bytes: &[u8]) -> u16 {
    let mut out = [0u8; 2];
    out.copy_from_slice(&bytes[..2]);
    u16::from_be_bytes(out)
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(out)
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(out)
}
