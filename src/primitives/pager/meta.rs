use std::fmt;
use std::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::types::{
    page::{self, PageHeader, PageKind, PAGE_HDR_LEN},
    IndexError, Lsn, PageId, Result,
};

const META_SALT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const META_WAL_SALT: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const META_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 20;
const META_FORMAT_VERSION: Range<usize> = PAGE_HDR_LEN + 20..PAGE_HDR_LEN + 22;
const META_LAYER_COUNT: Range<usize> = PAGE_HDR_LEN + 22..PAGE_HDR_LEN + 24;
const META_FREE_HEAD: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;
const META_NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const META_LAST_CHECKPOINT_LSN: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 48;
const META_LAST_LSN: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 56;
const META_LAYER_FINGERPRINT: Range<usize> = PAGE_HDR_LEN + 56..PAGE_HDR_LEN + 64;
const META_DICT_HEAD: Range<usize> = PAGE_HDR_LEN + 64..PAGE_HDR_LEN + 72;
const META_DICT_TAIL: Range<usize> = PAGE_HDR_LEN + 72..PAGE_HDR_LEN + 80;
const META_DIR_HEAD: Range<usize> = PAGE_HDR_LEN + 80..PAGE_HDR_LEN + 88;
const META_FILL_PAGE: Range<usize> = PAGE_HDR_LEN + 88..PAGE_HDR_LEN + 96;
const META_LOCATION_COUNT: Range<usize> = PAGE_HDR_LEN + 96..PAGE_HDR_LEN + 100;
const META_RESERVED: Range<usize> = PAGE_HDR_LEN + 100..PAGE_HDR_LEN + 104;
const META_END: usize = PAGE_HDR_LEN + 104;

/// Index file metadata stored in page 0.
///
/// Besides the pager's own bookkeeping (salts, free list, allocation
/// cursor, LSNs) it carries the roots of the storage structures and the
/// fingerprint of the layer configuration that wrote the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Page size of the file.
    pub page_size: u32,
    /// Salt mixed into every page checksum.
    pub salt: u64,
    /// Salt tying the write-ahead log to this file.
    pub wal_salt: u64,
    /// File format version.
    pub format_version: u16,
    /// Number of layers in the configuration that created the file.
    pub layer_count: u16,
    /// Head of the free page chain, or page 0 when empty.
    pub free_head: PageId,
    /// Next never-used page.
    pub next_page: PageId,
    /// LSN covered by the last checkpoint.
    pub last_checkpoint_lsn: Lsn,
    /// LSN of the most recent committed file transaction.
    pub last_lsn: Lsn,
    /// Fingerprint of the layer configuration.
    pub layer_fingerprint: u64,
    /// First dictionary page.
    pub dict_head: PageId,
    /// Dictionary page receiving new entries.
    pub dict_tail: PageId,
    /// First directory page.
    pub dir_head: PageId,
    /// Record page currently receiving new records.
    pub fill_page: PageId,
    /// Number of interned locations.
    pub location_count: u32,
}

impl Meta {
    /// Fresh metadata with random salts.
    pub fn new(page_size: u32) -> Result<Self> {
        if page_size < page::MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(IndexError::InvalidOwned(format!(
                "page size {page_size} must be a power of two of at least {}",
                page::MIN_PAGE_SIZE
            )));
        }
        let mut rng = OsRng;
        Ok(Self {
            page_size,
            salt: rng.next_u64(),
            wal_salt: rng.next_u64(),
            format_version: page::PAGE_FORMAT_VERSION,
            layer_count: 0,
            free_head: PageId(0),
            next_page: PageId(1),
            last_checkpoint_lsn: Lsn(0),
            last_lsn: Lsn(0),
            layer_fingerprint: 0,
            dict_head: PageId(0),
            dict_tail: PageId(0),
            dir_head: PageId(0),
            fill_page: PageId(0),
            location_count: 0,
        })
    }
}

/// Encodes metadata into a full page buffer, checksum included.
pub fn write_meta_page(buf: &mut [u8], meta: &Meta) -> Result<()> {
    let page_size = meta.page_size as usize;
    if buf.len() != page_size || page_size < META_END {
        return Err(IndexError::Invalid("meta buffer size mismatch"));
    }
    buf.fill(0);
    PageHeader::new(PageId(0), PageKind::Meta, meta.page_size)?.encode(buf)?;
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_WAL_SALT].copy_from_slice(&meta.wal_salt.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_FORMAT_VERSION].copy_from_slice(&meta.format_version.to_be_bytes());
    buf[META_LAYER_COUNT].copy_from_slice(&meta.layer_count.to_be_bytes());
    buf[META_FREE_HEAD].copy_from_slice(&meta.free_head.0.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    buf[META_LAST_CHECKPOINT_LSN].copy_from_slice(&meta.last_checkpoint_lsn.0.to_be_bytes());
    buf[META_LAST_LSN].copy_from_slice(&meta.last_lsn.0.to_be_bytes());
    buf[META_LAYER_FINGERPRINT].copy_from_slice(&meta.layer_fingerprint.to_be_bytes());
    buf[META_DICT_HEAD].copy_from_slice(&meta.dict_head.0.to_be_bytes());
    buf[META_DICT_TAIL].copy_from_slice(&meta.dict_tail.0.to_be_bytes());
    buf[META_DIR_HEAD].copy_from_slice(&meta.dir_head.0.to_be_bytes());
    buf[META_FILL_PAGE].copy_from_slice(&meta.fill_page.0.to_be_bytes());
    buf[META_LOCATION_COUNT].copy_from_slice(&meta.location_count.to_be_bytes());
    page::stamp_crc32(buf, meta.salt)
}

/// Decodes and verifies page 0.
pub fn read_meta_page(buf: &[u8]) -> Result<Meta> {
    if buf.len() < META_END {
        return Err(IndexError::Corruption("meta page truncated"));
    }
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::Meta || header.page_no != PageId(0) {
        return Err(IndexError::Corruption("meta page has wrong kind"));
    }
    let page_size = u32_at(buf, META_PAGE_SIZE);
    if page_size != header.page_size || buf.len() != page_size as usize {
        return Err(IndexError::Corruption("meta page size mismatch"));
    }
    let salt = u64_at(buf, META_SALT);
    let mut scratch = buf.to_vec();
    page::verify(&mut scratch, PageId(0), salt, true)?;
    if buf[META_RESERVED].iter().any(|b| *b != 0) {
        return Err(IndexError::Corruption("meta reserved field non-zero"));
    }
    let format_version = u16_at(buf, META_FORMAT_VERSION);
    if format_version != page::PAGE_FORMAT_VERSION {
        return Err(IndexError::Corruption("unsupported index format version"));
    }
    let meta = Meta {
        page_size,
        salt,
        wal_salt: u64_at(buf, META_WAL_SALT),
        format_version,
        layer_count: u16_at(buf, META_LAYER_COUNT),
        free_head: PageId(u64_at(buf, META_FREE_HEAD)),
        next_page: PageId(u64_at(buf, META_NEXT_PAGE)),
        last_checkpoint_lsn: Lsn(u64_at(buf, META_LAST_CHECKPOINT_LSN)),
        last_lsn: Lsn(u64_at(buf, META_LAST_LSN)),
        layer_fingerprint: u64_at(buf, META_LAYER_FINGERPRINT),
        dict_head: PageId(u64_at(buf, META_DICT_HEAD)),
        dict_tail: PageId(u64_at(buf, META_DICT_TAIL)),
        dir_head: PageId(u64_at(buf, META_DIR_HEAD)),
        fill_page: PageId(u64_at(buf, META_FILL_PAGE)),
        location_count: u32_at(buf, META_LOCATION_COUNT),
    };
    if meta.next_page.0 == 0 || meta.free_head >= meta.next_page {
        return Err(IndexError::Corruption("meta page allocation cursor invalid"));
    }
    Ok(meta)
}

fn u16_at(buf: &[u8], range: Range<usize>) -> u16 {
    let mut out = [0u8; 2];
    out.copy_from_slice(&buf[range]);
    u16::from_be_bytes(out)
}

fn u32_at(buf: &[u8], range: Range<usize>) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[range]);
    u32::from_be_bytes(out)
}

fn u64_at(buf: &[u8], range: Range<usize>) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[range]);
    u64::from_be_bytes(out)
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Meta(page_size={}, format_version={}, layers={}, fingerprint={:#018x}, free_head={}, next_page={}, last_lsn={}, last_checkpoint_lsn={}, dict_head={}, dir_head={}, fill_page={}, locations={})",
            self.page_size,
            self.format_version,
            self.layer_count,
            self.layer_fingerprint,
            self.free_head,
            self.next_page,
            self.last_lsn,
            self.last_checkpoint_lsn,
            self.dict_head,
            self.dir_head,
            self.fill_page,
            self.location_count,
        )
    }
}
