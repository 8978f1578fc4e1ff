//! Record pages and overflow chains.
//!
//! A record page packs several small records sorted by `(column, location)`:
//!
//! ```text
//! header (32) | count u16 | used u16 | entries...
//! entry: column u16 | location u32 | flags u8 | len u16 | data[len]
//! ```
//!
//! Blobs larger than a quarter of the page body are written to a chain of
//! overflow pages; the entry then holds `start u64 | length u32 | crc32 u32`.

use tracing::trace;

use crate::primitives::pager::Pager;
use crate::types::{
    chunked_crc32,
    page::{self, PageKind, NO_PAGE, PAGE_HDR_LEN},
    IndexError, LocationId, PageId, Result,
};

const COUNT_OFF: usize = PAGE_HDR_LEN;
const USED_OFF: usize = PAGE_HDR_LEN + 2;
const BODY_OFF: usize = PAGE_HDR_LEN + 4;
const ENTRY_HDR_LEN: usize = 9;
const OVERFLOW_REF_LEN: usize = 16;
const OVERFLOW_BODY_OFF: usize = PAGE_HDR_LEN + 2;

const FLAG_OVERFLOW: u8 = 0x01;

#[derive(Clone, Debug)]
struct Entry {
    column: u16,
    location: u32,
    flags: u8,
    data: Vec<u8>,
}

impl Entry {
    fn key(&self) -> (u16, u32) {
        (self.column, self.location)
    }

    fn encoded_len(&self) -> usize {
        ENTRY_HDR_LEN + self.data.len()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct OverflowRef {
    start: PageId,
    len: u32,
    crc32: u32,
}

impl OverflowRef {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(OVERFLOW_REF_LEN);
        out.extend_from_slice(&self.start.0.to_be_bytes());
        out.extend_from_slice(&self.len.to_be_bytes());
        out.extend_from_slice(&self.crc32.to_be_bytes());
        out
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != OVERFLOW_REF_LEN {
            return Err(IndexError::Corruption("overflow reference has the wrong length"));
        }
        let mut start = [0u8; 8];
        start.copy_from_slice(&data[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[8..12]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&data[12..16]);
        Ok(Self {
            start: PageId(u64::from_be_bytes(start)),
            len: u32::from_be_bytes(len),
            crc32: u32::from_be_bytes(crc),
        })
    }
}

/// Record access over a borrowed pager.
pub struct RecordStore<'a> {
    pager: &'a mut Pager,
}

impl<'a> RecordStore<'a> {
    pub fn new(pager: &'a mut Pager) -> Self {
        Self { pager }
    }

    /// Largest blob stored inline.
    pub fn inline_limit(&self) -> usize {
        (self.pager.page_size() - BODY_OFF) / 4
    }

    /// Reads the record `(column, location)` from `page_id`.
    pub fn read(
        &mut self,
        page_id: PageId,
        column: u16,
        location: LocationId,
    ) -> Result<Option<Vec<u8>>> {
        let entries = self.load_entries(page_id)?;
        let Some(entry) = entries.into_iter().find(|e| e.key() == (column, location.0)) else {
            return Ok(None);
        };
        if entry.flags & FLAG_OVERFLOW == 0 {
            return Ok(Some(entry.data));
        }
        let reference = OverflowRef::decode(&entry.data)?;
        self.read_overflow(reference).map(Some)
    }

    /// Stores `blob` for `(column, location)`, replacing the copy on
    /// `current` if any, and returns the page now holding the record.
    pub fn write(
        &mut self,
        current: Option<PageId>,
        column: u16,
        location: LocationId,
        blob: &[u8],
    ) -> Result<PageId> {
        let entry = self.make_entry(column, location, blob)?;
        if let Some(page_id) = current {
            let mut entries = self.load_entries(page_id)?;
            if let Some(pos) = entries.iter().position(|e| e.key() == entry.key()) {
                let old = entries.remove(pos);
                self.release(&old)?;
            }
            let pos = entries.partition_point(|e| e.key() < entry.key());
            entries.insert(pos, entry);
            if self.fits(&entries) {
                self.store_entries(page_id, &entries)?;
                return Ok(page_id);
            }
            let entry = entries.remove(pos);
            self.store_or_free(page_id, &entries)?;
            return self.place(entry);
        }
        self.place(entry)
    }

    /// Removes `(column, location)` from `page_id`. Returns false when the
    /// page held no such record.
    pub fn delete(&mut self, page_id: PageId, column: u16, location: LocationId) -> Result<bool> {
        let mut entries = self.load_entries(page_id)?;
        let Some(pos) = entries.iter().position(|e| e.key() == (column, location.0)) else {
            return Ok(false);
        };
        let old = entries.remove(pos);
        self.release(&old)?;
        self.store_or_free(page_id, &entries)?;
        Ok(true)
    }

    fn place(&mut self, entry: Entry) -> Result<PageId> {
        let fill = self.pager.meta().fill_page;
        if fill.0 != NO_PAGE {
            let mut entries = self.load_entries(fill)?;
            let pos = entries.partition_point(|e| e.key() < entry.key());
            entries.insert(pos, entry.clone());
            if self.fits(&entries) {
                self.store_entries(fill, &entries)?;
                return Ok(fill);
            }
        }
        let page_id = self.pager.allocate(PageKind::Records)?;
        self.pager.meta_mut()?.fill_page = page_id;
        trace!(page = page_id.0, previous = fill.0, "storage.record.fill_page");
        self.store_entries(page_id, std::slice::from_ref(&entry))?;
        Ok(page_id)
    }

    fn make_entry(&mut self, column: u16, location: LocationId, blob: &[u8]) -> Result<Entry> {
        if blob.len() <= self.inline_limit() {
            return Ok(Entry {
                column,
                location: location.0,
                flags: 0,
                data: blob.to_vec(),
            });
        }
        let reference = self.write_overflow(blob)?;
        Ok(Entry {
            column,
            location: location.0,
            flags: FLAG_OVERFLOW,
            data: reference.encode(),
        })
    }

    fn fits(&self, entries: &[Entry]) -> bool {
        let used: usize = entries.iter().map(Entry::encoded_len).sum();
        BODY_OFF + used <= self.pager.page_size()
    }

    fn store_or_free(&mut self, page_id: PageId, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() && page_id != self.pager.meta().fill_page {
            trace!(page = page_id.0, "storage.record.free_page");
            return self.pager.free(page_id);
        }
        self.store_entries(page_id, entries)
    }

    fn load_entries(&mut self, page_id: PageId) -> Result<Vec<Entry>> {
        let buf = self.pager.page(page_id)?;
        if page::kind_of(buf)? != PageKind::Records {
            return Err(IndexError::CorruptionOwned(format!(
                "page {page_id} is not a record page"
            )));
        }
        let count = u16_at(buf, COUNT_OFF) as usize;
        let used = u16_at(buf, USED_OFF) as usize;
        let body = buf
            .get(BODY_OFF..BODY_OFF + used)
            .ok_or(IndexError::Corruption("record page body overflows"))?;
        let mut entries = Vec::with_capacity(count);
        let mut pos = 0usize;
        for _ in 0..count {
            let hdr = body
                .get(pos..pos + ENTRY_HDR_LEN)
                .ok_or(IndexError::Corruption("record entry header truncated"))?;
            let column = u16::from_be_bytes([hdr[0], hdr[1]]);
            let location = u32::from_be_bytes([hdr[2], hdr[3], hdr[4], hdr[5]]);
            let flags = hdr[6];
            let len = u16::from_be_bytes([hdr[7], hdr[8]]) as usize;
            pos += ENTRY_HDR_LEN;
            let data = body
                .get(pos..pos + len)
                .ok_or(IndexError::Corruption("record entry truncated"))?;
            pos += len;
            entries.push(Entry {
                column,
                location,
                flags,
                data: data.to_vec(),
            });
        }
        if pos != used {
            return Err(IndexError::Corruption("record page has trailing bytes"));
        }
        Ok(entries)
    }

    fn store_entries(&mut self, page_id: PageId, entries: &[Entry]) -> Result<()> {
        let buf = self.pager.page_mut(page_id)?;
        let mut pos = BODY_OFF;
        for entry in entries {
            let end = pos + entry.encoded_len();
            let slot = buf
                .get_mut(pos..end)
                .ok_or(IndexError::Invalid("record entries exceed the page"))?;
            slot[0..2].copy_from_slice(&entry.column.to_be_bytes());
            slot[2..6].copy_from_slice(&entry.location.to_be_bytes());
            slot[6] = entry.flags;
            slot[7..9].copy_from_slice(&(entry.data.len() as u16).to_be_bytes());
            slot[ENTRY_HDR_LEN..].copy_from_slice(&entry.data);
            pos = end;
        }
        buf[pos..].fill(0);
        buf[COUNT_OFF..COUNT_OFF + 2].copy_from_slice(&(entries.len() as u16).to_be_bytes());
        buf[USED_OFF..USED_OFF + 2].copy_from_slice(&((pos - BODY_OFF) as u16).to_be_bytes());
        Ok(())
    }

    fn chunk_capacity(&self) -> usize {
        self.pager.page_size() - OVERFLOW_BODY_OFF
    }

    fn write_overflow(&mut self, blob: &[u8]) -> Result<OverflowRef> {
        let len = u32::try_from(blob.len())
            .map_err(|_| IndexError::Invalid("record larger than 4 GiB"))?;
        let capacity = self.chunk_capacity();
        let mut start = PageId(NO_PAGE);
        let mut prev: Option<PageId> = None;
        for chunk in blob.chunks(capacity) {
            let id = self.pager.allocate(PageKind::Overflow)?;
            match prev {
                Some(prev) => page::set_next(self.pager.page_mut(prev)?, id.0),
                None => start = id,
            }
            let buf = self.pager.page_mut(id)?;
            buf[PAGE_HDR_LEN..OVERFLOW_BODY_OFF].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
            buf[OVERFLOW_BODY_OFF..OVERFLOW_BODY_OFF + chunk.len()].copy_from_slice(chunk);
            prev = Some(id);
        }
        let reference = OverflowRef {
            start,
            len,
            crc32: chunked_crc32(blob.chunks(capacity)),
        };
        trace!(start = start.0, len, "storage.record.overflow_write");
        Ok(reference)
    }

    fn overflow_pages(&mut self, reference: OverflowRef) -> Result<Vec<PageId>> {
        let capacity = self.chunk_capacity();
        let expected = (reference.len as usize).div_ceil(capacity);
        let mut pages = Vec::with_capacity(expected);
        let mut cursor = reference.start;
        for _ in 0..expected {
            if cursor.0 == NO_PAGE {
                return Err(IndexError::Corruption("overflow chain ends early"));
            }
            let buf = self.pager.page(cursor)?;
            if page::kind_of(buf)? != PageKind::Overflow {
                return Err(IndexError::CorruptionOwned(format!(
                    "overflow chain reaches page {cursor} of another kind"
                )));
            }
            pages.push(cursor);
            cursor = PageId(page::next_of(buf));
        }
        Ok(pages)
    }

    fn read_overflow(&mut self, reference: OverflowRef) -> Result<Vec<u8>> {
        let pages = self.overflow_pages(reference)?;
        let mut out = Vec::with_capacity(reference.len as usize);
        for id in pages {
            let buf = self.pager.page(id)?;
            let chunk_len = u16_at(buf, PAGE_HDR_LEN) as usize;
            let chunk = buf
                .get(OVERFLOW_BODY_OFF..OVERFLOW_BODY_OFF + chunk_len)
                .ok_or(IndexError::Corruption("overflow chunk overflows its page"))?;
            out.extend_from_slice(chunk);
        }
        if out.len() != reference.len as usize {
            return Err(IndexError::Corruption("overflow chain length mismatch"));
        }
        let capacity = self.chunk_capacity();
        if chunked_crc32(out.chunks(capacity)) != reference.crc32 {
            return Err(IndexError::Corruption("overflow chain checksum mismatch"));
        }
        Ok(out)
    }

    fn release(&mut self, entry: &Entry) -> Result<()> {
        if entry.flags & FLAG_OVERFLOW == 0 {
            return Ok(());
        }
        let reference = OverflowRef::decode(&entry.data)?;
        for id in self.overflow_pages(reference)? {
            self.pager.free(id)?;
        }
        Ok(())
    }
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::PagerOptions;
    use tempfile::tempdir;

    fn pager(dir: &std::path::Path) -> Pager {
        Pager::create(
            &dir.join("index"),
            PagerOptions {
                page_size: 512,
                ..PagerOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn small_records_share_the_fill_page() {
        let dir = tempdir().unwrap();
        let mut pager = pager(dir.path());
        pager.begin().unwrap();
        let mut store = RecordStore::new(&mut pager);
        let a = store.write(None, 0, LocationId(1), b"alpha").unwrap();
        let b = store.write(None, 1, LocationId(0), b"beta").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.read(a, 0, LocationId(1)).unwrap().unwrap(), b"alpha");
        assert_eq!(store.read(a, 1, LocationId(0)).unwrap().unwrap(), b"beta");
        assert_eq!(store.read(a, 2, LocationId(0)).unwrap(), None);

        let moved = store.write(Some(a), 0, LocationId(1), b"alpha-2").unwrap();
        assert_eq!(moved, a);
        assert_eq!(store.read(a, 0, LocationId(1)).unwrap().unwrap(), b"alpha-2");
        assert!(store.delete(a, 1, LocationId(0)).unwrap());
        assert!(!store.delete(a, 1, LocationId(0)).unwrap());
        pager.commit().unwrap();
    }

    #[test]
    fn growing_record_moves_off_a_full_page() {
        let dir = tempdir().unwrap();
        let mut pager = pager(dir.path());
        pager.begin().unwrap();
        let mut store = RecordStore::new(&mut pager);
        let limit = store.inline_limit();
        let home = store.write(None, 0, LocationId(0), b"tiny").unwrap();
        for loc in 1..4u32 {
            let placed = store
                .write(None, 0, LocationId(loc), &vec![loc as u8; limit])
                .unwrap();
            assert_eq!(placed, home);
        }
        let grown = vec![7u8; limit];
        let moved = store.write(Some(home), 0, LocationId(0), &grown).unwrap();
        assert_ne!(moved, home);
        assert_eq!(store.read(moved, 0, LocationId(0)).unwrap().unwrap(), grown);
        assert_eq!(store.read(home, 0, LocationId(0)).unwrap(), None);
        assert!(store.read(home, 0, LocationId(1)).unwrap().is_some());
        pager.commit().unwrap();
    }

    #[test]
    fn large_blob_uses_checked_overflow_chain() {
        let dir = tempdir().unwrap();
        let mut pager = pager(dir.path());
        pager.begin().unwrap();
        let blob: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let home = RecordStore::new(&mut pager)
            .write(None, 2, LocationId(9), &blob)
            .unwrap();
        let before_free = pager.meta().free_head;
        assert_eq!(
            RecordStore::new(&mut pager)
                .read(home, 2, LocationId(9))
                .unwrap()
                .unwrap(),
            blob
        );
        assert!(RecordStore::new(&mut pager)
            .delete(home, 2, LocationId(9))
            .unwrap());
        assert_ne!(pager.meta().free_head, before_free);
        pager.commit().unwrap();
    }

    #[test]
    fn damaged_overflow_chunk_is_corruption() {
        let dir = tempdir().unwrap();
        let mut pager = pager(dir.path());
        pager.begin().unwrap();
        let blob = vec![3u8; 1200];
        let home = RecordStore::new(&mut pager)
            .write(None, 0, LocationId(0), &blob)
            .unwrap();
        // Overflow pages are allocated before the record page.
        let first_chunk = PageId(1);
        pager.page_mut(first_chunk).unwrap()[OVERFLOW_BODY_OFF + 5] ^= 0xFF;
        let err = RecordStore::new(&mut pager)
            .read(home, 0, LocationId(0))
            .unwrap_err();
        assert!(matches!(err, IndexError::Corruption(_)));
        pager.rollback().unwrap();
    }
}
