//! Append-only location dictionary.
//!
//! Locations are interned into a chain of dictionary pages; a location's
//! position in the chain is its dense [`LocationId`]. The whole chain is
//! decoded into memory on open, so lookups never touch the pager.
//!
//! Page body: `count u16 | used u16 | entries`, each entry being a saved
//! [`Location`].

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::model::Location;
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::primitives::pager::Pager;
use crate::types::{
    page::{self, PageKind, NO_PAGE, PAGE_HDR_LEN},
    IndexError, LocationId, PageId, Result,
};

const COUNT_OFF: usize = PAGE_HDR_LEN;
const USED_OFF: usize = PAGE_HDR_LEN + 2;
const BODY_OFF: usize = PAGE_HDR_LEN + 4;

/// In-memory mirror of the dictionary chain.
#[derive(Default)]
pub struct Dictionary {
    entries: Vec<Location>,
    ids: FxHashMap<Location, LocationId>,
    pages: Vec<PageId>,
    mark: Option<(usize, usize)>,
}

impl Dictionary {
    /// Decodes the chain starting at the meta page's dictionary head.
    pub fn load(pager: &mut Pager) -> Result<Self> {
        let mut dict = Dictionary::default();
        let mut cursor = pager.meta().dict_head;
        let limit = pager.meta().next_page.0;
        while cursor.0 != NO_PAGE {
            if dict.pages.len() as u64 >= limit {
                return Err(IndexError::Corruption("dictionary chain loops"));
            }
            let buf = pager.page(cursor)?;
            if page::kind_of(buf)? != PageKind::Dictionary {
                return Err(IndexError::Corruption("dictionary chain reaches a foreign page"));
            }
            let count = u16_at(buf, COUNT_OFF) as usize;
            let used = u16_at(buf, USED_OFF) as usize;
            let body = buf
                .get(BODY_OFF..BODY_OFF + used)
                .ok_or(IndexError::Corruption("dictionary page overflows"))?;
            let mut reader = ByteReader::new(body);
            for _ in 0..count {
                let loc = Location::load(&mut reader)?;
                let id = LocationId(dict.entries.len() as u32);
                dict.ids.insert(loc.clone(), id);
                dict.entries.push(loc);
            }
            reader.finish()?;
            let next = page::next_of(buf);
            dict.pages.push(cursor);
            cursor = PageId(next);
        }
        let expected = pager.meta().location_count as usize;
        if dict.entries.len() != expected {
            return Err(IndexError::CorruptionOwned(format!(
                "dictionary holds {} locations, meta expects {expected}",
                dict.entries.len()
            )));
        }
        Ok(dict)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn lookup(&self, location: &Location) -> Option<LocationId> {
        self.ids.get(location).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LocationId, &Location)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, loc)| (LocationId(idx as u32), loc))
    }

    /// Remembers the current size so a rollback can forget later entries.
    pub fn begin(&mut self) {
        self.mark = Some((self.entries.len(), self.pages.len()));
    }

    pub fn commit(&mut self) {
        self.mark = None;
    }

    pub fn rollback(&mut self) {
        if let Some((entries, pages)) = self.mark.take() {
            for loc in self.entries.drain(entries..) {
                self.ids.remove(&loc);
            }
            self.pages.truncate(pages);
        }
    }

    /// Returns the id of `location`, appending it when new.
    pub fn intern(&mut self, pager: &mut Pager, location: &Location) -> Result<LocationId> {
        if let Some(id) = self.lookup(location) {
            return Ok(id);
        }
        let mut w = ByteWriter::new();
        location.save(&mut w);
        let encoded = w.into_inner();
        let capacity = pager.page_size() - BODY_OFF;
        if encoded.len() > capacity {
            return Err(IndexError::InvalidOwned(format!(
                "location `{}` is too large to intern",
                location.identifier()
            )));
        }
        let tail = match self.pages.last().copied() {
            Some(tail) => {
                let used = u16_at(pager.page(tail)?, USED_OFF) as usize;
                if used + encoded.len() <= capacity {
                    tail
                } else {
                    self.append_page(pager, Some(tail))?
                }
            }
            None => self.append_page(pager, None)?,
        };
        let buf = pager.page_mut(tail)?;
        let count = u16_at(buf, COUNT_OFF);
        let used = u16_at(buf, USED_OFF) as usize;
        let start = BODY_OFF + used;
        buf[start..start + encoded.len()].copy_from_slice(&encoded);
        put_u16(buf, COUNT_OFF, count + 1);
        put_u16(buf, USED_OFF, (used + encoded.len()) as u16);

        let id = LocationId(self.entries.len() as u32);
        self.entries.push(location.clone());
        self.ids.insert(location.clone(), id);
        pager.meta_mut()?.location_count = self.entries.len() as u32;
        trace!(id = id.0, location = %location, "storage.dictionary.intern");
        Ok(id)
    }

    fn append_page(&mut self, pager: &mut Pager, tail: Option<PageId>) -> Result<PageId> {
        let id = pager.allocate(PageKind::Dictionary)?;
        match tail {
            Some(tail) => page::set_next(pager.page_mut(tail)?, id.0),
            None => pager.meta_mut()?.dict_head = id,
        }
        pager.meta_mut()?.dict_tail = id;
        self.pages.push(id);
        Ok(id)
    }
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}
