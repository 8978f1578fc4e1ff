//! Location directory: a chained array of record page addresses.
//!
//! Slot `location_id * stride + column` holds the record page of that
//! (location, column) pair, or 0 when there is no record. `stride` is the
//! layer count plus the file-info and dependents columns.

use tracing::trace;

use crate::primitives::pager::Pager;
use crate::types::{
    page::{self, PageKind, NO_PAGE, PAGE_HDR_LEN},
    IndexError, LocationId, PageId, Result,
};

const ENTRY_LEN: usize = 8;

pub struct Directory {
    pages: Vec<PageId>,
    stride: u64,
    per_page: u64,
    mark: Option<usize>,
}

impl Directory {
    /// Walks the directory chain from the meta page.
    pub fn load(pager: &mut Pager, columns: u16) -> Result<Self> {
        let per_page = ((pager.page_size() - PAGE_HDR_LEN) / ENTRY_LEN) as u64;
        let mut pages = Vec::new();
        let mut cursor = pager.meta().dir_head;
        let limit = pager.meta().next_page.0;
        while cursor.0 != NO_PAGE {
            if pages.len() as u64 >= limit {
                return Err(IndexError::Corruption("directory chain loops"));
            }
            let buf = pager.page(cursor)?;
            if page::kind_of(buf)? != PageKind::Directory {
                return Err(IndexError::Corruption("directory chain reaches a foreign page"));
            }
            pages.push(cursor);
            cursor = PageId(page::next_of(buf));
        }
        Ok(Self {
            pages,
            stride: u64::from(columns),
            per_page,
            mark: None,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn begin(&mut self) {
        self.mark = Some(self.pages.len());
    }

    pub fn commit(&mut self) {
        self.mark = None;
    }

    pub fn rollback(&mut self) {
        if let Some(len) = self.mark.take() {
            self.pages.truncate(len);
        }
    }

    fn slot(&self, location: LocationId, column: u16) -> Result<(usize, usize)> {
        if u64::from(column) >= self.stride {
            return Err(IndexError::InvalidOwned(format!(
                "column {column} outside directory stride {}",
                self.stride
            )));
        }
        let index = u64::from(location.0) * self.stride + u64::from(column);
        let page_idx = (index / self.per_page) as usize;
        let offset = PAGE_HDR_LEN + (index % self.per_page) as usize * ENTRY_LEN;
        Ok((page_idx, offset))
    }

    /// Record page of (location, column), if any.
    pub fn get(&self, pager: &mut Pager, location: LocationId, column: u16) -> Result<Option<PageId>> {
        let (page_idx, offset) = self.slot(location, column)?;
        let Some(page_id) = self.pages.get(page_idx).copied() else {
            return Ok(None);
        };
        let buf = pager.page(page_id)?;
        let mut raw = [0u8; ENTRY_LEN];
        raw.copy_from_slice(&buf[offset..offset + ENTRY_LEN]);
        let target = u64::from_be_bytes(raw);
        if target == NO_PAGE {
            return Ok(None);
        }
        if target >= pager.meta().next_page.0 {
            return Err(IndexError::CorruptionOwned(format!(
                "directory points location {location} to unallocated page {target}"
            )));
        }
        Ok(Some(PageId(target)))
    }

    /// Points (location, column) at `target`, or clears it with `None`.
    pub fn set(
        &mut self,
        pager: &mut Pager,
        location: LocationId,
        column: u16,
        target: Option<PageId>,
    ) -> Result<()> {
        let (page_idx, offset) = self.slot(location, column)?;
        if page_idx >= self.pages.len() {
            if target.is_none() {
                return Ok(());
            }
            while self.pages.len() <= page_idx {
                self.grow(pager)?;
            }
        }
        let page_id = self.pages[page_idx];
        let buf = pager.page_mut(page_id)?;
        let raw = target.map(|id| id.0).unwrap_or(NO_PAGE);
        buf[offset..offset + ENTRY_LEN].copy_from_slice(&raw.to_be_bytes());
        Ok(())
    }

    fn grow(&mut self, pager: &mut Pager) -> Result<()> {
        let id = pager.allocate(PageKind::Directory)?;
        match self.pages.last().copied() {
            Some(tail) => page::set_next(pager.page_mut(tail)?, id.0),
            None => pager.meta_mut()?.dir_head = id,
        }
        self.pages.push(id);
        trace!(page = id.0, pages = self.pages.len(), "storage.directory.grow");
        Ok(())
    }
}
