//! Overflow chains for values larger than one page.
//!
//! A chain is a list of whole pages with status `Overflow`, linked through
//! `next_page`. The first page records the full value length in its
//! `data_length` and the last page of the chain in its `prev_page`; every
//! following page records its own chunk length and its predecessor.

use crate::pager::Pager;
use xylem_common::{Page, PageId, PageStatus, Result, XylemError};

/// Largest value a chain can hold.
pub const MAX_OVERFLOW_LEN: usize = u32::MAX as usize;

/// Operations on overflow chains of one store.
pub struct OverflowChain<'a> {
    pager: &'a Pager,
}

impl<'a> OverflowChain<'a> {
    pub fn new(pager: &'a Pager) -> Self {
        Self { pager }
    }

    fn chunk_size(&self) -> usize {
        self.pager.working_size()
    }

    /// Bytes of the value held by the first page.
    fn first_chunk(&self, total: usize) -> usize {
        total.min(self.chunk_size())
    }

    /// Loads a page of the chain starting at `first`, checking its status.
    fn load_member(&self, from: PageId, page_id: PageId) -> Result<Page> {
        let page = self.pager.load_linked(from, page_id)?;
        if page.status() != PageStatus::Overflow {
            tracing::warn!(page = %page_id, status = ?page.status(), "overflow chain leads to a foreign page");
            return Err(XylemError::corruption(
                from,
                format!("overflow link to page {page_id} with status {:?}", page.status()),
            ));
        }
        Ok(page)
    }

    /// Writes `value` across freshly allocated pages and returns the first one.
    pub fn write(&self, value: &[u8]) -> Result<PageId> {
        if value.len() > MAX_OVERFLOW_LEN {
            return Err(XylemError::ValueTooLarge {
                size: value.len(),
                max: MAX_OVERFLOW_LEN,
            });
        }
        self.pager.check_writable()?;

        let chunk_size = self.chunk_size();
        let mut pages: Vec<Page> = Vec::new();
        let mut chunks = value.chunks(chunk_size);
        let first_chunk = chunks.next().unwrap_or(&[]);

        let mut first = self.pager.allocate(PageStatus::Overflow)?;
        first.area_mut()[..first_chunk.len()].copy_from_slice(first_chunk);
        first.set_data_length(value.len());
        let mut last_id = first.id();

        for chunk in chunks {
            let mut page = self.pager.allocate(PageStatus::Overflow)?;
            page.area_mut()[..chunk.len()].copy_from_slice(chunk);
            page.set_data_length(chunk.len());
            page.header_mut().prev_page = last_id;
            match pages.last_mut() {
                Some(prev) => prev.header_mut().next_page = page.id(),
                None => first.header_mut().next_page = page.id(),
            }
            last_id = page.id();
            pages.push(page);
        }
        first.header_mut().prev_page = last_id;

        self.pager.store(&mut first)?;
        for page in &mut pages {
            self.pager.store(page)?;
        }
        tracing::debug!(first = %first.id(), len = value.len(), pages = pages.len() + 1, "wrote overflow chain");
        Ok(first.id())
    }

    /// Returns the logical length of the value stored in the chain.
    pub fn length(&self, first: PageId) -> Result<usize> {
        let page = self.load_member(first, first)?;
        Ok(page.data_length())
    }

    /// Reads the whole value stored in the chain.
    pub fn read(&self, first: PageId) -> Result<Vec<u8>> {
        let page = self.load_member(first, first)?;
        let total = page.data_length();
        let mut value = Vec::with_capacity(total);
        value.extend_from_slice(&page.area()[..self.first_chunk(total)]);

        let mut current = page;
        while value.len() < total {
            let next = current.header().next_page;
            if next.is_none() {
                tracing::warn!(first = %first, read = value.len(), total, "overflow chain ends early");
                return Err(XylemError::corruption(
                    current.id(),
                    format!("overflow chain ends after {} of {} bytes", value.len(), total),
                ));
            }
            let page = self.load_member(current.id(), next)?;
            let chunk = page.data_length();
            if chunk == 0 || chunk > self.chunk_size() || chunk > total - value.len() {
                return Err(XylemError::corruption(
                    page.id(),
                    format!("overflow chunk of {chunk} bytes does not match value length"),
                ));
            }
            value.extend_from_slice(&page.area()[..chunk]);
            current = page;
        }

        if current.header().next_page.is_some() {
            return Err(XylemError::corruption(
                current.id(),
                "overflow chain continues past value length",
            ));
        }
        Ok(value)
    }

    /// Frees every page of the chain. Returns the number of pages freed.
    pub fn delete(&self, first: PageId) -> Result<usize> {
        self.pager.check_writable()?;
        let mut ids = Vec::new();
        let mut from = first;
        let mut next = first;
        while next.is_some() {
            let page = self.load_member(from, next)?;
            ids.push(page.id());
            from = page.id();
            next = page.header().next_page;
            if ids.len() > self.pager.page_count() as usize {
                return Err(XylemError::corruption(first, "overflow chain loops"));
            }
        }
        for id in &ids {
            self.pager.free(*id)?;
        }
        tracing::debug!(first = %first, pages = ids.len(), "deleted overflow chain");
        Ok(ids.len())
    }

    /// Appends `chunk` to the value, filling the last page before growing the chain.
    pub fn append(&self, first: PageId, chunk: &[u8]) -> Result<()> {
        self.pager.check_writable()?;
        let mut head = self.load_member(first, first)?;
        let total = head.data_length();
        if total + chunk.len() > MAX_OVERFLOW_LEN {
            return Err(XylemError::ValueTooLarge {
                size: total + chunk.len(),
                max: MAX_OVERFLOW_LEN,
            });
        }
        let chunk_size = self.chunk_size();
        let tail_id = head.header().prev_page;

        // the tail may be the head itself
        let mut tail = if tail_id == first || tail_id.is_none() {
            None
        } else {
            Some(self.load_member(first, tail_id)?)
        };
        let stale = match &tail {
            Some(page) => page.header().next_page.is_some() || page.data_length() > chunk_size,
            None => head.header().next_page.is_some() || total > chunk_size,
        };
        if stale {
            tracing::warn!(first = %first, tail = %tail_id, "overflow tail pointer does not name the last page");
            return Err(XylemError::corruption(first, "overflow tail pointer is stale"));
        }

        let mut rest = chunk;
        {
            let (page, used) = match tail.as_mut() {
                Some(page) => {
                    let used = page.data_length();
                    (page, used)
                }
                None => (&mut head, self.first_chunk(total)),
            };
            let take = rest.len().min(chunk_size - used);
            page.area_mut()[used..used + take].copy_from_slice(&rest[..take]);
            if page.id() != first {
                page.set_data_length(used + take);
            }
            rest = &rest[take..];
        }

        let mut grown: Vec<Page> = Vec::new();
        for piece in rest.chunks(chunk_size) {
            let mut page = self.pager.allocate(PageStatus::Overflow)?;
            page.area_mut()[..piece.len()].copy_from_slice(piece);
            page.set_data_length(piece.len());
            let prev = match grown.last_mut() {
                Some(prev) => prev,
                None => match tail.as_mut() {
                    Some(t) => t,
                    None => &mut head,
                },
            };
            prev.header_mut().next_page = page.id();
            page.header_mut().prev_page = prev.id();
            grown.push(page);
        }

        let new_tail = grown
            .last()
            .map(|p| p.id())
            .or(tail.as_ref().map(|p| p.id()))
            .unwrap_or(first);
        head.set_data_length(total + chunk.len());
        head.header_mut().prev_page = new_tail;

        self.pager.store(&mut head)?;
        if let Some(page) = tail.as_mut() {
            self.pager.store(page)?;
        }
        for page in &mut grown {
            self.pager.store(page)?;
        }
        Ok(())
    }
}
