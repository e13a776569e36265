//! Forward cursor over the records of a page chain.

use super::OrderedRecordStore;
use crate::record::{self, Slot};
use bytes::Bytes;
use xylem_common::{Page, PageId, Result, TupleId, VirtualAddress, XylemError};

/// Walks records in storage order, skipping forwarding links and reading
/// overflow values in full.
///
/// Yields the address a record is known by: for a relocated record that is
/// the address of the link forwarding to it.
pub struct RecordIterator<'a> {
    store: &'a OrderedRecordStore,
    page: Option<Page>,
    offset: usize,
    /// Physical position of the record returned last.
    last: Option<(PageId, TupleId, usize)>,
}

impl<'a> RecordIterator<'a> {
    pub(super) fn new(store: &'a OrderedRecordStore, page: Page, offset: usize) -> Self {
        Self {
            store,
            page: Some(page),
            offset,
            last: None,
        }
    }

    /// Page the cursor is on, or `PageId::NONE` after an error.
    pub fn page_id(&self) -> PageId {
        self.page.as_ref().map_or(PageId::NONE, |p| p.id())
    }

    /// Returns true if another record follows.
    pub fn has_next(&mut self) -> Result<bool> {
        Ok(self.seek()?.is_some())
    }

    /// Moves to the next record slot without consuming it.
    fn seek(&mut self) -> Result<Option<Slot>> {
        loop {
            let Some(page) = &self.page else {
                return Ok(None);
            };
            if self.offset >= page.data_length() {
                let next = page.header().next_page;
                if next.is_none() {
                    return Ok(None);
                }
                let from = page.id();
                let loaded = self.store.pager.load_linked(from, next)?;
                if !loaded.status().is_slotted() {
                    tracing::warn!(page = %next, status = ?loaded.status(), "chain leads to a non-record page");
                    return Err(XylemError::corruption(
                        from,
                        format!("chain link to page {next} with status {:?}", loaded.status()),
                    ));
                }
                self.page = Some(loaded);
                self.offset = 0;
                continue;
            }
            let slot = record::read_slot(page, self.offset)?;
            if slot.is_link() {
                self.offset = slot.end();
                continue;
            }
            return Ok(Some(slot));
        }
    }

    /// Removes the record returned last, together with its forwarding link.
    pub fn remove(&mut self) -> Result<()> {
        let (page_id, tid, slot_offset) = self
            .last
            .take()
            .ok_or_else(|| XylemError::Internal("no record to remove".to_string()))?;
        let on_current = self.page_id() == page_id;
        let next_page = self
            .page
            .as_ref()
            .map_or(PageId::NONE, |p| p.header().next_page);

        self.store.remove_at(VirtualAddress::new(page_id, tid))?;

        if !on_current {
            // the cursor moved on, pick up any header changes
            let current = self.page_id();
            if current.is_some() {
                self.page = Some(self.store.pager.load(current)?);
            }
            return Ok(());
        }
        let reloaded = self.store.pager.load(page_id)?;
        if reloaded.status().is_slotted() {
            self.page = Some(reloaded);
            self.offset = slot_offset;
        } else if next_page.is_some() {
            // the page was released with its last record
            self.page = Some(self.store.pager.load(next_page)?);
            self.offset = 0;
        } else {
            self.page = None;
        }
        Ok(())
    }
}

impl Iterator for RecordIterator<'_> {
    type Item = Result<(VirtualAddress, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = match self.seek() {
            Ok(Some(slot)) => slot,
            Ok(None) => return None,
            Err(e) => {
                self.page = None;
                return Some(Err(e));
            }
        };
        let page = self.page.as_ref()?;
        self.offset = slot.end();
        self.last = Some((page.id(), slot.tid, slot.offset));
        let addr = slot.logical_address(page.id());
        Some(self.store.read_payload(page, &slot).map(|value| (addr, value)))
    }
}
