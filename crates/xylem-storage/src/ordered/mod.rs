//! Record store preserving a caller-imposed order.
//!
//! Records of one document form a chain of `Record` pages linked through
//! `next_page`/`prev_page`; storage order along the chain is document order.
//! Records are appended at the end of a chain through a [`WriterContext`]
//! or inserted after an existing record. When an insertion does not fit,
//! the page is split: the tail of the page moves to new pages as relocated
//! records and forwarding links keep every handed-out address valid. A
//! forwarding link always points at the record itself, never at another
//! link.
//!
//! Links that do not fit on their page after a split go to `Spill` pages
//! placed directly behind it. A tuple id missing from a page is looked up
//! in its spill pages.

mod iter;
mod node;
mod split;

pub use iter::RecordIterator;
pub use node::{NodeError, NodeRecord};

use crate::overflow::OverflowChain;
use crate::pager::Pager;
use crate::record::{self, PLAIN_OVERHEAD, Payload, RELOCATED_OVERHEAD, Slot, SlotKind};
use bytes::Bytes;
use parking_lot::Mutex;
use xylem_buffer::PageCacheStats;
use xylem_common::{Page, PageId, PageStatus, Result, StorageConfig, VirtualAddress, XylemError};

/// Append cursor of one document.
///
/// Each writer keeps its own context so that documents built side by side
/// never share pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterContext {
    first_page: PageId,
    current_page: PageId,
}

impl WriterContext {
    /// Starts a new chain on the first append.
    pub fn new() -> Self {
        Self {
            first_page: PageId::NONE,
            current_page: PageId::NONE,
        }
    }

    /// Continues the chain starting at `first_page`, appending from `current_page`.
    pub fn resume(first_page: PageId, current_page: PageId) -> Self {
        Self {
            first_page,
            current_page,
        }
    }

    pub fn first_page(&self) -> PageId {
        self.first_page
    }

    pub fn current_page(&self) -> PageId {
        self.current_page
    }
}

impl Default for WriterContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Record store for document-ordered records.
pub struct OrderedRecordStore {
    pager: Pager,
    /// Serializes mutations.
    write_lock: Mutex<()>,
}

impl OrderedRecordStore {
    /// Opens or creates the store file `name`.
    pub fn open(config: &StorageConfig, name: &str) -> Result<Self> {
        let pager = Pager::open(config, name)?;
        tracing::info!(
            path = %pager.file().path().display(),
            pages = pager.page_count(),
            read_only = pager.is_read_only(),
            "opened ordered record store"
        );
        Ok(Self {
            pager,
            write_lock: Mutex::new(()),
        })
    }

    /// Appends `value` at the end of the writer's chain.
    pub fn append(&self, ctx: &mut WriterContext, value: &[u8]) -> Result<VirtualAddress> {
        self.pager.check_writable()?;
        let _guard = self.write_lock.lock();

        let overflow = self.write_overflow(value)?;
        let payload = payload_of(value, overflow);
        let mut page = match self.append_target(ctx, PLAIN_OVERHEAD + payload.stored_len()) {
            Ok(page) => page,
            Err(e) => {
                if let Some(first) = overflow {
                    self.discard_overflow(first);
                }
                return Err(e);
            }
        };
        let tid = page.allocate_tid()?;
        record::append_slot(&mut page, &record::encode_plain(tid, payload))?;
        self.pager.store(&mut page)?;
        ctx.current_page = page.id();
        Ok(VirtualAddress::new(page.id(), tid))
    }

    /// Inserts `value` directly after the record at `addr` in storage order.
    pub fn insert_after(&self, addr: VirtualAddress, value: &[u8]) -> Result<VirtualAddress> {
        self.pager.check_writable()?;
        let _guard = self.write_lock.lock();

        let (mut page, slot) = self.resolve(addr)?;
        if page.is_exhausted() {
            return Err(XylemError::PageExhausted { page: page.id() });
        }

        // links carry no position, so a tail made of links counts as the end
        let mut at_end = true;
        for tail in record::slots_from(&page, slot.end()) {
            if !tail?.is_link() {
                at_end = false;
                break;
            }
        }

        let overflow = self.write_overflow(value)?;
        let payload = payload_of(value, overflow);
        let slot_len = PLAIN_OVERHEAD + payload.stored_len();

        if at_end && page.free_space() < slot_len {
            let prepared = self
                .spill_tail(&page)
                .and_then(|tail| Ok((tail, self.pager.allocate(PageStatus::Record)?)));
            let (spill_tail, mut next) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    if let Some(first) = overflow {
                        self.discard_overflow(first);
                    }
                    return Err(e);
                }
            };
            let tid = next.allocate_tid()?;
            record::append_slot(&mut next, &record::encode_plain(tid, payload))?;
            match spill_tail {
                Some(mut last) => {
                    self.link_after(&mut last, &mut next)?;
                    self.pager.store(&mut last)?;
                }
                None => {
                    self.link_after(&mut page, &mut next)?;
                    self.pager.store(&mut page)?;
                }
            }
            self.pager.store(&mut next)?;
            tracing::debug!(after = %addr, page = %next.id(), "inserted on a new page");
            return Ok(VirtualAddress::new(next.id(), tid));
        }

        if page.free_space() >= slot_len {
            let tid = page.allocate_tid()?;
            let offset = if at_end { page.data_length() } else { slot.end() };
            record::insert_slot(&mut page, offset, &record::encode_plain(tid, payload))?;
            self.pager.store(&mut page)?;
            return Ok(VirtualAddress::new(page.id(), tid));
        }

        self.split(page, slot.end(), payload)
    }

    /// Returns the value stored at `addr`, or None if no record lives there.
    pub fn get(&self, addr: VirtualAddress) -> Result<Option<Bytes>> {
        match self.resolve(addr) {
            Ok((page, slot)) => self.read_payload(&page, &slot).map(Some),
            Err(XylemError::RecordNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Overwrites the value at `addr` with one of the same length.
    pub fn update(&self, addr: VirtualAddress, value: &[u8]) -> Result<()> {
        self.pager.check_writable()?;
        let _guard = self.write_lock.lock();

        let (mut page, slot) = self.resolve(addr)?;
        match slot.overflow {
            Some(first) => {
                let chain = OverflowChain::new(&self.pager);
                let current = chain.length(first)?;
                if current != value.len() {
                    return Err(XylemError::SizeMismatch {
                        expected: current,
                        actual: value.len(),
                    });
                }
                chain.delete(first)?;
                let rewritten = chain.write(value)?;
                record::overwrite_value(&mut page, &slot, &rewritten.to_disk().to_le_bytes())?;
            }
            None => record::overwrite_value(&mut page, &slot, value)?,
        }
        self.pager.store(&mut page)
    }

    /// Removes the record at `addr`, following a forwarding link.
    pub fn remove(&self, addr: VirtualAddress) -> Result<()> {
        self.pager.check_writable()?;
        let _guard = self.write_lock.lock();
        let (page, slot) = self.resolve(addr)?;
        self.remove_record(page, slot)
    }

    /// Removes the record physically stored at `addr`.
    ///
    /// Fails with `LinkRemoval` if the slot is a forwarding link: links go
    /// away only together with their record.
    pub fn remove_at(&self, addr: VirtualAddress) -> Result<()> {
        self.pager.check_writable()?;
        let _guard = self.write_lock.lock();
        let (page, slot) = self.locate(addr)?;
        if slot.is_link() {
            return Err(XylemError::LinkRemoval { address: addr });
        }
        self.remove_record(page, slot)
    }

    /// Frees every page of the chain starting at `first_page`, overflow
    /// chains included. Returns the number of chain pages freed.
    pub fn remove_all(&self, first_page: PageId) -> Result<usize> {
        self.pager.check_writable()?;
        let _guard = self.write_lock.lock();

        let pages = self.chain_pages(first_page)?;
        let chain = OverflowChain::new(&self.pager);
        for page_id in &pages {
            let page = self.pager.load(*page_id)?;
            for slot in record::slots(&page) {
                if let Some(first) = slot?.overflow {
                    chain.delete(first)?;
                }
            }
        }
        for page_id in &pages {
            self.pager.free(*page_id)?;
        }
        tracing::debug!(first = %first_page, pages = pages.len(), "removed document chain");
        Ok(pages.len())
    }

    /// Lists the pages of the chain starting at `first_page`, spill pages included.
    pub fn chain_pages(&self, first_page: PageId) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut from = first_page;
        let mut next = first_page;
        while next.is_some() {
            let page = self.pager.load_linked(from, next)?;
            if !page.status().is_slotted() {
                tracing::warn!(page = %next, status = ?page.status(), "chain leads to a non-record page");
                return Err(XylemError::corruption(
                    from,
                    format!("chain link to page {next} with status {:?}", page.status()),
                ));
            }
            pages.push(next);
            if pages.len() > self.pager.page_count() as usize {
                return Err(XylemError::corruption(first_page, "page chain loops"));
            }
            from = next;
            next = page.header().next_page;
        }
        Ok(pages)
    }

    /// Iterates the records of the chain starting at `first_page`.
    pub fn iter(&self, first_page: PageId) -> Result<RecordIterator<'_>> {
        let page = self.pager.load(first_page)?;
        Ok(RecordIterator::new(self, page, 0))
    }

    /// Iterates the records stored after the one at `addr`.
    pub fn iter_after(&self, addr: VirtualAddress) -> Result<RecordIterator<'_>> {
        let (page, slot) = self.resolve(addr)?;
        let offset = slot.end();
        Ok(RecordIterator::new(self, page, offset))
    }

    /// Concatenates the text content of the node stored at `addr`.
    ///
    /// Elements contribute the text of their descendants. Attributes,
    /// comments and processing instructions contribute only when they are
    /// the node asked for. With `add_whitespace` the contributions of
    /// sibling children are separated by one space.
    pub fn node_value(&self, addr: VirtualAddress, add_whitespace: bool) -> Result<String> {
        let (page, slot) = self.resolve(addr)?;
        let node = self.decode_node(addr, &self.read_payload(&page, &slot)?)?;
        let mut out = String::new();
        match node {
            NodeRecord::Element { children, .. } => {
                let mut iter = RecordIterator::new(self, page, slot.end());
                self.collect_children(&mut iter, children, add_whitespace, &mut out)?;
            }
            NodeRecord::Attribute { value, .. } => out.push_str(&value),
            NodeRecord::Text(content) | NodeRecord::CData(content) | NodeRecord::Comment(content) => {
                out.push_str(&content)
            }
            NodeRecord::ProcessingInstruction { data, .. } => out.push_str(&data),
        }
        Ok(out)
    }

    fn collect_children(
        &self,
        iter: &mut RecordIterator<'_>,
        children: u32,
        add_whitespace: bool,
        out: &mut String,
    ) -> Result<()> {
        let mut emitted = false;
        for _ in 0..children {
            let (addr, value) = match iter.next() {
                Some(entry) => entry?,
                None => {
                    tracing::warn!("element has fewer stored children than recorded");
                    return Err(XylemError::corruption(
                        iter.page_id(),
                        "element children run past the end of the chain",
                    ));
                }
            };
            let mut part = String::new();
            match self.decode_node(addr, &value)? {
                NodeRecord::Element { children, .. } => {
                    self.collect_children(iter, children, add_whitespace, &mut part)?
                }
                NodeRecord::Text(content) | NodeRecord::CData(content) => part = content,
                _ => {}
            }
            if part.is_empty() {
                continue;
            }
            if add_whitespace && emitted {
                out.push(' ');
            }
            out.push_str(&part);
            emitted = true;
        }
        Ok(())
    }

    fn decode_node(&self, addr: VirtualAddress, value: &[u8]) -> Result<NodeRecord> {
        NodeRecord::decode(value).map_err(|e| {
            tracing::warn!(address = %addr, error = %e, "undecodable node record");
            XylemError::corruption(addr.page(), format!("node record {addr}: {e}"))
        })
    }

    pub fn page_count(&self) -> u32 {
        self.pager.page_count()
    }

    pub fn free_page_count(&self) -> u32 {
        self.pager.free_page_count()
    }

    pub fn cache_stats(&self) -> PageCacheStats {
        self.pager.cache_stats()
    }

    /// Writes all dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.pager.flush()
    }

    /// Flushes and closes the store.
    pub fn close(self) -> Result<()> {
        self.pager.flush()?;
        tracing::info!(path = %self.pager.file().path().display(), "closed ordered record store");
        Ok(())
    }

    /// Writes an overflow chain if `value` cannot live in a page.
    ///
    /// Inline records leave room for the backlink a split may add.
    fn write_overflow(&self, value: &[u8]) -> Result<Option<PageId>> {
        if RELOCATED_OVERHEAD + value.len() <= self.pager.working_size() {
            return Ok(None);
        }
        OverflowChain::new(&self.pager).write(value).map(Some)
    }

    /// Frees the overflow chain of a record that was never stored.
    ///
    /// Runs on an error path, so a failure is logged and the original error
    /// is the one reported.
    fn discard_overflow(&self, first: PageId) {
        match OverflowChain::new(&self.pager).delete(first) {
            Ok(pages) => tracing::debug!(page = %first, pages, "freed overflow chain of a failed insert"),
            Err(e) => tracing::warn!(page = %first, error = %e, "could not free overflow chain of a failed insert"),
        }
    }

    fn read_payload(&self, page: &Page, slot: &Slot) -> Result<Bytes> {
        match slot.payload(page) {
            Payload::Inline(bytes) => Ok(Bytes::copy_from_slice(bytes)),
            Payload::Overflow(first) => Ok(Bytes::from(OverflowChain::new(&self.pager).read(first)?)),
        }
    }

    /// Finds the slot with the tuple id of `addr`, looking into the spill
    /// pages of its page on a miss.
    fn locate(&self, addr: VirtualAddress) -> Result<(Page, Slot)> {
        let not_found = || XylemError::RecordNotFound { address: addr };
        let mut page = match self.pager.load(addr.page()) {
            Err(XylemError::PageNotFound { .. }) => return Err(not_found()),
            other => other?,
        };
        if page.status() != PageStatus::Record {
            return Err(not_found());
        }
        loop {
            if let Some(slot) = record::find_slot(&page, addr.tid())? {
                return Ok((page, slot));
            }
            let next = page.header().next_page;
            if next.is_none() {
                return Err(not_found());
            }
            let spill = self.pager.load_linked(page.id(), next)?;
            if spill.status() != PageStatus::Spill {
                return Err(not_found());
            }
            page = spill;
        }
    }

    /// Locates `addr` and follows a forwarding link to the record itself.
    fn resolve(&self, addr: VirtualAddress) -> Result<(Page, Slot)> {
        let (page, slot) = self.locate(addr)?;
        let SlotKind::Link { forward } = slot.kind else {
            return Ok((page, slot));
        };
        let (target, target_slot) = match self.locate(forward) {
            Err(XylemError::RecordNotFound { .. }) => {
                tracing::warn!(address = %addr, forward = %forward, "dangling forwarding link");
                return Err(XylemError::corruption(
                    page.id(),
                    format!("link {addr} points at missing record {forward}"),
                ));
            }
            other => other?,
        };
        match target_slot.kind {
            SlotKind::Link { .. } => {
                tracing::warn!(address = %addr, forward = %forward, "forwarding link points at another link");
                Err(XylemError::corruption(
                    target.id(),
                    format!("link {addr} points at link {forward}"),
                ))
            }
            SlotKind::Relocated { backlink } if backlink != addr => Err(XylemError::corruption(
                target.id(),
                format!("record {forward} links back to {backlink}, not {addr}"),
            )),
            _ => Ok((target, target_slot)),
        }
    }

    /// Removes a record slot, its forwarding link and its overflow chain.
    fn remove_record(&self, page: Page, slot: Slot) -> Result<()> {
        let page_id = page.id();
        let tid = slot.tid;

        if let SlotKind::Relocated { backlink } = slot.kind {
            let (mut origin, stub) = self.locate(backlink)?;
            if !stub.is_link() {
                return Err(XylemError::corruption(
                    origin.id(),
                    format!("{backlink} should forward to a relocated record"),
                ));
            }
            record::remove_slot(&mut origin, &stub);
            self.pager.store(&mut origin)?;
            self.reclaim(origin)?;
        }
        if let Some(first) = slot.overflow {
            OverflowChain::new(&self.pager).delete(first)?;
        }

        let mut page = self.pager.load(page_id)?;
        let slot = record::find_slot(&page, tid)?.ok_or_else(|| {
            XylemError::corruption(page_id, format!("slot {tid} vanished during removal"))
        })?;
        record::remove_slot(&mut page, &slot);
        self.pager.store(&mut page)?;
        self.reclaim(page)
    }

    /// Releases a page left without slots unless the chain still needs it.
    ///
    /// Chain heads and tails stay, as does a page whose links live on a
    /// spill page. An emptied spill page goes, and its owner is checked
    /// again.
    fn reclaim(&self, page: Page) -> Result<()> {
        if page.header().record_count > 0 {
            return Ok(());
        }
        let header = *page.header();
        match page.status() {
            PageStatus::Spill => {
                self.pager.release(&page)?;
                tracing::debug!(page = %page.id(), "released empty spill page");
                if header.prev_page.is_some() {
                    let owner = self.pager.load_linked(page.id(), header.prev_page)?;
                    self.reclaim(owner)?;
                }
                Ok(())
            }
            PageStatus::Record => {
                if header.prev_page.is_none() || header.next_page.is_none() {
                    return Ok(());
                }
                let next = self.pager.load_linked(page.id(), header.next_page)?;
                if next.status() == PageStatus::Spill {
                    return Ok(());
                }
                self.pager.release(&page)?;
                tracing::debug!(page = %page.id(), "released empty record page");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Returns the page a new append goes to, linking a fresh one at the end
    /// of the chain when needed. The returned page is not yet stored.
    fn append_target(&self, ctx: &mut WriterContext, needed: usize) -> Result<Page> {
        if ctx.current_page.is_none() {
            let page = self.pager.allocate(PageStatus::Record)?;
            ctx.first_page = page.id();
            ctx.current_page = page.id();
            tracing::debug!(page = %page.id(), "started document chain");
            return Ok(page);
        }

        let mut page = match self.load_record_page(ctx.current_page)? {
            Some(page) => page,
            None => {
                tracing::debug!(page = %ctx.current_page, "current page is gone, walking from the chain head");
                self.load_record_page(ctx.first_page)?.ok_or_else(|| {
                    XylemError::corruption(ctx.first_page, "document chain head is not a record page")
                })?
            }
        };
        while page.header().next_page.is_some() {
            page = self.pager.load_linked(page.id(), page.header().next_page)?;
        }

        if page.status() == PageStatus::Record
            && !page.is_exhausted()
            && page.free_space() >= needed
        {
            return Ok(page);
        }
        if page.is_exhausted() {
            tracing::warn!(page = %page.id(), "tuple ids exhausted, appending to a new page");
        }
        let mut next = self.pager.allocate(PageStatus::Record)?;
        self.link_after(&mut page, &mut next)?;
        self.pager.store(&mut page)?;
        tracing::debug!(after = %page.id(), page = %next.id(), "extended document chain");
        Ok(next)
    }

    fn load_record_page(&self, page_id: PageId) -> Result<Option<Page>> {
        if page_id.is_none() {
            return Ok(None);
        }
        match self.pager.load(page_id) {
            Ok(page) if page.status() == PageStatus::Record => Ok(Some(page)),
            Ok(_) | Err(XylemError::PageNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the spill pages directly behind `page`, in chain order.
    fn spill_pages(&self, page: &Page) -> Result<Vec<Page>> {
        let mut spills = Vec::new();
        let mut from = page.id();
        let mut next = page.header().next_page;
        while next.is_some() {
            let candidate = self.pager.load_linked(from, next)?;
            if candidate.status() != PageStatus::Spill {
                break;
            }
            from = candidate.id();
            next = candidate.header().next_page;
            spills.push(candidate);
        }
        Ok(spills)
    }

    /// Returns the last spill page behind `page`, if any.
    fn spill_tail(&self, page: &Page) -> Result<Option<Page>> {
        Ok(self.spill_pages(page)?.pop())
    }

    /// Splices `new` into the chain right after `after`.
    ///
    /// Fixes the back pointer of the old successor and stores it; both
    /// `after` and `new` are left for the caller to store.
    fn link_after(&self, after: &mut Page, new: &mut Page) -> Result<()> {
        let old_next = after.header().next_page;
        if old_next.is_some() {
            let mut successor = self.pager.load_linked(after.id(), old_next)?;
            successor.header_mut().prev_page = new.id();
            self.pager.store(&mut successor)?;
        }
        new.header_mut().prev_page = after.id();
        new.header_mut().next_page = old_next;
        after.header_mut().next_page = new.id();
        Ok(())
    }
}

fn payload_of(value: &[u8], overflow: Option<PageId>) -> Payload<'_> {
    match overflow {
        Some(first) => Payload::Overflow(first),
        None => Payload::Inline(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_store() -> (OrderedRecordStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: 512,
            cache_pages: 16,
            fsync_enabled: false,
            ..Default::default()
        };
        let store = OrderedRecordStore::open(&config, "nodes.dom").unwrap();
        (store, dir)
    }

    fn values(store: &OrderedRecordStore, first: PageId) -> Vec<Vec<u8>> {
        store
            .iter(first)
            .unwrap()
            .map(|entry| entry.unwrap().1.to_vec())
            .collect()
    }

    #[test]
    fn test_append_fills_then_links_pages() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let mut addrs = Vec::new();
        for i in 0..100u32 {
            addrs.push(store.append(&mut ctx, &i.to_le_bytes()).unwrap());
        }
        let pages = store.chain_pages(ctx.first_page()).unwrap();
        assert!(pages.len() > 1);
        assert_eq!(ctx.current_page(), *pages.last().unwrap());
        assert_eq!(addrs[0].page(), ctx.first_page());

        let expected: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_le_bytes().to_vec()).collect();
        assert_eq!(values(&store, ctx.first_page()), expected);
    }

    #[test]
    fn test_writers_do_not_share_pages() {
        let (store, _dir) = create_test_store();
        let mut a = WriterContext::new();
        let mut b = WriterContext::new();
        let x = store.append(&mut a, b"a1").unwrap();
        let y = store.append(&mut b, b"b1").unwrap();
        store.append(&mut a, b"a2").unwrap();
        assert_ne!(x.page(), y.page());
        assert_eq!(values(&store, a.first_page()), vec![b"a1".to_vec(), b"a2".to_vec()]);
        assert_eq!(values(&store, b.first_page()), vec![b"b1".to_vec()]);
    }

    #[test]
    fn test_insert_after_shifts_in_page() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let a = store.append(&mut ctx, b"a").unwrap();
        let c = store.append(&mut ctx, b"c").unwrap();
        let b = store.insert_after(a, b"b").unwrap();
        assert_eq!(b.page(), a.page());
        assert_eq!(
            values(&store, ctx.first_page()),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(store.get(c).unwrap().unwrap(), Bytes::from_static(b"c"));
    }

    #[test]
    fn test_insert_after_last_on_full_page() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let big = vec![1u8; 487 - PLAIN_OVERHEAD - RELOCATED_OVERHEAD];
        let first = store.append(&mut ctx, &big).unwrap();
        let last = store.append(&mut ctx, b"12345678").unwrap();
        assert_eq!(first.page(), last.page());

        let added = store.insert_after(last, b"next").unwrap();
        assert_ne!(added.page(), last.page());
        let pages = store.chain_pages(ctx.first_page()).unwrap();
        assert_eq!(pages, vec![first.page(), added.page()]);
    }

    #[test]
    fn test_link_to_link_is_corruption() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let a = store.append(&mut ctx, b"a").unwrap();
        let target = store.append(&mut ctx, b"t").unwrap();

        // forge a link at a new slot that forwards to another link
        let mut page = store.pager.load(a.page()).unwrap();
        let l1 = page.allocate_tid().unwrap();
        let l2 = page.allocate_tid().unwrap();
        let nested = record::encode_link(l1, VirtualAddress::new(a.page(), l2));
        record::append_slot(&mut page, &nested).unwrap();
        record::append_slot(&mut page, &record::encode_link(l2, target)).unwrap();
        store.pager.store(&mut page).unwrap();

        let err = store.get(VirtualAddress::new(a.page(), l1)).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_remove_at_rejects_link() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let a = store.append(&mut ctx, b"a").unwrap();
        let mut page = store.pager.load(a.page()).unwrap();
        let tid = page.allocate_tid().unwrap();
        record::append_slot(&mut page, &record::encode_link(tid, a)).unwrap();
        store.pager.store(&mut page).unwrap();

        let link = VirtualAddress::new(a.page(), tid);
        assert!(matches!(
            store.remove_at(link),
            Err(XylemError::LinkRemoval { .. })
        ));
    }

    #[test]
    fn test_update_same_length_only() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let a = store.append(&mut ctx, b"abc").unwrap();
        store.update(a, b"xyz").unwrap();
        assert_eq!(store.get(a).unwrap().unwrap(), Bytes::from_static(b"xyz"));
        assert!(matches!(
            store.update(a, b"toolong"),
            Err(XylemError::SizeMismatch { expected: 3, actual: 7 })
        ));
    }

    #[test]
    fn test_update_overflow_value() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let big = vec![5u8; 1500];
        let a = store.append(&mut ctx, &big).unwrap();
        let replacement = vec![6u8; 1500];
        store.update(a, &replacement).unwrap();
        assert_eq!(store.get(a).unwrap().unwrap(), replacement);
        assert!(store.update(a, &[6u8; 10]).is_err());
    }

    #[test]
    fn test_empty_interior_page_is_released() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let filler = vec![0u8; 200];
        let mut addrs = Vec::new();
        for _ in 0..6 {
            addrs.push(store.append(&mut ctx, &filler).unwrap());
        }
        let pages = store.chain_pages(ctx.first_page()).unwrap();
        assert_eq!(pages.len(), 3);

        // both records of the middle page
        let middle: Vec<_> = addrs.iter().filter(|a| a.page() == pages[1]).copied().collect();
        assert_eq!(middle.len(), 2);
        for addr in middle {
            store.remove(addr).unwrap();
        }
        assert_eq!(store.chain_pages(ctx.first_page()).unwrap(), vec![pages[0], pages[2]]);
        assert_eq!(store.free_page_count(), 1);
    }

    #[test]
    fn test_head_and_tail_are_kept() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let a = store.append(&mut ctx, b"only").unwrap();
        store.remove(a).unwrap();
        assert_eq!(store.free_page_count(), 0);
        assert_eq!(store.get(a).unwrap(), None);

        // the writer keeps appending to the retained page
        let b = store.append(&mut ctx, b"again").unwrap();
        assert_eq!(b.page(), a.page());
        assert_ne!(b.tid(), a.tid());
    }

    #[test]
    fn test_resume_walks_to_tail() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        for i in 0..70u32 {
            store.append(&mut ctx, &i.to_le_bytes()).unwrap();
        }
        assert_ne!(ctx.first_page(), ctx.current_page());
        let mut resumed = WriterContext::resume(ctx.first_page(), ctx.first_page());
        let addr = store.append(&mut resumed, b"end!").unwrap();
        assert_eq!(addr.page(), ctx.current_page());
        let all = values(&store, ctx.first_page());
        assert_eq!(all.last().unwrap(), b"end!");
    }

    #[test]
    fn test_exhausted_page_rules() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let a = store.append(&mut ctx, b"first").unwrap();
        let mut page = store.pager.load(a.page()).unwrap();
        page.header_mut().next_tuple_id = xylem_common::TupleId::MAX + 1;
        store.pager.store(&mut page).unwrap();

        let pages = store.page_count();
        assert!(matches!(
            store.insert_after(a, b"x"),
            Err(XylemError::PageExhausted { page }) if page == a.page()
        ));
        assert_eq!(store.page_count(), pages);

        // appends move on to a new page instead
        let b = store.append(&mut ctx, b"second").unwrap();
        assert_ne!(b.page(), a.page());
        assert_eq!(ctx.current_page(), b.page());
        assert_eq!(store.chain_pages(ctx.first_page()).unwrap(), vec![a.page(), b.page()]);
        assert_eq!(
            values(&store, ctx.first_page()),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn test_failed_insert_frees_overflow_chain() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let addrs: Vec<_> = (0..20u8)
            .map(|i| store.append(&mut ctx, &[i; 20]).unwrap())
            .collect();

        // the last slot claims more bytes than the page holds
        let mut page = store.pager.load(ctx.first_page()).unwrap();
        let last = record::find_slot(&page, addrs[19].tid()).unwrap().unwrap();
        let len_at = last.offset + 2;
        page.area_mut()[len_at..len_at + 2].copy_from_slice(&100u16.to_le_bytes());
        store.pager.store(&mut page).unwrap();

        // the tail check runs into it before anything is written
        let pages = store.page_count();
        let big = vec![9u8; 1000];
        assert!(store.insert_after(addrs[18], &big).unwrap_err().is_corruption());
        assert_eq!(store.page_count(), pages);

        // the split runs into it after the overflow chain was written
        assert!(store.insert_after(addrs[2], &big).unwrap_err().is_corruption());
        assert!(store.page_count() > pages);
        assert_eq!(store.free_page_count(), store.page_count() - pages);
        assert_eq!(store.get(addrs[2]).unwrap().unwrap().to_vec(), vec![2u8; 20]);
    }
}
