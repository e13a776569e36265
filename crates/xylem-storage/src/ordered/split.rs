//! Page split for insertions that do not fit into their page.
//!
//! Every slot behind the insertion point leaves the page. Records move to
//! freshly allocated split pages as relocated records that remember the
//! address they are known by. A plain record leaves a forwarding link under
//! its old tuple id; an already relocated record keeps the link it has, which
//! is repointed once everything has moved. Links found in the tail stay with
//! the page. Links that no longer fit go to spill pages behind it.
//!
//! Resulting chain order:
//!
//! ```text
//! page -> existing spills -> new spills -> split pages -> old successor
//! ```

use super::OrderedRecordStore;
use crate::record::{self, LINK_LEN, PLAIN_OVERHEAD, Payload, RELOCATED_OVERHEAD, SlotKind};
use xylem_common::{Page, PageId, PageStatus, Result, VirtualAddress, XylemError};

/// A slot taken off the page being split.
enum Moved {
    /// Forwarding link, kept byte for byte.
    Link(Vec<u8>),
    Record {
        /// Address that has to forward to the record's new place.
        origin: VirtualAddress,
        relocated: bool,
        inline: Vec<u8>,
        overflow: Option<PageId>,
    },
}

/// A forwarding link to repoint after the move.
struct Patch {
    origin: VirtualAddress,
    target: VirtualAddress,
}

/// Every page of a split laid out in memory, nothing written yet.
struct Layout {
    page: Page,
    spills: Vec<Page>,
    new_spills: usize,
    split_pages: Vec<Page>,
    old_next: PageId,
    new_addr: VirtualAddress,
    links: usize,
    patches: Vec<Patch>,
    moved: usize,
}

impl OrderedRecordStore {
    /// Splits `page` at `offset` and stores `payload` right after the slots
    /// that stay. Returns the address of the new record.
    ///
    /// If the split fails before any page is written, the pages it allocated
    /// and the overflow chain of `payload` are freed again.
    pub(super) fn split(&self, page: Page, offset: usize, payload: Payload<'_>) -> Result<VirtualAddress> {
        let mut allocated = Vec::new();
        let layout = match self.lay_out_split(page, offset, payload, &mut allocated) {
            Ok(layout) => layout,
            Err(e) => {
                self.abandon_split(payload, &allocated);
                return Err(e);
            }
        };
        let Layout {
            mut page,
            mut spills,
            new_spills,
            mut split_pages,
            old_next,
            new_addr,
            links,
            patches,
            moved,
        } = layout;
        let page_id = page.id();

        let mut chain: Vec<&mut Page> = std::iter::once(&mut page)
            .chain(spills.iter_mut())
            .chain(split_pages.iter_mut())
            .collect();
        for i in 1..chain.len() {
            let prev_id = chain[i - 1].id();
            let id = chain[i].id();
            chain[i - 1].header_mut().next_page = id;
            chain[i].header_mut().prev_page = prev_id;
        }
        let mut last_id = page_id;
        if let Some(last) = chain.last_mut() {
            last.header_mut().next_page = old_next;
            last_id = last.id();
        }
        for member in chain {
            self.pager.store(member)?;
        }
        if old_next.is_some() {
            let mut successor = self.pager.load_linked(last_id, old_next)?;
            successor.header_mut().prev_page = last_id;
            self.pager.store(&mut successor)?;
        }

        // phase two: repoint links of records that had moved before
        for patch in &patches {
            let (mut stub_page, stub) = self.locate(patch.origin)?;
            if !stub.is_link() {
                tracing::warn!(origin = %patch.origin, "relocated record has no forwarding link");
                return Err(XylemError::corruption(
                    stub_page.id(),
                    format!("{} should forward to a relocated record", patch.origin),
                ));
            }
            record::set_forward(&mut stub_page, &stub, patch.target)?;
            self.pager.store(&mut stub_page)?;
        }

        tracing::debug!(
            page = %page_id,
            moved,
            links,
            patched = patches.len(),
            split_pages = split_pages.len(),
            new_spills,
            "split page"
        );
        Ok(new_addr)
    }

    /// Phase one: takes the tail off `page` and places it, the new value and
    /// the forwarding links on in-memory pages. Pages allocated on the way
    /// are recorded in `allocated`.
    fn lay_out_split(
        &self,
        mut page: Page,
        offset: usize,
        payload: Payload<'_>,
        allocated: &mut Vec<PageId>,
    ) -> Result<Layout> {
        let page_id = page.id();
        let work = page.working_size();

        let mut moved = Vec::new();
        for slot in record::slots_from(&page, offset) {
            let slot = slot?;
            let inline = match slot.payload(&page) {
                Payload::Inline(bytes) => bytes.to_vec(),
                Payload::Overflow(_) => Vec::new(),
            };
            moved.push(match slot.kind {
                SlotKind::Link { .. } => Moved::Link(page.body()[slot.offset..slot.end()].to_vec()),
                SlotKind::Plain => Moved::Record {
                    origin: VirtualAddress::new(page_id, slot.tid),
                    relocated: false,
                    inline,
                    overflow: slot.overflow,
                },
                SlotKind::Relocated { backlink } => Moved::Record {
                    origin: backlink,
                    relocated: true,
                    inline,
                    overflow: slot.overflow,
                },
            });
        }

        let mut spills = self.spill_pages(&page)?;
        let existing_spills = spills.len();
        let old_next = match spills.last() {
            Some(last) => last.header().next_page,
            None => page.header().next_page,
        };

        record::truncate(&mut page, offset);
        record::recount(&mut page)?;

        let link_count = moved
            .iter()
            .filter(|m| !matches!(m, Moved::Record { relocated: true, .. }))
            .count();
        let value_len = PLAIN_OVERHEAD + payload.stored_len();
        let value_stays = offset + link_count * LINK_LEN + value_len <= work;

        let mut split_pages: Vec<Page> = Vec::new();
        let new_addr = if value_stays {
            let tid = page.allocate_tid()?;
            record::append_slot(&mut page, &record::encode_plain(tid, payload))?;
            VirtualAddress::new(page_id, tid)
        } else {
            let target = self.next_page_with_room(&mut split_pages, value_len, PageStatus::Record, allocated)?;
            let tid = target.allocate_tid()?;
            record::append_slot(target, &record::encode_plain(tid, payload))?;
            VirtualAddress::new(target.id(), tid)
        };

        let mut links: Vec<Vec<u8>> = Vec::new();
        let mut patches: Vec<Patch> = Vec::new();
        let mut records_moved = 0usize;
        for entry in moved {
            let (origin, relocated, inline, overflow) = match entry {
                Moved::Link(bytes) => {
                    links.push(bytes);
                    continue;
                }
                Moved::Record {
                    origin,
                    relocated,
                    inline,
                    overflow,
                } => (origin, relocated, inline, overflow),
            };
            let payload = match overflow {
                Some(first) => Payload::Overflow(first),
                None => Payload::Inline(&inline),
            };
            let needed = RELOCATED_OVERHEAD + payload.stored_len();
            let target = self.next_page_with_room(&mut split_pages, needed, PageStatus::Record, allocated)?;
            let tid = target.allocate_tid()?;
            record::append_slot(target, &record::encode_relocated(tid, origin, payload))?;
            let moved_to = VirtualAddress::new(target.id(), tid);
            if relocated {
                patches.push(Patch {
                    origin,
                    target: moved_to,
                });
            } else {
                links.push(record::encode_link(origin.tid(), moved_to));
            }
            records_moved += 1;
        }

        for link in &links {
            if page.free_space() >= link.len() {
                record::append_slot(&mut page, link)?;
                continue;
            }
            let target = self.next_page_with_room(&mut spills, link.len(), PageStatus::Spill, allocated)?;
            record::append_slot(target, link)?;
        }

        Ok(Layout {
            page,
            new_spills: spills.len() - existing_spills,
            spills,
            split_pages,
            old_next,
            new_addr,
            links: links.len(),
            patches,
            moved: records_moved,
        })
    }

    /// Returns the last page of `pages` if it has `needed` free bytes,
    /// otherwise a newly allocated page pushed onto `pages`.
    fn next_page_with_room<'p>(
        &self,
        pages: &'p mut Vec<Page>,
        needed: usize,
        status: PageStatus,
        allocated: &mut Vec<PageId>,
    ) -> Result<&'p mut Page> {
        let fits = pages.last().is_some_and(|p| p.free_space() >= needed);
        if !fits {
            let page = self.pager.allocate(status)?;
            allocated.push(page.id());
            pages.push(page);
        }
        pages
            .last_mut()
            .ok_or_else(|| XylemError::Internal("split produced no page".to_string()))
    }

    /// Gives back what a failed split had taken before writing anything.
    fn abandon_split(&self, payload: Payload<'_>, allocated: &[PageId]) {
        for page_id in allocated {
            if let Err(e) = self.pager.free(*page_id) {
                tracing::warn!(page = %page_id, error = %e, "could not free page of a failed split");
            }
        }
        if let Payload::Overflow(first) = payload {
            self.discard_overflow(first);
        }
        tracing::debug!(pages = allocated.len(), "abandoned split");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Slot;
    use crate::ordered::WriterContext;
    use tempfile::tempdir;
    use xylem_common::StorageConfig;

    fn create_test_store() -> (OrderedRecordStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: 512,
            cache_pages: 32,
            fsync_enabled: false,
            ..Default::default()
        };
        let store = OrderedRecordStore::open(&config, "split.dom").unwrap();
        (store, dir)
    }

    /// Fills one page with `count` records of `len` bytes each.
    fn fill_page(store: &OrderedRecordStore, count: u16, len: usize) -> (WriterContext, Vec<VirtualAddress>) {
        let mut ctx = WriterContext::new();
        let addrs = (0..count)
            .map(|i| store.append(&mut ctx, &vec![i as u8; len]).unwrap())
            .collect::<Vec<_>>();
        assert!(addrs.iter().all(|a| a.page() == ctx.first_page()));
        (ctx, addrs)
    }

    fn slots_of(store: &OrderedRecordStore, page: PageId) -> Vec<Slot> {
        let page = store.pager.load(page).unwrap();
        record::slots(&page).map(|s| s.unwrap()).collect()
    }

    #[test]
    fn test_split_leaves_links_and_relocates() {
        let (store, _dir) = create_test_store();
        // 20 records of 20 bytes: 480 bytes, 7 free
        let (ctx, addrs) = fill_page(&store, 20, 20);
        let new = store.insert_after(addrs[9], b"new record").unwrap();

        let head = slots_of(&store, ctx.first_page());
        let links: Vec<_> = head.iter().filter(|s| s.is_link()).collect();
        assert_eq!(links.len(), 10);
        // the new value stays on the split page after the kept records
        assert_eq!(new.page(), ctx.first_page());

        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(store.get(*addr).unwrap().unwrap().to_vec(), vec![i as u8; 20]);
        }

        let pages = store.chain_pages(ctx.first_page()).unwrap();
        assert!(pages.len() >= 2);
        let moved = slots_of(&store, pages[1]);
        assert!(moved.iter().all(|s| matches!(s.kind, SlotKind::Relocated { .. })));
        assert_eq!(moved[0].logical_address(pages[1]), addrs[10]);
    }

    #[test]
    fn test_second_split_patches_existing_links() {
        let (store, _dir) = create_test_store();
        let (ctx, addrs) = fill_page(&store, 20, 20);
        store.insert_after(addrs[1], &[0xAA; 20]).unwrap();

        // the records behind addrs[2] are relocated already and their page is full
        let pages = store.chain_pages(ctx.first_page()).unwrap();
        assert_eq!(pages.len(), 3);
        assert!(store.pager.load(pages[1]).unwrap().free_space() < PLAIN_OVERHEAD + 20);
        store.insert_after(addrs[2], &[0xCC; 20]).unwrap();
        assert_eq!(store.chain_pages(ctx.first_page()).unwrap().len(), 4);

        // every original address still resolves in one hop
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(store.get(*addr).unwrap().unwrap().to_vec(), vec![i as u8; 20]);
            let (_, slot) = store.locate(*addr).unwrap();
            if let SlotKind::Link { forward } = slot.kind {
                let (_, target) = store.locate(forward).unwrap();
                assert!(!target.is_link());
            }
        }
    }

    #[test]
    fn test_links_spill_to_new_page() {
        let (store, _dir) = create_test_store();
        // 60 records of 4 bytes: 480 bytes, links for 57 of them need 570
        let (ctx, addrs) = fill_page(&store, 60, 4);
        store.insert_after(addrs[2], b"new!").unwrap();

        let pages = store.chain_pages(ctx.first_page()).unwrap();
        let second = store.pager.load(pages[1]).unwrap();
        assert_eq!(second.status(), PageStatus::Spill);
        assert!(slots_of(&store, pages[1]).iter().all(|s| s.is_link()));
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(store.get(*addr).unwrap().unwrap().to_vec(), vec![i as u8; 4]);
        }
    }

    #[test]
    fn test_split_chain_links_successor() {
        let (store, _dir) = create_test_store();
        let mut ctx = WriterContext::new();
        let mut addrs = Vec::new();
        for i in 0..30u8 {
            addrs.push(store.append(&mut ctx, &[i; 20]).unwrap());
        }
        let before = store.chain_pages(ctx.first_page()).unwrap();
        assert_eq!(before.len(), 2);
        store.insert_after(addrs[5], &[0xEE; 20]).unwrap();

        let after = store.chain_pages(ctx.first_page()).unwrap();
        assert_eq!(after.first(), before.first());
        assert_eq!(after.last(), before.last());
        let tail = store.pager.load(*after.last().unwrap()).unwrap();
        assert_eq!(tail.header().prev_page, after[after.len() - 2]);
    }
}
