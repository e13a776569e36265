//! Key-addressed record store.
//!
//! Values live in slotted `Record` pages and are reached through a
//! [`KeyIndex`]. Small values are stored inline; a value that does not fit
//! into one page is written to an overflow chain and its slot holds the
//! pointer to the chain. Placement reuses partly filled pages through the
//! [`FreeSpaceRegistry`], falling back to a fresh page.

use crate::freespace::FreeSpaceRegistry;
use crate::index::{KeyIndex, MemoryIndex};
use crate::overflow::OverflowChain;
use crate::pager::Pager;
use crate::record::{self, PLAIN_OVERHEAD, Payload, Slot};
use bytes::Bytes;
use parking_lot::Mutex;
use std::ops::Bound;
use xylem_buffer::PageCacheStats;
use xylem_common::{
    Page, PageId, PageStatus, Result, StorageConfig, VirtualAddress, XylemError,
};

/// Space accounting of one record page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageUsage {
    pub page: PageId,
    pub status: PageStatus,
    /// Bytes taken by slots.
    pub used: usize,
    /// Bytes still free in the data area.
    pub free: usize,
    /// Slots on the page.
    pub records: u16,
    /// Size of the data area.
    pub working: usize,
}

/// Record store addressed by key.
pub struct KeyedRecordStore<I: KeyIndex = MemoryIndex> {
    pager: Pager,
    index: I,
    /// Also serializes mutations.
    free_space: Mutex<FreeSpaceRegistry>,
}

impl KeyedRecordStore<MemoryIndex> {
    /// Opens or creates the store file `name` with an empty in-memory index.
    pub fn open(config: &StorageConfig, name: &str) -> Result<Self> {
        Self::open_with_index(config, name, MemoryIndex::new())
    }
}

impl<I: KeyIndex> KeyedRecordStore<I> {
    /// Opens or creates the store file `name` using `index` for key lookups.
    ///
    /// The free-space registry is rebuilt from the record pages in the file.
    pub fn open_with_index(config: &StorageConfig, name: &str, index: I) -> Result<Self> {
        let pager = Pager::open(config, name)?;
        let mut registry = FreeSpaceRegistry::new(config.min_free_space);
        for n in 1..pager.page_count() {
            let page = pager.load(PageId(n))?;
            if page.status() == PageStatus::Record && !page.is_exhausted() {
                registry.update(page.id(), page.free_space());
            }
        }
        tracing::info!(
            path = %pager.file().path().display(),
            pages = pager.page_count(),
            reusable = registry.len(),
            read_only = pager.is_read_only(),
            "opened keyed record store"
        );
        Ok(Self {
            pager,
            index,
            free_space: Mutex::new(registry),
        })
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    /// Stores `value` under `key` and returns the address of its slot.
    ///
    /// An existing key fails with `KeyExists` unless `overwrite` is set, in
    /// which case the old record is replaced and the index repointed.
    pub fn put(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<VirtualAddress> {
        self.pager.check_writable()?;
        let mut free_space = self.free_space.lock();
        match self.index.find(key)? {
            Some(_) if !overwrite => Err(XylemError::KeyExists),
            Some(old) => self.rewrite(&mut free_space, key, old, value),
            None => {
                let addr = self.store_value(&mut free_space, value)?;
                self.index.insert(key, addr)?;
                Ok(addr)
            }
        }
    }

    /// Appends `chunk` to the value of `key`, creating the key if absent.
    pub fn append(&self, key: &[u8], chunk: &[u8]) -> Result<VirtualAddress> {
        self.pager.check_writable()?;
        let mut free_space = self.free_space.lock();
        let Some(addr) = self.index.find(key)? else {
            let addr = self.store_value(&mut free_space, chunk)?;
            self.index.insert(key, addr)?;
            return Ok(addr);
        };

        let (mut page, slot) = self.locate(addr)?;
        if let Some(first) = slot.overflow {
            OverflowChain::new(&self.pager).append(first, chunk)?;
            return Ok(addr);
        }

        let grown = slot.value_len + chunk.len();
        if PLAIN_OVERHEAD + grown <= self.pager.working_size() && chunk.len() <= page.free_space() {
            record::extend_value(&mut page, &slot, chunk)?;
            self.pager.store(&mut page)?;
            free_space.update(page.id(), page.free_space());
            return Ok(addr);
        }

        let mut value = Vec::with_capacity(grown);
        if let Payload::Inline(bytes) = slot.payload(&page) {
            value.extend_from_slice(bytes);
        }
        value.extend_from_slice(chunk);
        self.rewrite(&mut free_space, key, addr, &value)
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        match self.index.find(key)? {
            Some(addr) => self.read_value(addr).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.index.find(key)?.is_some())
    }

    /// Removes `key` and its record. Fails with `KeyNotFound` if absent.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.pager.check_writable()?;
        let mut free_space = self.free_space.lock();
        let addr = self.index.find(key)?.ok_or(XylemError::KeyNotFound)?;
        self.delete_record(&mut free_space, addr)?;
        self.index.remove(key)?;
        Ok(())
    }

    /// Returns the entries whose keys fall inside the bounds, in key order.
    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Bytes)>> {
        self.index
            .scan(lower, upper)?
            .into_iter()
            .map(|(key, addr)| Ok((key, self.read_value(addr)?)))
            .collect()
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Space accounting of a record page.
    pub fn page_usage(&self, page_id: PageId) -> Result<PageUsage> {
        let page = self.pager.load(page_id)?;
        Ok(PageUsage {
            page: page_id,
            status: page.status(),
            used: page.data_length(),
            free: page.free_space(),
            records: page.header().record_count,
            working: page.working_size(),
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
        tracing::info!(path = %self.pager.file().path().display(), "closed keyed record store");
        Ok(())
    }

    /// Places a new record and returns its address.
    fn store_value(&self, free_space: &mut FreeSpaceRegistry, value: &[u8]) -> Result<VirtualAddress> {
        let working = self.pager.working_size();
        let overflow = if PLAIN_OVERHEAD + value.len() <= working {
            None
        } else {
            Some(OverflowChain::new(&self.pager).write(value)?)
        };
        let payload = match overflow {
            Some(first) => Payload::Overflow(first),
            None => Payload::Inline(value),
        };

        let mut page = self.find_page(free_space, PLAIN_OVERHEAD + payload.stored_len())?;
        let tid = page.allocate_tid()?;
        record::append_slot(&mut page, &record::encode_plain(tid, payload))?;
        self.pager.store(&mut page)?;
        free_space.update(page.id(), page.free_space());
        Ok(VirtualAddress::new(page.id(), tid))
    }

    /// Returns a record page with at least `needed` free bytes.
    fn find_page(&self, free_space: &mut FreeSpaceRegistry, needed: usize) -> Result<Page> {
        while let Some(candidate) = free_space.find_page(needed) {
            let page = self.pager.load(candidate)?;
            if page.status() != PageStatus::Record {
                free_space.remove(candidate);
                continue;
            }
            if page.is_exhausted() {
                tracing::warn!(page = %candidate, "tuple ids exhausted, placing elsewhere");
                free_space.remove(candidate);
                continue;
            }
            if page.free_space() < needed {
                tracing::debug!(
                    page = %candidate,
                    recorded = free_space.get(candidate).unwrap_or(0),
                    actual = page.free_space(),
                    "corrected stale free space hint"
                );
                free_space.update(candidate, page.free_space());
                continue;
            }
            return Ok(page);
        }
        let page = self.pager.allocate(PageStatus::Record)?;
        tracing::debug!(page = %page.id(), "allocated record page");
        Ok(page)
    }

    /// Writes `value` as a new record, drops the one at `old` and repoints `key`.
    fn rewrite(
        &self,
        free_space: &mut FreeSpaceRegistry,
        key: &[u8],
        old: VirtualAddress,
        value: &[u8],
    ) -> Result<VirtualAddress> {
        let addr = self.store_value(free_space, value)?;
        self.delete_record(free_space, old)?;
        self.index.insert(key, addr)?;
        Ok(addr)
    }

    /// Loads the page holding `addr` and decodes its slot.
    fn locate(&self, addr: VirtualAddress) -> Result<(Page, Slot)> {
        let page = match self.pager.load(addr.page()) {
            Err(XylemError::PageNotFound { page }) => {
                tracing::warn!(address = %addr, "index points past the end of the file");
                return Err(XylemError::corruption(page, format!("no page for {addr}")));
            }
            other => other?,
        };
        if page.status() != PageStatus::Record {
            tracing::warn!(address = %addr, status = ?page.status(), "index points at a non-record page");
            return Err(XylemError::corruption(
                page.id(),
                format!("{addr} is on a page with status {:?}", page.status()),
            ));
        }
        match record::find_slot(&page, addr.tid())? {
            Some(slot) => Ok((page, slot)),
            None => {
                tracing::warn!(address = %addr, "indexed record missing from its page");
                Err(XylemError::corruption(page.id(), format!("no slot for {addr}")))
            }
        }
    }

    fn read_value(&self, addr: VirtualAddress) -> Result<Bytes> {
        let (page, slot) = self.locate(addr)?;
        match slot.payload(&page) {
            Payload::Inline(bytes) => Ok(Bytes::copy_from_slice(bytes)),
            Payload::Overflow(first) => Ok(Bytes::from(OverflowChain::new(&self.pager).read(first)?)),
        }
    }

    /// Removes the record at `addr`, its overflow chain and, if it was the
    /// last record, its page.
    fn delete_record(&self, free_space: &mut FreeSpaceRegistry, addr: VirtualAddress) -> Result<()> {
        let (mut page, slot) = self.locate(addr)?;
        if let Some(first) = slot.overflow {
            OverflowChain::new(&self.pager).delete(first)?;
        }
        record::remove_slot(&mut page, &slot);
        if page.header().record_count == 0 {
            free_space.remove(page.id());
            self.pager.release(&page)?;
            tracing::debug!(page = %page.id(), "released empty record page");
        } else {
            self.pager.store(&mut page)?;
            free_space.update(page.id(), page.free_space());
        }
        Ok(())
    }
}
