//! Page access shared by both record stores.

use crate::disk::PagedFile;
use std::sync::Arc;
use xylem_buffer::{PageCache, PageCacheConfig, PageCacheStats};
use xylem_common::{Page, PageId, PageStatus, Result, StorageConfig, XylemError};

/// Couples a [`PagedFile`] with its [`PageCache`].
///
/// Pages are handed out as owned [`Page`] copies. A mutation is applied to
/// the copy and written back with [`Pager::store`], which replaces header and
/// data in one step and marks the cached page dirty.
pub struct Pager {
    file: Arc<PagedFile>,
    cache: PageCache<Arc<PagedFile>>,
}

impl Pager {
    /// Opens the store file `name` inside `config.data_dir`.
    pub fn open(config: &StorageConfig, name: &str) -> Result<Self> {
        config.validate()?;
        if !config.read_only {
            std::fs::create_dir_all(&config.data_dir)?;
        }
        let file = Arc::new(PagedFile::open(config.data_dir.join(name), config)?);
        let cache = PageCache::new(
            Arc::clone(&file),
            PageCacheConfig {
                num_frames: config.cache_pages,
            },
        );
        Ok(Self { file, cache })
    }

    pub fn file(&self) -> &PagedFile {
        &self.file
    }

    pub fn page_size(&self) -> usize {
        self.cache.page_size()
    }

    /// Bytes available for records on one page.
    pub fn working_size(&self) -> usize {
        self.page_size() - xylem_common::PageHeader::SIZE
    }

    pub fn is_read_only(&self) -> bool {
        self.file.is_read_only()
    }

    /// Fails with `ReadOnly` if the store cannot be mutated.
    pub fn check_writable(&self) -> Result<()> {
        if self.file.is_read_only() {
            return Err(XylemError::ReadOnly);
        }
        Ok(())
    }

    /// Loads a copy of a page through the cache.
    pub fn load(&self, page_id: PageId) -> Result<Page> {
        let handle = self.cache.fetch(page_id)?;
        let data = handle.read();
        Page::from_bytes(page_id, &data)
    }

    /// Loads a page that a chain link or address points at.
    ///
    /// A missing page is reported as corruption of `from`, the page holding
    /// the pointer.
    pub fn load_linked(&self, from: PageId, page_id: PageId) -> Result<Page> {
        match self.load(page_id) {
            Err(XylemError::PageNotFound { .. }) => {
                tracing::warn!(from = %from, target = %page_id, "dangling page link");
                Err(XylemError::corruption(
                    from,
                    format!("link to missing page {page_id}"),
                ))
            }
            other => other,
        }
    }

    /// Writes a page copy back to the cache and marks it dirty.
    pub fn store(&self, page: &mut Page) -> Result<()> {
        self.check_writable()?;
        let handle = self.cache.fetch(page.id())?;
        let mut data = handle.write();
        data.copy_from_slice(page.as_bytes());
        Ok(())
    }

    /// Allocates a fresh page with the given status.
    ///
    /// The page is installed in the cache but not yet stored; callers fill
    /// it and then [`Pager::store`] it.
    pub fn allocate(&self, status: PageStatus) -> Result<Page> {
        self.check_writable()?;
        let page_id = self.file.allocate_page()?;
        if let Err(e) = self.cache.create(page_id) {
            self.file.free_page(page_id)?;
            return Err(e);
        }
        Ok(Page::new(page_id, self.page_size(), status))
    }

    /// Returns a page to the free-page list, dropping its cached image.
    pub fn free(&self, page_id: PageId) -> Result<()> {
        self.check_writable()?;
        if self.cache.contains(page_id) && !self.cache.discard(page_id) {
            return Err(XylemError::Internal(format!(
                "cannot free pinned page {page_id}"
            )));
        }
        self.file.free_page(page_id)
    }

    /// Unlinks a page from its chain, fixing both neighbours, and frees it.
    pub fn release(&self, page: &Page) -> Result<()> {
        let header = *page.header();
        if header.prev_page.is_some() {
            let mut prev = self.load_linked(page.id(), header.prev_page)?;
            prev.header_mut().next_page = header.next_page;
            self.store(&mut prev)?;
        }
        if header.next_page.is_some() {
            let mut next = self.load_linked(page.id(), header.next_page)?;
            next.header_mut().prev_page = header.prev_page;
            self.store(&mut next)?;
        }
        self.free(page.id())
    }

    /// Writes every dirty page back in page order and syncs the file.
    pub fn flush(&self) -> Result<()> {
        if self.file.is_read_only() {
            return Ok(());
        }
        let flushed = self.cache.flush_all()?;
        self.file.sync()?;
        tracing::debug!(pages = flushed, path = %self.file.path().display(), "flushed store");
        Ok(())
    }

    /// Pages in the file, header page included.
    pub fn page_count(&self) -> u32 {
        self.file.page_count()
    }

    pub fn free_page_count(&self) -> u32 {
        self.file.free_page_count()
    }

    pub fn cache_stats(&self) -> PageCacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_pager() -> (Pager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: 512,
            cache_pages: 4,
            fsync_enabled: false,
            ..Default::default()
        };
        let pager = Pager::open(&config, "pager.dbx").unwrap();
        (pager, dir)
    }

    #[test]
    fn test_allocate_store_load() {
        let (pager, _dir) = create_test_pager();
        let mut page = pager.allocate(PageStatus::Record).unwrap();
        page.area_mut()[..3].copy_from_slice(b"xyz");
        page.set_data_length(3);
        pager.store(&mut page).unwrap();

        let loaded = pager.load(page.id()).unwrap();
        assert_eq!(loaded.status(), PageStatus::Record);
        assert_eq!(loaded.body(), b"xyz");
    }

    #[test]
    fn test_pages_survive_eviction() {
        let (pager, _dir) = create_test_pager();
        let mut ids = Vec::new();
        for i in 0..10u8 {
            let mut page = pager.allocate(PageStatus::Record).unwrap();
            page.area_mut()[0] = i;
            page.set_data_length(1);
            pager.store(&mut page).unwrap();
            ids.push(page.id());
        }
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(pager.load(*id).unwrap().body(), &[i as u8]);
        }
        assert!(pager.cache_stats().evictions > 0);
    }

    #[test]
    fn test_release_unlinks_neighbours() {
        let (pager, _dir) = create_test_pager();
        let mut a = pager.allocate(PageStatus::Record).unwrap();
        let mut b = pager.allocate(PageStatus::Record).unwrap();
        let mut c = pager.allocate(PageStatus::Record).unwrap();
        a.header_mut().next_page = b.id();
        b.header_mut().prev_page = a.id();
        b.header_mut().next_page = c.id();
        c.header_mut().prev_page = b.id();
        pager.store(&mut a).unwrap();
        pager.store(&mut b).unwrap();
        pager.store(&mut c).unwrap();

        pager.release(&b).unwrap();
        assert_eq!(pager.load(a.id()).unwrap().header().next_page, c.id());
        assert_eq!(pager.load(c.id()).unwrap().header().prev_page, a.id());
        assert_eq!(pager.free_page_count(), 1);
        assert_eq!(pager.load(b.id()).unwrap().status(), PageStatus::FreeList);
    }

    #[test]
    fn test_load_linked_reports_corruption() {
        let (pager, _dir) = create_test_pager();
        let err = pager.load_linked(PageId(1), PageId(500)).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_flush_persists() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: 512,
            fsync_enabled: false,
            ..Default::default()
        };
        let page_id;
        {
            let pager = Pager::open(&config, "flush.dbx").unwrap();
            let mut page = pager.allocate(PageStatus::Overflow).unwrap();
            page.set_data_length(7);
            pager.store(&mut page).unwrap();
            page_id = page.id();
            pager.flush().unwrap();
        }
        let pager = Pager::open(&config, "flush.dbx").unwrap();
        let page = pager.load(page_id).unwrap();
        assert_eq!(page.status(), PageStatus::Overflow);
        assert_eq!(page.data_length(), 7);
    }
}
