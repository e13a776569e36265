//! Page cache manager.

use crate::frame::{Frame, FrameId};
use crate::replacer::{ClockReplacer, Replacer};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::System;
use xylem_common::{PageId, Result, XylemError};

/// Fixed-size page I/O underneath the cache.
pub trait PageDevice: Send + Sync {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;

    /// Reads page `page_id` into `buf`.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` as the new image of page `page_id`.
    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()>;
}

impl<D: PageDevice + ?Sized> PageDevice for Arc<D> {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        (**self).read_page(page_id, buf)
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        (**self).write_page(page_id, buf)
    }
}

/// Configuration for the page cache.
#[derive(Debug, Clone)]
pub struct PageCacheConfig {
    /// Number of frames in the cache.
    pub num_frames: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self { num_frames: 256 }
    }
}

/// Page cache.
///
/// Keeps recently used pages in a fixed set of frames:
/// - pages are loaded from the device on a miss
/// - pinned pages are never evicted
/// - clock replacement picks the victim when no frame is free
/// - dirty victims are written back before their frame is reused
pub struct PageCache<D: PageDevice> {
    device: D,
    page_size: usize,
    frames: Vec<Frame>,
    page_table: Mutex<HashMap<PageId, FrameId>>,
    free_list: Mutex<Vec<FrameId>>,
    replacer: ClockReplacer,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<D: PageDevice> PageCache<D> {
    /// Creates a new page cache over `device`.
    pub fn new(device: D, config: PageCacheConfig) -> Self {
        let num_frames = config.num_frames.max(1);
        let page_size = device.page_size();

        let frames: Vec<_> = (0..num_frames)
            .map(|i| Frame::new(FrameId(i as u32), page_size))
            .collect();

        // pop() hands out low frame ids first
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            device,
            page_size,
            frames,
            page_table: Mutex::new(HashMap::with_capacity(num_frames)),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Creates a cache sized to 10% of available system RAM.
    ///
    /// Never smaller than 64 frames so small machines still cache a working
    /// set of pages.
    pub fn auto_sized(device: D) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let target_bytes = sys.available_memory() as usize / 10;
        let num_frames = (target_bytes / device.page_size().max(1)).max(64);

        Self::new(device, PageCacheConfig { num_frames })
    }

    /// Returns the underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of pages currently cached.
    pub fn cached_pages(&self) -> usize {
        self.page_table.lock().len()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.lock().contains_key(&page_id)
    }

    fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id.0 as usize]
    }

    fn pin_frame(&self, frame_id: FrameId) -> &Frame {
        let frame = self.frame(frame_id);
        if frame.pin() == 0 {
            self.replacer.set_evictable(frame_id, false);
        }
        self.replacer.record_access(frame_id);
        frame
    }

    fn release_frame(&self, frame_id: FrameId) {
        if self.frame(frame_id).unpin() == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
    }

    /// Finds a frame for a new page, evicting if necessary.
    ///
    /// Must be called with the page table locked.
    fn allocate_frame(&self, page_table: &mut HashMap<PageId, FrameId>) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }

        let Some(victim) = self.replacer.evict() else {
            tracing::error!(frames = self.frames.len(), "page cache exhausted, all pages pinned");
            return Err(XylemError::CacheFull);
        };

        let frame = self.frame(victim);
        if let Some(old_page) = frame.occupant() {
            if frame.is_dirty() {
                let data = frame.image();
                if let Err(e) = self.device.write_page(old_page, &data) {
                    drop(data);
                    self.replacer.set_evictable(victim, true);
                    return Err(e);
                }
                tracing::debug!(page = %old_page, "wrote back dirty page on eviction");
            }
            page_table.remove(&old_page);
        }
        frame.clear();
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(victim)
    }

    /// Fetches a page, reading it from the device on a miss.
    ///
    /// The returned handle keeps the page pinned until dropped.
    pub fn fetch(&self, page_id: PageId) -> Result<PageHandle<'_, D>> {
        let mut page_table = self.page_table.lock();

        if let Some(&frame_id) = page_table.get(&page_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            let frame = self.pin_frame(frame_id);
            return Ok(PageHandle {
                cache: self,
                page_id,
                frame,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let frame_id = self.allocate_frame(&mut page_table)?;
        let frame = self.frame(frame_id);
        {
            let mut data = frame.image_mut();
            if let Err(e) = self.device.read_page(page_id, &mut data) {
                drop(data);
                self.free_list.lock().push(frame_id);
                return Err(e);
            }
        }
        frame.assign(page_id);
        page_table.insert(page_id, frame_id);
        let frame = self.pin_frame(frame_id);

        Ok(PageHandle {
            cache: self,
            page_id,
            frame,
        })
    }

    /// Installs a zero-filled image for a freshly allocated page without
    /// reading the device. The page starts out dirty.
    pub fn create(&self, page_id: PageId) -> Result<PageHandle<'_, D>> {
        let mut page_table = self.page_table.lock();

        let frame_id = match page_table.get(&page_id) {
            Some(&frame_id) => {
                self.frame(frame_id).image_mut().fill(0);
                frame_id
            }
            None => {
                let frame_id = self.allocate_frame(&mut page_table)?;
                self.frame(frame_id).assign(page_id);
                page_table.insert(page_id, frame_id);
                frame_id
            }
        };
        let frame = self.pin_frame(frame_id);
        frame.mark_dirty();

        Ok(PageHandle {
            cache: self,
            page_id,
            frame,
        })
    }

    /// Pins a cached page. Returns false if the page is not cached.
    pub fn pin(&self, page_id: PageId) -> bool {
        let page_table = self.page_table.lock();
        match page_table.get(&page_id) {
            Some(&frame_id) => {
                self.pin_frame(frame_id);
                true
            }
            None => false,
        }
    }

    /// Unpins a cached page, optionally marking it dirty.
    ///
    /// Once the pin count reaches zero the page becomes evictable.
    pub fn unpin(&self, page_id: PageId, is_dirty: bool) -> bool {
        let page_table = self.page_table.lock();
        match page_table.get(&page_id) {
            Some(&frame_id) => {
                if is_dirty {
                    self.frame(frame_id).mark_dirty();
                }
                self.release_frame(frame_id);
                true
            }
            None => false,
        }
    }

    /// Marks a cached page dirty. Returns false if the page is not cached.
    pub fn mark_dirty(&self, page_id: PageId) -> bool {
        let page_table = self.page_table.lock();
        match page_table.get(&page_id) {
            Some(&frame_id) => {
                self.frame(frame_id).mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Writes one page back if it is dirty. Returns true if a write happened.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let page_table = self.page_table.lock();
        let Some(&frame_id) = page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = self.frame(frame_id);
        if !frame.is_dirty() {
            return Ok(false);
        }
        let data = frame.image();
        self.device.write_page(page_id, &data)?;
        frame.clear_dirty();
        Ok(true)
    }

    /// Writes every dirty page back in page-number order.
    ///
    /// Returns the number of pages written. Stops at the first device error,
    /// leaving the remaining pages dirty.
    pub fn flush_all(&self) -> Result<usize> {
        let page_table = self.page_table.lock();

        let mut dirty: Vec<(PageId, FrameId)> = page_table
            .iter()
            .filter(|(_, frame_id)| self.frame(**frame_id).is_dirty())
            .map(|(&page_id, &frame_id)| (page_id, frame_id))
            .collect();
        dirty.sort_unstable_by_key(|(page_id, _)| *page_id);

        let mut flushed = 0;
        for (page_id, frame_id) in dirty {
            let frame = self.frame(frame_id);
            let data = frame.image();
            self.device.write_page(page_id, &data)?;
            frame.clear_dirty();
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Drops a page from the cache without writing it back.
    ///
    /// Used for pages that were freed. Returns false if the page is pinned
    /// or not cached.
    pub fn discard(&self, page_id: PageId) -> bool {
        let mut page_table = self.page_table.lock();
        let Some(&frame_id) = page_table.get(&page_id) else {
            return false;
        };
        let frame = self.frame(frame_id);
        if frame.is_pinned() {
            return false;
        }
        page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        frame.clear();
        self.free_list.lock().push(frame_id);
        true
    }

    /// Returns statistics about the cache.
    pub fn stats(&self) -> PageCacheStats {
        let page_table = self.page_table.lock();
        let mut pinned_pages = 0;
        let mut dirty_pages = 0;
        for &frame_id in page_table.values() {
            let frame = self.frame(frame_id);
            if frame.is_pinned() {
                pinned_pages += 1;
            }
            if frame.is_dirty() {
                dirty_pages += 1;
            }
        }

        PageCacheStats {
            total_frames: self.frames.len(),
            cached_pages: page_table.len(),
            pinned_pages,
            dirty_pages,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the page cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCacheStats {
    pub total_frames: usize,
    pub cached_pages: usize,
    pub pinned_pages: usize,
    pub dirty_pages: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// RAII handle to a pinned page. Unpins on drop.
pub struct PageHandle<'a, D: PageDevice> {
    cache: &'a PageCache<D>,
    page_id: PageId,
    frame: &'a Frame,
}

impl<'a, D: PageDevice> PageHandle<'a, D> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Shared access to the page image.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.image()
    }

    /// Exclusive access to the page image. Marks the page dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.frame.mark_dirty();
        self.frame.image_mut()
    }
}

impl<D: PageDevice> Drop for PageHandle<'_, D> {
    fn drop(&mut self) {
        self.cache.release_frame(self.frame.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PAGE_SIZE: usize = 512;

    /// In-memory device recording the order of writes.
    #[derive(Default)]
    struct MemoryDevice {
        pages: Mutex<HashMap<PageId, Vec<u8>>>,
        writes: Mutex<Vec<PageId>>,
    }

    impl PageDevice for MemoryDevice {
        fn page_size(&self) -> usize {
            TEST_PAGE_SIZE
        }

        fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
            let pages = self.pages.lock();
            let data = pages
                .get(&page_id)
                .ok_or(XylemError::PageNotFound { page: page_id })?;
            buf.copy_from_slice(data);
            Ok(())
        }

        fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
            self.pages.lock().insert(page_id, buf.to_vec());
            self.writes.lock().push(page_id);
            Ok(())
        }
    }

    fn create_test_cache(num_frames: usize) -> PageCache<Arc<MemoryDevice>> {
        let device = Arc::new(MemoryDevice::default());
        for i in 0..32 {
            let mut data = vec![0u8; TEST_PAGE_SIZE];
            data[0] = i as u8;
            device.pages.lock().insert(PageId(i), data);
        }
        PageCache::new(device, PageCacheConfig { num_frames })
    }

    #[test]
    fn test_fetch_loads_from_device() {
        let cache = create_test_cache(4);
        let handle = cache.fetch(PageId(7)).unwrap();
        assert_eq!(handle.read()[0], 7);
        assert!(cache.contains(PageId(7)));
        drop(handle);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.pinned_pages, 0);
    }

    #[test]
    fn test_fetch_hit() {
        let cache = create_test_cache(4);
        drop(cache.fetch(PageId(1)).unwrap());
        drop(cache.fetch(PageId(1)).unwrap());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.cached_pages, 1);
    }

    #[test]
    fn test_fetch_missing_page_frees_frame() {
        let cache = create_test_cache(1);
        assert!(matches!(
            cache.fetch(PageId(99)),
            Err(XylemError::PageNotFound { .. })
        ));
        // the frame is reusable after the failed read
        assert!(cache.fetch(PageId(0)).is_ok());
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() {
        let cache = create_test_cache(2);
        {
            let handle = cache.fetch(PageId(0)).unwrap();
            handle.write()[1] = 0xAA;
        }
        drop(cache.fetch(PageId(1)).unwrap());
        drop(cache.fetch(PageId(2)).unwrap());
        drop(cache.fetch(PageId(3)).unwrap());

        assert!(!cache.contains(PageId(0)));
        assert_eq!(cache.device().pages.lock()[&PageId(0)][1], 0xAA);
        assert!(cache.stats().evictions >= 2);
    }

    #[test]
    fn test_pinned_pages_are_not_evicted() {
        let cache = create_test_cache(2);
        let pinned = cache.fetch(PageId(0)).unwrap();
        drop(cache.fetch(PageId(1)).unwrap());
        drop(cache.fetch(PageId(2)).unwrap());

        assert!(cache.contains(PageId(0)));
        assert!(!cache.contains(PageId(1)));
        drop(pinned);
    }

    #[test]
    fn test_all_pinned_is_an_error() {
        let cache = create_test_cache(2);
        let _a = cache.fetch(PageId(0)).unwrap();
        let _b = cache.fetch(PageId(1)).unwrap();
        assert!(matches!(cache.fetch(PageId(2)), Err(XylemError::CacheFull)));
    }

    #[test]
    fn test_explicit_pin_unpin() {
        let cache = create_test_cache(1);
        drop(cache.fetch(PageId(4)).unwrap());
        assert!(cache.pin(PageId(4)));
        assert!(matches!(cache.fetch(PageId(5)), Err(XylemError::CacheFull)));

        assert!(cache.unpin(PageId(4), true));
        assert_eq!(cache.stats().dirty_pages, 1);
        drop(cache.fetch(PageId(5)).unwrap());
        assert!(!cache.pin(PageId(4)));
        assert_eq!(cache.device().writes.lock().as_slice(), &[PageId(4)]);
    }

    #[test]
    fn test_flush_all_in_page_order() {
        let cache = create_test_cache(8);
        for page in [5, 2, 7, 1] {
            let handle = cache.fetch(PageId(page)).unwrap();
            handle.write()[2] = 1;
        }
        drop(cache.fetch(PageId(3)).unwrap());

        assert_eq!(cache.flush_all().unwrap(), 4);
        assert_eq!(
            cache.device().writes.lock().as_slice(),
            &[PageId(1), PageId(2), PageId(5), PageId(7)]
        );
        assert_eq!(cache.stats().dirty_pages, 0);
        assert_eq!(cache.flush_all().unwrap(), 0);
    }

    #[test]
    fn test_flush_page() {
        let cache = create_test_cache(4);
        {
            let handle = cache.fetch(PageId(3)).unwrap();
            handle.write()[0] = 0x33;
        }
        assert!(cache.flush_page(PageId(3)).unwrap());
        assert!(!cache.flush_page(PageId(3)).unwrap());
        assert!(!cache.flush_page(PageId(9)).unwrap());
    }

    #[test]
    fn test_create_skips_device_read() {
        let cache = create_test_cache(4);
        let handle = cache.create(PageId(100)).unwrap();
        assert!(handle.read().iter().all(|&b| b == 0));
        drop(handle);
        assert_eq!(cache.stats().dirty_pages, 1);
        cache.flush_all().unwrap();
        assert!(cache.device().pages.lock().contains_key(&PageId(100)));
    }

    #[test]
    fn test_discard() {
        let cache = create_test_cache(4);
        let handle = cache.fetch(PageId(6)).unwrap();
        handle.write()[0] = 0xFF;
        assert!(!cache.discard(PageId(6)));
        drop(handle);

        assert!(cache.discard(PageId(6)));
        assert!(!cache.contains(PageId(6)));
        assert_eq!(cache.flush_all().unwrap(), 0);
        assert_eq!(cache.device().pages.lock()[&PageId(6)][0], 6);
    }

    #[test]
    fn test_mark_dirty() {
        let cache = create_test_cache(4);
        assert!(!cache.mark_dirty(PageId(1)));
        drop(cache.fetch(PageId(1)).unwrap());
        assert!(cache.mark_dirty(PageId(1)));
        assert_eq!(cache.stats().dirty_pages, 1);
    }

    #[test]
    fn test_auto_sized() {
        let cache = PageCache::auto_sized(Arc::new(MemoryDevice::default()));
        assert!(cache.num_frames() >= 64);
    }
}
