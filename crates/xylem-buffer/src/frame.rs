//! Cache frames.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use xylem_common::PageId;

/// Index of a frame in the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

/// One cache slot: a page image plus the bookkeeping the cache needs to
/// decide whether it may be evicted or has to be written back first.
///
/// The occupant is stored as a raw page number so it can be read without
/// taking the image lock.
pub struct Frame {
    id: FrameId,
    occupant: AtomicU32,
    image: RwLock<Box<[u8]>>,
    pins: AtomicU32,
    dirty: AtomicBool,
}

impl Frame {
    pub fn new(id: FrameId, page_size: usize) -> Self {
        Self {
            id,
            occupant: AtomicU32::new(PageId::NONE.0),
            image: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pins: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Page currently held, if any.
    pub fn occupant(&self) -> Option<PageId> {
        let page = PageId(self.occupant.load(Ordering::Acquire));
        page.is_some().then_some(page)
    }

    /// Records that the frame now holds `page`.
    pub fn assign(&self, page: PageId) {
        self.occupant.store(page.0, Ordering::Release);
    }

    /// Pins the frame. Returns the pin count before this call.
    pub fn pin(&self) -> u32 {
        self.pins.fetch_add(1, Ordering::AcqRel)
    }

    /// Drops one pin. Returns the pins left; an unbalanced call is a no-op.
    pub fn unpin(&self) -> u32 {
        match self
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(before) => before - 1,
            Err(_) => 0,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Called once the image has reached the device.
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn image(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.image.read()
    }

    pub fn image_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.image.write()
    }

    /// Forgets the occupant and zeroes the image.
    pub fn clear(&self) {
        self.occupant.store(PageId::NONE.0, Ordering::Release);
        self.pins.store(0, Ordering::Release);
        self.clear_dirty();
        self.image.write().fill(0);
    }
}
