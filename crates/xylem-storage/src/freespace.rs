//! Free space registry for placing small values.
//!
//! Keeps one best-effort entry per page with reusable room. Lookups return
//! the page with the least free space that still satisfies the request, so
//! large holes stay available for large values. Entries are hints only:
//! callers re-validate the page before writing to it.

use std::collections::{BTreeSet, HashMap};
use xylem_common::PageId;

/// Free space known for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpaceEntry {
    pub page: PageId,
    pub free_bytes: usize,
}

/// Sorted registry of pages with reusable space.
#[derive(Debug)]
pub struct FreeSpaceRegistry {
    /// Entries below this many free bytes are not tracked.
    min_free: usize,
    /// (free_bytes, page) ordered for smallest-fit lookups.
    by_space: BTreeSet<(usize, PageId)>,
    by_page: HashMap<PageId, usize>,
}

impl FreeSpaceRegistry {
    /// Creates an empty registry that ignores fragments below `min_free`.
    pub fn new(min_free: usize) -> Self {
        Self {
            min_free,
            by_space: BTreeSet::new(),
            by_page: HashMap::new(),
        }
    }

    pub fn min_free(&self) -> usize {
        self.min_free
    }

    /// Returns the page with the smallest free space of at least `min_free_bytes`.
    pub fn find_page(&self, min_free_bytes: usize) -> Option<PageId> {
        self.by_space
            .range((min_free_bytes, PageId(0))..)
            .next()
            .map(|&(_, page)| page)
    }

    /// Records the free space of a page, dropping it below the threshold.
    pub fn update(&mut self, page: PageId, free_bytes: usize) {
        self.remove(page);
        if free_bytes < self.min_free {
            return;
        }
        self.by_space.insert((free_bytes, page));
        self.by_page.insert(page, free_bytes);
    }

    /// Forgets a page. Returns true if it had an entry.
    pub fn remove(&mut self, page: PageId) -> bool {
        match self.by_page.remove(&page) {
            Some(free_bytes) => {
                self.by_space.remove(&(free_bytes, page));
                true
            }
            None => false,
        }
    }

    /// Returns the recorded free space of a page.
    pub fn get(&self, page: PageId) -> Option<usize> {
        self.by_page.get(&page).copied()
    }

    pub fn len(&self) -> usize {
        self.by_page.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_page.is_empty()
    }

    /// Entries ordered by ascending free space.
    pub fn entries(&self) -> impl Iterator<Item = FreeSpaceEntry> + '_ {
        self.by_space
            .iter()
            .map(|&(free_bytes, page)| FreeSpaceEntry { page, free_bytes })
    }

    pub fn clear(&mut self) {
        self.by_space.clear();
        self.by_page.clear();
    }
}
