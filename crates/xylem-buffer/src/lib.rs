//! Page cache for xylem record stores.
//!
//! This crate provides in-memory page caching with:
//! - Fixed number of frames, loaded from a [`PageDevice`] on demand
//! - Clock eviction policy with a fallback to any unpinned frame
//! - Pin counting so pages in use are never evicted
//! - Dirty page tracking with write-back in page-number order

mod cache;
mod frame;
mod replacer;

pub use cache::{PageCache, PageCacheConfig, PageCacheStats, PageDevice, PageHandle};
pub use frame::{Frame, FrameId};
pub use replacer::{ClockReplacer, Replacer};
