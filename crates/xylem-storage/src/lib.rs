//! Paged record storage for xylem.
//!
//! This crate provides:
//! - Store file with a header page and a free-page list
//! - Pager coupling the store file with the page cache
//! - Record slot encoding shared by both stores
//! - Overflow chains for values larger than a page
//! - Free space registry for smallest-fit placement
//! - Keyed record store reached through a key index
//! - Ordered record store with page splits, forwarding links and node text extraction

mod disk;
mod freespace;
mod index;
mod keyed;
mod ordered;
mod overflow;
mod pager;
mod record;

pub use disk::{FILE_MAGIC, FORMAT_VERSION, FileHeader, HEADER_PAGE, PagedFile};
pub use freespace::{FreeSpaceEntry, FreeSpaceRegistry};
pub use index::{KeyIndex, MemoryIndex};
pub use keyed::{KeyedRecordStore, PageUsage};
pub use ordered::{NodeError, NodeRecord, OrderedRecordStore, RecordIterator, WriterContext};
pub use overflow::{MAX_OVERFLOW_LEN, OverflowChain};
pub use pager::Pager;
pub use record::{
    LINK_LEN, OVERFLOW_SENTINEL, PLAIN_OVERHEAD, Payload, RELOCATED_OVERHEAD, Slot, SlotKind,
};
