//! Page structures for record storage.

use crate::address::TupleId;
use crate::error::{Result, XylemError};
use serde::{Deserialize, Serialize};

/// Default page size in bytes (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Smallest page size a store accepts.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size a store accepts. Keeps every in-page length below the
/// overflow sentinel.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// On-disk encoding of an absent page link.
const NO_PAGE: u64 = u64::MAX;

/// Page number within one store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Sentinel for "no page".
    pub const NONE: PageId = PageId(u32::MAX);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Returns the 8-byte on-disk representation.
    pub fn to_disk(&self) -> u64 {
        if self.is_none() { NO_PAGE } else { self.0 as u64 }
    }

    /// Decodes the 8-byte on-disk representation.
    ///
    /// Returns None for values that cannot name a page.
    pub fn from_disk(value: u64) -> Option<PageId> {
        if value == NO_PAGE {
            Some(Self::NONE)
        } else if value < u32::MAX as u64 {
            Some(PageId(value as u32))
        } else {
            None
        }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Page status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageStatus {
    /// Never initialized (zero-filled).
    Unused = 0,
    /// Slotted page holding variable-length records.
    Record = 20,
    /// Page on the free-page list.
    FreeList = 22,
    /// Member of an overflow chain.
    Overflow = 23,
    /// Record page holding forwarding links spilled from its predecessor.
    Spill = 24,
}

impl PageStatus {
    /// Decodes a status byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unused),
            20 => Some(Self::Record),
            22 => Some(Self::FreeList),
            23 => Some(Self::Overflow),
            24 => Some(Self::Spill),
            _ => None,
        }
    }

    /// Returns true for pages that hold record slots.
    pub fn is_slotted(&self) -> bool {
        matches!(self, Self::Record | Self::Spill)
    }
}

/// Header structure at the beginning of every page.
///
/// Layout (25 bytes, little-endian, in this order):
/// - status: 1 byte
/// - record_count: 2 bytes
/// - data_length: 4 bytes
/// - next_page: 8 bytes
/// - prev_page: 8 bytes
/// - next_tuple_id: 2 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    /// What the page is used for.
    pub status: PageStatus,
    /// Number of slots on the page, forwarding links included.
    pub record_count: u16,
    /// Bytes occupied in the data area.
    pub data_length: u32,
    /// Next page of the chain this page belongs to.
    pub next_page: PageId,
    /// Previous page of the chain this page belongs to.
    pub prev_page: PageId,
    /// Next tuple id to hand out. Never decreases while the page is in use.
    pub next_tuple_id: u16,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 25;

    /// Creates a header for an empty page with the given status.
    pub fn new(status: PageStatus) -> Self {
        Self {
            status,
            record_count: 0,
            data_length: 0,
            next_page: PageId::NONE,
            prev_page: PageId::NONE,
            next_tuple_id: TupleId::FIRST.raw(),
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.status as u8;
        buf[1..3].copy_from_slice(&self.record_count.to_le_bytes());
        buf[3..7].copy_from_slice(&self.data_length.to_le_bytes());
        buf[7..15].copy_from_slice(&self.next_page.to_disk().to_le_bytes());
        buf[15..23].copy_from_slice(&self.prev_page.to_disk().to_le_bytes());
        buf[23..25].copy_from_slice(&self.next_tuple_id.to_le_bytes());
        buf
    }

    /// Deserializes the header of page `page` from bytes.
    pub fn from_bytes(page: PageId, buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(XylemError::corruption(page, "truncated page header"));
        }
        let status = PageStatus::from_u8(buf[0]).ok_or_else(|| {
            XylemError::corruption(page, format!("unknown page status {}", buf[0]))
        })?;
        let record_count = u16::from_le_bytes([buf[1], buf[2]]);
        let data_length = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]);
        let next_page = read_link(page, &buf[7..15])?;
        let prev_page = read_link(page, &buf[15..23])?;
        let next_tuple_id = u16::from_le_bytes([buf[23], buf[24]]);

        Ok(Self {
            status,
            record_count,
            data_length,
            next_page,
            prev_page,
            next_tuple_id,
        })
    }
}

fn read_link(page: PageId, buf: &[u8]) -> Result<PageId> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(buf);
    let value = u64::from_le_bytes(raw);
    PageId::from_disk(value)
        .ok_or_else(|| XylemError::corruption(page, format!("invalid page link {value:#x}")))
}

/// A fixed-size page: the unit of I/O.
///
/// Holds a decoded header next to the raw buffer. The header is written back
/// into the buffer by [`Page::as_bytes`], so a page is always persisted with
/// header and data together.
#[derive(Debug, Clone)]
pub struct Page {
    id: PageId,
    header: PageHeader,
    data: Box<[u8]>,
}

impl Page {
    /// Creates an empty page of the given size and status.
    pub fn new(id: PageId, page_size: usize, status: PageStatus) -> Self {
        Self {
            id,
            header: PageHeader::new(status),
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Decodes a page from its raw bytes.
    pub fn from_bytes(id: PageId, bytes: &[u8]) -> Result<Self> {
        let header = PageHeader::from_bytes(id, bytes)?;
        let working = bytes.len() - PageHeader::SIZE;
        // an overflow chain head records the length of the whole value
        if header.status != PageStatus::Overflow && header.data_length as usize > working {
            return Err(XylemError::corruption(
                id,
                format!(
                    "data length {} exceeds working size {}",
                    header.data_length, working
                ),
            ));
        }
        Ok(Self {
            id,
            header,
            data: bytes.to_vec().into_boxed_slice(),
        })
    }

    /// Returns the full page image with the current header written in.
    pub fn as_bytes(&mut self) -> &[u8] {
        let header = self.header.to_bytes();
        self.data[..PageHeader::SIZE].copy_from_slice(&header);
        &self.data
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut PageHeader {
        &mut self.header
    }

    pub fn status(&self) -> PageStatus {
        self.header.status
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    /// Bytes available for record data.
    pub fn working_size(&self) -> usize {
        self.data.len() - PageHeader::SIZE
    }

    /// Bytes occupied in the data area.
    pub fn data_length(&self) -> usize {
        self.header.data_length as usize
    }

    pub fn set_data_length(&mut self, len: usize) {
        self.header.data_length = len as u32;
    }

    /// Bytes still free in the data area.
    pub fn free_space(&self) -> usize {
        self.working_size().saturating_sub(self.data_length())
    }

    /// The occupied part of the data area.
    pub fn body(&self) -> &[u8] {
        let used = self.data_length().min(self.working_size());
        &self.data[PageHeader::SIZE..PageHeader::SIZE + used]
    }

    /// The whole data area, occupied or not.
    pub fn area(&self) -> &[u8] {
        &self.data[PageHeader::SIZE..]
    }

    /// Mutable access to the whole data area.
    pub fn area_mut(&mut self) -> &mut [u8] {
        &mut self.data[PageHeader::SIZE..]
    }

    /// Hands out the next tuple id of this page.
    pub fn allocate_tid(&mut self) -> Result<TupleId> {
        let next = self.header.next_tuple_id;
        if next == 0 || next > TupleId::MAX {
            return Err(XylemError::PageExhausted { page: self.id });
        }
        self.header.next_tuple_id = next + 1;
        Ok(TupleId::new(next))
    }

    /// Returns true if the page cannot hand out another tuple id.
    pub fn is_exhausted(&self) -> bool {
        self.header.next_tuple_id == 0 || self.header.next_tuple_id > TupleId::MAX
    }

    /// Clears the page for reuse under a new status.
    pub fn reset(&mut self, status: PageStatus) {
        self.header = PageHeader::new(status);
        self.data.fill(0);
    }
}
