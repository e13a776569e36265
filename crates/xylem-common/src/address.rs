//! Record addressing: tuple ids and virtual addresses.

use crate::page::PageId;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Identifier of a record slot within one page.
///
/// The low 14 bits hold the ordinal slot number. The two high bits mark the
/// slot as a relocated record or as a forwarding link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleId(u16);

impl TupleId {
    /// Slot is a forwarding link left behind by a split.
    pub const LINK: u16 = 0x8000;
    /// Slot holds a record moved by a split, preceded by a backlink.
    pub const RELOCATED: u16 = 0x4000;
    /// Mask selecting the ordinal part.
    pub const ID_MASK: u16 = 0x3FFF;
    /// Mask selecting the flag bits.
    pub const FLAG_MASK: u16 = Self::LINK | Self::RELOCATED;

    /// First tuple id handed out on a fresh page.
    pub const FIRST: TupleId = TupleId(1);
    /// Largest ordinal a page may hand out.
    pub const MAX: u16 = Self::ID_MASK;

    /// Creates a tuple id from an ordinal, dropping any flag bits.
    pub const fn new(id: u16) -> Self {
        Self(id & Self::ID_MASK)
    }

    /// Creates a tuple id from its raw on-page representation, flags included.
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw representation, flags included.
    pub const fn raw(&self) -> u16 {
        self.0
    }

    /// Returns the ordinal without flags.
    pub const fn id(&self) -> u16 {
        self.0 & Self::ID_MASK
    }

    /// Returns the flag bits only.
    pub const fn flags(&self) -> u16 {
        self.0 & Self::FLAG_MASK
    }

    pub const fn is_link(&self) -> bool {
        self.0 & Self::LINK != 0
    }

    pub const fn is_relocated(&self) -> bool {
        self.0 & Self::RELOCATED != 0
    }

    /// Returns this id with the link flag set.
    pub const fn as_link(&self) -> Self {
        Self(self.id() | Self::LINK)
    }

    /// Returns this id with the relocated flag set.
    pub const fn as_relocated(&self) -> Self {
        Self(self.id() | Self::RELOCATED)
    }

    /// Returns this id with both flags cleared.
    pub const fn plain(&self) -> Self {
        Self(self.id())
    }

    /// Returns the ordinal following this one, or None once the id space is used up.
    pub fn next(&self) -> Option<Self> {
        let id = self.id();
        if id >= Self::MAX {
            None
        } else {
            Some(Self(id + 1))
        }
    }
}

impl std::fmt::Display for TupleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Opaque 64-bit handle to a stored record.
///
/// Packs a 32-bit page number, a 16-bit tuple id and 16 flag bits. The flag
/// bits describe the pointer, not the slot, so equality and hashing compare
/// page and tuple id only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VirtualAddress {
    page: PageId,
    tid: TupleId,
    flags: u16,
}

impl VirtualAddress {
    /// Address value that never refers to a record.
    pub const NONE: VirtualAddress = VirtualAddress {
        page: PageId::NONE,
        tid: TupleId(0),
        flags: 0,
    };

    /// Creates an address without pointer flags. Tuple id flags are stripped.
    pub fn new(page: PageId, tid: TupleId) -> Self {
        Self::with_flags(page, tid, 0)
    }

    /// Creates an address carrying pointer flags.
    pub fn with_flags(page: PageId, tid: TupleId, flags: u16) -> Self {
        Self {
            page,
            tid: tid.plain(),
            flags,
        }
    }

    /// Packs page, tuple id and flags into one 64-bit value.
    pub fn encode(page: PageId, tid: TupleId, flags: u16) -> u64 {
        ((page.0 as u64) << 32) | ((tid.id() as u64) << 16) | flags as u64
    }

    /// Extracts the page number from a packed address.
    pub fn page_of(addr: u64) -> PageId {
        PageId((addr >> 32) as u32)
    }

    /// Extracts the tuple id from a packed address.
    pub fn tid_of(addr: u64) -> TupleId {
        TupleId::new((addr >> 16) as u16)
    }

    /// Extracts the flag bits from a packed address.
    pub fn flags_of(addr: u64) -> u16 {
        addr as u16
    }

    /// Returns the packed 64-bit form.
    pub fn as_u64(&self) -> u64 {
        Self::encode(self.page, self.tid, self.flags)
    }

    /// Rebuilds an address from its packed form.
    pub fn from_u64(addr: u64) -> Self {
        Self::with_flags(Self::page_of(addr), Self::tid_of(addr), Self::flags_of(addr))
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn tid(&self) -> TupleId {
        self.tid
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Returns true for the NONE sentinel.
    pub fn is_none(&self) -> bool {
        self.page.is_none()
    }

    /// Returns true if both addresses name the same slot, regardless of flags.
    pub fn same_slot(&self, other: &VirtualAddress) -> bool {
        self.page == other.page && self.tid == other.tid
    }

    /// Writes the packed address as 8 little-endian bytes.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.as_u64().to_le_bytes()
    }

    /// Reads a packed address from 8 little-endian bytes.
    pub fn from_bytes(buf: [u8; 8]) -> Self {
        Self::from_u64(u64::from_le_bytes(buf))
    }
}

impl PartialEq for VirtualAddress {
    fn eq(&self, other: &Self) -> bool {
        self.same_slot(other)
    }
}

impl Eq for VirtualAddress {}

impl Hash for VirtualAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.page.hash(state);
        self.tid.hash(state);
    }
}

impl std::fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page, self.tid)
    }
}
