//! Key index used by the keyed record store.
//!
//! The store only needs point lookups and ordered range scans from its
//! index; balancing and persistence are the index's own business.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use xylem_common::{Result, VirtualAddress};

/// Maps keys to the address of the record holding their value.
pub trait KeyIndex: Send + Sync {
    /// Returns the address stored for `key`.
    fn find(&self, key: &[u8]) -> Result<Option<VirtualAddress>>;

    /// Stores `addr` for `key`, replacing any previous address.
    fn insert(&self, key: &[u8], addr: VirtualAddress) -> Result<()>;

    /// Removes `key`, returning the address it had.
    fn remove(&self, key: &[u8]) -> Result<Option<VirtualAddress>>;

    /// Returns the entries with keys inside the bounds, in key order.
    fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, VirtualAddress)>>;

    /// Number of keys in the index.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<I: KeyIndex + ?Sized> KeyIndex for Arc<I> {
    fn find(&self, key: &[u8]) -> Result<Option<VirtualAddress>> {
        (**self).find(key)
    }

    fn insert(&self, key: &[u8], addr: VirtualAddress) -> Result<()> {
        (**self).insert(key, addr)
    }

    fn remove(&self, key: &[u8]) -> Result<Option<VirtualAddress>> {
        (**self).remove(key)
    }

    fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, VirtualAddress)>> {
        (**self).scan(lower, upper)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Ordered in-memory index.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: RwLock<BTreeMap<Vec<u8>, VirtualAddress>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Returns true if no key can satisfy both bounds.
fn is_empty_range(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
        _ => false,
    }
}

impl KeyIndex for MemoryIndex {
    fn find(&self, key: &[u8]) -> Result<Option<VirtualAddress>> {
        Ok(self.entries.read().get(key).copied())
    }

    fn insert(&self, key: &[u8], addr: VirtualAddress) -> Result<()> {
        self.entries.write().insert(key.to_vec(), addr);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<Option<VirtualAddress>> {
        Ok(self.entries.write().remove(key))
    }

    fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, VirtualAddress)>> {
        // BTreeMap::range panics on inverted bounds
        if is_empty_range(lower, upper) {
            return Ok(Vec::new());
        }
        let entries = self.entries.read();
        Ok(entries
            .range::<[u8], _>((lower, upper))
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xylem_common::{PageId, TupleId};

    fn addr(page: u32, tid: u16) -> VirtualAddress {
        VirtualAddress::new(PageId(page), TupleId::new(tid))
    }

    #[test]
    fn test_insert_find_remove() {
        let index = MemoryIndex::new();
        assert!(index.is_empty());
        index.insert(b"a", addr(1, 1)).unwrap();
        index.insert(b"b", addr(1, 2)).unwrap();
        assert_eq!(index.find(b"a").unwrap(), Some(addr(1, 1)));
        assert_eq!(index.len(), 2);

        index.insert(b"a", addr(3, 7)).unwrap();
        assert_eq!(index.find(b"a").unwrap(), Some(addr(3, 7)));
        assert_eq!(index.remove(b"a").unwrap(), Some(addr(3, 7)));
        assert_eq!(index.remove(b"a").unwrap(), None);
        assert_eq!(index.find(b"a").unwrap(), None);
    }

    #[test]
    fn test_scan_bounds() {
        let index = MemoryIndex::new();
        for (i, key) in [b"k1", b"k2", b"k3", b"k4"].iter().enumerate() {
            index.insert(*key, addr(1, i as u16 + 1)).unwrap();
        }

        let keys = |lower, upper| -> Vec<Vec<u8>> {
            index
                .scan(lower, upper)
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .collect()
        };

        assert_eq!(keys(Bound::Unbounded, Bound::Unbounded).len(), 4);
        assert_eq!(
            keys(Bound::Included(b"k2".as_slice()), Bound::Excluded(b"k4".as_slice())),
            vec![b"k2".to_vec(), b"k3".to_vec()]
        );
        assert_eq!(
            keys(Bound::Excluded(b"k2".as_slice()), Bound::Unbounded),
            vec![b"k3".to_vec(), b"k4".to_vec()]
        );
    }

    #[test]
    fn test_scan_inverted_range_is_empty() {
        let index = MemoryIndex::new();
        index.insert(b"m", addr(1, 1)).unwrap();
        let found = index
            .scan(Bound::Included(b"z".as_slice()), Bound::Included(b"a".as_slice()))
            .unwrap();
        assert!(found.is_empty());
        let found = index
            .scan(Bound::Excluded(b"m".as_slice()), Bound::Excluded(b"m".as_slice()))
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_shared_index() {
        let index = Arc::new(MemoryIndex::new());
        let shared = Arc::clone(&index);
        shared.insert(b"x", addr(2, 2)).unwrap();
        assert_eq!(index.find(b"x").unwrap(), Some(addr(2, 2)));
        assert_eq!(KeyIndex::len(&shared), 1);
    }
}
