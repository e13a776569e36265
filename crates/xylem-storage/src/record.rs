//! Record slot encoding within a page's data area.
//!
//! Four slot shapes share the data area:
//!
//! ```text
//! Plain:      [tid:2][length:2][payload:length]
//! Relocated:  [tid:2 | RELOCATED][length:2][backlink:8][payload:length]
//! Link:       [tid:2 | LINK][forward:8]
//! Overflow:   length == OVERFLOW_SENTINEL, payload is [first_page:8]
//! ```
//!
//! All offsets handed around here are relative to the start of the data
//! area, not to the start of the page.

use xylem_common::{Page, PageId, Result, TupleId, VirtualAddress, XylemError};

pub const TID_LEN: usize = 2;
pub const LENGTH_LEN: usize = 2;
pub const ADDRESS_LEN: usize = 8;

/// Bytes a plain slot adds on top of its payload.
pub const PLAIN_OVERHEAD: usize = TID_LEN + LENGTH_LEN;
/// Bytes a relocated slot adds on top of its payload.
pub const RELOCATED_OVERHEAD: usize = PLAIN_OVERHEAD + ADDRESS_LEN;
/// Size of a forwarding link slot.
pub const LINK_LEN: usize = TID_LEN + ADDRESS_LEN;

/// Length field value marking an overflow pointer.
pub const OVERFLOW_SENTINEL: u16 = 0xFFFF;

/// What a slot stores as its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    /// Bytes kept in the page.
    Inline(&'a [u8]),
    /// Pointer to the first page of an overflow chain.
    Overflow(PageId),
}

impl Payload<'_> {
    /// Bytes the payload occupies inside the slot.
    pub fn stored_len(&self) -> usize {
        match self {
            Payload::Inline(bytes) => bytes.len(),
            Payload::Overflow(_) => ADDRESS_LEN,
        }
    }

    fn length_field(&self) -> u16 {
        match self {
            Payload::Inline(bytes) => bytes.len() as u16,
            Payload::Overflow(_) => OVERFLOW_SENTINEL,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Payload::Inline(bytes) => buf.extend_from_slice(bytes),
            Payload::Overflow(first) => buf.extend_from_slice(&first.to_disk().to_le_bytes()),
        }
    }
}

/// Shape of a decoded slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Plain,
    Relocated { backlink: VirtualAddress },
    Link { forward: VirtualAddress },
}

/// A decoded slot and where its parts sit in the data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Tuple id without flag bits.
    pub tid: TupleId,
    pub kind: SlotKind,
    /// Start of the slot.
    pub offset: usize,
    /// Start of the stored payload.
    pub value_offset: usize,
    /// Stored payload bytes (8 for an overflow pointer, 0 for a link).
    pub value_len: usize,
    /// First page of the overflow chain if the payload is a pointer.
    pub overflow: Option<PageId>,
}

impl Slot {
    /// Offset just past the slot.
    pub fn end(&self) -> usize {
        self.value_offset + self.value_len
    }

    /// Total bytes of the slot.
    pub fn len(&self) -> usize {
        self.end() - self.offset
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, SlotKind::Link { .. })
    }

    /// The stored payload as it sits in the page.
    pub fn payload<'a>(&self, page: &'a Page) -> Payload<'a> {
        match self.overflow {
            Some(first) => Payload::Overflow(first),
            None => Payload::Inline(&page.body()[self.value_offset..self.end()]),
        }
    }

    /// Address clients use for the record stored here.
    ///
    /// A relocated record keeps the address of the slot forwarding to it.
    pub fn logical_address(&self, page: PageId) -> VirtualAddress {
        match self.kind {
            SlotKind::Relocated { backlink } => backlink,
            _ => VirtualAddress::new(page, self.tid),
        }
    }
}

fn corrupt(page: &Page, offset: usize, what: &str) -> XylemError {
    XylemError::corruption(page.id(), format!("{what} at offset {offset}"))
}

fn read_u16(body: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([body[at], body[at + 1]])
}

/// Reads an 8-byte field; the caller has checked the bounds.
fn read_u64_bytes(body: &[u8], at: usize) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&body[at..at + ADDRESS_LEN]);
    raw
}

/// Decodes the slot starting at `offset`.
pub fn read_slot(page: &Page, offset: usize) -> Result<Slot> {
    let body = page.body();
    if offset + TID_LEN > body.len() {
        return Err(corrupt(page, offset, "truncated tuple id"));
    }
    let raw = TupleId::from_raw(read_u16(body, offset));
    let tid = raw.plain();
    if tid.raw() == 0 {
        return Err(corrupt(page, offset, "zero tuple id"));
    }

    if raw.is_link() {
        if raw.is_relocated() {
            return Err(corrupt(page, offset, "slot flagged both link and relocated"));
        }
        let at = offset + TID_LEN;
        if at + ADDRESS_LEN > body.len() {
            return Err(corrupt(page, offset, "truncated forwarding link"));
        }
        let forward = VirtualAddress::from_bytes(read_u64_bytes(body, at));
        return Ok(Slot {
            tid,
            kind: SlotKind::Link { forward },
            offset,
            value_offset: at + ADDRESS_LEN,
            value_len: 0,
            overflow: None,
        });
    }

    let len_at = offset + TID_LEN;
    if len_at + LENGTH_LEN > body.len() {
        return Err(corrupt(page, offset, "truncated length"));
    }
    let length = read_u16(body, len_at);
    let mut value_offset = len_at + LENGTH_LEN;

    let kind = if raw.is_relocated() {
        if value_offset + ADDRESS_LEN > body.len() {
            return Err(corrupt(page, offset, "truncated backlink"));
        }
        let backlink = VirtualAddress::from_bytes(read_u64_bytes(body, value_offset));
        value_offset += ADDRESS_LEN;
        SlotKind::Relocated { backlink }
    } else {
        SlotKind::Plain
    };

    let (value_len, overflow) = if length == OVERFLOW_SENTINEL {
        if value_offset + ADDRESS_LEN > body.len() {
            return Err(corrupt(page, offset, "truncated overflow pointer"));
        }
        let first = PageId::from_disk(u64::from_le_bytes(read_u64_bytes(body, value_offset)))
            .filter(|p| p.is_some())
            .ok_or_else(|| corrupt(page, offset, "invalid overflow pointer"))?;
        (ADDRESS_LEN, Some(first))
    } else {
        (length as usize, None)
    };

    if value_offset + value_len > body.len() {
        return Err(corrupt(page, offset, "payload runs past data length"));
    }

    Ok(Slot {
        tid,
        kind,
        offset,
        value_offset,
        value_len,
        overflow,
    })
}

/// Iterator over the slots of a page in storage order.
pub struct Slots<'a> {
    page: &'a Page,
    offset: usize,
    failed: bool,
}

impl Iterator for Slots<'_> {
    type Item = Result<Slot>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.page.data_length() {
            return None;
        }
        match read_slot(self.page, self.offset) {
            Ok(slot) => {
                self.offset = slot.end();
                Some(Ok(slot))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Returns the slots of `page` starting at `offset`.
pub fn slots_from(page: &Page, offset: usize) -> Slots<'_> {
    Slots {
        page,
        offset,
        failed: false,
    }
}

/// Returns all slots of `page`.
pub fn slots(page: &Page) -> Slots<'_> {
    slots_from(page, 0)
}

/// Finds the slot with tuple id `tid`, whatever its flags.
pub fn find_slot(page: &Page, tid: TupleId) -> Result<Option<Slot>> {
    for slot in slots(page) {
        let slot = slot?;
        if slot.tid == tid.plain() {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

/// Encodes a plain slot.
pub fn encode_plain(tid: TupleId, payload: Payload<'_>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PLAIN_OVERHEAD + payload.stored_len());
    buf.extend_from_slice(&tid.plain().raw().to_le_bytes());
    buf.extend_from_slice(&payload.length_field().to_le_bytes());
    payload.write_to(&mut buf);
    buf
}

/// Encodes a relocated slot pointing back at `backlink`.
pub fn encode_relocated(tid: TupleId, backlink: VirtualAddress, payload: Payload<'_>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RELOCATED_OVERHEAD + payload.stored_len());
    buf.extend_from_slice(&tid.as_relocated().raw().to_le_bytes());
    buf.extend_from_slice(&payload.length_field().to_le_bytes());
    buf.extend_from_slice(&backlink.to_bytes());
    payload.write_to(&mut buf);
    buf
}

/// Encodes a forwarding link.
pub fn encode_link(tid: TupleId, forward: VirtualAddress) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LINK_LEN);
    buf.extend_from_slice(&tid.as_link().raw().to_le_bytes());
    buf.extend_from_slice(&forward.to_bytes());
    buf
}

/// Inserts an encoded slot at `offset`, shifting the tail right.
pub fn insert_slot(page: &mut Page, offset: usize, bytes: &[u8]) -> Result<()> {
    let used = page.data_length();
    if offset > used {
        return Err(corrupt(page, offset, "insert past data length"));
    }
    if bytes.len() > page.free_space() {
        return Err(XylemError::Internal(format!(
            "slot of {} bytes does not fit in {} free bytes on page {}",
            bytes.len(),
            page.free_space(),
            page.id()
        )));
    }
    let area = page.area_mut();
    area.copy_within(offset..used, offset + bytes.len());
    area[offset..offset + bytes.len()].copy_from_slice(bytes);
    page.set_data_length(used + bytes.len());
    page.header_mut().record_count += 1;
    Ok(())
}

/// Appends an encoded slot at the end of the data area.
pub fn append_slot(page: &mut Page, bytes: &[u8]) -> Result<()> {
    let used = page.data_length();
    insert_slot(page, used, bytes)
}

/// Removes a slot, compacting the data area.
pub fn remove_slot(page: &mut Page, slot: &Slot) {
    let used = page.data_length();
    let len = slot.len();
    let area = page.area_mut();
    area.copy_within(slot.end()..used, slot.offset);
    area[used - len..used].fill(0);
    page.set_data_length(used - len);
    let header = page.header_mut();
    header.record_count = header.record_count.saturating_sub(1);
}

/// Cuts the data area at `offset`, dropping every slot from there on.
///
/// Returns the removed bytes. The caller adjusts the record count.
pub fn truncate(page: &mut Page, offset: usize) -> Vec<u8> {
    let used = page.data_length();
    let tail = page.area()[offset..used].to_vec();
    page.area_mut()[offset..used].fill(0);
    page.set_data_length(offset);
    tail
}

/// Appends `chunk` to the inline payload of a plain slot in place.
pub fn extend_value(page: &mut Page, slot: &Slot, chunk: &[u8]) -> Result<()> {
    if slot.overflow.is_some() || slot.kind != SlotKind::Plain {
        return Err(XylemError::Internal(
            "only plain inline values grow in place".to_string(),
        ));
    }
    let new_len = slot.value_len + chunk.len();
    if new_len >= OVERFLOW_SENTINEL as usize || chunk.len() > page.free_space() {
        return Err(XylemError::Internal(format!(
            "value on page {} cannot grow by {} bytes",
            page.id(),
            chunk.len()
        )));
    }
    let used = page.data_length();
    let end = slot.end();
    let len_at = slot.offset + TID_LEN;
    let area = page.area_mut();
    area.copy_within(end..used, end + chunk.len());
    area[end..end + chunk.len()].copy_from_slice(chunk);
    area[len_at..len_at + LENGTH_LEN].copy_from_slice(&(new_len as u16).to_le_bytes());
    page.set_data_length(used + chunk.len());
    Ok(())
}

/// Overwrites the stored payload of a slot with bytes of the same length.
pub fn overwrite_value(page: &mut Page, slot: &Slot, bytes: &[u8]) -> Result<()> {
    if bytes.len() != slot.value_len {
        return Err(XylemError::SizeMismatch {
            expected: slot.value_len,
            actual: bytes.len(),
        });
    }
    page.area_mut()[slot.value_offset..slot.end()].copy_from_slice(bytes);
    Ok(())
}

/// Points an existing forwarding link at a new target.
pub fn set_forward(page: &mut Page, slot: &Slot, forward: VirtualAddress) -> Result<()> {
    if !slot.is_link() {
        return Err(corrupt(page, slot.offset, "expected a forwarding link"));
    }
    let at = slot.offset + TID_LEN;
    page.area_mut()[at..at + ADDRESS_LEN].copy_from_slice(&forward.to_bytes());
    Ok(())
}

/// Recounts the slots on a page into its header.
pub fn recount(page: &mut Page) -> Result<()> {
    let mut count = 0u16;
    for slot in slots(page) {
        slot?;
        count += 1;
    }
    page.header_mut().record_count = count;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xylem_common::PageStatus;

    fn test_page() -> Page {
        Page::new(PageId(2), 512, PageStatus::Record)
    }

    fn append_plain(page: &mut Page, value: &[u8]) -> TupleId {
        let tid = page.allocate_tid().unwrap();
        append_slot(page, &encode_plain(tid, Payload::Inline(value))).unwrap();
        tid
    }

    #[test]
    fn test_plain_slot_layout() {
        let bytes = encode_plain(TupleId::new(3), Payload::Inline(b"abc"));
        assert_eq!(bytes, vec![3, 0, 3, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_link_slot_layout() {
        let forward = VirtualAddress::new(PageId(9), TupleId::new(4));
        let bytes = encode_link(TupleId::new(3), forward);
        assert_eq!(bytes.len(), LINK_LEN);
        assert_eq!(&bytes[..2], &(0x8003u16).to_le_bytes());
        assert_eq!(&bytes[2..], &forward.to_bytes());
    }

    #[test]
    fn test_read_all_shapes() {
        let mut page = test_page();
        let backlink = VirtualAddress::new(PageId(1), TupleId::new(7));
        let forward = VirtualAddress::new(PageId(5), TupleId::new(2));

        append_slot(&mut page, &encode_plain(TupleId::new(1), Payload::Inline(b"hello"))).unwrap();
        append_slot(
            &mut page,
            &encode_relocated(TupleId::new(2), backlink, Payload::Inline(b"moved")),
        )
        .unwrap();
        append_slot(&mut page, &encode_link(TupleId::new(3), forward)).unwrap();
        append_slot(&mut page, &encode_plain(TupleId::new(4), Payload::Overflow(PageId(40)))).unwrap();

        let all: Vec<Slot> = slots(&page).collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(page.header().record_count, 4);

        assert_eq!(all[0].kind, SlotKind::Plain);
        assert_eq!(all[0].payload(&page), Payload::Inline(b"hello"));
        assert_eq!(all[0].len(), 9);

        assert_eq!(all[1].kind, SlotKind::Relocated { backlink });
        assert_eq!(all[1].payload(&page), Payload::Inline(b"moved"));
        assert_eq!(all[1].logical_address(page.id()), backlink);
        assert_eq!(all[1].len(), RELOCATED_OVERHEAD + 5);

        assert_eq!(all[2].kind, SlotKind::Link { forward });
        assert_eq!(all[2].len(), LINK_LEN);
        assert!(all[2].is_link());

        assert_eq!(all[3].overflow, Some(PageId(40)));
        assert_eq!(all[3].payload(&page), Payload::Overflow(PageId(40)));
        assert_eq!(all[3].end(), page.data_length());
    }

    #[test]
    fn test_find_slot_ignores_flags() {
        let mut page = test_page();
        append_plain(&mut page, b"a");
        append_slot(
            &mut page,
            &encode_link(TupleId::new(2), VirtualAddress::new(PageId(3), TupleId::new(1))),
        )
        .unwrap();

        let found = find_slot(&page, TupleId::new(2).as_link()).unwrap().unwrap();
        assert!(found.is_link());
        assert!(find_slot(&page, TupleId::new(9)).unwrap().is_none());
    }

    #[test]
    fn test_insert_shifts_tail() {
        let mut page = test_page();
        append_plain(&mut page, b"first");
        let third = append_plain(&mut page, b"third");

        let first = read_slot(&page, 0).unwrap();
        let tid = page.allocate_tid().unwrap();
        insert_slot(&mut page, first.end(), &encode_plain(tid, Payload::Inline(b"second"))).unwrap();

        let values: Vec<Vec<u8>> = slots(&page)
            .map(|s| {
                let s = s.unwrap();
                match s.payload(&page) {
                    Payload::Inline(v) => v.to_vec(),
                    Payload::Overflow(_) => unreachable!(),
                }
            })
            .collect();
        assert_eq!(values, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
        assert_eq!(find_slot(&page, third).unwrap().unwrap().tid, third);
    }

    #[test]
    fn test_insert_rejects_overfull_page() {
        let mut page = test_page();
        let big = vec![7u8; page.working_size() - PLAIN_OVERHEAD];
        append_plain(&mut page, &big);
        assert_eq!(page.free_space(), 0);
        let err = append_slot(&mut page, &encode_plain(TupleId::new(9), Payload::Inline(b"x")));
        assert!(err.is_err());
        assert_eq!(page.header().record_count, 1);
    }

    #[test]
    fn test_remove_compacts() {
        let mut page = test_page();
        append_plain(&mut page, b"aa");
        let b = append_plain(&mut page, b"bbbb");
        append_plain(&mut page, b"c");
        let before = page.data_length();

        let slot = find_slot(&page, b).unwrap().unwrap();
        remove_slot(&mut page, &slot);
        assert_eq!(page.data_length(), before - 8);
        assert_eq!(page.header().record_count, 2);
        assert!(find_slot(&page, b).unwrap().is_none());
        assert_eq!(slots(&page).count(), 2);
        assert!(page.area()[page.data_length()..].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_truncate() {
        let mut page = test_page();
        append_plain(&mut page, b"keep");
        append_plain(&mut page, b"drop");
        let second = read_slot(&page, 8).unwrap();

        let tail = truncate(&mut page, second.offset);
        assert_eq!(tail.len(), 8);
        assert_eq!(page.data_length(), 8);
        recount(&mut page).unwrap();
        assert_eq!(page.header().record_count, 1);
    }

    #[test]
    fn test_extend_value() {
        let mut page = test_page();
        let a = append_plain(&mut page, b"ab");
        append_plain(&mut page, b"zz");
        let slot = find_slot(&page, a).unwrap().unwrap();
        extend_value(&mut page, &slot, b"cd").unwrap();

        let slot = find_slot(&page, a).unwrap().unwrap();
        assert_eq!(slot.payload(&page), Payload::Inline(b"abcd"));
        let last = slots(&page).last().unwrap().unwrap();
        assert_eq!(last.payload(&page), Payload::Inline(b"zz"));
    }

    #[test]
    fn test_overwrite_and_set_forward() {
        let mut page = test_page();
        let a = append_plain(&mut page, b"old");
        let slot = find_slot(&page, a).unwrap().unwrap();
        assert!(matches!(
            overwrite_value(&mut page, &slot, b"toolong"),
            Err(XylemError::SizeMismatch { expected: 3, actual: 7 })
        ));
        overwrite_value(&mut page, &slot, b"new").unwrap();
        assert_eq!(slot.payload(&page), Payload::Inline(b"new"));
        assert!(set_forward(&mut page, &slot, VirtualAddress::NONE).is_err());

        let link_tid = page.allocate_tid().unwrap();
        append_slot(
            &mut page,
            &encode_link(link_tid, VirtualAddress::new(PageId(1), TupleId::new(1))),
        )
        .unwrap();
        let link = find_slot(&page, link_tid).unwrap().unwrap();
        let target = VirtualAddress::new(PageId(8), TupleId::new(6));
        set_forward(&mut page, &link, target).unwrap();
        let link = find_slot(&page, link_tid).unwrap().unwrap();
        assert_eq!(link.kind, SlotKind::Link { forward: target });
    }

    #[test]
    fn test_truncated_slot_is_corruption() {
        let mut page = test_page();
        append_plain(&mut page, b"abcdef");
        // claim a longer payload than the data area holds
        page.area_mut()[2..4].copy_from_slice(&100u16.to_le_bytes());
        let err = read_slot(&page, 0).unwrap_err();
        assert!(err.is_corruption());

        let mut iter = slots(&page);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_short_address_fields_are_corruption() {
        let mut page = test_page();
        let link = TupleId::new(1).as_link();
        page.area_mut()[0..2].copy_from_slice(&link.raw().to_le_bytes());
        page.set_data_length(TID_LEN + 5);
        assert!(read_slot(&page, 0).unwrap_err().is_corruption());

        let relocated = TupleId::new(1).as_relocated();
        page.area_mut()[0..2].copy_from_slice(&relocated.raw().to_le_bytes());
        page.area_mut()[2..4].copy_from_slice(&0u16.to_le_bytes());
        page.set_data_length(TID_LEN + LENGTH_LEN + 3);
        assert!(read_slot(&page, 0).unwrap_err().is_corruption());
    }
}
