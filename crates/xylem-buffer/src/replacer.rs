//! Page replacement policies for the page cache.

use crate::frame::FrameId;
use parking_lot::Mutex;

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as evictable (unpinned) or not.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame and removes it from the evictable set.
    ///
    /// Returns None if no frame is evictable.
    fn evict(&self) -> Option<FrameId>;

    /// Forgets a frame entirely.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Clock (second-chance) replacement.
///
/// Each frame carries a reference bit set on access. The hand sweeps the
/// frames, clearing set bits and stopping at the first evictable frame whose
/// bit is already clear. After two full sweeps without a victim it falls back
/// to the lowest evictable frame, so eviction succeeds whenever at least one
/// frame is unpinned.
pub struct ClockReplacer {
    inner: Mutex<ClockState>,
}

struct ClockState {
    referenced: Vec<bool>,
    evictable: Vec<bool>,
    evictable_count: usize,
    hand: usize,
}

impl ClockState {
    fn in_range(&self, frame_id: FrameId) -> bool {
        (frame_id.0 as usize) < self.referenced.len()
    }

    fn take(&mut self, slot: usize) -> FrameId {
        self.evictable[slot] = false;
        self.referenced[slot] = false;
        self.evictable_count -= 1;
        FrameId(slot as u32)
    }
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockState {
                referenced: vec![false; num_frames],
                evictable: vec![false; num_frames],
                evictable_count: 0,
                hand: 0,
            }),
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().referenced.len()
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&self, frame_id: FrameId) {
        let mut state = self.inner.lock();
        if state.in_range(frame_id) {
            state.referenced[frame_id.0 as usize] = true;
        }
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut state = self.inner.lock();
        if !state.in_range(frame_id) {
            return;
        }
        let slot = frame_id.0 as usize;
        match (state.evictable[slot], evictable) {
            (false, true) => state.evictable_count += 1,
            (true, false) => state.evictable_count -= 1,
            _ => {}
        }
        state.evictable[slot] = evictable;
    }

    fn evict(&self) -> Option<FrameId> {
        let mut state = self.inner.lock();
        if state.evictable_count == 0 {
            return None;
        }

        let num_frames = state.referenced.len();
        for _ in 0..(2 * num_frames) {
            let slot = state.hand;
            state.hand = (slot + 1) % num_frames;

            if !state.evictable[slot] {
                continue;
            }
            if state.referenced[slot] {
                state.referenced[slot] = false;
            } else {
                return Some(state.take(slot));
            }
        }

        let slot = state.evictable.iter().position(|&e| e)?;
        Some(state.take(slot))
    }

    fn remove(&self, frame_id: FrameId) {
        let mut state = self.inner.lock();
        if !state.in_range(frame_id) {
            return;
        }
        let slot = frame_id.0 as usize;
        if state.evictable[slot] {
            state.evictable_count -= 1;
        }
        state.evictable[slot] = false;
        state.referenced[slot] = false;
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_replacer_new() {
        let replacer = ClockReplacer::new(8);
        assert_eq!(replacer.capacity(), 8);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_clock_replacer_set_evictable() {
        let replacer = ClockReplacer::new(8);
        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.size(), 2);

        replacer.set_evictable(FrameId(1), false);
        assert_eq!(replacer.size(), 1);

        // out of range is ignored
        replacer.set_evictable(FrameId(100), true);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_clock_replacer_evicts_unreferenced_first() {
        let replacer = ClockReplacer::new(4);
        for i in 0..4 {
            replacer.set_evictable(FrameId(i), true);
        }
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));

        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert_eq!(replacer.evict(), Some(FrameId(3)));
        // second chance used up, referenced frames go next
        assert_eq!(replacer.evict(), Some(FrameId(0)));
        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_clock_replacer_skips_pinned() {
        let replacer = ClockReplacer::new(3);
        replacer.set_evictable(FrameId(2), true);
        replacer.record_access(FrameId(2));
        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_remove() {
        let replacer = ClockReplacer::new(4);
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(2), true);
        replacer.remove(FrameId(1));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId(2)));
    }
}
