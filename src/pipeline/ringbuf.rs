//! Fixed-capacity ring of frame-sized slots over a contiguous byte region.
//!
//! The ring has no synchronization and no occupancy checks of its own; the
//! channel owning it does both. One slot always stays free so `head == tail`
//! means empty and `tail + 1 == head` (mod capacity) means full.

/// Read/write cursors. `#[repr(C)]` so it can sit in a shared segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    /// Next slot to read
    pub head: usize,
    /// Next slot to write
    pub tail: usize,
    /// Number of slots, one more than the usable capacity
    pub capacity: usize,
}

impl RingCursor {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 2, "a ring needs at least two slots");
        Self {
            head: 0,
            tail: 0,
            capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        (self.tail + 1) % self.capacity == self.head
    }

    pub fn len(&self) -> usize {
        (self.tail + self.capacity - self.head) % self.capacity
    }

    /// Frames the ring can hold at once
    pub fn usable(&self) -> usize {
        self.capacity - 1
    }
}

/// Borrowed view pairing a cursor with its slot storage
pub struct RingBuffer<'a> {
    cursor: &'a mut RingCursor,
    slots: &'a mut [u8],
    frame_size: usize,
}

impl<'a> RingBuffer<'a> {
    pub fn new(cursor: &'a mut RingCursor, slots: &'a mut [u8], frame_size: usize) -> Self {
        debug_assert!(slots.len() >= cursor.capacity * frame_size);
        Self {
            cursor,
            slots,
            frame_size,
        }
    }

    pub fn cursor(&self) -> &RingCursor {
        &*self.cursor
    }

    /// Slot at `tail`, to be filled with exactly one frame
    pub fn write_slot(&mut self) -> &mut [u8] {
        let offset = self.cursor.tail * self.frame_size;
        &mut self.slots[offset..offset + self.frame_size]
    }

    /// Slot at `head`, holding the oldest frame
    pub fn read_slot(&self) -> &[u8] {
        let offset = self.cursor.head * self.frame_size;
        &self.slots[offset..offset + self.frame_size]
    }

    pub fn advance_tail(&mut self) {
        self.cursor.tail = (self.cursor.tail + 1) % self.cursor.capacity;
    }

    pub fn advance_head(&mut self) {
        self.cursor.head = (self.cursor.head + 1) % self.cursor.capacity;
    }

    /// Copy a frame into the tail slot and publish it
    pub fn write(&mut self, frame: &[u8]) {
        debug_assert!(!self.cursor.is_full());
        self.write_slot().copy_from_slice(frame);
        self.advance_tail();
    }

    /// Copy the oldest frame out and release its slot
    pub fn read(&mut self) -> Vec<u8> {
        debug_assert!(!self.cursor.is_empty());
        let frame = self.read_slot().to_vec();
        self.advance_head();
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_full_sacrifice_one_slot() {
        let mut cursor = RingCursor::new(4);
        let mut slots = vec![0u8; 4 * 2];
        let mut ring = RingBuffer::new(&mut cursor, &mut slots, 2);

        assert!(ring.cursor().is_empty());
        ring.write(&[1, 1]);
        ring.write(&[2, 2]);
        ring.write(&[3, 3]);
        assert!(ring.cursor().is_full());
        assert_eq!(ring.cursor().len(), 3);
        assert_eq!(ring.cursor().usable(), 3);
    }

    #[test]
    fn reads_come_back_in_write_order_across_wrap() {
        let mut cursor = RingCursor::new(3);
        let mut slots = vec![0u8; 3];
        let mut ring = RingBuffer::new(&mut cursor, &mut slots, 1);

        let mut out = Vec::new();
        for value in 0..10u8 {
            ring.write(&[value]);
            if ring.cursor().is_full() {
                out.extend(ring.read());
            }
        }
        while !ring.cursor().is_empty() {
            out.extend(ring.read());
        }
        assert_eq!(out, (0..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn slot_offsets_follow_indices() {
        let mut cursor = RingCursor::new(3);
        let mut slots = vec![0u8; 3 * 4];
        {
            let mut ring = RingBuffer::new(&mut cursor, &mut slots, 4);
            ring.write_slot().copy_from_slice(&[9; 4]);
            ring.advance_tail();
            ring.write_slot()[0] = 7;
        }
        assert_eq!(&slots[..4], &[9; 4]);
        assert_eq!(slots[4], 7);
        assert_eq!(cursor.tail, 1);
    }
}
