use std::borrow::Cow;
use std::cmp::Ordering;

use crate::memory::allocator::MemorySegment;

/// Bytes taken from the buffer for each record's index entry.
pub const SLOT_BYTES: usize = 8;

#[derive(Clone, Copy, Debug)]
struct Slot {
    offset: u32,
    len: u32,
}

impl Slot {
    fn encode(self) -> [u8; SLOT_BYTES] {
        let mut raw = [0u8; SLOT_BYTES];
        raw[..4].copy_from_slice(&self.offset.to_le_bytes());
        raw[4..].copy_from_slice(&self.len.to_le_bytes());
        raw
    }

    fn decode(raw: [u8; SLOT_BYTES]) -> Self {
        Self {
            offset: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            len: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

/// Serialized records packed into a fixed set of memory segments.
///
/// Record bytes grow from the front of the buffer and the slot index grows
/// from the back, so records plus index never exceed the segments handed in.
/// A record may straddle a segment boundary. Sorting permutes the index in
/// place and never moves record bytes.
pub struct SegmentBuffer {
    segments: Vec<MemorySegment>,
    segment_size: usize,
    count: usize,
    fill: usize,
}

impl SegmentBuffer {
    pub fn new(segments: Vec<MemorySegment>) -> Self {
        let segment_size = segments.first().map(|s| s.size()).unwrap_or(0);
        Self {
            segments,
            segment_size,
            count: 0,
            fill: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.segments.len() * self.segment_size
    }

    /// Record bytes, not counting the index.
    pub fn fill_bytes(&self) -> usize {
        self.fill
    }

    /// Record bytes plus index bytes.
    pub fn used_bytes(&self) -> usize {
        self.fill + self.count * SLOT_BYTES
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Copy `bytes` in as a new record. Returns `false` if the record and its
    /// index entry do not fit.
    pub fn try_append(&mut self, bytes: &[u8]) -> bool {
        let needed = self.used_bytes() + bytes.len() + SLOT_BYTES;
        if needed > self.capacity() {
            return false;
        }
        let (Ok(offset), Ok(len)) = (u32::try_from(self.fill), u32::try_from(bytes.len())) else {
            return false;
        };
        if offset.checked_add(len).is_none() {
            return false;
        }
        self.write_at(self.fill, bytes);
        self.set_slot(self.count, Slot { offset, len });
        self.count += 1;
        self.fill += bytes.len();
        true
    }

    /// Bytes of the `index`-th record in current index order.
    pub fn get(&self, index: usize) -> Cow<'_, [u8]> {
        assert!(index < self.count, "record index out of bounds");
        self.bytes_of(self.slot(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = Cow<'_, [u8]>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Sort the record index, stable with respect to insertion order.
    ///
    /// Heapsort over the in-segment index, so no scratch memory is taken.
    /// Ties fall back to the record offset, which grows with insertion order.
    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&[u8], &[u8]) -> Ordering,
    {
        let mut less = |buffer: &Self, a: Slot, b: Slot| {
            compare(&buffer.bytes_of(a), &buffer.bytes_of(b))
                .then(a.offset.cmp(&b.offset))
                == Ordering::Less
        };
        let n = self.count;
        for start in (0..n / 2).rev() {
            self.sift_down(start, n, &mut less);
        }
        for end in (1..n).rev() {
            self.swap_slots(0, end);
            self.sift_down(0, end, &mut less);
        }
    }

    fn sift_down<L>(&mut self, mut root: usize, end: usize, less: &mut L)
    where
        L: FnMut(&Self, Slot, Slot) -> bool,
    {
        loop {
            let mut child = 2 * root + 1;
            if child >= end {
                break;
            }
            if child + 1 < end && less(self, self.slot(child), self.slot(child + 1)) {
                child += 1;
            }
            if !less(self, self.slot(root), self.slot(child)) {
                break;
            }
            self.swap_slots(root, child);
            root = child;
        }
    }

    fn slot_position(&self, index: usize) -> usize {
        self.capacity() - (index + 1) * SLOT_BYTES
    }

    fn slot(&self, index: usize) -> Slot {
        let mut raw = [0u8; SLOT_BYTES];
        self.read_at(self.slot_position(index), &mut raw);
        Slot::decode(raw)
    }

    fn set_slot(&mut self, index: usize, slot: Slot) {
        self.write_at(self.slot_position(index), &slot.encode());
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        let (first, second) = (self.slot(a), self.slot(b));
        self.set_slot(a, second);
        self.set_slot(b, first);
    }

    fn write_at(&mut self, mut offset: usize, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let segment = offset / self.segment_size;
            let within = offset % self.segment_size;
            let n = bytes.len().min(self.segment_size - within);
            self.segments[segment][within..within + n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            offset += n;
        }
    }

    fn read_at(&self, mut offset: usize, out: &mut [u8]) {
        let mut done = 0;
        while done < out.len() {
            let segment = offset / self.segment_size;
            let within = offset % self.segment_size;
            let n = (out.len() - done).min(self.segment_size - within);
            out[done..done + n].copy_from_slice(&self.segments[segment][within..within + n]);
            done += n;
            offset += n;
        }
    }

    fn bytes_of(&self, slot: Slot) -> Cow<'_, [u8]> {
        let (offset, len) = (slot.offset as usize, slot.len as usize);
        if len == 0 {
            return Cow::Borrowed(&[]);
        }
        let segment = offset / self.segment_size;
        let within = offset % self.segment_size;
        if within + len <= self.segment_size {
            return Cow::Borrowed(&self.segments[segment][within..within + len]);
        }
        let mut bytes = vec![0u8; len];
        self.read_at(offset, &mut bytes);
        Cow::Owned(bytes)
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.fill = 0;
    }

    pub fn into_segments(self) -> Vec<MemorySegment> {
        self.segments
    }
}
