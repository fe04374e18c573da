use std::time::Instant;

/// Contiguous byte buffer holding the most recent captured PCM.
///
/// Data always starts at offset 0 and ends at `write_offset`. When an append
/// would overflow, the oldest half of the capacity is discarded by shifting
/// the remaining bytes to the front, so readers can always copy a contiguous
/// tail. Owned by the control loop; wrap in a mutex for cross-thread access.
#[derive(Debug)]
pub struct RingBuffer {
    buffer: Vec<u8>,
    write_offset: usize,
    capacity: usize,
    /// Discards and oversize truncation happen on multiples of this many bytes.
    alignment: usize,
    last_merged: Option<Instant>,
}

impl RingBuffer {
    pub fn new(capacity: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let capacity = capacity / alignment * alignment;
        Self {
            buffer: vec![0; capacity],
            write_offset: 0,
            capacity,
            alignment,
            last_merged: None,
        }
    }

    /// Append a frame, compacting first if it would not fit.
    ///
    /// A frame larger than the whole buffer leaves only its aligned tail.
    pub fn append(&mut self, frame: &[u8]) {
        if frame.is_empty() || self.capacity == 0 {
            return;
        }

        if frame.len() >= self.capacity {
            let start = frame.len() - self.capacity;
            let start = start.div_ceil(self.alignment) * self.alignment;
            let kept = &frame[start..];
            self.buffer[..kept.len()].copy_from_slice(kept);
            self.write_offset = kept.len();
            return;
        }

        while self.write_offset + frame.len() > self.capacity {
            self.discard_oldest_half();
        }

        self.buffer[self.write_offset..self.write_offset + frame.len()].copy_from_slice(frame);
        self.write_offset += frame.len();
    }

    fn discard_oldest_half(&mut self) {
        let half = (self.capacity / 2) / self.alignment * self.alignment;
        let discard = if half == 0 { self.write_offset } else { half.min(self.write_offset) };
        self.buffer.copy_within(discard..self.write_offset, 0);
        self.write_offset -= discard;
    }

    /// Copy of the last `len` bytes, or `None` if fewer are buffered.
    pub fn tail(&self, len: usize) -> Option<Vec<u8>> {
        if len > self.write_offset {
            return None;
        }
        Some(self.buffer[self.write_offset - len..self.write_offset].to_vec())
    }

    /// Record the capture time of the newest merged frame.
    pub fn mark_merged(&mut self, captured_at: Instant) {
        self.last_merged = Some(captured_at);
    }

    pub fn last_merged(&self) -> Option<Instant> {
        self.last_merged
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.write_offset
    }

    pub fn is_empty(&self) -> bool {
        self.write_offset == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all buffered data and the merge timestamp.
    pub fn reset(&mut self) {
        self.write_offset = 0;
        self.last_merged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_tail() {
        let mut buf = RingBuffer::new(10, 1);
        buf.append(&[1, 2, 3]);
        buf.append(&[4, 5]);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf.tail(3), Some(vec![3, 4, 5]));
        assert_eq!(buf.tail(5), Some(vec![1, 2, 3, 4, 5]));
        assert_eq!(buf.tail(6), None);
    }

    #[test]
    fn overflow_discards_oldest_half() {
        let mut buf = RingBuffer::new(8, 1);
        buf.append(&[1, 2, 3, 4, 5, 6]);
        buf.append(&[7, 8, 9]); // drops 1..=4

        assert_eq!(buf.len(), 5);
        assert_eq!(buf.tail(5), Some(vec![5, 6, 7, 8, 9]));
    }

    #[test]
    fn overflow_keeps_sample_alignment() {
        let mut buf = RingBuffer::new(12, 2);
        buf.append(&[1, 1, 2, 2, 3, 3, 4, 4, 5, 5]);
        buf.append(&[6, 6, 7, 7]); // half = 6 bytes

        assert_eq!(buf.tail(buf.len()), Some(vec![4, 4, 5, 5, 6, 6, 7, 7]));
        assert_eq!(buf.len() % 2, 0);
    }

    #[test]
    fn large_frame_compacts_repeatedly() {
        let mut buf = RingBuffer::new(8, 1);
        buf.append(&[1, 2, 3, 4, 5, 6, 7]);
        buf.append(&[10, 11, 12, 13, 14, 15]);

        assert!(buf.len() <= buf.capacity());
        assert_eq!(buf.tail(6), Some(vec![10, 11, 12, 13, 14, 15]));
    }

    #[test]
    fn frame_larger_than_capacity_keeps_tail() {
        let mut buf = RingBuffer::new(4, 2);
        buf.append(&[9, 9]);
        buf.append(&[1, 2, 3, 4, 5, 6]);

        assert_eq!(buf.len(), 4);
        assert_eq!(buf.tail(4), Some(vec![3, 4, 5, 6]));
    }

    #[test]
    fn many_appends_stay_within_capacity() {
        let mut buf = RingBuffer::new(230 * 1024, 2);
        let frame: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        for _ in 0..200 {
            buf.append(&frame);
            assert!(buf.len() <= buf.capacity());
        }
        assert_eq!(buf.tail(4096), Some(frame));
    }

    #[test]
    fn reset_clears_data_and_timestamp() {
        let mut buf = RingBuffer::new(10, 1);
        buf.append(&[1, 2, 3]);
        buf.mark_merged(Instant::now());
        buf.reset();

        assert!(buf.is_empty());
        assert!(buf.last_merged().is_none());
        assert_eq!(buf.tail(1), None);
    }

    #[test]
    fn empty_append_is_a_no_op() {
        let mut buf = RingBuffer::new(10, 1);
        buf.append(&[]);
        assert!(buf.is_empty());
        assert_eq!(buf.tail(0), Some(Vec::new()));
    }
}
