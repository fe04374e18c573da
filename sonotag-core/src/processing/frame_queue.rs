use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;

/// One read from the capture device.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

/// Bounded FIFO between the acquisition and control loops.
///
/// Pushing into a full queue drops the oldest frame.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<CapturedFrame>>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Enqueue a frame. Returns `true` if an older frame was dropped to make room.
    pub fn push(&self, frame: CapturedFrame) -> bool {
        let mut frames = self.frames.lock();
        let dropped = if frames.len() >= self.capacity {
            frames.pop_front();
            true
        } else {
            false
        };
        frames.push_back(frame);
        dropped
    }

    /// Remove every queued frame, returning those captured after `after` in FIFO order.
    pub fn drain_newer_than(&self, after: Option<Instant>) -> Vec<CapturedFrame> {
        let mut frames = self.frames.lock();
        frames
            .drain(..)
            .filter(|frame| after.is_none_or(|t| frame.captured_at > t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn frame(byte: u8, at: Instant) -> CapturedFrame {
        CapturedFrame {
            data: vec![byte; 4],
            captured_at: at,
        }
    }

    #[test]
    fn fifo_order() {
        let queue = FrameQueue::new(4);
        let now = Instant::now();
        queue.push(frame(1, now));
        queue.push(frame(2, now + Duration::from_millis(1)));

        let drained = queue.drain_newer_than(None);
        assert_eq!(drained.iter().map(|f| f.data[0]).collect::<Vec<_>>(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = FrameQueue::new(2);
        let now = Instant::now();
        assert!(!queue.push(frame(1, now)));
        assert!(!queue.push(frame(2, now)));
        assert!(queue.push(frame(3, now)));

        assert_eq!(queue.len(), 2);
        let drained = queue.drain_newer_than(None);
        assert_eq!(drained.iter().map(|f| f.data[0]).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn skips_frames_already_merged() {
        let queue = FrameQueue::new(8);
        let base = Instant::now();
        for i in 0..4u8 {
            queue.push(frame(i, base + Duration::from_millis(i as u64 * 10)));
        }

        let drained = queue.drain_newer_than(Some(base + Duration::from_millis(10)));
        assert_eq!(drained.iter().map(|f| f.data[0]).collect::<Vec<_>>(), vec![2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producer() {
        use std::sync::Arc;

        let queue = Arc::new(FrameQueue::new(15));
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..100u8 {
                    queue.push(frame(i, Instant::now()));
                }
            })
        };
        producer.join().unwrap();

        let drained = queue.drain_newer_than(None);
        assert_eq!(drained.len(), 15);
        assert_eq!(drained.last().map(|f| f.data[0]), Some(99));
    }
}
