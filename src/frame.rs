//! Frame payloads and the per-camera rolling buffer.
//!
//! - `Frame`: Immutable RGB8 image plus its resolution. Cloning shares the pixels.
//! - `RingBuffer<T>`: Fixed-capacity FIFO that evicts the oldest entry when full.
//! - `FrameRingBuffer`: The ring buffer a capture worker fills and a save reads.
//!
//! The buffer is written by exactly one capture thread and read on demand by the
//! save path. `snapshot()` takes the same lock as `push()`, so a reader always
//! observes a state that existed between two pushes, never a torn one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Frame dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte length of one packed RGB8 image at this resolution.
    pub fn rgb_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One captured image.
///
/// Pixels are packed RGB8, row-major, no padding. The payload sits behind an
/// `Arc`, so buffering and snapshotting never copy pixel data.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    resolution: Resolution,
}

impl Frame {
    pub fn new(data: Vec<u8>, resolution: Resolution) -> Self {
        Self {
            data: data.into(),
            resolution,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Pixel payloads are never logged.
        f.debug_struct("Frame")
            .field("resolution", &self.resolution)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// RingBuffer
// ----------------------------------------------------------------------------

/// Bounded FIFO shared between one producer and on-demand readers.
///
/// `push` is O(1): the `VecDeque` is allocated at full capacity up front and
/// the oldest element is popped before the new one is appended.
pub struct RingBuffer<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items. A zero capacity is
    /// raised to one so that the buffer always retains the latest item.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `item`, evicting the single oldest item if the buffer is full.
    pub fn push(&self, item: T) {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    /// Independent copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panicking writer cannot leave the deque structurally invalid,
        // so a poisoned lock still guards consistent data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Rolling pre-fault window for one camera.
pub type FrameRingBuffer = RingBuffer<Frame>;

impl FrameRingBuffer {
    /// Approximate pixel memory held by the buffer.
    pub fn memory_bytes(&self) -> usize {
        self.lock().iter().map(Frame::byte_len).sum()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn tagged_frame(tag: u32) -> Frame {
        Frame::new(tag.to_le_bytes().to_vec(), Resolution::new(2, 2))
    }

    fn frame_tag(frame: &Frame) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(frame.data());
        u32::from_le_bytes(bytes)
    }

    #[test]
    fn ring_buffer_keeps_last_min_m_n_in_order() {
        for capacity in [1usize, 2, 3, 7, 16] {
            for pushes in [0usize, 1, 5, 7, 8, 40] {
                let buf = RingBuffer::new(capacity);
                for i in 0..pushes {
                    buf.push(i);
                }
                let kept = pushes.min(capacity);
                let expected: Vec<usize> = (pushes - kept..pushes).collect();
                assert_eq!(buf.len(), kept, "capacity={capacity} pushes={pushes}");
                assert_eq!(buf.snapshot(), expected);
            }
        }
    }

    #[test]
    fn capacity_300_after_500_pushes_holds_201_through_500() {
        let buf = FrameRingBuffer::new(300);
        for tag in 1..=500 {
            buf.push(tagged_frame(tag));
        }

        let tags: Vec<u32> = buf.snapshot().iter().map(frame_tag).collect();
        assert_eq!(tags.len(), 300);
        assert_eq!(tags.first(), Some(&201));
        assert_eq!(tags.last(), Some(&500));
        assert!(tags.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let buf = RingBuffer::new(0);
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.snapshot(), vec!["b"]);
    }

    #[test]
    fn snapshot_is_independent_of_later_pushes() {
        let buf = RingBuffer::new(3);
        buf.push(1);
        buf.push(2);
        let snap = buf.snapshot();
        buf.push(3);
        buf.push(4);
        assert_eq!(snap, vec![1, 2]);
        assert_eq!(buf.snapshot(), vec![2, 3, 4]);
    }

    #[test]
    fn concurrent_snapshots_never_tear() {
        let buf = Arc::new(RingBuffer::new(64));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let buf = Arc::clone(&buf);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0u64..50_000 {
                    buf.push(i);
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut observed = 0;
        while !done.load(Ordering::SeqCst) || observed == 0 {
            let snap = buf.snapshot();
            assert!(snap.len() <= 64);
            // Every snapshot must be a contiguous run of pushed values.
            assert!(snap.windows(2).all(|w| w[1] == w[0] + 1), "torn snapshot");
            assert!(snap.iter().all(|v| *v < 50_000));
            observed += 1;
        }

        writer.join().unwrap();
        assert_eq!(buf.snapshot(), (50_000 - 64..50_000).collect::<Vec<u64>>());
    }

    #[test]
    fn frame_debug_hides_pixels() {
        let frame = Frame::new(vec![7; 12], Resolution::new(2, 2));
        let rendered = format!("{:?}", frame);
        assert!(rendered.contains("bytes: 12"));
        assert!(!rendered.contains("7, 7"));
    }

    #[test]
    fn memory_bytes_sums_payloads() {
        let buf = FrameRingBuffer::new(4);
        buf.push(Frame::new(vec![0; 12], Resolution::new(2, 2)));
        buf.push(Frame::new(vec![0; 12], Resolution::new(2, 2)));
        assert_eq!(buf.memory_bytes(), 24);
    }
}
