//! Frames and the bounded frame queue.
//!
//! - `Frame`: Opaque container for pixel data handed over by the camera. Bytes are private;
//!   recognizers receive them through `Frame::run_recognizer`.
//! - `FrameQueue`: Bounded newest-N queue between acquisition and recognition.
//!
//! Recognition is the bottleneck, and a fresh frame is worth more than a complete
//! history: when the queue is full the OLDEST frame is dropped, never the incoming one.

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::recognize::{RecognizedItem, Recognizer};

/// Default queue capacity. Keeps latency to roughly one recognition pass.
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

/// Upper bound on queue capacity regardless of configuration.
pub const MAX_QUEUE_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One camera frame. There is no `.as_bytes()` and no `Clone`.
pub struct Frame {
    /// Private pixel data.
    pixels: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Monotonic sequence number assigned by the source.
    pub seq: u64,

    /// Wall-clock capture time (ms since epoch).
    pub captured_at_ms: u64,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, seq: u64, captured_at_ms: u64) -> Self {
        Self {
            pixels,
            width,
            height,
            seq,
            captured_at_ms,
        }
    }

    /// A frame is readable when it has non-zero dimensions and at least one byte per pixel.
    pub fn is_readable(&self) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        let needed = (self.width as usize).saturating_mul(self.height as usize);
        self.pixels.len() >= needed
    }

    /// Hand the pixels to a recognizer. The slice cannot outlive the call.
    pub fn run_recognizer<R: Recognizer + ?Sized>(
        &self,
        recognizer: &mut R,
    ) -> Result<Vec<RecognizedItem>> {
        recognizer.recognize(&self.pixels, self.width, self.height)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameQueue
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub dropped: u64,
    pub popped: u64,
}

struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
    stats: QueueStats,
}

/// Bounded queue that keeps only the newest `capacity` frames.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_QUEUE_CAPACITY);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
                stats: QueueStats::default(),
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a frame without blocking. Evicts the oldest frames when full.
    ///
    /// Returns the number of frames dropped to make room, or `None` when the queue
    /// is closed (the frame is discarded).
    pub fn push(&self, frame: Frame) -> Option<usize> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        let mut dropped = 0;
        while state.frames.len() >= self.capacity {
            if let Some(old) = state.frames.pop_front() {
                log::debug!("frame queue full, dropping frame seq={}", old.seq);
                dropped += 1;
            }
        }
        state.frames.push_back(frame);
        state.stats.pushed += 1;
        state.stats.dropped += dropped as u64;
        drop(state);
        self.available.notify_one();
        Some(dropped)
    }

    /// Wait up to `timeout` for the oldest retained frame.
    ///
    /// Returns `None` on timeout or once the queue is closed and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                state.stats.popped += 1;
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Stop accepting frames and discard those not yet processed.
    pub fn close(&self) -> usize {
        let mut state = self.state();
        state.closed = true;
        let discarded = state.frames.len();
        state.frames.clear();
        drop(state);
        self.available.notify_all();
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        self.state().stats
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_frame(seq: u64) -> Frame {
        Frame::new(vec![0u8; 16], 4, 4, seq, seq * 100)
    }

    #[test]
    fn frame_readability() {
        assert!(make_frame(1).is_readable());
        assert!(!Frame::new(vec![], 4, 4, 1, 0).is_readable());
        assert!(!Frame::new(vec![1, 2, 3], 0, 3, 1, 0).is_readable());
        assert!(!Frame::new(vec![1, 2, 3], 4, 4, 1, 0).is_readable());
    }

    #[test]
    fn queue_keeps_newest_frames() {
        let queue = FrameQueue::new(3);
        for seq in 0..10 {
            queue.push(make_frame(seq));
        }
        assert_eq!(queue.len(), 3);
        let seqs: Vec<u64> = (0..3)
            .filter_map(|_| queue.pop_timeout(Duration::from_millis(1)))
            .map(|f| f.seq)
            .collect();
        assert_eq!(seqs, vec![7, 8, 9]);
        let stats = queue.stats();
        assert_eq!(stats.pushed, 10);
        assert_eq!(stats.dropped, 7);
        assert_eq!(stats.popped, 3);
    }

    #[test]
    fn push_reports_evictions() {
        let queue = FrameQueue::new(1);
        assert_eq!(queue.push(make_frame(1)), Some(0));
        assert_eq!(queue.push(make_frame(2)), Some(1));
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue = FrameQueue::new(2);
        let start = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn pop_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop_timeout(Duration::from_secs(5)).map(|f| f.seq))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.push(make_frame(42));
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn closed_queue_rejects_and_releases_waiters() {
        let queue = Arc::new(FrameQueue::new(2));
        queue.push(make_frame(1));
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.pop_timeout(Duration::from_secs(5)).is_none()
            })
        };
        assert_eq!(queue.close(), 1);
        assert!(consumer.join().unwrap());
        assert_eq!(queue.push(make_frame(2)), None);
        assert!(queue.is_closed());
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(FrameQueue::new(0).capacity(), 1);
        assert_eq!(FrameQueue::new(10_000).capacity(), MAX_QUEUE_CAPACITY);
    }
}
