//! # Bounded Output Ring Buffer
//!
//! Per-execution store for streamed command output. Writers (the reader
//! task pulling from the daemon) append frames; readers poll by cursor.
//! The buffer is bounded by a byte budget: when an append would exceed it,
//! the oldest whole frames are evicted and the evicted-watermark
//! `min_available_seq` advances. Slow pollers therefore never block
//! producers - they observe a gap marker instead.
//!
//! ## Cursor Semantics
//!
//! - `seq` starts at 1 and is strictly increasing per execution.
//! - A poll with `after_seq = 0` returns from the oldest available frame.
//! - If `after_seq < min_available_seq - 1`, frames were evicted past the
//!   cursor: the response carries `gap_from_seq = min_available_seq` and
//!   resumes there.
//! - The terminal frame (exit code + usage) is appended exactly once, has
//!   the largest `seq`, and is never evicted. After it, appends are
//!   silently dropped.
//!
//! ## Frame Layout
//!
//! ```text
//!        min_available_seq                     write cursor
//!              │                                    │
//!   evicted ◄──┤  ┌────┬────┬────┬────┬─────────┐  │
//!   (gap)      └─►│ s=4│ s=5│ s=6│ s=7│ s=8 exit│◄─┘
//!                 └────┴────┴────┴────┴─────────┘
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::runtime::StreamKind;
use crate::store::ExecUsage;

// =============================================================================
// Frames
// =============================================================================

/// Payload of one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// Raw output bytes from one stream.
    Data { stream: StreamKind, data: Vec<u8> },
    /// Terminal frame: observed exit code and resource usage.
    Exit { exit_code: i64, usage: ExecUsage },
    /// Control frame delivered when the server shuts down mid-stream.
    Shutdown,
}

/// One immutable frame. Appended once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub body: FrameBody,
}

impl Frame {
    fn payload_len(&self) -> usize {
        match &self.body {
            FrameBody::Data { data, .. } => data.len(),
            FrameBody::Exit { .. } | FrameBody::Shutdown => 0,
        }
    }

    /// True for control frames (exit or shutdown).
    pub fn is_control(&self) -> bool {
        !matches!(self.body, FrameBody::Data { .. })
    }
}

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct PollResult {
    /// Frames with `seq` strictly greater than the effective cursor, in
    /// strictly increasing order.
    pub frames: Vec<Frame>,
    /// True when the execution is terminal and no frames were omitted from
    /// this response.
    pub complete: bool,
    /// Set when eviction advanced past the requested cursor; the first
    /// returned frame has this `seq`.
    pub gap_from_seq: Option<u64>,
}

// =============================================================================
// Ring Buffer
// =============================================================================

/// Bounded per-execution output buffer.
#[derive(Debug)]
pub struct RingBuffer {
    frames: VecDeque<Frame>,
    /// Byte budget over Data payloads.
    budget: usize,
    /// Current sum of retained Data payload bytes.
    data_bytes: usize,
    /// Next sequence number to assign.
    next_seq: u64,
    /// Seq of the oldest retained frame (equals `next_seq` when empty).
    min_available_seq: u64,
    /// Set once the terminal frame lands; appends are dropped after this.
    completed: bool,
}

impl RingBuffer {
    /// Creates a buffer with the given Data-byte budget.
    pub fn new(budget: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            budget,
            data_bytes: 0,
            next_seq: 1,
            min_available_seq: 1,
            completed: false,
        }
    }

    /// Appends an output frame, evicting oldest whole frames as needed.
    /// Returns the assigned seq, or `None` if the buffer is already
    /// terminal (the frame is dropped - invariant I6).
    pub fn push_data(&mut self, stream: StreamKind, data: Vec<u8>) -> Option<u64> {
        if self.completed || data.is_empty() {
            return None;
        }

        // Evict oldest whole frames until the new frame fits. A frame larger
        // than the whole budget empties the buffer and is then retained, so
        // output is never silently lost mid-stream.
        while self.data_bytes + data.len() > self.budget {
            match self.frames.pop_front() {
                Some(evicted) => {
                    self.data_bytes -= evicted.payload_len();
                    self.min_available_seq = evicted.seq + 1;
                }
                None => break,
            }
        }

        let seq = self.assign_seq();
        self.data_bytes += data.len();
        self.frames.push_back(Frame {
            seq,
            ts: Utc::now(),
            body: FrameBody::Data { stream, data },
        });
        Some(seq)
    }

    /// Appends the terminal frame and seals the buffer. Returns the
    /// assigned seq, or `None` if already terminal.
    pub fn push_exit(&mut self, exit_code: i64, usage: ExecUsage) -> Option<u64> {
        if self.completed {
            return None;
        }
        let seq = self.assign_seq();
        self.frames.push_back(Frame {
            seq,
            ts: Utc::now(),
            body: FrameBody::Exit { exit_code, usage },
        });
        self.completed = true;
        Some(seq)
    }

    /// Appends a shutdown control frame and seals the buffer. No-op when
    /// the execution already has its terminal frame.
    pub fn push_shutdown(&mut self) -> Option<u64> {
        if self.completed {
            return None;
        }
        let seq = self.assign_seq();
        self.frames.push_back(Frame {
            seq,
            ts: Utc::now(),
            body: FrameBody::Shutdown,
        });
        self.completed = true;
        Some(seq)
    }

    fn assign_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Polls frames after `after_seq`, bounded by `max_bytes` of payload.
    /// At least one frame is returned when any is pending, so a single
    /// oversized frame cannot wedge the cursor.
    pub fn poll(&self, after_seq: u64, max_bytes: usize) -> PollResult {
        // Detect a gap: the cursor points at an evicted frame.
        let (start_after, gap_from_seq) = if after_seq + 1 < self.min_available_seq {
            (self.min_available_seq - 1, Some(self.min_available_seq))
        } else {
            (after_seq, None)
        };

        let mut frames = Vec::new();
        let mut bytes = 0usize;
        let mut truncated = false;
        for frame in self.frames.iter().filter(|f| f.seq > start_after) {
            let len = frame.payload_len();
            if !frames.is_empty() && bytes + len > max_bytes {
                truncated = true;
                break;
            }
            bytes += len;
            frames.push(frame.clone());
        }

        let last_delivered = frames.last().map(|f| f.seq).unwrap_or(start_after);
        let complete = self.completed && !truncated && last_delivered + 1 >= self.next_seq;

        PollResult {
            frames,
            complete,
            gap_from_seq,
        }
    }

    /// Seq of the oldest retained frame.
    pub fn min_available_seq(&self) -> u64 {
        self.min_available_seq
    }

    /// Largest seq assigned so far (0 before the first frame).
    pub fn max_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Whether the terminal (or shutdown) frame has landed.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Retained Data payload bytes.
    pub fn buffered_bytes(&self) -> usize {
        self.data_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(n: usize) -> Vec<u8> {
        vec![b'x'; n]
    }

    #[test]
    fn test_seq_starts_at_one_and_increases() {
        let mut ring = RingBuffer::new(1024);
        assert_eq!(ring.push_data(StreamKind::Stdout, b"a".to_vec()), Some(1));
        assert_eq!(ring.push_data(StreamKind::Stderr, b"b".to_vec()), Some(2));
        assert_eq!(ring.push_exit(0, ExecUsage::default()), Some(3));
        assert_eq!(ring.max_seq(), 3);
    }

    #[test]
    fn test_no_frames_after_terminal() {
        let mut ring = RingBuffer::new(1024);
        ring.push_data(StreamKind::Stdout, b"a".to_vec());
        ring.push_exit(0, ExecUsage::default());
        assert_eq!(ring.push_data(StreamKind::Stdout, b"late".to_vec()), None);
        assert_eq!(ring.push_exit(1, ExecUsage::default()), None);
        assert_eq!(ring.push_shutdown(), None);
        assert_eq!(ring.max_seq(), 2);
    }

    #[test]
    fn test_terminal_frame_has_largest_seq() {
        let mut ring = RingBuffer::new(1024);
        ring.push_data(StreamKind::Stdout, b"hello".to_vec());
        ring.push_data(StreamKind::Stderr, b"world".to_vec());
        let exit_seq = ring.push_exit(0, ExecUsage::default()).unwrap();
        assert_eq!(exit_seq, ring.max_seq());

        let result = ring.poll(0, usize::MAX);
        assert!(result.frames.last().unwrap().is_control());
    }

    #[test]
    fn test_poll_returns_strictly_after_cursor() {
        let mut ring = RingBuffer::new(1024);
        for i in 0..5 {
            ring.push_data(StreamKind::Stdout, vec![i]);
        }
        let result = ring.poll(2, usize::MAX);
        let seqs: Vec<u64> = result.frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert!(result.gap_from_seq.is_none());
        assert!(!result.complete);
    }

    #[test]
    fn test_poll_at_max_seq_is_empty() {
        let mut ring = RingBuffer::new(1024);
        ring.push_data(StreamKind::Stdout, b"a".to_vec());
        let running = ring.poll(ring.max_seq(), usize::MAX);
        assert!(running.frames.is_empty());
        assert!(!running.complete);

        ring.push_exit(0, ExecUsage::default());
        let done = ring.poll(ring.max_seq(), usize::MAX);
        assert!(done.frames.is_empty());
        assert!(done.complete);
    }

    #[test]
    fn test_eviction_just_over_budget() {
        // Budget 10: two 5-byte frames fill it exactly.
        let mut ring = RingBuffer::new(10);
        ring.push_data(StreamKind::Stdout, data(5));
        ring.push_data(StreamKind::Stdout, data(5));
        assert_eq!(ring.min_available_seq(), 1);
        assert_eq!(ring.buffered_bytes(), 10);

        // One more byte evicts the oldest whole frame.
        ring.push_data(StreamKind::Stdout, data(1));
        assert_eq!(ring.min_available_seq(), 2);
        assert_eq!(ring.buffered_bytes(), 6);
    }

    #[test]
    fn test_gap_marker_after_eviction() {
        let mut ring = RingBuffer::new(10);
        for _ in 0..4 {
            ring.push_data(StreamKind::Stdout, data(5));
        }
        // Frames 1 and 2 are gone; 3 and 4 remain.
        assert_eq!(ring.min_available_seq(), 3);

        let result = ring.poll(0, usize::MAX);
        assert_eq!(result.gap_from_seq, Some(3));
        assert_eq!(result.frames.first().unwrap().seq, 3);

        // Cursor exactly at min_available_seq - 1 is not a gap.
        let result = ring.poll(2, usize::MAX);
        assert!(result.gap_from_seq.is_none());
        assert_eq!(result.frames.first().unwrap().seq, 3);
    }

    #[test]
    fn test_oversized_frame_retained() {
        let mut ring = RingBuffer::new(10);
        ring.push_data(StreamKind::Stdout, data(5));
        ring.push_data(StreamKind::Stdout, data(64));
        assert_eq!(ring.buffered_bytes(), 64);
        let result = ring.poll(1, usize::MAX);
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0].seq, 2);
    }

    #[test]
    fn test_response_byte_cap() {
        let mut ring = RingBuffer::new(1024);
        for _ in 0..4 {
            ring.push_data(StreamKind::Stdout, data(10));
        }
        ring.push_exit(0, ExecUsage::default());

        // Cap of 25 bytes returns two 10-byte frames and is not complete.
        let page1 = ring.poll(0, 25);
        assert_eq!(page1.frames.len(), 2);
        assert!(!page1.complete);

        // Next page picks up where the first ended and reaches the exit.
        let last = page1.frames.last().unwrap().seq;
        let page2 = ring.poll(last, 25);
        assert_eq!(page2.frames.len(), 3); // two data + control
        assert!(page2.complete);
    }

    #[test]
    fn test_terminal_frame_never_evicted() {
        let mut ring = RingBuffer::new(10);
        ring.push_data(StreamKind::Stdout, data(5));
        ring.push_exit(7, ExecUsage::default());
        // Pressure after completion is dropped, not evicting the exit frame.
        ring.push_data(StreamKind::Stdout, data(100));
        let result = ring.poll(0, usize::MAX);
        assert!(matches!(
            result.frames.last().unwrap().body,
            FrameBody::Exit { exit_code: 7, .. }
        ));
    }

    #[test]
    fn test_shutdown_frame_seals_stream() {
        let mut ring = RingBuffer::new(1024);
        ring.push_data(StreamKind::Stdout, b"partial".to_vec());
        ring.push_shutdown().unwrap();
        assert!(ring.is_completed());
        let result = ring.poll(0, usize::MAX);
        assert!(matches!(
            result.frames.last().unwrap().body,
            FrameBody::Shutdown
        ));
        assert!(result.complete);
    }
}
