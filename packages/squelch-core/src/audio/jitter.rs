//! Per-member jitter buffer.
//!
//! A short bounded FIFO that smooths variable network arrival times before
//! mixing. The transport is assumed in-order, so there is no timestamp
//! reordering. The bound is the sole backpressure: a push into a full
//! buffer drops the incoming frame (drop-newest), keeping the frames
//! already absorbed and bounding perceived latency.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::constants::{JITTER_CAPACITY, JITTER_FLOOR};

/// Bounded FIFO of inbound audio frames for one channel member.
#[derive(Debug, Default)]
pub struct JitterBuffer {
    frames: VecDeque<Bytes>,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::with_capacity(JITTER_CAPACITY),
        }
    }

    /// Appends a frame, or drops it when the buffer is full.
    ///
    /// Returns `false` when the frame was dropped.
    pub fn push(&mut self, frame: Bytes) -> bool {
        if self.frames.len() >= JITTER_CAPACITY {
            return false;
        }
        self.frames.push_back(frame);
        true
    }

    /// Removes and returns the oldest frame.
    pub fn pop(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// `true` once enough frames are buffered for the member to count as an
    /// active speaker (~40 ms of prefill).
    pub fn ready(&self) -> bool {
        self.frames.len() >= JITTER_FLOOR
    }
}
