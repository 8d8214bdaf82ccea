//! Fixed-capacity frame queue for traffic headed to an absent controller.
//!
//! When the queue is full, pushing a new frame evicts the oldest one.
//! Memory usage is bounded at `capacity` frames regardless of how long the
//! outage lasts. Every eviction logs exactly one warning.
//!
//! # Usage in the relay
//!
//! Host datagrams that arrive while the controller is disconnected (or not
//! ready) are pushed here. On reconnect the relay drains the queue in
//! submission order before forwarding new traffic.

use std::collections::VecDeque;

/// Fixed-capacity FIFO of frames.
#[derive(Debug)]
pub struct OutboundBuffer {
    frames: VecDeque<Vec<u8>>,
    capacity: usize,
    dropped_total: u64,
}

impl OutboundBuffer {
    /// Create a new buffer holding at most `capacity` frames.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped_total: 0,
        }
    }

    /// Append `frame`, evicting the oldest frame if the buffer is full.
    ///
    /// Returns the evicted frame, if any.
    pub fn push(&mut self, frame: Vec<u8>) -> Option<Vec<u8>> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            self.dropped_total += 1;
            log::warn!(
                "[Relay] Outbound buffer full ({} frames), dropped oldest frame ({} bytes)",
                self.capacity,
                old.len()
            );
        }
        self.frames.push_back(frame);
        evicted
    }

    /// Remove and return all frames, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.frames.drain(..).collect()
    }

    /// Put a frame back at the front (a flush that failed midway).
    pub fn requeue_front(&mut self, frames: Vec<Vec<u8>>) {
        for frame in frames.into_iter().rev() {
            if self.frames.len() >= self.capacity {
                // Newer frames win; the requeued one is the oldest.
                self.dropped_total += 1;
                log::warn!("[Relay] Outbound buffer full, dropped requeued frame");
                continue;
            }
            self.frames.push_front(frame);
        }
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if no frames are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Configured capacity in frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted since creation.
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Change the capacity, evicting the oldest frames if it shrinks.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
            self.dropped_total += 1;
            log::warn!("[Relay] Outbound buffer shrunk, dropped oldest frame");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
