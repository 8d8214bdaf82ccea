//! Live session bookkeeping.
//!
//! A [`Session`] exists while the controller link is up. Its counters live
//! in [`SessionStats`] atomics shared with the control plane, which only
//! ever reads them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One controller connection, from successful open to teardown.
#[derive(Debug, Clone)]
pub struct Session {
    /// Endpoint description at connect time.
    pub endpoint: String,
    /// Monotonic start.
    pub started: Instant,
    /// Wall-clock start, for `status`.
    pub started_at: DateTime<Utc>,
}

impl Session {
    /// Start a session on `endpoint` now.
    pub fn start(endpoint: String) -> Self {
        Self {
            endpoint,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

/// Per-direction counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_to_host: AtomicU64,
    bytes_to_host: AtomicU64,
    frames_to_controller: AtomicU64,
    bytes_to_controller: AtomicU64,
    dropped_outbound: AtomicU64,
    sessions: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames forwarded controller → host in the current session.
    pub frames_to_host: u64,
    /// Bytes forwarded controller → host in the current session.
    pub bytes_to_host: u64,
    /// Frames forwarded host → controller in the current session.
    pub frames_to_controller: u64,
    /// Bytes forwarded host → controller in the current session.
    pub bytes_to_controller: u64,
    /// Outbound frames evicted from the buffer since startup.
    pub dropped_outbound: u64,
    /// Sessions started since startup.
    pub sessions: u64,
}

impl SessionStats {
    /// Zero the per-session counters and count a new session.
    pub fn begin_session(&self) {
        self.frames_to_host.store(0, Ordering::Relaxed);
        self.bytes_to_host.store(0, Ordering::Relaxed);
        self.frames_to_controller.store(0, Ordering::Relaxed);
        self.bytes_to_controller.store(0, Ordering::Relaxed);
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// One frame reached the host.
    pub fn record_to_host(&self, len: usize) {
        self.frames_to_host.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_host.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// One frame reached the controller.
    pub fn record_to_controller(&self, len: usize) {
        self.frames_to_controller.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_controller.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// One outbound frame was evicted.
    pub fn record_dropped(&self) {
        self.dropped_outbound.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_to_host: self.frames_to_host.load(Ordering::Relaxed),
            bytes_to_host: self.bytes_to_host.load(Ordering::Relaxed),
            frames_to_controller: self.frames_to_controller.load(Ordering::Relaxed),
            bytes_to_controller: self.bytes_to_controller.load(Ordering::Relaxed),
            dropped_outbound: self.dropped_outbound.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_session_resets_traffic_but_not_totals() {
        let stats = SessionStats::default();
        stats.begin_session();
        stats.record_to_host(3);
        stats.record_to_controller(5);
        stats.record_dropped();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_to_host, 1);
        assert_eq!(snap.bytes_to_controller, 5);
        assert_eq!(snap.sessions, 1);

        stats.begin_session();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_to_host, 0);
        assert_eq!(snap.bytes_to_controller, 0);
        assert_eq!(snap.dropped_outbound, 1);
        assert_eq!(snap.sessions, 2);
    }
}
