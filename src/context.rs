//! Shared daemon context.
//!
//! One [`DaemonContext`] is built at startup and cloned into every task.
//! It carries the shutdown token, read-only relay status, the handle for
//! sending commands to the relay, and the live configuration. Nothing here
//! is global, so tests build as many independent contexts as they need.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::relay::session::SessionStats;
use crate::relay::RelayHandle;

/// Relay state published for the control plane. Written only by the relay.
#[derive(Debug, Default)]
pub struct RelayStatus {
    paused: AtomicBool,
    connected: AtomicBool,
    buffered: AtomicUsize,
    /// Traffic counters.
    pub stats: SessionStats,
    session: Mutex<Option<SessionInfo>>,
    last_error: Mutex<Option<String>>,
}

/// Description of the live session for `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Controller endpoint.
    pub endpoint: String,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

impl RelayStatus {
    /// Whether the relay is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Whether a controller session is live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Frames waiting in the outbound buffer.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Live session, if any.
    pub fn session(&self) -> Option<SessionInfo> {
        self.session.lock().expect("RelayStatus mutex poisoned").clone()
    }

    /// Code of the last connect failure, cleared on connect.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("RelayStatus mutex poisoned").clone()
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn set_buffered(&self, len: usize) {
        self.buffered.store(len, Ordering::Relaxed);
    }

    pub(crate) fn set_session(&self, session: Option<SessionInfo>) {
        self.connected.store(session.is_some(), Ordering::Release);
        *self.session.lock().expect("RelayStatus mutex poisoned") = session;
    }

    pub(crate) fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().expect("RelayStatus mutex poisoned") = error;
    }
}

/// Everything a daemon task needs, passed explicitly at spawn time.
#[derive(Debug, Clone)]
pub struct DaemonContext {
    /// Cancelled once to stop every task.
    pub shutdown: CancellationToken,
    /// Relay state (read-only outside the relay).
    pub status: Arc<RelayStatus>,
    /// Command channel into the relay.
    pub relay: RelayHandle,
    /// Configuration currently in effect.
    pub config: Arc<RwLock<Config>>,
    /// Directory the daemon was started against.
    pub config_dir: PathBuf,
    /// Name of the virtual MIDI port, when one is open.
    pub midi_port: Option<String>,
}

impl DaemonContext {
    /// Build a context around an existing relay handle.
    pub fn new(config: Config, config_dir: PathBuf, relay: RelayHandle) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            status: Arc::new(RelayStatus::default()),
            relay,
            config: Arc::new(RwLock::new(config)),
            config_dir,
            midi_port: None,
        }
    }

    /// Copy of the configuration in effect.
    pub fn config_snapshot(&self) -> Config {
        self.config.read().expect("config lock poisoned").clone()
    }
}
