//! Fire-and-forget log fan-out over loopback UDP.
//!
//! The daemon sends every [`LogEntry`] as one JSON datagram to a fixed
//! loopback address. Nobody has to listen: send errors are swallowed and
//! the daemon never waits on a monitor.
//!
//! ```text
//! log::info!(..) ──► TeeLogger ──► env_logger (stderr / file)
//!                        │
//!                        └──► LogBroadcaster ──mpsc──► BroadcastPump ──UDP──► monitors
//! ```
//!
//! Monitors bind the broadcast address with [`LogMonitor::attach`]. A
//! monitor that cannot bind (another monitor holds the port) reports
//! [`MonitorAttach::Unavailable`] and keeps working on the control plane.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::constants::MAX_DATAGRAM_SIZE;

/// Origin of a log entry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    /// Daemon lifecycle and diagnostics.
    System,
    /// Traffic or text received from the controller.
    ControllerIn,
    /// Traffic sent to the controller.
    ControllerOut,
    /// Failures.
    Error,
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::ControllerIn => write!(f, "controller-in"),
            Self::ControllerOut => write!(f, "controller-out"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One structured log entry. Immutable once built.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Entry origin.
    pub kind: LogKind,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Human-readable text.
    pub message: String,
}

impl LogEntry {
    /// Build an entry stamped with the current time.
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// Short hex preview of a frame for traffic entries.
pub fn frame_summary(frame: &[u8]) -> String {
    const PREVIEW: usize = 16;
    let hex: Vec<String> = frame.iter().take(PREVIEW).map(|b| format!("{b:02X}")).collect();
    let ellipsis = if frame.len() > PREVIEW { " …" } else { "" };
    format!("{} bytes: {}{}", frame.len(), hex.join(" "), ellipsis)
}

/// Cheap, cloneable handle for emitting entries.
#[derive(Debug, Clone)]
pub struct LogBroadcaster {
    tx: UnboundedSender<LogEntry>,
}

impl LogBroadcaster {
    /// Create a broadcaster and the pump that delivers its datagrams.
    ///
    /// Entries emitted before the pump runs are queued.
    pub fn channel(target: SocketAddr) -> (Self, BroadcastPump) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, BroadcastPump { target, rx })
    }

    /// A broadcaster whose entries go nowhere.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Queue an entry. Never blocks, never fails.
    pub fn emit(&self, entry: LogEntry) {
        let _ = self.tx.send(entry);
    }

    /// Shorthand for a `system` entry.
    pub fn system(&self, message: impl Into<String>) {
        self.emit(LogEntry::new(LogKind::System, message));
    }
}

/// Task half of the broadcaster: owns the sending socket.
#[derive(Debug)]
pub struct BroadcastPump {
    target: SocketAddr,
    rx: UnboundedReceiver<LogEntry>,
}

impl BroadcastPump {
    /// Deliver entries until shutdown or until every broadcaster is dropped.
    ///
    /// Must not log: records would loop back into this pump.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let bind: SocketAddr = if self.target.is_ipv6() {
            (std::net::Ipv6Addr::LOCALHOST, 0).into()
        } else {
            (std::net::Ipv4Addr::LOCALHOST, 0).into()
        };
        let Ok(socket) = UdpSocket::bind(bind).await else {
            return;
        };

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                entry = self.rx.recv() => {
                    let Some(entry) = entry else { break };
                    if let Ok(bytes) = serde_json::to_vec(&entry) {
                        let _ = socket.send_to(&bytes, self.target).await;
                    }
                }
            }
        }
    }
}

/// Result of trying to attach a monitor.
#[derive(Debug)]
pub enum MonitorAttach {
    /// Receiving socket bound.
    Attached(LogMonitor),
    /// Could not bind; logs are unavailable for this monitor.
    Unavailable(String),
}

/// Receiver side used by `midibridge monitor`.
#[derive(Debug)]
pub struct LogMonitor {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl LogMonitor {
    /// Bind the broadcast address, degrading instead of failing.
    pub async fn attach(addr: SocketAddr) -> MonitorAttach {
        match UdpSocket::bind(addr).await {
            Ok(socket) => MonitorAttach::Attached(Self {
                socket,
                buf: vec![0u8; MAX_DATAGRAM_SIZE],
            }),
            Err(e) => MonitorAttach::Unavailable(format!("cannot bind {addr}: {e}")),
        }
    }

    /// Wait for the next entry. Datagrams that are not entries are skipped.
    pub async fn recv(&mut self) -> Result<LogEntry> {
        loop {
            let (n, _) = self
                .socket
                .recv_from(&mut self.buf)
                .await
                .context("log monitor receive failed")?;
            if let Ok(entry) = serde_json::from_slice(&self.buf[..n]) {
                return Ok(entry);
            }
        }
    }
}

/// `log::Log` implementation that tees records to env_logger and the broadcaster.
#[derive(Debug)]
pub struct TeeLogger {
    inner: env_logger::Logger,
    broadcaster: LogBroadcaster,
}

impl log::Log for TeeLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.inner.matches(record) {
            return;
        }
        self.inner.log(record);
        let kind = if record.level() == log::Level::Error {
            LogKind::Error
        } else {
            LogKind::System
        };
        self.broadcaster
            .emit(LogEntry::new(kind, record.args().to_string()));
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install `builder` as the global logger, tee'd to `broadcaster`.
pub fn init_tee_logger(mut builder: env_logger::Builder, broadcaster: LogBroadcaster) -> Result<()> {
    let inner = builder.build();
    let max_level = inner.filter();
    log::set_boxed_logger(Box::new(TeeLogger { inner, broadcaster }))
        .context("logger already initialized")?;
    log::set_max_level(max_level);
    Ok(())
}
