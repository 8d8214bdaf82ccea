//! Controller and host transports.
//!
//! The controller side is a closed set of link kinds behind one contract:
//!
//! ```text
//!                 ┌────────────────────────────┐
//!                 │    ControllerTransport     │
//!                 │  open / poll / send / close│
//!                 └─────┬─────────┬─────────┬──┘
//!                       │         │         │
//!                 Serial│      Udp│  WebSocket (server)
//!            (COBS + 0x00)  (1 datagram   (1 message
//!                            = 1 frame)    = 1 frame)
//! ```
//!
//! Every call site matches exhaustively, so adding a link kind is a
//! compile error everywhere it needs handling.
//!
//! Receive and ready callbacks must be installed before [`ControllerTransport::open`];
//! reader threads and tasks capture them when the link comes up.
//!
//! The host side ([`host::HostTransport`]) is always a UDP socket pair and
//! lives for the whole daemon run.

pub mod host;
pub mod serial;
pub mod udp;
pub mod ws;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::broadcast::LogBroadcaster;
use crate::codec::Framing;
use crate::config::{BridgeConfig, ControllerKind};
use crate::device::DeviceDescriptor;
use crate::error::BridgeError;

pub use host::HostTransport;
pub use serial::SerialTransport;
pub use udp::UdpTransport;
pub use ws::WsTransport;

/// Invoked with every frame received from the controller.
pub type ReceiveCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Invoked when a transport's readiness flips.
pub type ReadyCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// The controller link.
#[derive(Debug)]
pub enum ControllerTransport {
    /// USB CDC serial device.
    Serial(SerialTransport),
    /// UDP socket pair.
    Udp(UdpTransport),
    /// WebSocket server accepting simulator clients.
    WebSocket(WsTransport),
}

impl ControllerTransport {
    /// Build the transport selected by `[bridge]`.
    ///
    /// Nothing is opened yet.
    pub fn from_config(
        bridge: &BridgeConfig,
        descriptor: DeviceDescriptor,
        broadcaster: LogBroadcaster,
    ) -> Self {
        match bridge.controller {
            ControllerKind::Serial => Self::Serial(SerialTransport::new(descriptor, broadcaster)),
            ControllerKind::Udp => Self::Udp(UdpTransport::new(
                SocketAddr::from((Ipv4Addr::LOCALHOST, bridge.controller_port)),
                SocketAddr::from((Ipv4Addr::LOCALHOST, bridge.controller_dest_port)),
            )),
            ControllerKind::Ws => Self::WebSocket(WsTransport::new(
                SocketAddr::from((Ipv4Addr::LOCALHOST, bridge.controller_port)),
                broadcaster,
            )),
        }
    }

    /// Link kind.
    pub fn kind(&self) -> ControllerKind {
        match self {
            Self::Serial(_) => ControllerKind::Serial,
            Self::Udp(_) => ControllerKind::Udp,
            Self::WebSocket(_) => ControllerKind::Ws,
        }
    }

    /// Framing used on the wire.
    pub fn framing(&self) -> Framing {
        match self {
            Self::Serial(_) => Framing::Delimited,
            Self::Udp(_) | Self::WebSocket(_) => Framing::Implicit,
        }
    }

    /// Human-readable endpoint (`/dev/ttyACM0`, `udp 127.0.0.1:9100`, ...).
    pub fn describe(&self) -> String {
        match self {
            Self::Serial(t) => t.describe(),
            Self::Udp(t) => t.describe(),
            Self::WebSocket(t) => t.describe(),
        }
    }

    /// Acquire the underlying device or socket.
    pub async fn open(&mut self) -> Result<(), BridgeError> {
        match self {
            Self::Serial(t) => t.open().await,
            Self::Udp(t) => t.open().await,
            Self::WebSocket(t) => t.open().await,
        }
    }

    /// Non-blocking health check.
    ///
    /// Returns [`BridgeError::TransportDisconnected`] once the link died.
    pub fn poll(&self) -> Result<(), BridgeError> {
        match self {
            Self::Serial(t) => t.poll(),
            Self::Udp(t) => t.poll(),
            Self::WebSocket(t) => t.poll(),
        }
    }

    /// Send one frame, re-framed for the wire.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), BridgeError> {
        match self {
            Self::Serial(t) => t.send(frame),
            Self::Udp(t) => t.send(frame).await,
            Self::WebSocket(t) => t.send(frame),
        }
    }

    /// Install the frame callback.
    pub fn on_receive(&mut self, callback: ReceiveCallback) {
        match self {
            Self::Serial(t) => t.on_receive(callback),
            Self::Udp(t) => t.on_receive(callback),
            Self::WebSocket(t) => t.on_receive(callback),
        }
    }

    /// Whether frames can be delivered right now.
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Serial(_) | Self::Udp(_) => true,
            Self::WebSocket(t) => t.is_ready(),
        }
    }

    /// Install the readiness callback. Links that are always ready ignore it.
    pub fn on_ready_changed(&mut self, callback: ReadyCallback) {
        match self {
            Self::Serial(_) | Self::Udp(_) => {}
            Self::WebSocket(t) => t.on_ready_changed(callback),
        }
    }

    /// Release the underlying handle.
    ///
    /// Returns only after the device or socket is closed, so another
    /// process can open it immediately afterwards.
    pub async fn close(&mut self) {
        match self {
            Self::Serial(t) => t.close().await,
            Self::Udp(t) => t.close().await,
            Self::WebSocket(t) => t.close().await,
        }
    }

    /// Whether a handle is currently held.
    pub fn is_open(&self) -> bool {
        match self {
            Self::Serial(t) => t.is_open(),
            Self::Udp(t) => t.is_open(),
            Self::WebSocket(t) => t.is_open(),
        }
    }
}
