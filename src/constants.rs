//! Application-wide constants for midibridge.
//!
//! Defaults here are the values used when the configuration file does not
//! override them. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Ports**: loopback endpoints for the relay, control plane and logs
//! - **Reconnect**: backoff and outbound buffering
//! - **Timeouts**: ownership hand-off and lock release windows
//! - **Framing**: codec limits

use std::time::Duration;

// ============================================================================
// Ports
// ============================================================================

/// Controller-side port (UDP bind port or WebSocket listen port).
pub const DEFAULT_CONTROLLER_PORT: u16 = 9100;

/// Destination port for UDP controllers.
pub const DEFAULT_CONTROLLER_DEST_PORT: u16 = 9101;

/// Port the bridge listens on for datagrams from the host software.
pub const DEFAULT_HOST_PORT: u16 = 9000;

/// Port the host software listens on.
pub const DEFAULT_HOST_DEST_PORT: u16 = 9001;

/// Control-plane TCP port on 127.0.0.1.
pub const DEFAULT_CONTROL_PORT: u16 = 9200;

/// Log broadcast UDP port on 127.0.0.1.
pub const DEFAULT_LOG_PORT: u16 = 9201;

// ============================================================================
// Reconnect
// ============================================================================

/// Initial reconnect delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound for the reconnect delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Hard ceiling for any configured reconnect delay (one day).
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Outbound frames kept while the controller is away.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// How often the relay checks transport health.
pub const TRANSPORT_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Timeouts
// ============================================================================

/// How long `pause` may wait for the device handle to close.
pub const DEFAULT_PAUSE_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a replacing instance waits for the previous lock holder.
pub const DEFAULT_LOCK_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between lock acquisition attempts while waiting.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// `ctl` connect/read timeout.
pub const CONTROL_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack added on top of the pause-close timeout for `ctl pause`.
pub const CONTROL_PAUSE_MARGIN: Duration = Duration::from_secs(2);

/// Serial read timeout; bounds how long a stop request takes to be seen.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// Framing
// ============================================================================

/// Largest decoded frame accepted from a byte stream.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Largest datagram read from UDP sockets.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Control-plane JSON schema version.
pub const CONTROL_SCHEMA_VERSION: u32 = 1;
