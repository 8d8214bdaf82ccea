//! Error taxonomy for the bridge.
//!
//! Every variant carries a stable string [`code`](BridgeError::code) used in
//! control-plane responses and a stable process [`exit_code`](BridgeError::exit_code).
//! Lock and bind failures are the only startup-fatal conditions; they must
//! never share a code.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Exit code for a second instance that found the lock held.
pub const EXIT_LOCK_HELD: i32 = 3;
/// Exit code for a daemon that could not bind its control listener.
pub const EXIT_CONTROL_BIND: i32 = 4;
/// Exit code when a previous instance never released the lock.
pub const EXIT_LOCK_RELEASE_TIMEOUT: i32 = 5;

/// Errors surfaced by bridge components.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No serial port matched the configured descriptor.
    #[error("no device matching '{descriptor}' found")]
    DeviceNotFound {
        /// Descriptor name used for detection.
        descriptor: String,
    },

    /// More than one serial port matched; detection never guesses.
    #[error("{count} devices match '{descriptor}', refusing to pick one")]
    MultipleDevicesFound {
        /// Descriptor name used for detection.
        descriptor: String,
        /// Number of matching ports.
        count: usize,
    },

    /// The controller link went away (I/O error, unplug, explicit close).
    #[error("controller transport disconnected: {0}")]
    TransportDisconnected(String),

    /// The control-plane listener could not be bound.
    #[error("failed to bind control plane on {addr}: {source}")]
    ControlBindFailed {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying bind error.
        #[source]
        source: std::io::Error,
    },

    /// Another daemon already owns this configuration directory.
    #[error("another instance holds the lock at {}", path.display())]
    InstanceLockHeld {
        /// Lock file path.
        path: PathBuf,
    },

    /// A previous instance did not release the lock in time.
    #[error("lock at {} not released within {timeout:?}", path.display())]
    LockReleaseTimeout {
        /// Lock file path.
        path: PathBuf,
        /// How long we waited.
        timeout: Duration,
    },

    /// No usable virtual MIDI backend on this system.
    #[error("virtual MIDI backend unavailable: {0}")]
    MidiBackendUnavailable(String),

    /// The configuration file exists but could not be parsed.
    #[error("failed to parse {}: {message}", path.display())]
    ConfigParseError {
        /// File that failed to parse.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceNotFound { .. } => "device_not_found",
            Self::MultipleDevicesFound { .. } => "multiple_devices_found",
            Self::TransportDisconnected(_) => "transport_disconnected",
            Self::ControlBindFailed { .. } => "control_bind_failed",
            Self::InstanceLockHeld { .. } => "instance_lock_held",
            Self::LockReleaseTimeout { .. } => "lock_release_timeout",
            Self::MidiBackendUnavailable(_) => "midi_backend_unavailable",
            Self::ConfigParseError { .. } => "config_parse_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Process exit code when this error terminates the daemon.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InstanceLockHeld { .. } => EXIT_LOCK_HELD,
            Self::ControlBindFailed { .. } => EXIT_CONTROL_BIND,
            Self::LockReleaseTimeout { .. } => EXIT_LOCK_RELEASE_TIMEOUT,
            _ => 1,
        }
    }

    /// Whether the daemon keeps running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::ControlBindFailed { .. }
                | Self::InstanceLockHeld { .. }
                | Self::LockReleaseTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_bind_codes_are_distinct() {
        let lock = BridgeError::InstanceLockHeld { path: PathBuf::from("/tmp/x.lock") };
        let bind = BridgeError::ControlBindFailed {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_ne!(lock.code(), bind.code());
        assert_ne!(lock.exit_code(), bind.exit_code());
        assert_ne!(lock.exit_code(), 0);
        assert_ne!(bind.exit_code(), 0);
    }

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(BridgeError::DeviceNotFound { descriptor: "x".into() }.is_recoverable());
        assert!(BridgeError::MultipleDevicesFound { descriptor: "x".into(), count: 2 }.is_recoverable());
        assert!(BridgeError::TransportDisconnected("eof".into()).is_recoverable());
        assert!(BridgeError::MidiBackendUnavailable("none".into()).is_recoverable());
        assert!(!BridgeError::InstanceLockHeld { path: PathBuf::new() }.is_recoverable());
    }

    #[test]
    fn test_multiple_devices_message_includes_count() {
        let err = BridgeError::MultipleDevicesFound { descriptor: "pad".into(), count: 3 };
        assert!(err.to_string().contains('3'));
        assert_eq!(err.code(), "multiple_devices_found");
    }
}
