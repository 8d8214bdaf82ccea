//! midibridge - MIDI controller relay daemon.
//!
//! Bridges a hardware or simulated controller to host software over
//! serial, UDP or WebSocket, and exposes a local control plane so other
//! tools can take the controller's port without stopping the daemon.
//!
//! # Architecture
//!
//! - **Relay** - owns the controller transport and host socket, runs the
//!   reconnect state machine
//! - **Control** - loopback JSON-lines server; talks to the relay only
//!   through pause/resume/reconfigure messages
//! - **Broadcast** - fire-and-forget log datagrams for `midibridge monitor`
//! - **Midi** - optional virtual MIDI port fed from controller traffic
//!
//! # Modules
//!
//! - [`codec`] - COBS framing for byte-stream links
//! - [`transport`] - controller and host links
//! - [`daemon`] - startup and shutdown ordering
//! - [`config`] - configuration loading

// Library modules
pub mod broadcast;
pub mod codec;
pub mod control;
pub mod daemon;
pub mod midi;
pub mod relay;
pub mod transport;

pub mod config;
pub mod constants;
pub mod context;
pub mod device;
pub mod error;
pub mod lock;
pub mod reconnect;

// Re-export commonly used types
pub use config::Config;
pub use context::DaemonContext;
pub use daemon::{DaemonOptions, RunningDaemon};
pub use error::BridgeError;
