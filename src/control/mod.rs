//! Local control plane.
//!
//! ```text
//! midibridge ctl pause ──TCP 127.0.0.1:9200──► ControlServer ──► RelayHandle
//!                       ◄── {"schema":1,"ok":true} ──┘
//! ```

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{run_ctl, send_command, timeout_for, ClientError};
pub use protocol::{ControlCommand, ControlRequest, ControlResponse, ErrorCode};
pub use server::ControlServer;
