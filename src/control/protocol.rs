//! Control-plane wire format.
//!
//! Newline-delimited JSON over loopback TCP. One request line yields one
//! response line:
//!
//! ```text
//! → {"schema":1,"cmd":"pause"}
//! ← {"schema":1,"ok":true}
//! ← {"schema":1,"ok":false,"error":"close_timeout"}
//! ```
//!
//! A request without `schema` is read as schema 1. Any other schema value
//! is rejected with `unsupported_schema`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::CONTROL_SCHEMA_VERSION;

/// Commands understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    /// Liveness check.
    Ping,
    /// Process id, version, config path, ports.
    Info,
    /// Paused/connected flags and session statistics.
    Status,
    /// Release the controller device.
    Pause,
    /// Reacquire the controller device.
    Resume,
    /// Re-read the configuration file.
    Reload,
    /// Graceful exit.
    Shutdown,
}

impl ControlCommand {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Info => "info",
            Self::Status => "status",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Reload => "reload",
            Self::Shutdown => "shutdown",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "ping" => Self::Ping,
            "info" => Self::Info,
            "status" => Self::Status,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "reload" => Self::Reload,
            "shutdown" => Self::Shutdown,
            _ => return None,
        })
    }
}

/// Stable error codes carried in failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Not JSON, or no `cmd`.
    BadRequest,
    /// `schema` is not 1.
    UnsupportedSchema,
    /// `cmd` names no known command.
    UnknownCommand,
    /// The relay task is gone.
    RelayUnavailable,
    /// The device did not close within the pause timeout.
    CloseTimeout,
    /// The configuration file could not be read or parsed.
    ReloadFailed,
    /// Client side: no daemon answered on the control port.
    Unreachable,
    /// Client side: the daemon did not reply in time.
    Timeout,
    /// Client side: the reply was not a response line.
    Protocol,
}

/// A request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Protocol version; defaults to 1 when absent.
    #[serde(default = "default_schema")]
    pub schema: u32,
    /// Command name.
    pub cmd: String,
    /// Optional command parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn default_schema() -> u32 {
    CONTROL_SCHEMA_VERSION
}

impl ControlRequest {
    /// Request for `command` at the current schema.
    pub fn new(command: ControlCommand) -> Self {
        Self {
            schema: CONTROL_SCHEMA_VERSION,
            cmd: command.as_str().to_string(),
            params: None,
        }
    }

    /// Parse and validate one request line.
    pub fn parse_line(line: &str) -> Result<(Self, ControlCommand), ErrorCode> {
        let request: Self = serde_json::from_str(line).map_err(|_| ErrorCode::BadRequest)?;
        if request.schema != CONTROL_SCHEMA_VERSION {
            return Err(ErrorCode::UnsupportedSchema);
        }
        let command = ControlCommand::parse(&request.cmd).ok_or(ErrorCode::UnknownCommand)?;
        Ok((request, command))
    }
}

/// A response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Protocol version.
    pub schema: u32,
    /// Whether the command succeeded.
    pub ok: bool,
    /// Command-specific result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error code when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    /// Human-readable detail for errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlResponse {
    /// Success without payload.
    pub fn ok() -> Self {
        Self {
            schema: CONTROL_SCHEMA_VERSION,
            ok: true,
            payload: None,
            error: None,
            message: None,
        }
    }

    /// Success with payload.
    pub fn with_payload(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::ok()
        }
    }

    /// Failure with a stable code.
    pub fn error(code: ErrorCode) -> Self {
        Self {
            ok: false,
            error: Some(code),
            ..Self::ok()
        }
    }

    /// Failure with a code and detail.
    pub fn error_with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::error(code)
        }
    }

    /// Serialize as one line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!(r#"{{"schema":{CONTROL_SCHEMA_VERSION},"ok":false,"error":"bad_request"}}"#))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_wire_shapes() {
        assert_eq!(ControlResponse::ok().to_line(), r#"{"schema":1,"ok":true}"#);
        assert_eq!(
            ControlResponse::error(ErrorCode::CloseTimeout).to_line(),
            r#"{"schema":1,"ok":false,"error":"close_timeout"}"#
        );
        assert_eq!(
            serde_json::to_string(&ControlRequest::new(ControlCommand::Pause)).unwrap(),
            r#"{"schema":1,"cmd":"pause"}"#
        );
    }

    #[test]
    fn test_parse_line_validation() {
        let (_, cmd) = ControlRequest::parse_line(r#"{"schema":1,"cmd":"status"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Status);

        let (req, cmd) = ControlRequest::parse_line(r#"{"cmd":"ping"}"#).unwrap();
        assert_eq!(req.schema, 1);
        assert_eq!(cmd, ControlCommand::Ping);

        assert_eq!(
            ControlRequest::parse_line(r#"{"schema":2,"cmd":"ping"}"#).unwrap_err(),
            ErrorCode::UnsupportedSchema
        );
        assert_eq!(
            ControlRequest::parse_line(r#"{"schema":1,"cmd":"reboot"}"#).unwrap_err(),
            ErrorCode::UnknownCommand
        );
        assert_eq!(
            ControlRequest::parse_line("pause").unwrap_err(),
            ErrorCode::BadRequest
        );
        assert_eq!(
            ControlRequest::parse_line(r#"{"schema":1}"#).unwrap_err(),
            ErrorCode::BadRequest
        );
    }

    #[test]
    fn test_command_names_roundtrip() {
        for cmd in [
            ControlCommand::Ping,
            ControlCommand::Info,
            ControlCommand::Status,
            ControlCommand::Pause,
            ControlCommand::Resume,
            ControlCommand::Reload,
            ControlCommand::Shutdown,
        ] {
            assert_eq!(ControlCommand::parse(cmd.as_str()), Some(cmd));
        }
    }
}
