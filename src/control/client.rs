//! Client side of the control plane, used by `midibridge ctl` and by a
//! replacing instance asking the old one to exit.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{ControlCommand, ControlRequest, ControlResponse, ErrorCode};
use crate::config::TimeoutConfig;
use crate::constants::{CONTROL_CLIENT_TIMEOUT, CONTROL_PAUSE_MARGIN};

/// `ctl` exit code on `ok: true`.
pub const EXIT_CTL_OK: i32 = 0;
/// `ctl` exit code when the daemon answered with `ok: false`.
pub const EXIT_CTL_FAILED: i32 = 1;
/// `ctl` exit code when no usable answer came back.
pub const EXIT_CTL_UNREACHABLE: i32 = 2;

/// Failure to get a response from the daemon.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Nothing is listening, or the connection broke.
    #[error("daemon unreachable at {addr}: {source}")]
    Unreachable {
        /// Control address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No response within the client timeout.
    #[error("daemon at {addr} did not respond within {timeout:?}")]
    Timeout {
        /// Control address.
        addr: SocketAddr,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The reply was not a valid response line.
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Stable code for the JSON body `ctl` prints.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unreachable { .. } => ErrorCode::Unreachable,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Protocol(_) => ErrorCode::Protocol,
        }
    }

    /// Failed response carrying this error's code and text.
    pub fn to_response(&self) -> ControlResponse {
        ControlResponse::error_with_message(self.code(), self.to_string())
    }
}

/// Client timeout for `command`.
///
/// `pause` may legitimately take as long as the configured close timeout,
/// so it gets that plus [`CONTROL_PAUSE_MARGIN`].
pub fn timeout_for(command: ControlCommand, timeouts: &TimeoutConfig) -> Duration {
    match command {
        ControlCommand::Pause => CONTROL_CLIENT_TIMEOUT
            .max(timeouts.pause_close().saturating_add(CONTROL_PAUSE_MARGIN)),
        _ => CONTROL_CLIENT_TIMEOUT,
    }
}

/// One `ctl` round trip: the line to print and the exit code.
///
/// Every outcome, including an unreachable daemon, yields a response in
/// the control-plane shape.
pub async fn run_ctl(port: u16, command: ControlCommand, timeout: Duration) -> (ControlResponse, i32) {
    match send_command_with_timeout(port, command, timeout).await {
        Ok(response) if response.ok => (response, EXIT_CTL_OK),
        Ok(response) => (response, EXIT_CTL_FAILED),
        Err(e) => {
            log::debug!("[Ctl] {command:?} failed: {e}");
            (e.to_response(), EXIT_CTL_UNREACHABLE)
        }
    }
}

/// Send one command to the daemon on `port` and wait for its response.
pub async fn send_command(port: u16, command: ControlCommand) -> Result<ControlResponse, ClientError> {
    send_command_with_timeout(port, command, CONTROL_CLIENT_TIMEOUT).await
}

/// [`send_command`] with an explicit timeout covering connect and reply.
pub async fn send_command_with_timeout(
    port: u16,
    command: ControlCommand,
    timeout: Duration,
) -> Result<ControlResponse, ClientError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    tokio::time::timeout(timeout, exchange(addr, command))
        .await
        .map_err(|_| ClientError::Timeout { addr, timeout })?
}

async fn exchange(addr: SocketAddr, command: ControlCommand) -> Result<ControlResponse, ClientError> {
    let unreachable = |source| ClientError::Unreachable { addr, source };

    let stream = TcpStream::connect(addr).await.map_err(unreachable)?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_string(&ControlRequest::new(command))
        .map_err(|e| ClientError::Protocol(e.to_string()))?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await.map_err(unreachable)?;

    let mut reply = String::new();
    let read = BufReader::new(read_half)
        .read_line(&mut reply)
        .await
        .map_err(unreachable)?;
    if read == 0 {
        return Err(ClientError::Protocol("connection closed before reply".into()));
    }
    serde_json::from_str(reply.trim_end()).map_err(|e| ClientError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_no_daemon_is_unreachable() {
        // Bind then drop to find a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = send_command(port, ControlCommand::Ping).await.unwrap_err();
        assert!(matches!(err, ClientError::Unreachable { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_silent_daemon_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = send_command_with_timeout(port, ControlCommand::Ping, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_garbage_reply_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            stream.write_all(b"hello\n").await.unwrap();
        });

        let err = send_command(port, ControlCommand::Status).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_ctl_without_daemon_prints_json_error() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (response, code) = run_ctl(port, ControlCommand::Status, CONTROL_CLIENT_TIMEOUT).await;
        assert_eq!(code, EXIT_CTL_UNREACHABLE);

        let json: serde_json::Value = serde_json::from_str(&response.to_line()).unwrap();
        assert_eq!(json["schema"], 1);
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "unreachable");
        assert!(json["message"].as_str().unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_ctl_maps_daemon_failure_to_exit_one() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            let line = ControlResponse::error(ErrorCode::CloseTimeout).to_line();
            stream.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        });

        let (response, code) = run_ctl(port, ControlCommand::Pause, CONTROL_CLIENT_TIMEOUT).await;
        assert_eq!(code, EXIT_CTL_FAILED);
        assert_eq!(response.error, Some(ErrorCode::CloseTimeout));
    }

    #[test]
    fn test_pause_timeout_covers_configured_close() {
        let mut timeouts = TimeoutConfig::default();
        assert_eq!(timeout_for(ControlCommand::Pause, &timeouts), CONTROL_CLIENT_TIMEOUT);

        timeouts.pause_close_ms = 30_000;
        assert_eq!(
            timeout_for(ControlCommand::Pause, &timeouts),
            Duration::from_secs(30) + CONTROL_PAUSE_MARGIN
        );
        assert_eq!(timeout_for(ControlCommand::Status, &timeouts), CONTROL_CLIENT_TIMEOUT);

        timeouts.pause_close_ms = u64::MAX;
        assert!(timeout_for(ControlCommand::Pause, &timeouts) > Duration::from_secs(30));
    }
}
