//! Loopback TCP server for the control plane.
//!
//! Binds `127.0.0.1:<control_port>` and serves each accepted connection on
//! its own task. Requests are handled in arrival order per connection;
//! a `pause` request holds its connection until the relay confirms the
//! device is closed.
//!
//! Binding requires an [`InstanceLock`] reference, so the listener can
//! only come up after the lock is held.

use std::net::{Ipv4Addr, SocketAddr};

use futures_util::StreamExt;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::protocol::{ControlCommand, ControlRequest, ControlResponse, ErrorCode};
use crate::config::Config;
use crate::context::DaemonContext;
use crate::error::BridgeError;
use crate::lock::InstanceLock;
use crate::relay::{PauseOutcome, ResumeOutcome};

/// Longest accepted request line.
const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Running control-plane listener.
#[derive(Debug)]
pub struct ControlServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

impl ControlServer {
    /// Bind the listener and start accepting.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ControlBindFailed`] if the port cannot be bound. The
    /// daemon treats this as fatal.
    pub async fn bind(port: u16, _lock: &InstanceLock, ctx: DaemonContext) -> Result<Self, BridgeError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::ControlBindFailed { addr, source })?;
        let local_addr = listener.local_addr()?;
        log::info!("[Control] Listening on {local_addr}");

        let accept_handle = tokio::spawn(Self::accept_loop(listener, ctx));
        Ok(Self {
            local_addr,
            accept_handle,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections.
    pub fn shutdown(self) {
        self.accept_handle.abort();
    }

    async fn accept_loop(listener: TcpListener, ctx: DaemonContext) {
        loop {
            tokio::select! {
                () = ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("[Control] Client connected: {peer}");
                        tokio::spawn(serve_connection(stream, ctx.clone()));
                    }
                    Err(e) => {
                        log::error!("[Control] Accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
        log::debug!("[Control] Accept loop stopped");
    }
}

async fn serve_connection(stream: TcpStream, ctx: DaemonContext) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_REQUEST_LINE));

    loop {
        let next = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            next = lines.next() => next,
        };
        let response = match next {
            None => break,
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => handle_line(&ctx, &line).await,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                (ControlResponse::error(ErrorCode::BadRequest), false)
            }
            Some(Err(LinesCodecError::Io(e))) => {
                log::debug!("[Control] Read error: {e}");
                break;
            }
        };

        let (response, shutdown_after) = response;
        let mut out = response.to_line();
        out.push('\n');
        if let Err(e) = write_half.write_all(out.as_bytes()).await {
            log::debug!("[Control] Write error: {e}");
            break;
        }
        if shutdown_after {
            log::info!("[Control] Shutdown requested");
            ctx.shutdown.cancel();
            break;
        }
    }
}

/// Handle one request line. The flag asks the caller to shut down after
/// the response is written.
pub async fn handle_line(ctx: &DaemonContext, line: &str) -> (ControlResponse, bool) {
    match ControlRequest::parse_line(line) {
        Ok((_, command)) => {
            log::debug!("[Control] {}", command.as_str());
            let response = dispatch(ctx, command).await;
            (response, command == ControlCommand::Shutdown)
        }
        Err(code) => (ControlResponse::error(code), false),
    }
}

/// Execute one command.
pub async fn dispatch(ctx: &DaemonContext, command: ControlCommand) -> ControlResponse {
    match command {
        ControlCommand::Ping => ControlResponse::with_payload(json!({ "pong": true })),
        ControlCommand::Info => ControlResponse::with_payload(info_payload(ctx)),
        ControlCommand::Status => ControlResponse::with_payload(status_payload(ctx)),
        ControlCommand::Pause => match ctx.relay.pause().await {
            Ok(PauseOutcome::Paused | PauseOutcome::AlreadyPaused) => ControlResponse::ok(),
            Ok(PauseOutcome::CloseTimeout) => ControlResponse::error(ErrorCode::CloseTimeout),
            Err(_) => ControlResponse::error(ErrorCode::RelayUnavailable),
        },
        ControlCommand::Resume => match ctx.relay.resume().await {
            Ok(ResumeOutcome::Resumed | ResumeOutcome::AlreadyRunning) => ControlResponse::ok(),
            Err(_) => ControlResponse::error(ErrorCode::RelayUnavailable),
        },
        ControlCommand::Reload => reload(ctx).await,
        ControlCommand::Shutdown => ControlResponse::ok(),
    }
}

fn info_payload(ctx: &DaemonContext) -> serde_json::Value {
    let config = ctx.config_snapshot();
    json!({
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "config_path": Config::file_path(&ctx.config_dir),
        "mode": config.bridge.mode,
        "controller": config.bridge.controller,
        "ports": {
            "controller": config.bridge.controller_port,
            "controller_dest": config.bridge.controller_dest_port,
            "host": config.bridge.host_port,
            "host_dest": config.bridge.host_dest_port,
            "control": config.bridge.control_port,
            "log": config.bridge.log_port,
        },
        "midi_port": ctx.midi_port,
    })
}

fn status_payload(ctx: &DaemonContext) -> serde_json::Value {
    let status = &ctx.status;
    let session = status.session().map(|s| {
        let uptime = (chrono::Utc::now() - s.started_at).num_seconds().max(0);
        json!({
            "endpoint": s.endpoint,
            "started_at": s.started_at,
            "uptime_secs": uptime,
        })
    });
    json!({
        "paused": status.is_paused(),
        "connected": status.is_connected(),
        "session": session,
        "buffered": status.buffered(),
        "last_error": status.last_error(),
        "stats": status.stats.snapshot(),
    })
}

async fn reload(ctx: &DaemonContext) -> ControlResponse {
    let next = match Config::reload_from_dir(&ctx.config_dir) {
        Ok(next) => next,
        Err(e) => {
            log::warn!("[Control] Reload failed: {e}");
            return ControlResponse::error_with_message(ErrorCode::ReloadFailed, e.to_string());
        }
    };

    let restart_required = {
        let mut current = ctx.config.write().expect("config lock poisoned");
        let restart_required = current.restart_required(&next);
        current.reconnect = next.reconnect.clone();
        current.timeouts = next.timeouts.clone();
        restart_required
    };
    if ctx.relay.reconfigure(&next).await.is_err() {
        return ControlResponse::error(ErrorCode::RelayUnavailable);
    }
    if restart_required {
        log::warn!("[Control] Reloaded; [bridge]/[midi] changes need a restart");
    } else {
        log::info!("[Control] Reloaded configuration");
    }
    ControlResponse::with_payload(json!({ "restart_required": restart_required }))
}
