//! Daemon orchestration.
//!
//! Startup order is fixed:
//!
//! ```text
//! instance lock ─► MIDI port ─► control listener ─► log pump
//!               ─► host socket ─► controller transport + relay task
//! ```
//!
//! The lock comes first so a second instance fails before touching any
//! port. Lock and control-bind failures are the only fatal errors; MIDI
//! problems are logged and the relay runs without a MIDI tee.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::broadcast::{BroadcastPump, LogBroadcaster};
use crate::config::{Config, MidiConfig};
use crate::context::DaemonContext;
use crate::control::{self, ControlCommand, ControlServer};
use crate::device::{DeviceDescriptor, DeviceRegistry};
use crate::error::BridgeError;
use crate::lock::{self, InstanceLock};
use crate::midi::{detect_capability, open_backend, MidiBridge};
use crate::relay::{Relay, RelayHandle};
use crate::transport::{ControllerTransport, HostTransport};

/// Inputs for one daemon run.
#[derive(Debug)]
pub struct DaemonOptions {
    /// Directory holding `config.toml`, `devices/` and the lock.
    pub config_dir: PathBuf,
    /// Configuration to run with (file plus CLI overrides).
    pub config: Config,
    /// Ask a running instance to exit and take over its lock.
    pub replace: bool,
    /// Sender side of the log broadcast.
    pub broadcaster: LogBroadcaster,
    /// Task side of the log broadcast; `None` when broadcasting is off.
    pub pump: Option<BroadcastPump>,
}

impl DaemonOptions {
    /// Options with broadcasting disabled.
    pub fn new(config_dir: PathBuf, config: Config) -> Self {
        Self {
            config_dir,
            config,
            replace: false,
            broadcaster: LogBroadcaster::disabled(),
            pump: None,
        }
    }
}

/// A started daemon. Dropping it without [`shutdown`](Self::shutdown)
/// leaves its tasks running until the runtime stops.
pub struct RunningDaemon {
    ctx: DaemonContext,
    control: ControlServer,
    host_addr: SocketAddr,
    tasks: JoinSet<()>,
    lock: InstanceLock,
}

impl std::fmt::Debug for RunningDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningDaemon")
            .field("control", &self.control.local_addr())
            .field("host", &self.host_addr)
            .field("lock", &self.lock.path())
            .finish_non_exhaustive()
    }
}

impl RunningDaemon {
    /// Acquire the lock and bring every component up.
    ///
    /// # Errors
    ///
    /// Fails with a [`BridgeError`] (reachable through `downcast_ref`) when
    /// the lock is held, the previous holder does not let go in time, or the
    /// control port cannot be bound. Host socket bind failures are fatal too.
    pub async fn start(options: DaemonOptions) -> Result<Self> {
        let DaemonOptions {
            config_dir,
            config,
            replace,
            broadcaster,
            pump,
        } = options;

        let lock = acquire_lock(&config_dir, &config, replace).await?;

        let (submissions_tx, submissions_rx) = mpsc::unbounded_channel();
        let midi = open_midi(&config.midi, submissions_tx.clone()).await;

        let (relay_handle, commands) = RelayHandle::channel();
        let mut ctx = DaemonContext::new(config.clone(), config_dir.clone(), relay_handle);
        ctx.midi_port = midi.as_ref().map(|m| m.port_name().to_string());

        let control = ControlServer::bind(config.bridge.control_port, &lock, ctx.clone()).await?;

        let mut tasks = JoinSet::new();
        if let Some(pump) = pump {
            tasks.spawn(pump.run(ctx.shutdown.clone()));
        }

        let host = HostTransport::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, config.bridge.host_port)),
            SocketAddr::from((Ipv4Addr::LOCALHOST, config.bridge.host_dest_port)),
        )
        .await
        .context("Failed to bind host socket")?;
        let host_addr = host.local_addr()?;
        let host_reader = host.spawn_reader(submissions_tx, ctx.shutdown.clone());
        tasks.spawn(async move {
            let _ = host_reader.await;
        });

        let descriptor = load_descriptor(&config_dir, &config.bridge.device);
        let transport = ControllerTransport::from_config(&config.bridge, descriptor, broadcaster.clone());
        let mut relay = Relay::new(
            transport,
            host,
            &config,
            Arc::clone(&ctx.status),
            broadcaster.clone(),
        );
        if let Some(midi) = midi {
            relay = relay.with_midi(midi);
        }
        tasks.spawn(relay.run(commands, submissions_rx, ctx.shutdown.clone()));

        log::info!(
            "[Daemon] Running (pid={}, controller={}, host={}, control={})",
            std::process::id(),
            config.bridge.controller,
            host_addr,
            control.local_addr()
        );
        broadcaster.system(format!("midibridge {} started", env!("CARGO_PKG_VERSION")));

        Ok(Self {
            ctx,
            control,
            host_addr,
            tasks,
            lock,
        })
    }

    /// Shared context (status, relay handle, shutdown token).
    pub fn context(&self) -> &DaemonContext {
        &self.ctx
    }

    /// Bound control-plane address.
    pub fn control_addr(&self) -> SocketAddr {
        self.control.local_addr()
    }

    /// Bound host socket address.
    pub fn host_addr(&self) -> SocketAddr {
        self.host_addr
    }

    /// Wait until something cancels the shutdown token, then tear down.
    pub async fn wait(self) {
        self.ctx.shutdown.cancelled().await;
        self.stop().await;
    }

    /// Cancel the shutdown token and tear down.
    pub async fn shutdown(self) {
        self.ctx.shutdown.cancel();
        self.stop().await;
    }

    async fn stop(mut self) {
        self.control.shutdown();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("[Daemon] Task failed during shutdown: {e}");
            }
        }
        log::info!("[Daemon] Stopped; releasing {}", self.lock.path().display());
        drop(self.lock);
    }
}

/// Run until interrupted or told to shut down over the control plane.
pub async fn run(options: DaemonOptions) -> Result<()> {
    let daemon = RunningDaemon::start(options).await?;
    let shutdown = daemon.context().shutdown.clone();

    tokio::select! {
        () = shutdown.cancelled() => {}
        () = wait_for_signal() => log::info!("[Daemon] Signal received, shutting down"),
    }
    daemon.shutdown().await;
    Ok(())
}

async fn acquire_lock(config_dir: &std::path::Path, config: &Config, replace: bool) -> Result<InstanceLock> {
    match InstanceLock::acquire(config_dir) {
        Ok(lock) => Ok(lock),
        Err(BridgeError::InstanceLockHeld { path }) if replace => {
            let owner = lock::read_owner_pid(config_dir)
                .map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
            log::info!("[Daemon] Replacing running instance (pid={owner})");
            match control::send_command(config.bridge.control_port, ControlCommand::Shutdown).await {
                Ok(response) if response.ok => {}
                Ok(response) => log::warn!("[Daemon] Shutdown request refused: {:?}", response.error),
                Err(e) => log::warn!("[Daemon] Could not ask {} to exit: {e}", path.display()),
            }
            let lock =
                InstanceLock::acquire_with_timeout(config_dir, config.timeouts.lock_release()).await?;
            Ok(lock)
        }
        Err(e) => Err(e.into()),
    }
}

async fn open_midi(config: &MidiConfig, input: mpsc::UnboundedSender<Vec<u8>>) -> Option<MidiBridge> {
    let config = config.clone();
    let opened = tokio::task::spawn_blocking(move || {
        let capability = detect_capability(&config);
        log::debug!("[Midi] Capability: {capability:?}");
        open_backend(capability, &config, input)
    })
    .await;

    match opened {
        Ok(Ok(endpoint)) => {
            log::info!("[Midi] Port '{}' open", endpoint.name());
            Some(MidiBridge::new(endpoint))
        }
        Ok(Err(e)) => {
            log::warn!("[Midi] {e}; relaying without a MIDI port");
            None
        }
        Err(e) => {
            log::error!("[Midi] Backend setup panicked: {e}");
            None
        }
    }
}

fn load_descriptor(config_dir: &std::path::Path, name: &str) -> DeviceDescriptor {
    match DeviceRegistry::new(config_dir).load(name) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            log::warn!("[Daemon] {e:#}; using built-in descriptor");
            DeviceDescriptor::builtin()
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("[Daemon] Cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerKind;

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn udp_config() -> Config {
        let mut config = Config::default();
        config.bridge.controller = ControllerKind::Udp;
        config.bridge.controller_port = free_udp_port();
        config.bridge.controller_dest_port = free_udp_port();
        config.bridge.host_port = 0;
        config.bridge.host_dest_port = free_udp_port();
        config.bridge.control_port = 0;
        config.midi.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_start_and_shutdown_releases_lock() {
        let tmp = tempfile::TempDir::new().unwrap();
        let daemon = RunningDaemon::start(DaemonOptions::new(tmp.path().to_path_buf(), udp_config()))
            .await
            .unwrap();
        assert!(daemon.context().midi_port.is_none());
        assert!(InstanceLock::acquire(tmp.path()).is_err());

        daemon.shutdown().await;
        InstanceLock::acquire(tmp.path()).expect("lock released after shutdown");
    }

    #[tokio::test]
    async fn test_second_start_fails_with_lock_held() {
        let tmp = tempfile::TempDir::new().unwrap();
        let first = RunningDaemon::start(DaemonOptions::new(tmp.path().to_path_buf(), udp_config()))
            .await
            .unwrap();

        let err = RunningDaemon::start(DaemonOptions::new(tmp.path().to_path_buf(), udp_config()))
            .await
            .unwrap_err();
        let bridge = err.downcast_ref::<BridgeError>().unwrap();
        assert!(matches!(bridge, BridgeError::InstanceLockHeld { .. }));

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_descriptor_falls_back_to_builtin() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(load_descriptor(tmp.path(), "nope"), DeviceDescriptor::builtin());
    }
}
