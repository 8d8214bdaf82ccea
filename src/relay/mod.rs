//! Relay core: the bidirectional pump between controller and host.
//!
//! # Architecture
//!
//! ```text
//!                       RelayCommand (pause/resume/reconfigure)
//!                                   │
//!   controller ──callback──► ┌──────▼──────┐ ──send──► HostTransport ──► DAW
//!   transport  ◄──send────── │    Relay    │ ◄─mpsc─── host reader / MIDI in
//!                            └──────┬──────┘
//!                                   │ publishes
//!                             RelayStatus (atomics)
//! ```
//!
//! The relay task is the only owner of the controller transport. Every
//! other component talks to it through [`RelayHandle`] messages, and reads
//! its state from [`RelayStatus`](crate::context::RelayStatus).
//!
//! # Pause contract
//!
//! The reply to [`RelayHandle::pause`] is sent only after
//! [`ControllerTransport::close`] returned, i.e. after the device handle is
//! released. The close runs on its own task and is never abandoned: a close
//! slower than the configured timeout replies [`PauseOutcome::CloseTimeout`]
//! and keeps running. Until it finishes, further pauses wait on it again and
//! a resume does not reopen the transport. Pause and resume are idempotent.
//!
//! # Sessions
//!
//! A session starts when the link is open *and* ready. For WebSocket that
//! means a client is attached; the last client leaving ends the session
//! while the server keeps listening.

pub mod outbound;
pub mod session;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{frame_summary, LogBroadcaster, LogEntry, LogKind};
use crate::config::{Config, ReconnectConfig, TimeoutConfig};
use crate::constants::TRANSPORT_POLL_INTERVAL;
use crate::context::{RelayStatus, SessionInfo};
use crate::error::BridgeError;
use crate::midi::MidiBridge;
use crate::reconnect::ReconnectPolicy;
use crate::transport::{ControllerTransport, HostTransport};

use outbound::OutboundBuffer;
use session::Session;

/// Depth of the relay command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Result of a pause request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseOutcome {
    /// The device was closed by this request.
    Paused,
    /// Already paused; nothing changed.
    AlreadyPaused,
    /// Close did not finish within the pause timeout.
    CloseTimeout,
}

/// Result of a resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// Reconnection re-engaged.
    Resumed,
    /// Not paused; nothing changed.
    AlreadyRunning,
}

/// Messages accepted by the relay task.
#[derive(Debug)]
pub enum RelayCommand {
    /// Close the controller and stop reconnecting.
    Pause {
        /// Sent after the device handle is released.
        reply: oneshot::Sender<PauseOutcome>,
    },
    /// Reopen through the normal detection path.
    Resume {
        /// Sent once reconnection is scheduled.
        reply: oneshot::Sender<ResumeOutcome>,
    },
    /// Apply hot-reloadable settings.
    Reconfigure {
        /// New backoff and buffer settings.
        reconnect: ReconnectConfig,
        /// New hand-off windows.
        timeouts: TimeoutConfig,
    },
}

/// The relay task has exited.
#[derive(Debug, Error)]
#[error("relay task is not running")]
pub struct RelayUnavailable;

/// Cloneable sender half for [`RelayCommand`]s.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    /// Create a handle and the receiver the relay task consumes.
    pub fn channel() -> (Self, mpsc::Receiver<RelayCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Pause the relay; resolves once the device is closed.
    pub async fn pause(&self) -> Result<PauseOutcome, RelayUnavailable> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RelayCommand::Pause { reply })
            .await
            .map_err(|_| RelayUnavailable)?;
        rx.await.map_err(|_| RelayUnavailable)
    }

    /// Resume the relay.
    pub async fn resume(&self) -> Result<ResumeOutcome, RelayUnavailable> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RelayCommand::Resume { reply })
            .await
            .map_err(|_| RelayUnavailable)?;
        rx.await.map_err(|_| RelayUnavailable)
    }

    /// Push hot-reloadable settings.
    pub async fn reconfigure(&self, config: &Config) -> Result<(), RelayUnavailable> {
        self.tx
            .send(RelayCommand::Reconfigure {
                reconnect: config.reconnect.clone(),
                timeouts: config.timeouts.clone(),
            })
            .await
            .map_err(|_| RelayUnavailable)
    }
}

/// Events raised by transport callbacks (reader threads and tasks).
#[derive(Debug)]
enum ControllerEvent {
    Frame(Vec<u8>),
    Ready(bool),
}

/// Owner of the controller transport and the session state.
///
/// The transport is either held here or owned by a close task started by
/// `pause`; never both. A session exists only while the link is open and
/// ready (for WebSocket: at least one client attached).
pub struct Relay {
    transport: Option<ControllerTransport>,
    closing: Option<JoinHandle<ControllerTransport>>,
    host: HostTransport,
    policy: ReconnectPolicy,
    outbound: OutboundBuffer,
    session: Option<Session>,
    paused: bool,
    pause_close_timeout: Duration,
    status: Arc<RelayStatus>,
    broadcaster: LogBroadcaster,
    midi: Option<MidiBridge>,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    #[cfg(test)]
    close_delay: Duration,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("transport", &self.transport)
            .field("closing", &self.closing.is_some())
            .field("paused", &self.paused)
            .field("connected", &self.session.is_some())
            .field("buffered", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Wire callbacks into `transport` and build the relay. Nothing opens yet.
    pub fn new(
        mut transport: ControllerTransport,
        host: HostTransport,
        config: &Config,
        status: Arc<RelayStatus>,
        broadcaster: LogBroadcaster,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let frame_tx = events_tx.clone();
        transport.on_receive(Arc::new(move |frame| {
            let _ = frame_tx.send(ControllerEvent::Frame(frame));
        }));
        transport.on_ready_changed(Arc::new(move |ready| {
            let _ = events_tx.send(ControllerEvent::Ready(ready));
        }));

        Self {
            transport: Some(transport),
            closing: None,
            host,
            policy: ReconnectPolicy::new(
                config.reconnect.initial_delay(),
                config.reconnect.max_delay(),
            ),
            outbound: OutboundBuffer::new(config.reconnect.buffer_capacity),
            session: None,
            paused: false,
            pause_close_timeout: config.timeouts.pause_close(),
            status,
            broadcaster,
            midi: None,
            events,
            #[cfg(test)]
            close_delay: Duration::ZERO,
        }
    }

    /// Tee controller frames into a virtual MIDI port.
    #[must_use]
    pub fn with_midi(mut self, midi: MidiBridge) -> Self {
        self.midi = Some(midi);
        self
    }

    /// Run until `shutdown` fires. The controller is closed on exit.
    ///
    /// `submissions` carries frames destined for the controller (host
    /// datagrams and virtual MIDI input).
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<RelayCommand>,
        mut submissions: mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown: CancellationToken,
    ) {
        log::info!("[Relay] Started ({})", self.describe());
        let mut health = tokio::time::interval(TRANSPORT_POLL_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_attempt = if self.paused {
                None
            } else {
                self.policy.next_attempt()
            };
            let reconnect_due = async move {
                match next_attempt {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = self.events.recv() => self.handle_event(event).await,
                Some(frame) = submissions.recv() => self.submit(frame).await,
                () = reconnect_due => self.try_connect().await,
                _ = health.tick() => self.check_health().await,
            }
        }

        self.reclaim_transport(None).await;
        if let Some(transport) = self.transport.as_mut() {
            transport.close().await;
        }
        self.end_session();
        log::info!("[Relay] Stopped");
    }

    async fn handle_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Pause { reply } => {
                let outcome = self.pause().await;
                let _ = reply.send(outcome);
            }
            RelayCommand::Resume { reply } => {
                let outcome = self.resume();
                let _ = reply.send(outcome);
            }
            RelayCommand::Reconfigure {
                reconnect,
                timeouts,
            } => {
                self.policy
                    .reconfigure(reconnect.initial_delay(), reconnect.max_delay());
                self.outbound.set_capacity(reconnect.buffer_capacity);
                self.pause_close_timeout = timeouts.pause_close();
                self.sync_buffered();
                log::info!("[Relay] Applied reconnect/timeouts settings");
            }
        }
    }

    fn describe(&self) -> String {
        self.transport
            .as_ref()
            .map_or_else(|| "closing".to_string(), ControllerTransport::describe)
    }

    fn link_open(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(ControllerTransport::is_open)
    }

    fn link_ready(&self) -> bool {
        self.link_open()
            && self
                .transport
                .as_ref()
                .is_some_and(ControllerTransport::is_ready)
    }

    /// Pause. Replies `Paused` only once the handle is released; a close
    /// still running at the deadline keeps going in the background and
    /// every later `pause` waits on it again.
    async fn pause(&mut self) -> PauseOutcome {
        if !self.paused {
            self.paused = true;
            self.status.set_paused(true);
            self.policy.suspend();
            self.end_session();
            self.start_close();
        } else if self.closing.is_none() {
            return PauseOutcome::AlreadyPaused;
        }

        if self.reclaim_transport(Some(self.pause_close_timeout)).await {
            log::info!("[Relay] Paused, controller released");
            self.broadcaster.system("relay paused");
            PauseOutcome::Paused
        } else {
            log::error!(
                "[Relay] Controller did not close within {:?}; close still running",
                self.pause_close_timeout
            );
            PauseOutcome::CloseTimeout
        }
    }

    /// Move the transport into a task that closes it to completion.
    fn start_close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        #[cfg(test)]
        let delay = self.close_delay;
        self.closing = Some(tokio::spawn(async move {
            #[cfg(test)]
            tokio::time::sleep(delay).await;
            transport.close().await;
            transport
        }));
    }

    /// Take the transport back from a finished close task.
    ///
    /// With a `limit`, returns false if the close is still running when it
    /// elapses; the task is left untouched.
    async fn reclaim_transport(&mut self, limit: Option<Duration>) -> bool {
        let Some(closing) = self.closing.as_mut() else {
            return true;
        };
        let joined = match limit {
            Some(limit) => match tokio::time::timeout(limit, closing).await {
                Ok(joined) => joined,
                Err(_) => return false,
            },
            None => closing.await,
        };
        self.closing = None;
        match joined {
            Ok(transport) => {
                self.transport = Some(transport);
                true
            }
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    fn resume(&mut self) -> ResumeOutcome {
        if !self.paused {
            return ResumeOutcome::AlreadyRunning;
        }
        self.paused = false;
        self.status.set_paused(false);
        self.policy.resume(Instant::now());
        log::info!("[Relay] Resumed, reconnecting");
        self.broadcaster.system("relay resumed");
        ResumeOutcome::Resumed
    }

    async fn try_connect(&mut self) {
        if self.paused || self.link_open() {
            return;
        }
        self.policy.begin_attempt(Instant::now());

        // Never reopen over a handle an earlier pause is still closing.
        if self.closing.as_ref().is_some_and(|c| !c.is_finished()) {
            let delay = self.policy.on_failure(Instant::now());
            log::debug!("[Relay] Previous close still running; retrying in {delay:?}");
            return;
        }
        self.reclaim_transport(None).await;
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        match transport.open().await {
            Ok(()) => {
                self.policy.on_connected();
                self.status.set_last_error(None);
                if self.link_ready() {
                    self.begin_session();
                    self.flush_outbound().await;
                } else {
                    log::info!("[Relay] {} open, waiting for the controller", self.describe());
                }
            }
            Err(e) => {
                let delay = self.policy.on_failure(Instant::now());
                let attempts = self.policy.state().attempts;
                if attempts == 1 {
                    log::warn!("[Relay] Connect failed: {e}; retrying in {delay:?}");
                } else {
                    log::debug!("[Relay] Connect attempt {attempts} failed: {e}; retrying in {delay:?}");
                }
                self.status.set_last_error(Some(e.code().to_string()));
            }
        }
    }

    fn begin_session(&mut self) {
        let session = Session::start(self.describe());
        log::info!("[Relay] Connected to {}", session.endpoint);
        self.status.stats.begin_session();
        self.status.set_session(Some(SessionInfo {
            endpoint: session.endpoint.clone(),
            started_at: session.started_at,
        }));
        self.session = Some(session);
    }

    async fn check_health(&mut self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        if !transport.is_open() {
            return;
        }
        if let Err(e) = transport.poll() {
            self.teardown(&e).await;
        }
    }

    async fn teardown(&mut self, reason: &BridgeError) {
        log::warn!("[Relay] {reason}");
        self.broadcaster
            .emit(LogEntry::new(LogKind::Error, reason.to_string()));
        if let Some(transport) = self.transport.as_mut() {
            transport.close().await;
        }
        self.end_session();
        self.policy.on_disconnected(Instant::now());
    }

    fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            log::info!(
                "[Relay] Session on {} ended after {:?}",
                session.endpoint,
                session.started.elapsed()
            );
        }
        self.status.set_session(None);
    }

    async fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Frame(frame) => {
                if self.paused {
                    return;
                }
                self.broadcaster
                    .emit(LogEntry::new(LogKind::ControllerIn, frame_summary(&frame)));
                if let Some(midi) = &mut self.midi {
                    midi.offer(&frame);
                }
                match self.host.send(&frame).await {
                    Ok(()) => self.status.stats.record_to_host(frame.len()),
                    Err(e) => log::warn!("[Relay] Host send failed: {e:#}"),
                }
            }
            // Stale events from a link closed since are dropped here.
            ControllerEvent::Ready(true) => {
                if self.paused || !self.link_ready() {
                    return;
                }
                if self.session.is_none() {
                    self.begin_session();
                }
                self.flush_outbound().await;
            }
            ControllerEvent::Ready(false) => {
                if self.session.is_some() && !self.link_ready() {
                    log::info!("[Relay] Controller gone, buffering outbound frames");
                    self.end_session();
                }
            }
        }
    }

    async fn submit(&mut self, frame: Vec<u8>) {
        if self.outbound.push(frame).is_some() {
            self.status.stats.record_dropped();
        }
        self.flush_outbound().await;
    }

    async fn send_to_controller(&mut self, frame: &[u8]) -> Result<(), BridgeError> {
        match self.transport.as_mut() {
            Some(transport) => transport.send(frame).await,
            None => Err(BridgeError::TransportDisconnected("controller is closing".into())),
        }
    }

    /// Send buffered frames in submission order while the link accepts them.
    async fn flush_outbound(&mut self) {
        if self.session.is_none() || !self.link_ready() {
            self.sync_buffered();
            return;
        }
        let mut pending = self.outbound.drain().into_iter();
        while let Some(frame) = pending.next() {
            if let Err(e) = self.send_to_controller(&frame).await {
                log::debug!("[Relay] Send failed, keeping {} frames: {e}", pending.len() + 1);
                let mut rest = vec![frame];
                rest.extend(pending);
                self.outbound.requeue_front(rest);
                self.sync_buffered();
                let polled = self.transport.as_ref().map(ControllerTransport::poll);
                if let Some(Err(e)) = polled {
                    self.teardown(&e).await;
                }
                return;
            }
            self.status.stats.record_to_controller(frame.len());
            self.broadcaster
                .emit(LogEntry::new(LogKind::ControllerOut, frame_summary(&frame)));
        }
        self.sync_buffered();
    }

    fn sync_buffered(&self) {
        self.status.set_buffered(self.outbound.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerKind;
    use crate::device::DeviceDescriptor;
    use tokio::net::UdpSocket;

    struct Harness {
        relay: RelayHandle,
        status: Arc<RelayStatus>,
        submit: mpsc::UnboundedSender<Vec<u8>>,
        shutdown: CancellationToken,
        controller_addr: std::net::SocketAddr,
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn udp_config(controller_peer: &UdpSocket, capacity: usize) -> Config {
        let mut config = Config::default();
        config.bridge.controller = ControllerKind::Udp;
        config.bridge.controller_port = free_udp_port();
        config.bridge.controller_dest_port = controller_peer.local_addr().unwrap().port();
        config.reconnect.initial_delay_ms = 20;
        config.reconnect.max_delay_ms = 100;
        config.reconnect.buffer_capacity = capacity;
        config
    }

    async fn spawn(config: Config, host_peer: &UdpSocket, close_delay: Duration) -> Harness {
        let transport = ControllerTransport::from_config(
            &config.bridge,
            DeviceDescriptor::builtin(),
            LogBroadcaster::disabled(),
        );
        let host = HostTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            host_peer.local_addr().unwrap(),
        )
        .await
        .unwrap();
        let status = Arc::new(RelayStatus::default());
        let mut relay = Relay::new(
            transport,
            host,
            &config,
            Arc::clone(&status),
            LogBroadcaster::disabled(),
        );
        relay.close_delay = close_delay;
        let (handle, commands) = RelayHandle::channel();
        let (submit, submissions) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(relay.run(commands, submissions, shutdown.clone()));

        Harness {
            relay: handle,
            status,
            submit,
            shutdown,
            controller_addr: ([127, 0, 0, 1], config.bridge.controller_port).into(),
        }
    }

    async fn start(controller_peer: &UdpSocket, host_peer: &UdpSocket, capacity: usize) -> Harness {
        spawn(udp_config(controller_peer, capacity), host_peer, Duration::ZERO).await
    }

    async fn wait_connected(status: &RelayStatus, want: bool) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while status.is_connected() != want {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for connection state");
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("Timed out waiting for datagram")
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let h = start(&controller, &host, 8).await;
        wait_connected(&h.status, true).await;

        controller.send_to(&[0x90, 0x3C, 0x7F], h.controller_addr).await.unwrap();
        assert_eq!(recv(&host).await, vec![0x90, 0x3C, 0x7F]);

        h.submit.send(vec![0xB0, 0x01, 0x02]).unwrap();
        assert_eq!(recv(&controller).await, vec![0xB0, 0x01, 0x02]);

        let stats = h.status.stats.snapshot();
        assert_eq!(stats.frames_to_host, 1);
        assert_eq!(stats.frames_to_controller, 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_idempotent() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let h = start(&controller, &host, 8).await;
        wait_connected(&h.status, true).await;

        assert_eq!(h.relay.pause().await.unwrap(), PauseOutcome::Paused);
        assert!(h.status.is_paused());
        assert!(!h.status.is_connected());
        // Port is free the moment pause replies.
        let squatter = UdpSocket::bind(h.controller_addr).await.unwrap();
        assert_eq!(h.relay.pause().await.unwrap(), PauseOutcome::AlreadyPaused);
        drop(squatter);

        assert_eq!(h.relay.resume().await.unwrap(), ResumeOutcome::Resumed);
        assert_eq!(h.relay.resume().await.unwrap(), ResumeOutcome::AlreadyRunning);
        wait_connected(&h.status, true).await;
        assert_eq!(h.status.stats.snapshot().sessions, 2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_paused_frames_are_buffered_and_flushed_in_order() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let h = start(&controller, &host, 2).await;
        wait_connected(&h.status, true).await;
        h.relay.pause().await.unwrap();

        for i in 1..=3u8 {
            h.submit.send(vec![i]).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.status.stats.snapshot().dropped_outbound < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for drop");
        assert_eq!(h.status.buffered(), 2);

        h.relay.resume().await.unwrap();
        assert_eq!(recv(&controller).await, vec![2]);
        assert_eq!(recv(&controller).await, vec![3]);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_handle_reports_unavailable_after_shutdown() {
        let (handle, commands) = RelayHandle::channel();
        drop(commands);
        assert!(handle.pause().await.is_err());
        assert!(handle.resume().await.is_err());
    }

    #[tokio::test]
    async fn test_slow_close_is_not_abandoned() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = udp_config(&controller, 8);
        config.timeouts.pause_close_ms = 50;
        let h = spawn(config, &host, Duration::from_millis(300)).await;
        wait_connected(&h.status, true).await;

        assert_eq!(h.relay.pause().await.unwrap(), PauseOutcome::CloseTimeout);
        assert!(h.status.is_paused());
        // The close keeps running, so the socket is still held.
        assert!(UdpSocket::bind(h.controller_addr).await.is_err());
        // A second pause waits on the same close instead of claiming success.
        assert_eq!(h.relay.pause().await.unwrap(), PauseOutcome::CloseTimeout);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.relay.pause().await.unwrap(), PauseOutcome::Paused);
        let squatter = UdpSocket::bind(h.controller_addr).await.unwrap();
        assert_eq!(h.relay.pause().await.unwrap(), PauseOutcome::AlreadyPaused);
        drop(squatter);

        h.relay.resume().await.unwrap();
        wait_connected(&h.status, true).await;
        controller.send_to(&[0xC0, 0x05], h.controller_addr).await.unwrap();
        assert_eq!(recv(&host).await, vec![0xC0, 0x05]);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_resume_waits_for_pending_close_before_reopening() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = udp_config(&controller, 8);
        config.timeouts.pause_close_ms = 50;
        let h = spawn(config, &host, Duration::from_millis(300)).await;
        wait_connected(&h.status, true).await;

        assert_eq!(h.relay.pause().await.unwrap(), PauseOutcome::CloseTimeout);
        assert_eq!(h.relay.resume().await.unwrap(), ResumeOutcome::Resumed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.status.is_connected());

        wait_connected(&h.status, true).await;
        assert_eq!(h.status.stats.snapshot().sessions, 2);
        h.submit.send(vec![0xF8]).unwrap();
        assert_eq!(recv(&controller).await, vec![0xF8]);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_websocket_session_follows_clients() {
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ws_port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = Config::default();
        config.bridge.controller = ControllerKind::Ws;
        config.bridge.controller_port = ws_port;
        config.reconnect.initial_delay_ms = 20;
        let h = spawn(config, &host, Duration::ZERO).await;

        // Listening with nobody attached is not a session.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!h.status.is_connected());
        assert!(h.status.session().is_none());
        h.submit.send(vec![0x90, 0x40, 0x7F]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.status.buffered(), 1);

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{ws_port}"))
            .await
            .unwrap();
        wait_connected(&h.status, true).await;
        assert_eq!(h.status.stats.snapshot().sessions, 1);

        client.close(None).await.unwrap();
        drop(client);
        wait_connected(&h.status, false).await;
        assert!(!h.status.is_paused());
        h.shutdown.cancel();
    }
}
