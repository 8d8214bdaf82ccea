//! UDP controller link.
//!
//! Binds the controller port on loopback and sends every frame as one
//! datagram to a fixed destination. Always ready once open.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::ReceiveCallback;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::BridgeError;

/// Datagram-based controller transport.
pub struct UdpTransport {
    bind: SocketAddr,
    dest: SocketAddr,
    on_receive: Option<ReceiveCallback>,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("bind", &self.bind)
            .field("dest", &self.dest)
            .field("open", &self.socket.is_some())
            .finish_non_exhaustive()
    }
}

impl UdpTransport {
    /// Transport bound on `bind`, sending to `dest`. Not opened yet.
    pub fn new(bind: SocketAddr, dest: SocketAddr) -> Self {
        Self {
            bind,
            dest,
            on_receive: None,
            socket: None,
            reader: None,
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `udp <bind> -> <dest>`.
    pub fn describe(&self) -> String {
        format!("udp {} -> {}", self.bind, self.dest)
    }

    /// Install the frame callback.
    pub fn on_receive(&mut self, callback: ReceiveCallback) {
        self.on_receive = Some(callback);
    }

    /// Bind the socket and start the reader task.
    pub async fn open(&mut self) -> Result<(), BridgeError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind(self.bind).await.map_err(|e| {
            BridgeError::TransportDisconnected(format!("bind {} failed: {e}", self.bind))
        })?;
        let socket = Arc::new(socket);

        self.alive.store(true, Ordering::Release);
        let reader_socket = Arc::clone(&socket);
        let alive = Arc::clone(&self.alive);
        let callback = self.on_receive.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((n, _from)) => {
                        if let Some(cb) = &callback {
                            cb(buf[..n].to_vec());
                        }
                    }
                    // ICMP port-unreachable from a previous send surfaces here on some OSes.
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
                    Err(e) => {
                        log::warn!("[Udp] Receive failed: {e}");
                        alive.store(false, Ordering::Release);
                        break;
                    }
                }
            }
        }));
        self.socket = Some(socket);
        log::info!("[Udp] Listening on {} (sending to {})", self.bind, self.dest);
        Ok(())
    }

    /// Fails once the reader task stopped.
    pub fn poll(&self) -> Result<(), BridgeError> {
        if self.socket.is_none() {
            return Err(BridgeError::TransportDisconnected("udp link not open".into()));
        }
        if !self.alive.load(Ordering::Acquire) {
            return Err(BridgeError::TransportDisconnected("udp reader stopped".into()));
        }
        Ok(())
    }

    /// Send one frame as one datagram.
    pub async fn send(&self, frame: &[u8]) -> Result<(), BridgeError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| BridgeError::TransportDisconnected("udp link not open".into()))?;
        match socket.send_to(frame, self.dest).await {
            Ok(_) => Ok(()),
            // Nobody listening yet; datagrams are fire-and-forget.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => Ok(()),
            Err(e) => Err(BridgeError::TransportDisconnected(format!("udp send failed: {e}"))),
        }
    }

    /// Stop the reader and drop the socket. The port is free on return.
    pub async fn close(&mut self) {
        // State first: a close cut short still leaves the transport closed.
        self.socket = None;
        self.alive.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
    }

    /// Whether the socket is bound.
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}
