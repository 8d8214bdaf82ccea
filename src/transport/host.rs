//! Host-side UDP link (DAW / host software).
//!
//! Bound once at startup and kept for the whole daemon run; controller
//! disconnects never touch it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::MAX_DATAGRAM_SIZE;

/// UDP socket pair facing the host software.
#[derive(Debug, Clone)]
pub struct HostTransport {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
}

impl HostTransport {
    /// Bind `bind`; frames are sent to `dest`.
    pub async fn bind(bind: SocketAddr, dest: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("Failed to bind host port {bind}"))?;
        log::info!("[Host] Listening on {bind} (sending to {dest})");
        Ok(Self {
            socket: Arc::new(socket),
            dest,
        })
    }

    /// Actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("host socket has no address")
    }

    /// Destination address.
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Forward one frame to the host. Refused sends are ignored.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        match self.socket.send_to(frame, self.dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => Ok(()),
            Err(e) => Err(e).context("host send failed"),
        }
    }

    /// Spawn the reader task; every datagram is pushed to `tx`.
    pub fn spawn_reader(
        &self,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, _)) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
                        Err(e) => {
                            log::error!("[Host] Receive failed: {e}");
                            break;
                        }
                    }
                }
            }
        })
    }
}
