//! WebSocket server controller link.
//!
//! Browser-hosted simulators connect as WebSocket clients. Every accepted
//! client is an independent connection feeding the same receive callback;
//! outbound frames are sent to all clients.
//!
//! ```text
//!   TcpListener ──accept──► client task ◄──mpsc── send() (fan-out)
//!                              │
//!                              ├─Binary──► receive callback
//!                              └─Text────► LogBroadcaster
//! ```
//!
//! The link is ready while at least one client is attached; the ready
//! callback fires on each 0↔1 transition.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;

use super::{ReadyCallback, ReceiveCallback};
use crate::broadcast::{LogBroadcaster, LogEntry, LogKind};
use crate::error::BridgeError;

/// Connected clients and the callbacks they report to.
struct WsShared {
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    next_id: AtomicU64,
    alive: AtomicBool,
    on_receive: Option<ReceiveCallback>,
    on_ready: Option<ReadyCallback>,
    broadcaster: LogBroadcaster,
}

impl WsShared {
    fn client_count(&self) -> usize {
        self.clients.lock().expect("WsShared mutex poisoned").len()
    }

    fn register(&self, tx: mpsc::UnboundedSender<Vec<u8>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut clients = self.clients.lock().expect("WsShared mutex poisoned");
            clients.insert(id, tx);
            clients.len()
        };
        if count == 1 {
            if let Some(cb) = &self.on_ready {
                cb(true);
            }
        }
        id
    }

    fn unregister(&self, id: u64) {
        let (removed, count) = {
            let mut clients = self.clients.lock().expect("WsShared mutex poisoned");
            let removed = clients.remove(&id).is_some();
            (removed, clients.len())
        };
        if removed && count == 0 {
            if let Some(cb) = &self.on_ready {
                cb(false);
            }
        }
    }
}

/// WebSocket server controller transport.
pub struct WsTransport {
    bind: SocketAddr,
    broadcaster: LogBroadcaster,
    on_receive: Option<ReceiveCallback>,
    on_ready: Option<ReadyCallback>,
    shared: Option<Arc<WsShared>>,
    accept: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("bind", &self.bind)
            .field("open", &self.shared.is_some())
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    /// Server listening on `bind`. Not opened yet.
    pub fn new(bind: SocketAddr, broadcaster: LogBroadcaster) -> Self {
        Self {
            bind,
            broadcaster,
            on_receive: None,
            on_ready: None,
            shared: None,
            accept: None,
        }
    }

    /// `ws://<bind> (<n> clients)`.
    pub fn describe(&self) -> String {
        let clients = self.shared.as_ref().map_or(0, |s| s.client_count());
        format!("ws://{} ({} clients)", self.bind, clients)
    }

    /// Install the frame callback.
    pub fn on_receive(&mut self, callback: ReceiveCallback) {
        self.on_receive = Some(callback);
    }

    /// Install the readiness callback.
    pub fn on_ready_changed(&mut self, callback: ReadyCallback) {
        self.on_ready = Some(callback);
    }

    /// True while at least one client is attached.
    pub fn is_ready(&self) -> bool {
        self.shared.as_ref().is_some_and(|s| s.client_count() > 0)
    }

    /// Bind the listener and start accepting clients.
    pub async fn open(&mut self) -> Result<(), BridgeError> {
        if self.shared.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(self.bind).await.map_err(|e| {
            BridgeError::TransportDisconnected(format!("listen on {} failed: {e}", self.bind))
        })?;
        let shared = Arc::new(WsShared {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            on_receive: self.on_receive.clone(),
            on_ready: self.on_ready.clone(),
            broadcaster: self.broadcaster.clone(),
        });

        let accept_shared = Arc::clone(&shared);
        self.accept = Some(tokio::spawn(accept_loop(listener, accept_shared)));
        self.shared = Some(shared);
        log::info!("[WebSocket] Listening on ws://{}", self.bind);
        Ok(())
    }

    /// Fails once the accept loop died.
    pub fn poll(&self) -> Result<(), BridgeError> {
        match &self.shared {
            None => Err(BridgeError::TransportDisconnected("websocket server not open".into())),
            Some(s) if !s.alive.load(Ordering::Acquire) => Err(
                BridgeError::TransportDisconnected("websocket accept loop stopped".into()),
            ),
            Some(_) => Ok(()),
        }
    }

    /// Send one frame to every attached client.
    pub fn send(&self, frame: &[u8]) -> Result<(), BridgeError> {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| BridgeError::TransportDisconnected("websocket server not open".into()))?;
        let clients = shared.clients.lock().expect("WsShared mutex poisoned");
        if clients.is_empty() {
            return Err(BridgeError::TransportDisconnected("no websocket clients".into()));
        }
        for tx in clients.values() {
            // A closed channel means the client task is exiting and will unregister.
            let _ = tx.send(frame.to_vec());
        }
        Ok(())
    }

    /// Stop accepting, drop every client and release the listener.
    pub async fn close(&mut self) {
        let shared = self.shared.take();
        if let Some(accept) = self.accept.take() {
            accept.abort();
            let _ = accept.await;
        }
        if let Some(shared) = shared {
            let had_clients = {
                let mut clients = shared.clients.lock().expect("WsShared mutex poisoned");
                let had = !clients.is_empty();
                clients.clear();
                had
            };
            if had_clients {
                if let Some(cb) = &shared.on_ready {
                    cb(false);
                }
            }
        }
    }

    /// Whether the listener is bound.
    pub fn is_open(&self) -> bool {
        self.shared.is_some()
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<WsShared>) {
    // Client tasks are aborted when this set drops (on close).
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    clients.spawn(serve_client(stream, peer, Arc::clone(&shared)));
                }
                Err(e) => {
                    log::error!("[WebSocket] Accept failed: {e}");
                    shared.alive.store(false, Ordering::Release);
                    break;
                }
            },
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, shared: Arc<WsShared>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("[WebSocket] Handshake with {peer} failed: {e}");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let id = shared.register(tx);
    log::info!("[WebSocket] Client {id} connected from {peer}");

    // Unregister even when this task is aborted mid-await.
    let _guard = scopeguard::guard((), |()| shared.unregister(id));

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break };
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    log::warn!("[WebSocket] Send to client {id} failed: {e}");
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(frame))) => {
                    if let Some(cb) = &shared.on_receive {
                        cb(frame.to_vec());
                    }
                }
                Some(Ok(Message::Text(line))) => {
                    shared.broadcaster.emit(LogEntry::new(LogKind::ControllerIn, line.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by tungstenite on the next write/flush.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("[WebSocket] Client {id} read error: {e}");
                    break;
                }
            }
        }
    }
    log::info!("[WebSocket] Client {id} disconnected");
}
