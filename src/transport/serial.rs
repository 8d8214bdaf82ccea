//! USB CDC serial controller link.
//!
//! # Threads
//!
//! `serialport` is blocking, so an open link runs two OS threads that each
//! own a cloned handle:
//!
//! ```text
//!   reader thread ──read──► StreamDecoder ──Frame──► receive callback
//!                                         └─Text───► LogBroadcaster
//!   writer thread ◄──mpsc── send()
//! ```
//!
//! The reader wakes every [`SERIAL_READ_TIMEOUT`] to check the stop flag.
//! [`SerialTransport::close`] raises the flag, drops the writer's channel
//! and joins both threads, so when it returns no handle to the device is
//! left open.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::ReceiveCallback;
use crate::broadcast::{LogBroadcaster, LogEntry, LogKind};
use crate::codec::{Framing, StreamDecoder, StreamItem};
use crate::constants::SERIAL_READ_TIMEOUT;
use crate::device::{self, DeviceDescriptor};
use crate::error::BridgeError;

/// Nominal baud rate. USB CDC ignores it.
const BAUD_RATE: u32 = 115_200;

/// Serial controller transport, detected through the device registry.
pub struct SerialTransport {
    descriptor: DeviceDescriptor,
    broadcaster: LogBroadcaster,
    on_receive: Option<ReceiveCallback>,
    port_name: Option<String>,
    link: Option<SerialLink>,
}

struct SerialLink {
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    writer_tx: std_mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("descriptor", &self.descriptor.name)
            .field("port_name", &self.port_name)
            .field("open", &self.link.is_some())
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    /// Transport for the device matching `descriptor`. Not opened yet.
    pub fn new(descriptor: DeviceDescriptor, broadcaster: LogBroadcaster) -> Self {
        Self {
            descriptor,
            broadcaster,
            on_receive: None,
            port_name: None,
            link: None,
        }
    }

    /// Port path of the current (or last) link, or the descriptor name.
    pub fn describe(&self) -> String {
        match &self.port_name {
            Some(name) => format!("serial {name}"),
            None => format!("serial <{}>", self.descriptor.name),
        }
    }

    /// Install the frame callback.
    pub fn on_receive(&mut self, callback: ReceiveCallback) {
        self.on_receive = Some(callback);
    }

    /// Detect the device, open it and start the I/O threads.
    pub async fn open(&mut self) -> Result<(), BridgeError> {
        if self.link.is_some() {
            return Ok(());
        }
        let descriptor = self.descriptor.clone();
        let (name, port) = tokio::task::spawn_blocking(move || open_detected(&descriptor))
            .await
            .map_err(|e| BridgeError::TransportDisconnected(format!("open task failed: {e}")))??;

        let write_port = port
            .try_clone()
            .map_err(|e| BridgeError::TransportDisconnected(format!("clone {name}: {e}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let (writer_tx, writer_rx) = std_mpsc::channel::<Vec<u8>>();

        let reader = {
            let stop = Arc::clone(&stop);
            let alive = Arc::clone(&alive);
            let callback = self.on_receive.clone();
            let broadcaster = self.broadcaster.clone();
            std::thread::Builder::new()
                .name("serial-reader".into())
                .spawn(move || read_loop(port, &stop, &alive, callback.as_ref(), &broadcaster))?
        };
        let writer = {
            let alive = Arc::clone(&alive);
            std::thread::Builder::new()
                .name("serial-writer".into())
                .spawn(move || write_loop(write_port, &writer_rx, &alive))
        };
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::Release);
                let _ = tokio::task::spawn_blocking(move || reader.join()).await;
                return Err(e.into());
            }
        };

        log::info!("[Serial] Opened {name}");
        self.port_name = Some(name);
        self.link = Some(SerialLink {
            stop,
            alive,
            writer_tx,
            reader,
            writer,
        });
        Ok(())
    }

    /// Fails once either I/O thread hit an error.
    pub fn poll(&self) -> Result<(), BridgeError> {
        match &self.link {
            None => Err(BridgeError::TransportDisconnected("serial link not open".into())),
            Some(link) if !link.alive.load(Ordering::Acquire) => Err(
                BridgeError::TransportDisconnected(format!("{} stopped responding", self.describe())),
            ),
            Some(_) => Ok(()),
        }
    }

    /// Queue one frame for the writer thread.
    pub fn send(&self, frame: &[u8]) -> Result<(), BridgeError> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| BridgeError::TransportDisconnected("serial link not open".into()))?;
        link.writer_tx
            .send(Framing::Delimited.encode(frame))
            .map_err(|_| BridgeError::TransportDisconnected("serial writer stopped".into()))
    }

    /// Stop and join both threads. The device is closed on return.
    pub async fn close(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let SerialLink {
            stop,
            alive,
            writer_tx,
            reader,
            writer,
        } = link;
        stop.store(true, Ordering::Release);
        alive.store(false, Ordering::Release);
        drop(writer_tx);

        let joined = tokio::task::spawn_blocking(move || {
            let _ = reader.join();
            let _ = writer.join();
        })
        .await;
        if let Err(e) = joined {
            log::error!("[Serial] Failed to join I/O threads: {e}");
        }
        log::info!("[Serial] Closed {}", self.describe());
    }

    /// Whether the device is held.
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }
}

fn open_detected(
    descriptor: &DeviceDescriptor,
) -> Result<(String, Box<dyn serialport::SerialPort>), BridgeError> {
    let candidate = device::detect(descriptor)?;
    let port = serialport::new(&candidate.name, BAUD_RATE)
        .timeout(SERIAL_READ_TIMEOUT)
        .open()
        .map_err(|e| {
            BridgeError::TransportDisconnected(format!("open {} failed: {e}", candidate.name))
        })?;
    Ok((candidate.name, port))
}

fn read_loop(
    mut port: Box<dyn serialport::SerialPort>,
    stop: &AtomicBool,
    alive: &AtomicBool,
    callback: Option<&ReceiveCallback>,
    broadcaster: &LogBroadcaster,
) {
    let mut decoder = StreamDecoder::new();
    let mut buf = [0u8; 1024];

    while !stop.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) => {
                log::warn!("[Serial] Device returned EOF");
                alive.store(false, Ordering::Release);
                break;
            }
            Ok(n) => {
                for item in decoder.feed(&buf[..n]) {
                    match item {
                        StreamItem::Frame(frame) => {
                            if let Some(cb) = callback {
                                cb(frame);
                            }
                        }
                        StreamItem::Text(line) => {
                            broadcaster.emit(LogEntry::new(LogKind::ControllerIn, line));
                        }
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    log::warn!("[Serial] Read failed: {e}");
                }
                alive.store(false, Ordering::Release);
                break;
            }
        }
    }
}

fn write_loop(
    mut port: Box<dyn serialport::SerialPort>,
    frames: &std_mpsc::Receiver<Vec<u8>>,
    alive: &AtomicBool,
) {
    while let Ok(bytes) = frames.recv() {
        if let Err(e) = port.write_all(&bytes).and_then(|()| port.flush()) {
            log::warn!("[Serial] Write failed: {e}");
            alive.store(false, Ordering::Release);
            break;
        }
    }
}
