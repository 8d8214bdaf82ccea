//! Outbound overflow logs exactly one warning per dropped frame.
//!
//! Installs a process-wide logger, so this file holds a single test.

use std::net::UdpSocket as StdUdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use midibridge::config::ControllerKind;
use midibridge::control::{send_command, ControlCommand};
use midibridge::relay::outbound::OutboundBuffer;
use midibridge::{Config, DaemonOptions, RunningDaemon};
use tempfile::TempDir;
use tokio::net::UdpSocket;

const OUTBOUND_TARGET: &str = "midibridge::relay::outbound";

struct WarnCounter {
    warnings: AtomicUsize,
}

impl log::Log for WarnCounter {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record<'_>) {
        if record.level() == log::Level::Warn && record.target() == OUTBOUND_TARGET {
            self.warnings.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flush(&self) {}
}

static COUNTER: WarnCounter = WarnCounter {
    warnings: AtomicUsize::new(0),
};

fn warnings() -> usize {
    COUNTER.warnings.load(Ordering::SeqCst)
}

fn free_udp_port() -> u16 {
    StdUdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_one_warning_per_dropped_frame() {
    log::set_logger(&COUNTER).unwrap();
    log::set_max_level(log::LevelFilter::Warn);

    // The buffer on its own.
    let mut buffer = OutboundBuffer::new(2);
    for i in 0..5u8 {
        buffer.push(vec![i]);
    }
    assert_eq!(warnings(), 3);
    assert_eq!(buffer.drain(), vec![vec![3], vec![4]]);

    // Through a running daemon whose controller port is held elsewhere.
    let before = warnings();
    let dir = TempDir::new().unwrap();
    let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = Config::default();
    config.bridge.controller = ControllerKind::Udp;
    config.bridge.controller_port = free_udp_port();
    config.bridge.controller_dest_port = free_udp_port();
    config.bridge.host_port = 0;
    config.bridge.host_dest_port = host.local_addr().unwrap().port();
    config.bridge.control_port = 0;
    config.midi.enabled = false;
    config.reconnect.initial_delay_ms = 20;
    config.reconnect.max_delay_ms = 200;
    config.reconnect.buffer_capacity = 3;
    let _squatter = StdUdpSocket::bind(("127.0.0.1", config.bridge.controller_port)).unwrap();

    let daemon = RunningDaemon::start(DaemonOptions::new(dir.path().to_path_buf(), config))
        .await
        .unwrap();
    let control_port = daemon.control_addr().port();

    for i in 0..5u8 {
        host.send_to(&[0x90, i, 0x40], daemon.host_addr()).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let status = send_command(control_port, ControlCommand::Status).await.unwrap();
            if status.payload.unwrap()["stats"]["dropped_outbound"] == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Timed out waiting for drops");

    // Reconnect attempts keep failing meanwhile; they must not add warnings
    // for this target.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(warnings() - before, 2);

    daemon.shutdown().await;
}
