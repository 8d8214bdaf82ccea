//! End-to-end relay scenarios over UDP, driven through the control plane.
//!
//! The UDP controller stands in for a device: "attached" means its port is
//! free for the daemon to bind, "held elsewhere" means another socket owns
//! it.

use std::net::UdpSocket as StdUdpSocket;
use std::time::Duration;

use midibridge::config::ControllerKind;
use midibridge::control::{send_command, ControlCommand, ErrorCode};
use midibridge::{Config, DaemonOptions, RunningDaemon};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::UdpSocket;

fn free_udp_port() -> u16 {
    StdUdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Rig {
    _dir: TempDir,
    daemon: RunningDaemon,
    control_port: u16,
    controller_port: u16,
    /// Plays the controller.
    controller: UdpSocket,
    /// Plays the host software.
    host: UdpSocket,
}

async fn start_rig(buffer_capacity: usize, before_start: impl FnOnce(u16)) -> Rig {
    let dir = TempDir::new().unwrap();
    let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut config = Config::default();
    config.bridge.controller = ControllerKind::Udp;
    config.bridge.controller_port = free_udp_port();
    config.bridge.controller_dest_port = controller.local_addr().unwrap().port();
    config.bridge.host_port = 0;
    config.bridge.host_dest_port = host.local_addr().unwrap().port();
    config.bridge.control_port = 0;
    config.midi.enabled = false;
    config.reconnect.initial_delay_ms = 20;
    config.reconnect.max_delay_ms = 200;
    config.reconnect.buffer_capacity = buffer_capacity;

    let controller_port = config.bridge.controller_port;
    before_start(controller_port);

    let daemon = RunningDaemon::start(DaemonOptions::new(dir.path().to_path_buf(), config))
        .await
        .unwrap();
    let control_port = daemon.control_addr().port();
    Rig {
        _dir: dir,
        daemon,
        control_port,
        controller_port,
        controller,
        host,
    }
}

async fn status(rig: &Rig) -> Value {
    let response = send_command(rig.control_port, ControlCommand::Status).await.unwrap();
    assert!(response.ok);
    response.payload.unwrap()
}

async fn wait_for_status(rig: &Rig, pred: impl Fn(&Value) -> bool) -> Value {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let s = status(rig).await;
            if pred(&s) {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Timed out waiting for status")
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("Timed out waiting for datagram")
        .unwrap();
    buf[..n].to_vec()
}

#[tokio::test]
async fn test_connects_once_controller_becomes_available() {
    let squatter = std::sync::Mutex::new(None);
    let rig = start_rig(8, |port| {
        *squatter.lock().unwrap() = Some(StdUdpSocket::bind(("127.0.0.1", port)).unwrap());
    })
    .await;

    let s = wait_for_status(&rig, |s| s["last_error"].is_string()).await;
    assert_eq!(s["connected"], false);
    assert_eq!(s["last_error"], "transport_disconnected");

    drop(squatter.lock().unwrap().take());
    let s = wait_for_status(&rig, |s| s["connected"] == true).await;
    assert!(s["session"]["endpoint"].is_string());
    assert!(s["last_error"].is_null());

    rig.daemon.shutdown().await;
}

#[tokio::test]
async fn test_pause_releases_controller_and_resume_reacquires() {
    let rig = start_rig(8, |_| {}).await;
    wait_for_status(&rig, |s| s["connected"] == true).await;

    let line = send_command(rig.control_port, ControlCommand::Pause).await.unwrap().to_line();
    assert_eq!(line, r#"{"schema":1,"ok":true}"#);

    // The reply means the port is already free.
    let flasher = StdUdpSocket::bind(("127.0.0.1", rig.controller_port))
        .expect("paused daemon must release the controller");
    let s = status(&rig).await;
    assert_eq!(s["paused"], true);
    assert_eq!(s["connected"], false);

    // Idempotent while paused.
    assert!(send_command(rig.control_port, ControlCommand::Pause).await.unwrap().ok);
    drop(flasher);

    assert!(send_command(rig.control_port, ControlCommand::Resume).await.unwrap().ok);
    assert!(send_command(rig.control_port, ControlCommand::Resume).await.unwrap().ok);
    let s = wait_for_status(&rig, |s| s["connected"] == true).await;
    assert_eq!(s["paused"], false);
    assert_eq!(s["stats"]["sessions"], 2);

    // Relaying works again after the hand-back.
    rig.controller
        .send_to(&[0xB0, 0x07, 0x64], ("127.0.0.1", rig.controller_port))
        .await
        .unwrap();
    assert_eq!(recv(&rig.host).await, vec![0xB0, 0x07, 0x64]);

    rig.daemon.shutdown().await;
}

#[tokio::test]
async fn test_outbound_overflow_drops_oldest() {
    let squatter = std::sync::Mutex::new(None);
    let rig = start_rig(3, |port| {
        *squatter.lock().unwrap() = Some(StdUdpSocket::bind(("127.0.0.1", port)).unwrap());
    })
    .await;
    let host_addr = rig.daemon.host_addr();

    for i in 0..5u8 {
        rig.host.send_to(&[0x90, i, 0x40], host_addr).await.unwrap();
    }
    let s = wait_for_status(&rig, |s| s["stats"]["dropped_outbound"] == 2).await;
    assert_eq!(s["buffered"], 3);
    assert_eq!(s["connected"], false);

    drop(squatter.lock().unwrap().take());
    wait_for_status(&rig, |s| s["connected"] == true).await;
    for i in 2..5u8 {
        assert_eq!(recv(&rig.controller).await, vec![0x90, i, 0x40]);
    }
    let s = status(&rig).await;
    assert_eq!(s["buffered"], 0);

    rig.daemon.shutdown().await;
}

#[tokio::test]
async fn test_info_and_protocol_errors() {
    let rig = start_rig(8, |_| {}).await;

    let info = send_command(rig.control_port, ControlCommand::Info).await.unwrap();
    let payload = info.payload.unwrap();
    assert_eq!(payload["pid"], std::process::id());
    assert_eq!(payload["controller"], "udp");
    assert!(payload["midi_port"].is_null());

    // Raw line with an unknown command.
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    let stream = tokio::net::TcpStream::connect(rig.daemon.control_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"{\"schema\":1,\"cmd\":\"explode\"}\n").await.unwrap();
    let reply: midibridge::control::ControlResponse =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply.error, Some(ErrorCode::UnknownCommand));

    rig.daemon.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_command_stops_daemon() {
    let rig = start_rig(8, |_| {}).await;
    let dir = rig._dir.path().to_path_buf();

    assert!(send_command(rig.control_port, ControlCommand::Shutdown).await.unwrap().ok);
    tokio::time::timeout(Duration::from_secs(3), rig.daemon.wait())
        .await
        .expect("daemon should stop after shutdown");

    midibridge::lock::InstanceLock::acquire(&dir).expect("lock released");
}
