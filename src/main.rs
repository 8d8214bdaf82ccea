//! midibridge CLI - relay daemon, control client and diagnostics.
//!
//! This is the main binary entry point. See the `midibridge` library for
//! the core functionality.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use midibridge::broadcast::{init_tee_logger, LogBroadcaster, LogMonitor, MonitorAttach};
use midibridge::config::{ControllerKind, RunMode};
use midibridge::control::client::EXIT_CTL_UNREACHABLE;
use midibridge::control::{run_ctl, send_command, timeout_for, ControlCommand, ControlResponse, ErrorCode};
use midibridge::device::{self, DeviceRegistry};
use midibridge::{BridgeError, Config, DaemonOptions};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Version of this build.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often `monitor` polls status when logs are unavailable.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(2);

// CLI
#[derive(Parser)]
#[command(name = "midibridge")]
#[command(version = VERSION)]
#[command(about = "Relay daemon bridging a MIDI controller to host software")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay daemon
    Run {
        /// Controller transport (overrides config)
        #[arg(long, value_enum)]
        controller: Option<ControllerKind>,
        /// Controller-side UDP/WebSocket port (overrides config)
        #[arg(long)]
        controller_port: Option<u16>,
        /// Port receiving host datagrams (overrides config)
        #[arg(long)]
        host_port: Option<u16>,
        /// Foreground, logs to stderr
        #[arg(long, conflicts_with = "daemon")]
        headless: bool,
        /// Background mode, logs to the config directory
        #[arg(long)]
        daemon: bool,
        /// Ask a running instance to exit and take over
        #[arg(long)]
        replace: bool,
    },
    /// Send a control command to the running daemon
    Ctl {
        /// Command to send
        #[arg(value_enum)]
        command: ControlCommand,
    },
    /// List serial ports and which one matches the configured device
    Devices,
    /// Follow daemon logs
    Monitor,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            controller,
            controller_port,
            host_port,
            headless,
            daemon,
            replace,
        } => run(controller, controller_port, host_port, headless, daemon, replace).await,
        Commands::Ctl { command } => {
            init_cli_logging();
            let code = ctl(command).await;
            std::process::exit(code);
        }
        Commands::Devices => {
            init_cli_logging();
            devices()
        }
        Commands::Monitor => {
            init_cli_logging();
            monitor().await
        }
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        eprintln!("Error: {e:#}");
        let code = e.downcast_ref::<BridgeError>().map_or(1, BridgeError::exit_code);
        std::process::exit(code);
    }
}

async fn run(
    controller: Option<ControllerKind>,
    controller_port: Option<u16>,
    host_port: Option<u16>,
    headless: bool,
    daemon: bool,
    replace: bool,
) -> Result<()> {
    let config_dir = Config::config_dir()?;
    let mut config = Config::load_from_dir(&config_dir);
    if let Some(controller) = controller {
        config.bridge.controller = controller;
    }
    if let Some(port) = controller_port {
        config.bridge.controller_port = port;
    }
    if let Some(port) = host_port {
        config.bridge.host_port = port;
    }
    if headless {
        config.bridge.mode = RunMode::Headless;
    } else if daemon {
        config.bridge.mode = RunMode::Daemon;
    }

    let (broadcaster, pump) =
        LogBroadcaster::channel(SocketAddr::from((Ipv4Addr::LOCALHOST, config.bridge.log_port)));
    init_daemon_logging(&config_dir, config.bridge.mode, broadcaster.clone())?;
    log::info!(
        "midibridge v{VERSION} starting ({:?} mode, config: {})",
        config.bridge.mode,
        config_dir.display()
    );

    midibridge::daemon::run(DaemonOptions {
        config_dir,
        config,
        replace,
        broadcaster,
        pump: Some(pump),
    })
    .await
}

/// Headless logs to stderr; daemon mode logs to `<config_dir>/midibridge.log`.
fn init_daemon_logging(config_dir: &Path, mode: RunMode, broadcaster: LogBroadcaster) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if mode == RunMode::Daemon {
        let log_path = config_dir.join("midibridge.log");
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file at {}", log_path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }
    init_tee_logger(builder, broadcaster)
}

fn init_cli_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .try_init();
}

/// Print the response line on stdout and map it to an exit code.
async fn ctl(command: ControlCommand) -> i32 {
    let (response, code) = match Config::config_dir() {
        Ok(config_dir) => {
            let config = Config::load_from_dir(&config_dir);
            let timeout = timeout_for(command, &config.timeouts);
            run_ctl(config.bridge.control_port, command, timeout).await
        }
        Err(e) => (
            ControlResponse::error_with_message(ErrorCode::Unreachable, format!("{e:#}")),
            EXIT_CTL_UNREACHABLE,
        ),
    };
    println!("{}", response.to_line());
    code
}

fn devices() -> Result<()> {
    let config_dir = Config::config_dir()?;
    let config = Config::load_from_dir(&config_dir);
    let registry = DeviceRegistry::new(&config_dir);
    let descriptor = registry.load(&config.bridge.device)?;

    let ports = device::enumerate_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in &ports {
        let usb = port
            .usb
            .map_or_else(|| "-".to_string(), |u| format!("{:04x}:{:04x}", u.vid, u.pid));
        println!("{:<24} {:<10} {}", port.name, usb, port.label.as_deref().unwrap_or(""));
    }
    println!();

    let names = registry.names();
    if !names.is_empty() {
        println!("Descriptors: {}", names.join(", "));
    }
    match device::select_port(&descriptor, &ports, device::current_platform()) {
        Ok(port) => println!("Descriptor '{}' selects {}", descriptor.name, port.name),
        Err(e) => println!("Descriptor '{}': {e}", descriptor.name),
    }
    Ok(())
}

async fn monitor() -> Result<()> {
    let config_dir = Config::config_dir()?;
    let config = Config::load_from_dir(&config_dir);
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.bridge.log_port));

    match LogMonitor::attach(addr).await {
        MonitorAttach::Attached(mut monitor) => {
            println!("Listening for logs on {addr} (Ctrl-C to stop)");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    entry = monitor.recv() => {
                        let entry = entry?;
                        println!(
                            "{} [{}] {}",
                            entry.timestamp.format("%H:%M:%S%.3f"),
                            entry.kind,
                            entry.message
                        );
                    }
                }
            }
        }
        MonitorAttach::Unavailable(reason) => {
            println!("Logs unavailable ({reason}); polling status instead");
            let mut ticker = tokio::time::interval(MONITOR_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => match send_command(config.bridge.control_port, ControlCommand::Status).await {
                        Ok(response) => println!("{}", response.to_line()),
                        Err(e) => println!("{e}"),
                    },
                }
            }
        }
    }
    Ok(())
}
