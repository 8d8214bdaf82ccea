//! Configuration loading.
//!
//! Reads the per-user `config.toml`:
//!
//! ```toml
//! [bridge]
//! mode = "headless"          # or "daemon"
//! controller = "serial"      # serial | udp | ws
//! controller_port = 9100
//! host_port = 9000
//! device = "default"         # name of devices/<name>.toml
//!
//! [midi]
//! enabled = true
//! port_name = "midibridge"
//! backend = "auto"           # auto | native | external | disabled
//!
//! [reconnect]
//! initial_delay_ms = 500
//! max_delay_ms = 30000
//! buffer_capacity = 256
//!
//! [timeouts]
//! pause_close_ms = 2000
//! lock_release_ms = 5000
//! ```
//!
//! A file that fails to parse is not fatal: the daemon logs a warning and
//! runs on defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONTROLLER_DEST_PORT, DEFAULT_CONTROLLER_PORT, DEFAULT_CONTROL_PORT,
    DEFAULT_HOST_DEST_PORT, DEFAULT_HOST_PORT, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_LOCK_RELEASE_TIMEOUT, DEFAULT_LOG_PORT, DEFAULT_MAX_BACKOFF,
    DEFAULT_OUTBOUND_CAPACITY, DEFAULT_PAUSE_CLOSE_TIMEOUT, MAX_RECONNECT_DELAY,
};
use crate::error::BridgeError;

/// Name of the configuration file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// How the daemon presents itself.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Foreground, logs to stderr.
    #[default]
    Headless,
    /// Background service, logs to a file in the config directory.
    Daemon,
}

/// Which controller transport to run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    /// USB virtual serial device found through the device registry.
    #[default]
    Serial,
    /// Datagram link (networked controller).
    Udp,
    /// WebSocket server (browser-hosted simulator).
    Ws,
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Udp => write!(f, "udp"),
            Self::Ws => write!(f, "ws"),
        }
    }
}

/// Preferred virtual MIDI backend.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MidiBackendPreference {
    /// Native virtual ports when the OS has them, external ports otherwise.
    #[default]
    Auto,
    /// Only native virtual ports.
    Native,
    /// Only an existing port created by a loopback utility.
    External,
    /// Never open a MIDI port.
    Disabled,
}

/// `[bridge]` section.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Run mode.
    pub mode: RunMode,
    /// Controller transport.
    pub controller: ControllerKind,
    /// UDP bind port or WebSocket listen port for the controller side.
    pub controller_port: u16,
    /// Destination port for UDP controllers.
    pub controller_dest_port: u16,
    /// Port receiving datagrams from the host software.
    pub host_port: u16,
    /// Port the host software listens on.
    pub host_dest_port: u16,
    /// Control-plane port on 127.0.0.1.
    pub control_port: u16,
    /// Log broadcast port on 127.0.0.1.
    pub log_port: u16,
    /// Device descriptor name (`devices/<name>.toml`).
    pub device: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Headless,
            controller: ControllerKind::Serial,
            controller_port: DEFAULT_CONTROLLER_PORT,
            controller_dest_port: DEFAULT_CONTROLLER_DEST_PORT,
            host_port: DEFAULT_HOST_PORT,
            host_dest_port: DEFAULT_HOST_DEST_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            log_port: DEFAULT_LOG_PORT,
            device: crate::device::DEFAULT_DESCRIPTOR_NAME.to_string(),
        }
    }
}

/// `[midi]` section.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MidiConfig {
    /// Whether to expose a virtual MIDI port at all.
    pub enabled: bool,
    /// Port name shown to DAWs (and searched for on external backends).
    pub port_name: String,
    /// Backend preference.
    pub backend: MidiBackendPreference,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port_name: "midibridge".to_string(),
            backend: MidiBackendPreference::Auto,
        }
    }
}

/// `[reconnect]` section. Hot-reloadable.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay after a failure, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on the retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Outbound frames buffered while the controller is away.
    pub buffer_capacity: usize,
}

impl ReconnectConfig {
    /// Initial delay as a `Duration`, capped at [`MAX_RECONNECT_DELAY`].
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms).min(MAX_RECONNECT_DELAY)
    }

    /// Maximum delay as a `Duration` (never below the initial delay, never
    /// above [`MAX_RECONNECT_DELAY`]).
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms)).min(MAX_RECONNECT_DELAY)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_BACKOFF.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
            buffer_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// `[timeouts]` section.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound on waiting for the device handle to close during `pause`.
    pub pause_close_ms: u64,
    /// Upper bound on waiting for a previous instance to release the lock.
    pub lock_release_ms: u64,
}

impl TimeoutConfig {
    /// Pause close timeout as a `Duration`.
    pub fn pause_close(&self) -> Duration {
        Duration::from_millis(self.pause_close_ms)
    }

    /// Lock release timeout as a `Duration`.
    pub fn lock_release(&self) -> Duration {
        Duration::from_millis(self.lock_release_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            pause_close_ms: DEFAULT_PAUSE_CLOSE_TIMEOUT.as_millis() as u64,
            lock_release_ms: DEFAULT_LOCK_RELEASE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Configuration for the bridge daemon.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Transport and port settings.
    pub bridge: BridgeConfig,
    /// Virtual MIDI port settings.
    pub midi: MidiConfig,
    /// Backoff and buffering.
    pub reconnect: ReconnectConfig,
    /// Hand-off windows.
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `MIDIBRIDGE_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir joined with `midibridge`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("MIDIBRIDGE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("midibridge")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        Ok(dir)
    }

    /// Path of `config.toml` inside `dir`.
    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE_NAME)
    }

    /// Parse a config file.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    pub fn parse_file(path: &Path) -> Result<Option<Self>, BridgeError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| BridgeError::ConfigParseError {
                path: path.to_path_buf(),
                message: e.message().to_string(),
            })
    }

    /// Load `config.toml` from `dir`, falling back to defaults.
    ///
    /// Parse errors are logged and never fatal. Environment overrides are
    /// applied last.
    pub fn load_from_dir(dir: &Path) -> Self {
        let path = Self::file_path(dir);
        let mut config = match Self::parse_file(&path) {
            Ok(Some(config)) => config,
            Ok(None) => {
                log::debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                log::warn!("{e}; falling back to default configuration");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    /// Re-read `config.toml` for a live reload.
    ///
    /// Unlike [`load_from_dir`](Self::load_from_dir), a parse error is
    /// returned so the caller can keep the configuration in effect.
    pub fn reload_from_dir(dir: &Path) -> Result<Self, BridgeError> {
        let mut config = Self::parse_file(&Self::file_path(dir))?.unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_port("MIDIBRIDGE_CONTROL_PORT") {
            self.bridge.control_port = port;
        }
        if let Some(port) = env_port("MIDIBRIDGE_LOG_PORT") {
            self.bridge.log_port = port;
        }
        if let Some(port) = env_port("MIDIBRIDGE_HOST_PORT") {
            self.bridge.host_port = port;
        }
    }

    /// Whether switching from `self` to `next` needs a daemon restart.
    ///
    /// Only `[reconnect]` and `[timeouts]` apply live.
    pub fn restart_required(&self, next: &Self) -> bool {
        self.bridge != next.bridge || self.midi != next.midi
    }

    /// Write this configuration to `path` (used by tests and first-run setup).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bridge.controller, ControllerKind::Serial);
        assert_eq!(config.bridge.control_port, DEFAULT_CONTROL_PORT);
        assert!(config.midi.enabled);
        assert_eq!(config.reconnect.buffer_capacity, DEFAULT_OUTBOUND_CAPACITY);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = Config::file_path(tmp.path());
        fs::write(&path, "[bridge]\ncontroller = \"udp\"\nhost_port = 9500\n").unwrap();

        let config = Config::parse_file(&path).unwrap().unwrap();
        assert_eq!(config.bridge.controller, ControllerKind::Udp);
        assert_eq!(config.bridge.host_port, 9500);
        assert_eq!(config.bridge.controller_port, DEFAULT_CONTROLLER_PORT);
        assert_eq!(config.midi, MidiConfig::default());
    }

    #[test]
    fn test_missing_file_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(Config::parse_file(&tmp.path().join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn test_parse_error_is_typed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = Config::file_path(tmp.path());
        fs::write(&path, "[bridge\ncontroller = ").unwrap();

        let err = Config::parse_file(&path).unwrap_err();
        assert_eq!(err.code(), "config_parse_error");
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_parse_error_falls_back_to_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(Config::file_path(tmp.path()), "not = [valid").unwrap();
        let config = Config::load_from_dir(tmp.path());
        assert_eq!(config.bridge.controller, ControllerKind::Serial);
        assert_eq!(config.midi, MidiConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = Config::file_path(tmp.path());
        let mut config = Config::default();
        config.bridge.controller = ControllerKind::Ws;
        config.midi.port_name = "Pad Out".into();
        config.save_to(&path).unwrap();

        assert_eq!(Config::parse_file(&path).unwrap(), Some(config));
    }

    #[test]
    fn test_restart_required_only_for_bridge_and_midi() {
        let base = Config::default();

        let mut backoff = base.clone();
        backoff.reconnect.max_delay_ms = 1_000;
        backoff.timeouts.pause_close_ms = 100;
        assert!(!base.restart_required(&backoff));

        let mut ports = base.clone();
        ports.bridge.host_port += 1;
        assert!(base.restart_required(&ports));

        let mut midi = base.clone();
        midi.midi.enabled = false;
        assert!(base.restart_required(&midi));
    }

    #[test]
    fn test_reload_surfaces_parse_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(Config::reload_from_dir(tmp.path()).unwrap().midi, MidiConfig::default());

        fs::write(Config::file_path(tmp.path()), "[reconnect\n").unwrap();
        assert!(matches!(
            Config::reload_from_dir(tmp.path()),
            Err(BridgeError::ConfigParseError { .. })
        ));
    }

    #[test]
    fn test_max_delay_never_below_initial() {
        let cfg = ReconnectConfig { initial_delay_ms: 800, max_delay_ms: 100, buffer_capacity: 1 };
        assert_eq!(cfg.max_delay(), Duration::from_millis(800));
    }

    #[test]
    fn test_huge_delays_are_capped() {
        let cfg = ReconnectConfig {
            initial_delay_ms: u64::MAX,
            max_delay_ms: u64::MAX,
            buffer_capacity: 1,
        };
        assert_eq!(cfg.initial_delay(), MAX_RECONNECT_DELAY);
        assert_eq!(cfg.max_delay(), MAX_RECONNECT_DELAY);
    }
}
