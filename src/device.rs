//! Device registry and serial auto-detection.
//!
//! Descriptors live as individual TOML documents under
//! `{config_dir}/devices/{name}.toml`:
//!
//! ```toml
//! name = "default"
//! vendor_id = 0x2E8A
//! product_id_list = [0x000A, 0x1020]
//!
//! [platform_name_hints]
//! linux = ["ttyACM"]
//! macos = ["usbmodem"]
//! windows = ["USB Serial Device"]
//! ```
//!
//! Detection filters enumerated serial ports by USB vendor/product id and
//! falls back to a substring match against the current platform's name
//! hints for ports that carry no USB metadata. It never picks one of
//! several matches.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Descriptor used when the configured name has no file on disk.
pub const DEFAULT_DESCRIPTOR_NAME: &str = "default";

/// Identifies which serial device is the controller.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Descriptor name (matches the file stem).
    pub name: String,
    /// USB vendor id.
    pub vendor_id: u16,
    /// Accepted USB product ids.
    pub product_id_list: Vec<u16>,
    /// Per-OS substrings matched against port names lacking USB metadata.
    #[serde(default)]
    pub platform_name_hints: HashMap<String, Vec<String>>,
}

impl DeviceDescriptor {
    /// Built-in descriptor (RP2040 CDC firmware).
    pub fn builtin() -> Self {
        let mut hints = HashMap::new();
        hints.insert("linux".to_string(), vec!["ttyACM".to_string()]);
        hints.insert("macos".to_string(), vec!["usbmodem".to_string()]);
        hints.insert("windows".to_string(), vec!["USB Serial Device".to_string()]);
        Self {
            name: DEFAULT_DESCRIPTOR_NAME.to_string(),
            vendor_id: 0x2E8A,
            product_id_list: vec![0x000A, 0x1020],
            platform_name_hints: hints,
        }
    }

    /// Name hints for `platform` (`linux`, `macos`, `windows`).
    pub fn hints_for(&self, platform: &str) -> &[String] {
        self.platform_name_hints
            .get(platform)
            .map_or(&[], Vec::as_slice)
    }

    fn matches(&self, port: &PortCandidate, platform: &str) -> bool {
        match port.usb {
            Some(usb) => usb.vid == self.vendor_id && self.product_id_list.contains(&usb.pid),
            None => self.hints_for(platform).iter().any(|hint| {
                port.name.contains(hint.as_str())
                    || port.label.as_deref().is_some_and(|l| l.contains(hint.as_str()))
            }),
        }
    }
}

/// USB identity of an enumerated port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIds {
    /// Vendor id.
    pub vid: u16,
    /// Product id.
    pub pid: u16,
}

/// One enumerated serial port, reduced to what detection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// OS path or name (`/dev/ttyACM0`, `COM3`).
    pub name: String,
    /// USB ids when the OS reports them.
    pub usb: Option<UsbIds>,
    /// Product string, if any.
    pub label: Option<String>,
}

impl From<serialport::SerialPortInfo> for PortCandidate {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                usb: Some(UsbIds { vid: usb.vid, pid: usb.pid }),
                label: usb.product,
            },
            _ => Self {
                name: info.port_name,
                usb: None,
                label: None,
            },
        }
    }
}

/// Current platform key for name hints.
pub fn current_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(windows) {
        "windows"
    } else {
        "linux"
    }
}

/// Pick the single port matching `descriptor`.
///
/// Zero matches is [`BridgeError::DeviceNotFound`]; more than one is
/// [`BridgeError::MultipleDevicesFound`].
pub fn select_port<'a>(
    descriptor: &DeviceDescriptor,
    ports: &'a [PortCandidate],
    platform: &str,
) -> Result<&'a PortCandidate, BridgeError> {
    let matches: Vec<&PortCandidate> = ports
        .iter()
        .filter(|port| descriptor.matches(port, platform))
        .collect();

    match matches.as_slice() {
        [] => Err(BridgeError::DeviceNotFound {
            descriptor: descriptor.name.clone(),
        }),
        [only] => Ok(only),
        many => Err(BridgeError::MultipleDevicesFound {
            descriptor: descriptor.name.clone(),
            count: many.len(),
        }),
    }
}

/// Enumerate serial ports on this machine.
pub fn enumerate_ports() -> Result<Vec<PortCandidate>, BridgeError> {
    let ports = serialport::available_ports()
        .map_err(|e| BridgeError::Io(std::io::Error::other(e.to_string())))?;
    Ok(ports.into_iter().map(PortCandidate::from).collect())
}

/// Enumerate and select in one step.
pub fn detect(descriptor: &DeviceDescriptor) -> Result<PortCandidate, BridgeError> {
    let ports = enumerate_ports()?;
    select_port(descriptor, &ports, current_platform()).cloned()
}

/// Load descriptors by name from `{config_dir}/devices/`.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    dir: std::path::PathBuf,
}

impl DeviceRegistry {
    /// Registry rooted at `{config_dir}/devices`.
    pub fn new(config_dir: &Path) -> Self {
        Self {
            dir: config_dir.join("devices"),
        }
    }

    /// Load the descriptor called `name`.
    ///
    /// Falls back to the built-in descriptor when `name` is the default and
    /// no file exists.
    pub fn load(&self, name: &str) -> Result<DeviceDescriptor> {
        let path = self.dir.join(format!("{name}.toml"));
        if !path.exists() {
            if name == DEFAULT_DESCRIPTOR_NAME {
                return Ok(DeviceDescriptor::builtin());
            }
            anyhow::bail!("Device descriptor not found: {}", path.display());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read descriptor: {}", path.display()))?;
        let descriptor: DeviceDescriptor = toml::from_str(&content)
            .with_context(|| format!("Invalid descriptor: {}", path.display()))?;
        Ok(descriptor)
    }

    /// Names of all descriptors on disk.
    pub fn names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != "toml" {
                    return None;
                }
                Some(path.file_stem()?.to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> PortCandidate {
        PortCandidate {
            name: name.into(),
            usb: Some(UsbIds { vid, pid }),
            label: None,
        }
    }

    fn bare(name: &str) -> PortCandidate {
        PortCandidate { name: name.into(), usb: None, label: None }
    }

    #[test]
    fn test_zero_matches_is_device_not_found() {
        let desc = DeviceDescriptor::builtin();
        let ports = vec![usb("/dev/ttyUSB0", 0x0403, 0x6001)];
        let err = select_port(&desc, &ports, "linux").unwrap_err();
        assert!(matches!(err, BridgeError::DeviceNotFound { .. }));

        let err = select_port(&desc, &[], "linux").unwrap_err();
        assert!(matches!(err, BridgeError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_single_match_selected() {
        let desc = DeviceDescriptor::builtin();
        let ports = vec![
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyACM3", 0x2E8A, 0x000A),
        ];
        assert_eq!(select_port(&desc, &ports, "linux").unwrap().name, "/dev/ttyACM3");
    }

    #[test]
    fn test_many_matches_reports_count() {
        let desc = DeviceDescriptor::builtin();
        let ports = vec![
            usb("/dev/ttyACM0", 0x2E8A, 0x000A),
            usb("/dev/ttyACM1", 0x2E8A, 0x1020),
            usb("/dev/ttyACM2", 0x2E8A, 0x000A),
        ];
        match select_port(&desc, &ports, "linux") {
            Err(BridgeError::MultipleDevicesFound { count, .. }) => assert_eq!(count, 3),
            other => panic!("Expected MultipleDevicesFound, got: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_product_id_not_matched() {
        let desc = DeviceDescriptor::builtin();
        let ports = vec![usb("/dev/ttyACM0", 0x2E8A, 0x0003)];
        assert!(select_port(&desc, &ports, "linux").is_err());
    }

    #[test]
    fn test_name_hint_fallback_without_usb_metadata() {
        let desc = DeviceDescriptor::builtin();
        let ports = vec![bare("/dev/ttyS0"), bare("/dev/cu.usbmodem1101")];
        assert_eq!(
            select_port(&desc, &ports, "macos").unwrap().name,
            "/dev/cu.usbmodem1101"
        );
        // Linux hints do not match a macOS-style name.
        assert!(select_port(&desc, &ports, "linux").is_err());
    }

    #[test]
    fn test_hints_do_not_override_usb_mismatch() {
        let desc = DeviceDescriptor::builtin();
        let ports = vec![usb("/dev/ttyACM0", 0x1234, 0x5678)];
        assert!(select_port(&desc, &ports, "linux").is_err());
    }

    #[test]
    fn test_registry_loads_descriptor_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let devices = tmp.path().join("devices");
        fs::create_dir_all(&devices).unwrap();
        fs::write(
            devices.join("pad.toml"),
            "name = \"pad\"\nvendor_id = 4660\nproduct_id_list = [1, 2]\n\n[platform_name_hints]\nlinux = [\"ttyACM\"]\n",
        )
        .unwrap();

        let registry = DeviceRegistry::new(tmp.path());
        let desc = registry.load("pad").unwrap();
        assert_eq!(desc.vendor_id, 0x1234);
        assert_eq!(desc.product_id_list, vec![1, 2]);
        assert_eq!(desc.hints_for("linux"), ["ttyACM".to_string()]);
        assert!(desc.hints_for("windows").is_empty());
        assert_eq!(registry.names(), vec!["pad".to_string()]);
    }

    #[test]
    fn test_registry_default_falls_back_to_builtin() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = DeviceRegistry::new(tmp.path());
        assert_eq!(registry.load(DEFAULT_DESCRIPTOR_NAME).unwrap(), DeviceDescriptor::builtin());
        assert!(registry.load("missing").is_err());
    }
}
