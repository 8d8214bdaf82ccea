//! Virtual MIDI backend selection.
//!
//! All platform knowledge sits in [`detect_capability`]; everything else
//! branches once on the [`Capability`] it returns, inside [`open_backend`].
//!
//! ```text
//!  detect_capability ──► NativeAvailable ──► EndpointDescription ──open──► MidiEndpoint
//!                    ├─► ExternalPortsFound ──connect by name──────────► MidiEndpoint
//!                    ├─► NeedsSetup(instructions) ──► MidiBackendUnavailable
//!                    └─► Disabled(reason) ─────────► MidiBackendUnavailable
//! ```
//!
//! Native ports (ALSA sequencer, CoreMIDI) go through `midir` virtual
//! ports and need the `virtual-midi` feature. A described endpoint is not
//! visible to other applications until [`PendingEndpoint::open`] runs.

use std::fmt;
use std::sync::mpsc as std_mpsc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::{MidiBackendPreference, MidiConfig};
use crate::error::BridgeError;

/// What this machine can do for virtual MIDI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// The OS can create virtual ports directly.
    NativeAvailable,
    /// Existing ports matching the configured name.
    ExternalPortsFound(Vec<String>),
    /// No usable port; the operator must create one.
    NeedsSetup(SetupInstructions),
    /// MIDI is switched off or unsupported in this build.
    Disabled(String),
}

/// Actionable steps for platforms without native virtual ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupInstructions {
    /// Exact port name the daemon searches for.
    pub port_name: String,
    /// Ordered steps.
    pub steps: Vec<String>,
}

impl SetupInstructions {
    /// Loopback-utility instructions for `port_name`.
    pub fn loopback(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            steps: vec![
                "Install a loopback MIDI utility (for example loopMIDI).".to_string(),
                format!("Create a port named exactly \"{port_name}\"."),
                "Restart midibridge.".to_string(),
            ],
        }
    }
}

impl fmt::Display for SetupInstructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no MIDI port named \"{}\" found:", self.port_name)?;
        for (i, step) in self.steps.iter().enumerate() {
            write!(f, " {}. {}", i + 1, step)?;
        }
        Ok(())
    }
}

/// Direction of a function block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDirection {
    /// Receives from applications.
    Input,
    /// Sends to applications.
    Output,
    /// Both.
    Bidirectional,
}

/// A declared functional unit of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBlock {
    /// Block index.
    pub index: u8,
    /// Display name.
    pub name: String,
    /// Data direction.
    pub direction: BlockDirection,
    /// First group (0-15).
    pub first_group: u8,
    /// Number of groups spanned.
    pub group_count: u8,
}

/// Identity of the virtual endpoint shown to DAWs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescription {
    /// Port name.
    pub name: String,
    /// Manufacturer string.
    pub manufacturer: String,
    /// Declared blocks; at least one.
    pub function_blocks: Vec<FunctionBlock>,
}

impl EndpointDescription {
    /// Single bidirectional block on group 0.
    pub fn for_port(name: &str) -> Self {
        Self {
            name: name.to_string(),
            manufacturer: "midibridge".to_string(),
            function_blocks: vec![FunctionBlock {
                index: 0,
                name: name.to_string(),
                direction: BlockDirection::Bidirectional,
                first_group: 0,
                group_count: 1,
            }],
        }
    }

    /// Reject descriptions that no device-services API would accept.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.function_blocks.is_empty() {
            return Err(BridgeError::MidiBackendUnavailable(format!(
                "endpoint '{}' declares no function blocks",
                self.name
            )));
        }
        if let Some(block) = self
            .function_blocks
            .iter()
            .find(|b| b.group_count == 0 || u16::from(b.first_group) + u16::from(b.group_count) > 16)
        {
            return Err(BridgeError::MidiBackendUnavailable(format!(
                "function block '{}' spans invalid groups",
                block.name
            )));
        }
        Ok(())
    }
}

/// A validated endpoint that is not yet visible to other applications.
#[derive(Debug)]
pub struct PendingEndpoint {
    description: EndpointDescription,
}

impl PendingEndpoint {
    /// Validate `description`.
    pub fn new(description: EndpointDescription) -> Result<Self, BridgeError> {
        description.validate()?;
        Ok(Self { description })
    }

    /// Description that will be published.
    pub fn description(&self) -> &EndpointDescription {
        &self.description
    }

    /// Create the port. Only now does it become visible.
    pub fn open(self, input: UnboundedSender<Vec<u8>>) -> Result<MidiEndpoint, BridgeError> {
        native::open_virtual(&self.description.name, input)
    }
}

/// An open MIDI port owned by a dedicated output thread.
#[derive(Debug)]
pub struct MidiEndpoint {
    name: String,
    tx: std_mpsc::Sender<Vec<u8>>,
}

impl MidiEndpoint {
    #[cfg_attr(not(feature = "virtual-midi"), allow(dead_code))]
    pub(crate) fn from_sender(name: String, tx: std_mpsc::Sender<Vec<u8>>) -> Self {
        Self { name, tx }
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue raw MIDI bytes for the port. Silently dropped once closed.
    pub fn send(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(bytes);
    }
}

/// Classify the platform without touching any port.
pub fn detect_capability(config: &MidiConfig) -> Capability {
    classify(
        config,
        native::SUPPORTED,
        native::list_output_ports,
    )
}

fn classify(
    config: &MidiConfig,
    native_supported: bool,
    list_ports: impl FnOnce() -> Result<Vec<String>, String>,
) -> Capability {
    if !config.enabled || config.backend == MidiBackendPreference::Disabled {
        return Capability::Disabled("disabled in configuration".to_string());
    }
    if !native::COMPILED {
        return Capability::Disabled("built without the virtual-midi feature".to_string());
    }
    let want_native = matches!(
        config.backend,
        MidiBackendPreference::Auto | MidiBackendPreference::Native
    );
    if want_native && native_supported {
        return Capability::NativeAvailable;
    }
    if config.backend == MidiBackendPreference::Native {
        return Capability::Disabled("native virtual ports are not available on this platform".to_string());
    }

    match list_ports() {
        Ok(ports) => {
            let found: Vec<String> = ports
                .into_iter()
                .filter(|p| p.contains(config.port_name.as_str()))
                .collect();
            if found.is_empty() {
                Capability::NeedsSetup(SetupInstructions::loopback(&config.port_name))
            } else {
                Capability::ExternalPortsFound(found)
            }
        }
        Err(e) => Capability::Disabled(format!("cannot enumerate MIDI ports: {e}")),
    }
}

/// The one place that acts on a [`Capability`].
///
/// `input` receives raw bytes that DAWs send to the port.
pub fn open_backend(
    capability: Capability,
    config: &MidiConfig,
    input: UnboundedSender<Vec<u8>>,
) -> Result<MidiEndpoint, BridgeError> {
    match capability {
        Capability::NativeAvailable => {
            let pending = PendingEndpoint::new(EndpointDescription::for_port(&config.port_name))?;
            log::info!(
                "[Midi] Opening virtual endpoint '{}' ({} function block(s))",
                pending.description().name,
                pending.description().function_blocks.len()
            );
            pending.open(input)
        }
        Capability::ExternalPortsFound(ports) => {
            let target = ports
                .iter()
                .find(|p| **p == config.port_name)
                .or_else(|| ports.first())
                .cloned()
                .ok_or_else(|| BridgeError::MidiBackendUnavailable("no external port".into()))?;
            log::info!("[Midi] Connecting to external port '{target}'");
            native::connect_external(&target, input)
        }
        Capability::NeedsSetup(instructions) => {
            Err(BridgeError::MidiBackendUnavailable(instructions.to_string()))
        }
        Capability::Disabled(reason) => Err(BridgeError::MidiBackendUnavailable(reason)),
    }
}

#[cfg(feature = "virtual-midi")]
mod native {
    use std::sync::mpsc as std_mpsc;

    use midir::{Ignore, MidiInput, MidiOutput};
    use tokio::sync::mpsc::UnboundedSender;

    use super::MidiEndpoint;
    use crate::error::BridgeError;

    pub(super) const COMPILED: bool = true;
    pub(super) const SUPPORTED: bool = cfg!(any(target_os = "linux", target_os = "macos"));

    const CLIENT_NAME: &str = "midibridge";

    fn unavailable(e: impl std::fmt::Display) -> BridgeError {
        BridgeError::MidiBackendUnavailable(e.to_string())
    }

    pub(super) fn list_output_ports() -> Result<Vec<String>, String> {
        let output = MidiOutput::new(CLIENT_NAME).map_err(|e| e.to_string())?;
        Ok(output
            .ports()
            .iter()
            .filter_map(|p| output.port_name(p).ok())
            .collect())
    }

    /// Spawn the thread that owns the connections; waits until they exist.
    fn spawn_owner<F>(name: &str, setup: F) -> Result<MidiEndpoint, BridgeError>
    where
        F: FnOnce() -> Result<Box<dyn FnMut(&[u8])>, BridgeError> + Send + 'static,
    {
        let (tx, rx) = std_mpsc::channel::<Vec<u8>>();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let thread_name = name.to_string();
        std::thread::Builder::new()
            .name("midi-out".into())
            .spawn(move || {
                let mut send = match setup() {
                    Ok(send) => {
                        let _ = ready_tx.send(Ok(()));
                        send
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while let Ok(bytes) = rx.recv() {
                    send(&bytes);
                }
                log::debug!("[Midi] Port '{thread_name}' closed");
            })?;
        ready_rx
            .recv()
            .map_err(|_| unavailable("MIDI thread exited during setup"))??;
        Ok(MidiEndpoint::from_sender(name.to_string(), tx))
    }

    #[cfg(unix)]
    pub(super) fn open_virtual(
        name: &str,
        input: UnboundedSender<Vec<u8>>,
    ) -> Result<MidiEndpoint, BridgeError> {
        use midir::os::unix::{VirtualInput, VirtualOutput};

        let port_name = name.to_string();
        spawn_owner(name, move || {
            let mut out = MidiOutput::new(CLIENT_NAME)
                .map_err(unavailable)?
                .create_virtual(&port_name)
                .map_err(unavailable)?;
            let mut midi_in = MidiInput::new(CLIENT_NAME).map_err(unavailable)?;
            midi_in.ignore(Ignore::None);
            let input_conn = midi_in
                .create_virtual(
                    &port_name,
                    move |_ts, bytes, _| {
                        let _ = input.send(bytes.to_vec());
                    },
                    (),
                )
                .map_err(unavailable)?;
            Ok(Box::new(move |bytes: &[u8]| {
                // Keep the input side alive as long as the output side.
                let _keep = &input_conn;
                if let Err(e) = out.send(bytes) {
                    log::warn!("[Midi] Send failed: {e}");
                }
            }))
        })
    }

    #[cfg(not(unix))]
    pub(super) fn open_virtual(
        _name: &str,
        _input: UnboundedSender<Vec<u8>>,
    ) -> Result<MidiEndpoint, BridgeError> {
        Err(unavailable("virtual ports are not supported on this platform"))
    }

    pub(super) fn connect_external(
        name: &str,
        input: UnboundedSender<Vec<u8>>,
    ) -> Result<MidiEndpoint, BridgeError> {
        let port_name = name.to_string();
        spawn_owner(name, move || {
            let output = MidiOutput::new(CLIENT_NAME).map_err(unavailable)?;
            let out_port = output
                .ports()
                .into_iter()
                .find(|p| output.port_name(p).is_ok_and(|n| n == port_name))
                .ok_or_else(|| unavailable(format!("port '{port_name}' disappeared")))?;
            let mut out = output.connect(&out_port, CLIENT_NAME).map_err(unavailable)?;

            let mut midi_in = MidiInput::new(CLIENT_NAME).map_err(unavailable)?;
            midi_in.ignore(Ignore::None);
            let in_port = midi_in
                .ports()
                .into_iter()
                .find(|p| midi_in.port_name(p).is_ok_and(|n| n == port_name));
            let input_conn = match in_port {
                Some(port) => Some(
                    midi_in
                        .connect(
                            &port,
                            CLIENT_NAME,
                            move |_ts, bytes, _| {
                                let _ = input.send(bytes.to_vec());
                            },
                            (),
                        )
                        .map_err(unavailable)?,
                ),
                None => None,
            };
            Ok(Box::new(move |bytes: &[u8]| {
                let _keep = &input_conn;
                if let Err(e) = out.send(bytes) {
                    log::warn!("[Midi] Send failed: {e}");
                }
            }))
        })
    }
}

#[cfg(not(feature = "virtual-midi"))]
mod native {
    use tokio::sync::mpsc::UnboundedSender;

    use super::MidiEndpoint;
    use crate::error::BridgeError;

    pub(super) const COMPILED: bool = false;
    pub(super) const SUPPORTED: bool = false;

    const REASON: &str = "built without the virtual-midi feature";

    pub(super) fn list_output_ports() -> Result<Vec<String>, String> {
        Err(REASON.to_string())
    }

    pub(super) fn open_virtual(
        _name: &str,
        _input: UnboundedSender<Vec<u8>>,
    ) -> Result<MidiEndpoint, BridgeError> {
        Err(BridgeError::MidiBackendUnavailable(REASON.to_string()))
    }

    pub(super) fn connect_external(
        _name: &str,
        _input: UnboundedSender<Vec<u8>>,
    ) -> Result<MidiEndpoint, BridgeError> {
        Err(BridgeError::MidiBackendUnavailable(REASON.to_string()))
    }
}
