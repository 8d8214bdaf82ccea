//! Virtual MIDI port fed from controller traffic.
//!
//! [`MidiBridge`] parses controller frames as a MIDI byte stream and
//! forwards every complete message to the open [`MidiEndpoint`]. Bytes
//! that are not MIDI are dropped by the parser; the relay path itself is
//! unaffected.

pub mod backend;
pub mod message;

pub use backend::{detect_capability, open_backend, Capability, MidiEndpoint};
pub use message::{MidiMessage, MidiStreamParser};

/// Tee from the relay into a MIDI port.
#[derive(Debug)]
pub struct MidiBridge {
    parser: MidiStreamParser,
    endpoint: MidiEndpoint,
}

impl MidiBridge {
    /// Bridge into an already opened endpoint.
    pub fn new(endpoint: MidiEndpoint) -> Self {
        Self {
            parser: MidiStreamParser::new(),
            endpoint,
        }
    }

    /// Port name.
    pub fn port_name(&self) -> &str {
        self.endpoint.name()
    }

    /// Parse `frame` and forward complete messages. Partial messages carry
    /// over to the next frame.
    pub fn offer(&mut self, frame: &[u8]) {
        for msg in self.parser.feed(frame) {
            self.endpoint.send(msg.encode());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_forwards_complete_messages() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut bridge = MidiBridge::new(MidiEndpoint::from_sender("Pad".into(), tx));
        assert_eq!(bridge.port_name(), "Pad");

        bridge.offer(&[0x90, 0x3C]);
        assert!(rx.try_recv().is_err());
        bridge.offer(&[0x7F, 0x3E, 0x40]);

        assert_eq!(rx.try_recv().unwrap(), vec![0x90, 0x3C, 0x7F]);
        assert_eq!(rx.try_recv().unwrap(), vec![0x90, 0x3E, 0x40]);
        assert!(rx.try_recv().is_err());
    }
}
