//! Frame codecs for controller links.
//!
//! Two strategies, picked per transport kind:
//!
//! - [`Framing::Delimited`]: byte-oriented links (serial). Frames are COBS
//!   stuffed and `0x00`-terminated; see [`stream`] for the wire layout and
//!   how diagnostic text lines share the stream.
//! - [`Framing::Implicit`]: message-oriented links (UDP, WebSocket). One
//!   transport message is one frame.

pub mod cobs;
pub mod stream;

pub use stream::{encode_frame, StreamDecoder, StreamItem};

/// Framing strategy for a controller transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Marker + COBS + `0x00` delimiter on a continuous byte stream.
    Delimited,
    /// The transport already preserves message boundaries.
    Implicit,
}

impl Framing {
    /// Encode one frame for the wire.
    pub fn encode(self, frame: &[u8]) -> Vec<u8> {
        match self {
            Self::Delimited => encode_frame(frame),
            Self::Implicit => frame.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implicit_is_identity() {
        let frame = [0x00, 0xB0, 0x07, 0x64];
        assert_eq!(Framing::Implicit.encode(&frame), frame.to_vec());
    }

    #[test]
    fn test_delimited_output_has_single_trailing_zero() {
        let wire = Framing::Delimited.encode(&[0x00, 0x00, 0x01]);
        assert_eq!(wire.first(), Some(&stream::FRAME_MARKER));
        assert_eq!(wire.last(), Some(&stream::FRAME_DELIMITER));
        assert_eq!(wire.iter().filter(|&&b| b == 0).count(), 1);
    }
}
