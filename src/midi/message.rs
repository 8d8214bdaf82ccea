//! MIDI 1.0 message model.
//!
//! | Message                | Bytes                     |
//! |------------------------|---------------------------|
//! | Note off/on, poly AT   | `8n/9n/An kk vv`          |
//! | Control change         | `Bn cc vv`                |
//! | Program change         | `Cn pp`                   |
//! | Channel pressure       | `Dn vv`                   |
//! | Pitch bend             | `En ll mm` (14-bit, LSB first) |
//! | System exclusive       | `F0 … F7`                 |
//! | MTC quarter frame      | `F1 dd`                   |
//! | Song position          | `F2 ll mm`                |
//! | Song select            | `F3 ss`                   |
//! | Tune request           | `F6`                      |
//! | Real-time              | `F8 FA FB FC FE FF`       |
//!
//! [`MidiStreamParser`] turns a byte stream into messages, handling running
//! status and real-time bytes interleaved inside other messages.

use thiserror::Error;

/// Errors decoding a single message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MidiError {
    /// No bytes.
    #[error("empty MIDI message")]
    Empty,
    /// First byte is not a usable status byte.
    #[error("invalid status byte 0x{0:02X}")]
    InvalidStatus(u8),
    /// Fewer bytes than the status requires.
    #[error("message truncated: expected {expected} bytes, got {got}")]
    Truncated {
        /// Bytes required by the status.
        expected: usize,
        /// Bytes available.
        got: usize,
    },
    /// More bytes than the status allows.
    #[error("trailing bytes after {expected}-byte message")]
    Trailing {
        /// Bytes required by the status.
        expected: usize,
    },
    /// A data byte has its high bit set.
    #[error("data byte 0x{0:02X} out of range")]
    DataOutOfRange(u8),
    /// SysEx without the closing `F7`.
    #[error("unterminated system exclusive message")]
    UnterminatedSysEx,
}

/// One MIDI 1.0 message. Channels are 0-15, data values 0-127.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// `8n`
    NoteOff {
        /// Channel 0-15.
        channel: u8,
        /// Note number.
        note: u8,
        /// Release velocity.
        velocity: u8,
    },
    /// `9n`
    NoteOn {
        /// Channel 0-15.
        channel: u8,
        /// Note number.
        note: u8,
        /// Velocity.
        velocity: u8,
    },
    /// `An`
    PolyPressure {
        /// Channel 0-15.
        channel: u8,
        /// Note number.
        note: u8,
        /// Pressure.
        pressure: u8,
    },
    /// `Bn`
    ControlChange {
        /// Channel 0-15.
        channel: u8,
        /// Controller number.
        controller: u8,
        /// Value.
        value: u8,
    },
    /// `Cn`
    ProgramChange {
        /// Channel 0-15.
        channel: u8,
        /// Program number.
        program: u8,
    },
    /// `Dn`
    ChannelPressure {
        /// Channel 0-15.
        channel: u8,
        /// Pressure.
        pressure: u8,
    },
    /// `En`, 14-bit value, center 8192.
    PitchBend {
        /// Channel 0-15.
        channel: u8,
        /// 0-16383.
        value: u16,
    },
    /// `F0 … F7`; payload excludes both markers.
    SysEx(Vec<u8>),
    /// `F1`
    TimeCodeQuarterFrame(u8),
    /// `F2`, 14-bit beat count.
    SongPosition(u16),
    /// `F3`
    SongSelect(u8),
    /// `F6`
    TuneRequest,
    /// `F8`
    TimingClock,
    /// `FA`
    Start,
    /// `FB`
    Continue,
    /// `FC`
    Stop,
    /// `FE`
    ActiveSensing,
    /// `FF`
    SystemReset,
}

/// Total length of a non-SysEx message with this status, or `None` for
/// SysEx and undefined statuses.
pub fn message_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF | 0xE0..=0xEF | 0xF2 => Some(3),
        0xC0..=0xDF | 0xF1 | 0xF3 => Some(2),
        0xF6 | 0xF8 | 0xFA | 0xFB | 0xFC | 0xFE | 0xFF => Some(1),
        _ => None,
    }
}

/// Whether `byte` is a System Real-Time status.
pub fn is_realtime(byte: u8) -> bool {
    matches!(byte, 0xF8 | 0xFA | 0xFB | 0xFC | 0xFE | 0xFF)
}

fn data(byte: u8) -> Result<u8, MidiError> {
    if byte & 0x80 == 0 {
        Ok(byte)
    } else {
        Err(MidiError::DataOutOfRange(byte))
    }
}

fn split14(value: u16) -> [u8; 2] {
    [(value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
}

fn join14(lsb: u8, msb: u8) -> u16 {
    u16::from(lsb) | (u16::from(msb) << 7)
}

impl MidiMessage {
    /// Wire bytes for this message. Out-of-range fields are masked.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::NoteOff { channel, note, velocity } => {
                vec![0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            Self::NoteOn { channel, note, velocity } => {
                vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            Self::PolyPressure { channel, note, pressure } => {
                vec![0xA0 | (channel & 0x0F), note & 0x7F, pressure & 0x7F]
            }
            Self::ControlChange { channel, controller, value } => {
                vec![0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F]
            }
            Self::ProgramChange { channel, program } => vec![0xC0 | (channel & 0x0F), program & 0x7F],
            Self::ChannelPressure { channel, pressure } => {
                vec![0xD0 | (channel & 0x0F), pressure & 0x7F]
            }
            Self::PitchBend { channel, value } => {
                let [lsb, msb] = split14(value);
                vec![0xE0 | (channel & 0x0F), lsb, msb]
            }
            Self::SysEx(ref payload) => {
                let mut out = Vec::with_capacity(payload.len() + 2);
                out.push(0xF0);
                out.extend(payload.iter().map(|b| b & 0x7F));
                out.push(0xF7);
                out
            }
            Self::TimeCodeQuarterFrame(v) => vec![0xF1, v & 0x7F],
            Self::SongPosition(v) => {
                let [lsb, msb] = split14(v);
                vec![0xF2, lsb, msb]
            }
            Self::SongSelect(v) => vec![0xF3, v & 0x7F],
            Self::TuneRequest => vec![0xF6],
            Self::TimingClock => vec![0xF8],
            Self::Start => vec![0xFA],
            Self::Continue => vec![0xFB],
            Self::Stop => vec![0xFC],
            Self::ActiveSensing => vec![0xFE],
            Self::SystemReset => vec![0xFF],
        }
    }

    /// Decode exactly one complete message.
    pub fn decode(bytes: &[u8]) -> Result<Self, MidiError> {
        let (&status, rest) = bytes.split_first().ok_or(MidiError::Empty)?;

        if status == 0xF0 {
            let Some((&last, payload)) = rest.split_last() else {
                return Err(MidiError::UnterminatedSysEx);
            };
            if last != 0xF7 {
                return Err(MidiError::UnterminatedSysEx);
            }
            for &b in payload {
                data(b)?;
            }
            return Ok(Self::SysEx(payload.to_vec()));
        }

        let expected = message_len(status).ok_or(MidiError::InvalidStatus(status))?;
        if bytes.len() < expected {
            return Err(MidiError::Truncated { expected, got: bytes.len() });
        }
        if bytes.len() > expected {
            return Err(MidiError::Trailing { expected });
        }
        let d1 = rest.first().copied().map(data).transpose()?.unwrap_or(0);
        let d2 = rest.get(1).copied().map(data).transpose()?.unwrap_or(0);
        let channel = status & 0x0F;

        Ok(match status {
            0x80..=0x8F => Self::NoteOff { channel, note: d1, velocity: d2 },
            0x90..=0x9F => Self::NoteOn { channel, note: d1, velocity: d2 },
            0xA0..=0xAF => Self::PolyPressure { channel, note: d1, pressure: d2 },
            0xB0..=0xBF => Self::ControlChange { channel, controller: d1, value: d2 },
            0xC0..=0xCF => Self::ProgramChange { channel, program: d1 },
            0xD0..=0xDF => Self::ChannelPressure { channel, pressure: d1 },
            0xE0..=0xEF => Self::PitchBend { channel, value: join14(d1, d2) },
            0xF1 => Self::TimeCodeQuarterFrame(d1),
            0xF2 => Self::SongPosition(join14(d1, d2)),
            0xF3 => Self::SongSelect(d1),
            0xF6 => Self::TuneRequest,
            0xF8 => Self::TimingClock,
            0xFA => Self::Start,
            0xFB => Self::Continue,
            0xFC => Self::Stop,
            0xFE => Self::ActiveSensing,
            0xFF => Self::SystemReset,
            other => return Err(MidiError::InvalidStatus(other)),
        })
    }
}

/// Incremental parser for a raw MIDI byte stream.
#[derive(Debug, Default)]
pub struct MidiStreamParser {
    running_status: Option<u8>,
    pending: Vec<u8>,
    sysex: Option<Vec<u8>>,
}

impl MidiStreamParser {
    /// Fresh parser with no running status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every message completed by them, in order.
    ///
    /// Real-time bytes are emitted immediately, even mid-message. Stray
    /// data bytes without a status are dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<MidiMessage> {
        let mut out = Vec::new();
        for &byte in bytes {
            if is_realtime(byte) {
                if let Ok(msg) = MidiMessage::decode(&[byte]) {
                    out.push(msg);
                }
                continue;
            }

            if let Some(sysex) = &mut self.sysex {
                if byte & 0x80 == 0 {
                    sysex.push(byte);
                    continue;
                }
                let payload = self.sysex.take().unwrap_or_default();
                if byte == 0xF7 {
                    out.push(MidiMessage::SysEx(payload));
                    continue;
                }
                // Any other status aborts the SysEx and is handled below.
            }

            if byte & 0x80 != 0 {
                self.pending.clear();
                match byte {
                    0xF0 => {
                        self.running_status = None;
                        self.sysex = Some(Vec::new());
                    }
                    0x80..=0xEF => {
                        self.running_status = Some(byte);
                        self.pending.push(byte);
                    }
                    _ => {
                        // System common cancels running status.
                        self.running_status = None;
                        if message_len(byte).is_some() {
                            self.pending.push(byte);
                        }
                    }
                }
            } else if self.pending.is_empty() {
                match self.running_status {
                    Some(status) => {
                        self.pending.push(status);
                        self.pending.push(byte);
                    }
                    None => continue,
                }
            } else {
                self.pending.push(byte);
            }

            if let Some(&status) = self.pending.first() {
                if message_len(status) == Some(self.pending.len()) {
                    if let Ok(msg) = MidiMessage::decode(&self.pending) {
                        out.push(msg);
                    }
                    self.pending.clear();
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_two_and_three_byte_lengths() {
        let pc = MidiMessage::ProgramChange { channel: 2, program: 5 };
        assert_eq!(pc.encode(), vec![0xC2, 0x05]);
        let cp = MidiMessage::ChannelPressure { channel: 0, pressure: 64 };
        assert_eq!(cp.encode().len(), 2);
        let on = MidiMessage::NoteOn { channel: 9, note: 36, velocity: 100 };
        assert_eq!(on.encode(), vec![0x99, 36, 100]);
    }

    #[test]
    fn test_pitch_bend_splits_14_bits() {
        let center = MidiMessage::PitchBend { channel: 0, value: 8192 };
        assert_eq!(center.encode(), vec![0xE0, 0x00, 0x40]);
        let max = MidiMessage::PitchBend { channel: 1, value: 16383 };
        assert_eq!(max.encode(), vec![0xE1, 0x7F, 0x7F]);
        assert_eq!(MidiMessage::decode(&[0xE1, 0x7F, 0x7F]).unwrap(), max);
    }

    #[test]
    fn test_sysex_framed_by_markers() {
        let msg = MidiMessage::SysEx(vec![0x7E, 0x7F, 0x06, 0x01]);
        assert_eq!(msg.encode(), vec![0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]);
        assert_eq!(MidiMessage::decode(&msg.encode()).unwrap(), msg);
        assert_eq!(
            MidiMessage::decode(&[0xF0, 0x01]),
            Err(MidiError::UnterminatedSysEx)
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(MidiMessage::decode(&[]), Err(MidiError::Empty));
        assert_eq!(MidiMessage::decode(&[0x40]), Err(MidiError::InvalidStatus(0x40)));
        assert_eq!(MidiMessage::decode(&[0xF4]), Err(MidiError::InvalidStatus(0xF4)));
        assert_eq!(
            MidiMessage::decode(&[0x90, 0x3C]),
            Err(MidiError::Truncated { expected: 3, got: 2 })
        );
        assert_eq!(
            MidiMessage::decode(&[0xC0, 0x01, 0x02]),
            Err(MidiError::Trailing { expected: 2 })
        );
        assert_eq!(
            MidiMessage::decode(&[0x90, 0x80, 0x00]),
            Err(MidiError::DataOutOfRange(0x80))
        );
    }

    #[test]
    fn test_parser_running_status() {
        let mut parser = MidiStreamParser::new();
        let msgs = parser.feed(&[0x90, 60, 100, 62, 90, 64, 0]);
        assert_eq!(
            msgs,
            vec![
                MidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 },
                MidiMessage::NoteOn { channel: 0, note: 62, velocity: 90 },
                MidiMessage::NoteOn { channel: 0, note: 64, velocity: 0 },
            ]
        );
    }

    #[test]
    fn test_parser_realtime_inside_message() {
        let mut parser = MidiStreamParser::new();
        let msgs = parser.feed(&[0xB0, 0xF8, 7, 0xFA, 100]);
        assert_eq!(
            msgs,
            vec![
                MidiMessage::TimingClock,
                MidiMessage::Start,
                MidiMessage::ControlChange { channel: 0, controller: 7, value: 100 },
            ]
        );
    }

    #[test]
    fn test_parser_split_across_feeds() {
        let mut parser = MidiStreamParser::new();
        assert!(parser.feed(&[0xE3, 0x00]).is_empty());
        assert_eq!(
            parser.feed(&[0x40]),
            vec![MidiMessage::PitchBend { channel: 3, value: 8192 }]
        );
    }

    #[test]
    fn test_parser_sysex_and_abort() {
        let mut parser = MidiStreamParser::new();
        let msgs = parser.feed(&[0xF0, 1, 2, 0xF8, 3, 0xF7]);
        assert_eq!(msgs, vec![MidiMessage::TimingClock, MidiMessage::SysEx(vec![1, 2, 3])]);

        // A channel status inside SysEx aborts it and starts a new message.
        let msgs = parser.feed(&[0xF0, 1, 0x90, 60, 1]);
        assert_eq!(msgs, vec![MidiMessage::NoteOn { channel: 0, note: 60, velocity: 1 }]);
    }

    #[test]
    fn test_parser_system_common_clears_running_status() {
        let mut parser = MidiStreamParser::new();
        let msgs = parser.feed(&[0x90, 60, 1, 0xF3, 4, 61, 1]);
        assert_eq!(
            msgs,
            vec![
                MidiMessage::NoteOn { channel: 0, note: 60, velocity: 1 },
                MidiMessage::SongSelect(4),
            ]
        );
    }

    #[test]
    fn test_parser_drops_stray_data() {
        let mut parser = MidiStreamParser::new();
        assert!(parser.feed(&[1, 2, 3]).is_empty());
    }

    fn any_message() -> impl Strategy<Value = MidiMessage> {
        let ch = 0u8..16;
        let d = 0u8..128;
        prop_oneof![
            (ch.clone(), d.clone(), d.clone())
                .prop_map(|(channel, note, velocity)| MidiMessage::NoteOn { channel, note, velocity }),
            (ch.clone(), d.clone(), d.clone())
                .prop_map(|(channel, note, velocity)| MidiMessage::NoteOff { channel, note, velocity }),
            (ch.clone(), d.clone(), d.clone()).prop_map(|(channel, controller, value)| {
                MidiMessage::ControlChange { channel, controller, value }
            }),
            (ch.clone(), d.clone())
                .prop_map(|(channel, program)| MidiMessage::ProgramChange { channel, program }),
            (ch, 0u16..16384).prop_map(|(channel, value)| MidiMessage::PitchBend { channel, value }),
            proptest::collection::vec(d, 0..32).prop_map(MidiMessage::SysEx),
            Just(MidiMessage::TimingClock),
            (0u16..16384).prop_map(MidiMessage::SongPosition),
        ]
    }

    proptest! {
        #[test]
        fn encode_decode_symmetric(msg in any_message()) {
            prop_assert_eq!(MidiMessage::decode(&msg.encode()).unwrap(), msg);
        }

        #[test]
        fn parser_recovers_concatenated_stream(msgs in proptest::collection::vec(any_message(), 0..16)) {
            let stream: Vec<u8> = msgs.iter().flat_map(MidiMessage::encode).collect();
            let mut parser = MidiStreamParser::new();
            prop_assert_eq!(parser.feed(&stream), msgs);
        }
    }
}
