//! Incremental decoder for the serial byte stream.
//!
//! The controller interleaves two kinds of traffic on one link:
//!
//! ```text
//! [0xFF] [COBS-stuffed payload] [0x00]     binary frame
//! text bytes ... '\n'                      diagnostic line
//! ```
//!
//! `0xFF` never appears in UTF-8, so it marks the start of a stuffed frame.
//! Anything outside a marked frame is text. Feed bytes via
//! [`StreamDecoder::feed`] and route the resulting [`StreamItem`]s: frames
//! to the relay, text to the log broadcaster.

use super::cobs;
use crate::constants::MAX_FRAME_SIZE;

/// Marks the start of a stuffed binary frame.
pub const FRAME_MARKER: u8 = 0xFF;

/// Terminates a stuffed binary frame.
pub const FRAME_DELIMITER: u8 = 0x00;

/// One decoded unit from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// Binary frame payload (already unstuffed).
    Frame(Vec<u8>),
    /// Diagnostic text line without its line terminator.
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Frame,
    /// Oversized frame; skip to the next delimiter.
    Discard,
}

/// Encode `payload` as a marked, stuffed, delimited stream frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let stuffed = cobs::encode(payload);
    let mut out = Vec::with_capacity(stuffed.len() + 2);
    out.push(FRAME_MARKER);
    out.extend_from_slice(&stuffed);
    out.push(FRAME_DELIMITER);
    out
}

/// Incremental stream decoder that handles partial reads.
#[derive(Debug)]
pub struct StreamDecoder {
    state: State,
    buf: Vec<u8>,
    max_frame: usize,
}

impl StreamDecoder {
    /// Create a decoder with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    /// Create a decoder that rejects frames larger than `max_frame` bytes.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            state: State::Text,
            buf: Vec::new(),
            max_frame,
        }
    }

    fn max_stuffed(&self) -> usize {
        self.max_frame + self.max_frame / 254 + 1
    }

    /// Feed bytes and extract every complete item.
    ///
    /// Incomplete data is buffered for the next call. Malformed frames are
    /// dropped with a warning; the decoder resyncs on the next delimiter.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamItem> {
        let mut items = Vec::new();

        for &byte in bytes {
            match self.state {
                State::Text => match byte {
                    FRAME_MARKER => {
                        self.flush_text(&mut items);
                        self.state = State::Frame;
                    }
                    b'\n' | FRAME_DELIMITER => self.flush_text(&mut items),
                    _ => {
                        self.buf.push(byte);
                        if self.buf.len() >= self.max_frame {
                            self.flush_text(&mut items);
                        }
                    }
                },
                State::Frame => {
                    if byte == FRAME_DELIMITER {
                        self.finish_frame(&mut items);
                        self.state = State::Text;
                    } else {
                        self.buf.push(byte);
                        if self.buf.len() > self.max_stuffed() {
                            log::warn!(
                                "[Codec] Dropping oversized frame (> {} bytes), resyncing",
                                self.max_frame
                            );
                            self.buf.clear();
                            self.state = State::Discard;
                        }
                    }
                }
                State::Discard => {
                    if byte == FRAME_DELIMITER {
                        self.state = State::Text;
                    }
                }
            }
        }

        items
    }

    fn flush_text(&mut self, items: &mut Vec<StreamItem>) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf);
        let line = line.trim_end_matches('\r');
        if !line.is_empty() {
            items.push(StreamItem::Text(line.to_string()));
        }
        self.buf.clear();
    }

    fn finish_frame(&mut self, items: &mut Vec<StreamItem>) {
        if self.buf.is_empty() {
            log::warn!("[Codec] Empty stuffed frame ignored");
            return;
        }
        match cobs::decode(&self.buf) {
            Ok(frame) => items.push(StreamItem::Frame(frame)),
            Err(e) => log::warn!("[Codec] Dropping malformed frame: {e}"),
        }
        self.buf.clear();
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || self.state != State::Text
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}
