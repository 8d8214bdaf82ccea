//! Consistent Overhead Byte Stuffing.
//!
//! Removes every `0x00` from a payload so that `0x00` can terminate frames
//! on a continuous byte stream. Overhead is one byte per 254 payload bytes
//! plus one.

use thiserror::Error;

/// Errors returned by [`decode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CobsError {
    /// A zero byte appeared inside stuffed data.
    #[error("zero byte inside stuffed data at offset {0}")]
    ZeroByte(usize),
    /// A code byte pointed past the end of the input.
    #[error("code byte at offset {offset} overruns input ({len} bytes)")]
    Truncated {
        /// Offset of the offending code byte.
        offset: usize,
        /// Input length.
        len: usize,
    },
}

/// Stuff `data` so the result contains no zero bytes.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 2);
    let mut code_idx = 0;
    let mut code: u8 = 1;
    out.push(0); // placeholder for the first code byte

    for &byte in data {
        if byte == 0 {
            out[code_idx] = code;
            code_idx = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == 0xFF {
                out[code_idx] = code;
                code_idx = out.len();
                out.push(0);
                code = 1;
            }
        }
    }
    out[code_idx] = code;
    out
}

/// Reverse [`encode`]. The input must not include the trailing delimiter.
pub fn decode(encoded: &[u8]) -> Result<Vec<u8>, CobsError> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut i = 0;

    while i < encoded.len() {
        let code = encoded[i];
        if code == 0 {
            return Err(CobsError::ZeroByte(i));
        }
        let start = i + 1;
        let end = start + usize::from(code) - 1;
        if end > encoded.len() {
            return Err(CobsError::Truncated { offset: i, len: encoded.len() });
        }
        let run = &encoded[start..end];
        if let Some(pos) = run.iter().position(|&b| b == 0) {
            return Err(CobsError::ZeroByte(start + pos));
        }
        out.extend_from_slice(run);
        i = end;
        // A full 254-byte run carries no implicit zero.
        if code != 0xFF && i < encoded.len() {
            out.push(0);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_payload() {
        assert_eq!(encode(&[]), vec![0x01]);
        assert_eq!(decode(&[0x01]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(encode(&[0x00]), vec![0x01, 0x01]);
        assert_eq!(encode(&[0x00, 0x00]), vec![0x01, 0x01, 0x01]);
        assert_eq!(encode(&[0x11, 0x22, 0x00, 0x33]), vec![0x03, 0x11, 0x22, 0x02, 0x33]);
        assert_eq!(encode(&[0x11, 0x00, 0x00, 0x00]), vec![0x02, 0x11, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn test_254_byte_run_boundary() {
        let data: Vec<u8> = (1..=254).collect();
        let encoded = encode(&data);
        assert_eq!(encoded[0], 0xFF);
        assert!(!encoded.contains(&0));
        assert_eq!(decode(&encoded).unwrap(), data);

        let mut with_zero = data.clone();
        with_zero.push(0);
        assert_eq!(decode(&encode(&with_zero)).unwrap(), with_zero);
    }

    #[test]
    fn test_decode_rejects_embedded_zero() {
        assert_eq!(decode(&[0x03, 0x11, 0x00]), Err(CobsError::ZeroByte(2)));
        assert_eq!(decode(&[0x00]), Err(CobsError::ZeroByte(0)));
    }

    #[test]
    fn test_decode_rejects_overrun() {
        assert!(matches!(decode(&[0x05, 0x11]), Err(CobsError::Truncated { offset: 0, .. })));
    }

    proptest! {
        #[test]
        fn encoded_never_contains_zero(data in prop::collection::vec(any::<u8>(), 0..1024)) {
            prop_assert!(!encode(&data).contains(&0));
        }

        #[test]
        fn decode_inverts_encode(data in prop::collection::vec(any::<u8>(), 0..1024)) {
            prop_assert_eq!(decode(&encode(&data)).unwrap(), data);
        }

        #[test]
        fn zero_heavy_payloads_round_trip(data in prop::collection::vec(prop_oneof![Just(0u8), any::<u8>()], 0..600)) {
            prop_assert_eq!(decode(&encode(&data)).unwrap(), data);
        }
    }
}
