//! XZ variable-length integers: 7 bits per byte, little-endian, at most 9
//! bytes, high bit marks continuation.

use crate::error::{ArchiveError, Code, Result};

pub const MAX_VLI_BYTES: usize = 9;

/// Decode one VLI from a byte slice, returning the value and its encoded
/// length. Rejects overlong encodings and values that overflow 63 bits.
pub fn decode(data: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().take(MAX_VLI_BYTES).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            if byte == 0 && i > 0 {
                return Err(ArchiveError::new(
                    Code::CompressionXzBadData,
                    "non-minimal variable-length integer",
                ));
            }
            return Ok((value, i + 1));
        }
        if i == MAX_VLI_BYTES - 1 {
            break;
        }
    }
    if data.len() < MAX_VLI_BYTES {
        Err(ArchiveError::new(
            Code::CompressionXzTruncated,
            "variable-length integer runs past end of input",
        ))
    } else {
        Err(ArchiveError::new(
            Code::CompressionXzBadData,
            "variable-length integer exceeds 9 bytes",
        ))
    }
}

/// Encode a VLI (used by tests and the index verifier to size records).
pub fn encode(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Encoded size of a value without materializing it.
pub fn encoded_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}
