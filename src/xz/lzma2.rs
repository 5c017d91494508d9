//! LZMA2 chunk framing around the LZMA core.

use std::io::Read;

use crate::cancel::CancelCounter;
use crate::error::{ArchiveError, Code, Result};

use super::lzma::{DecodeOutcome, LzmaProps, LzmaState, RangeDecoder, Window};

fn bad_data(message: &str) -> ArchiveError {
    ArchiveError::new(Code::CompressionXzBadData, message)
}

fn read_byte<R: Read>(input: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    input
        .read_exact(&mut byte)
        .map_err(|e| ArchiveError::from_io(e, Code::CompressionXzTruncated))?;
    Ok(byte[0])
}

fn read_u16_be<R: Read>(input: &mut R) -> Result<u16> {
    let mut bytes = [0u8; 2];
    input
        .read_exact(&mut bytes)
        .map_err(|e| ArchiveError::from_io(e, Code::CompressionXzTruncated))?;
    Ok(u16::from_be_bytes(bytes))
}

/// Stateful LZMA2 decoder; the dictionary window persists across chunks
/// until a chunk requests a dictionary reset.
pub struct Lzma2Decoder {
    window: Window,
    dict_size: u64,
    state: Option<LzmaState>,
    /// The first chunk of a stream must reset the dictionary.
    need_dict_reset: bool,
    /// Set after uncompressed chunks; the next compressed chunk must carry a
    /// state reset.
    need_state_reset: bool,
    /// Uncompressed position since the last dictionary reset.
    total_pos: u64,
    chunk_buf: Vec<u8>,
}

impl Lzma2Decoder {
    pub fn new(dict_size: u64) -> Self {
        Lzma2Decoder {
            window: Window::new(dict_size as usize),
            dict_size,
            state: None,
            need_dict_reset: true,
            need_state_reset: false,
            total_pos: 0,
            chunk_buf: Vec::new(),
        }
    }

    fn reset_dict(&mut self) {
        self.window.reset();
        self.total_pos = 0;
        self.need_dict_reset = false;
    }

    /// Decode the next chunk from `input`. Returns `None` on the 0x00
    /// end-of-LZMA2 marker, otherwise the chunk's uncompressed bytes.
    pub fn decode_chunk<R: Read>(
        &mut self,
        input: &mut R,
        cancel: &mut CancelCounter,
    ) -> Result<Option<Vec<u8>>> {
        let control = read_byte(input)?;
        match control {
            0x00 => Ok(None),
            0x01 | 0x02 => {
                if control == 0x01 {
                    self.reset_dict();
                } else if self.need_dict_reset {
                    return Err(bad_data("first LZMA2 chunk must reset the dictionary"));
                }
                let size = u64::from(read_u16_be(input)?) + 1;
                let mut out = Vec::with_capacity(size as usize);
                let mut buf = [0u8; 4096];
                let mut remaining = size as usize;
                while remaining > 0 {
                    let take = remaining.min(buf.len());
                    input
                        .read_exact(&mut buf[..take])
                        .map_err(|e| ArchiveError::from_io(e, Code::CompressionXzTruncated))?;
                    for &byte in &buf[..take] {
                        self.window.push_raw(byte, &mut out);
                    }
                    cancel.step(take)?;
                    remaining -= take;
                }
                self.total_pos += size;
                self.need_state_reset = true;
                Ok(Some(out))
            }
            0x03..=0x7F => Err(bad_data("reserved LZMA2 control byte")),
            _ => {
                let unpacked =
                    (u64::from(control & 0x1F) << 16) + u64::from(read_u16_be(input)?) + 1;
                let packed = u64::from(read_u16_be(input)?) + 1;
                let reset = (control >> 5) & 0x03;

                if self.need_dict_reset && reset != 3 {
                    return Err(bad_data("first LZMA2 chunk must reset the dictionary"));
                }
                match reset {
                    3 => {
                        let props = LzmaProps::from_byte(read_byte(input)?)?;
                        self.reset_dict();
                        self.state = Some(LzmaState::new(props));
                    }
                    2 => {
                        let props = LzmaProps::from_byte(read_byte(input)?)?;
                        self.state = Some(LzmaState::new(props));
                    }
                    1 => {
                        let props = self
                            .state
                            .as_ref()
                            .ok_or_else(|| bad_data("state reset before properties were set"))?
                            .props();
                        self.state = Some(LzmaState::new(props));
                    }
                    _ => {
                        if self.state.is_none() {
                            return Err(bad_data("chunk continues a state that was never set"));
                        }
                        if self.need_state_reset {
                            return Err(bad_data(
                                "compressed chunk after an uncompressed chunk must reset state",
                            ));
                        }
                    }
                }
                self.need_state_reset = false;

                self.chunk_buf.clear();
                self.chunk_buf.resize(packed as usize, 0);
                input
                    .read_exact(&mut self.chunk_buf)
                    .map_err(|e| ArchiveError::from_io(e, Code::CompressionXzTruncated))?;

                let mut out = Vec::with_capacity(unpacked as usize);
                let mut rc = RangeDecoder::new(&self.chunk_buf)?;
                let state = self.state.as_mut().expect("state set above");
                let outcome = state.decode(
                    &mut rc,
                    &mut self.window,
                    &mut out,
                    self.total_pos,
                    unpacked,
                    self.dict_size,
                )?;
                if outcome != DecodeOutcome::Filled || out.len() as u64 != unpacked {
                    return Err(bad_data("chunk did not produce its declared size"));
                }
                if !rc.input_consumed() {
                    return Err(bad_data("chunk left compressed bytes unconsumed"));
                }
                cancel.step(out.len())?;
                self.total_pos += unpacked;
                Ok(Some(out))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Cancel;

    fn counter() -> CancelCounter {
        CancelCounter::new(Cancel::none())
    }

    /// Build an uncompressed chunk: control, 2-byte size-1, payload.
    fn uncompressed_chunk(reset_dict: bool, payload: &[u8]) -> Vec<u8> {
        let mut chunk = vec![if reset_dict { 0x01 } else { 0x02 }];
        chunk.extend_from_slice(&((payload.len() - 1) as u16).to_be_bytes());
        chunk.extend_from_slice(payload);
        chunk
    }

    #[test]
    fn decodes_uncompressed_chunks() {
        let mut stream = uncompressed_chunk(true, b"hello ");
        stream.extend(uncompressed_chunk(false, b"world"));
        stream.push(0x00);

        let mut decoder = Lzma2Decoder::new(1 << 16);
        let mut input = &stream[..];
        let first = decoder.decode_chunk(&mut input, &mut counter()).unwrap();
        assert_eq!(first.as_deref(), Some(&b"hello "[..]));
        let second = decoder.decode_chunk(&mut input, &mut counter()).unwrap();
        assert_eq!(second.as_deref(), Some(&b"world"[..]));
        assert!(decoder.decode_chunk(&mut input, &mut counter()).unwrap().is_none());
    }

    #[test]
    fn first_chunk_must_reset_dict() {
        let stream = uncompressed_chunk(false, b"x");
        let mut decoder = Lzma2Decoder::new(1 << 16);
        let err = decoder
            .decode_chunk(&mut &stream[..], &mut counter())
            .unwrap_err();
        assert_eq!(err.code, Code::CompressionXzBadData);
    }

    #[test]
    fn reserved_control_bytes_rejected() {
        let mut decoder = Lzma2Decoder::new(1 << 16);
        let err = decoder
            .decode_chunk(&mut &[0x03u8][..], &mut counter())
            .unwrap_err();
        assert_eq!(err.code, Code::CompressionXzBadData);
    }

    #[test]
    fn compressed_chunk_without_props_rejected() {
        // Control 0x80: compressed, no reset, before any props.
        let stream = [0x80u8, 0x00, 0x00, 0x00, 0x00];
        let mut decoder = Lzma2Decoder::new(1 << 16);
        let err = decoder
            .decode_chunk(&mut &stream[..], &mut counter())
            .unwrap_err();
        assert_eq!(err.code, Code::CompressionXzBadData);
    }

    #[test]
    fn truncated_payload_is_truncation() {
        let mut chunk = vec![0x01, 0x00, 0x10];
        chunk.extend_from_slice(b"short");
        let mut decoder = Lzma2Decoder::new(1 << 16);
        let err = decoder
            .decode_chunk(&mut &chunk[..], &mut counter())
            .unwrap_err();
        assert_eq!(err.code, Code::ArchiveTruncated);
    }
}
