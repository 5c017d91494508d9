//! Method 14: the standalone LZMA stream ZIP carries (a 4-byte version
//! header, 5 property bytes, then raw LZMA data).

use std::io::{Cursor, Read};

use super::{Codec, DecodeContext, method};
use crate::cancel::CancelCounter;
use crate::error::{ArchiveError, Code, Result};
use crate::xz::lzma::{DecodeOutcome, LzmaProps, LzmaState, RangeDecoder, Window};

pub struct LzmaCodec;

/// ZIP general-purpose bit 1: the stream ends with an end-of-stream marker
/// instead of relying on the declared size.
const FLAG_EOS_MARKER: u16 = 1 << 1;

const STEP: u64 = 64 * 1024;

impl Codec for LzmaCodec {
    fn method_id(&self) -> u16 {
        method::LZMA
    }

    fn name(&self) -> &'static str {
        "lzma"
    }

    fn decompress<'r>(
        &self,
        mut input: Box<dyn Read + Send + 'r>,
        ctx: &DecodeContext,
    ) -> Result<Box<dyn Read + Send + 'r>> {
        let mut header = [0u8; 4];
        input
            .read_exact(&mut header)
            .map_err(|e| ArchiveError::from_io(e, Code::CompressionLzmaBadData))?;
        let props_len = u16::from_le_bytes([header[2], header[3]]);
        if props_len != 5 {
            return Err(ArchiveError::new(
                Code::CompressionLzmaBadData,
                format!("LZMA properties length {props_len}, expected 5"),
            ));
        }
        let mut props_raw = [0u8; 5];
        input
            .read_exact(&mut props_raw)
            .map_err(|e| ArchiveError::from_io(e, Code::CompressionLzmaBadData))?;
        let props = LzmaProps::from_byte(props_raw[0])?;
        let dict_size = u64::from(u32::from_le_bytes([
            props_raw[1],
            props_raw[2],
            props_raw[3],
            props_raw[4],
        ]))
        .max(4096);
        let dict_cap = ctx.limits.max_dictionary_bytes;
        if dict_size > dict_cap {
            return Err(ArchiveError::new(
                Code::CompressionResourceLimit,
                format!("declared dictionary of {dict_size} bytes exceeds the cap of {dict_cap}"),
            ));
        }

        // The compressed window is already bounded by the entry's declared
        // compressed size; pull it in and decode in cancellable steps.
        let mut compressed = Vec::new();
        input
            .read_to_end(&mut compressed)
            .map_err(|e| ArchiveError::from_io(e, Code::CompressionLzmaBadData))?;

        let use_marker = ctx.flags & FLAG_EOS_MARKER != 0 || ctx.uncompressed_size.is_none();
        let size_cap = match ctx.uncompressed_size {
            Some(size) => size,
            None => ctx.limits.max_uncompressed_entry_bytes,
        };

        let mut rc = RangeDecoder::new(&compressed)?;
        let mut state = LzmaState::new(props);
        let mut window = Window::new(dict_size as usize);
        let mut out = Vec::new();
        let mut cancel = CancelCounter::new(ctx.cancel.clone());
        loop {
            let produced = out.len() as u64;
            if produced >= size_cap {
                if use_marker && ctx.uncompressed_size.is_none() {
                    return Err(ArchiveError::new(
                        Code::ArchiveLimitExceeded,
                        "LZMA output exceeds the entry cap",
                    ));
                }
                break;
            }
            let want = STEP.min(size_cap - produced);
            match state.decode(&mut rc, &mut window, &mut out, produced, want, dict_size)? {
                DecodeOutcome::EndMarker => break,
                DecodeOutcome::Filled => {}
            }
            cancel.step(want as usize)?;
        }

        if let Some(size) = ctx.uncompressed_size {
            // A final end marker may trail the declared size.
            if !use_marker && out.len() as u64 != size {
                return Err(ArchiveError::new(
                    Code::CompressionLzmaBadData,
                    format!("LZMA stream produced {} bytes, expected {size}", out.len()),
                ));
            }
            out.truncate(size as usize);
        }
        Ok(Box::new(Cursor::new(out)))
    }
}
