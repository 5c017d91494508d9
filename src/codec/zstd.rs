use std::io::Read;

use super::{Codec, DecodeContext, method};
use crate::error::{ArchiveError, Code, Result};

/// Method 93: Zstandard.
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn method_id(&self) -> u16 {
        method::ZSTD
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn supports_compress(&self) -> bool {
        true
    }

    fn decompress<'r>(
        &self,
        input: Box<dyn Read + Send + 'r>,
        ctx: &DecodeContext,
    ) -> Result<Box<dyn Read + Send + 'r>> {
        let mut decoder = zstd::stream::read::Decoder::new(input)
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveBadHeader))?;
        // Refuse frames whose declared window outgrows the dictionary cap.
        let window_log = 64 - u64::max(ctx.limits.max_dictionary_bytes, 1024).leading_zeros();
        decoder
            .window_log_max(window_log)
            .map_err(|e| ArchiveError::from_io(e, Code::CompressionResourceLimit))?;
        Ok(Box::new(decoder))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(data, 0)
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveBadHeader))
    }
}
