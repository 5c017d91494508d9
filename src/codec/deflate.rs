use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use super::{Codec, DecodeContext, method};
use crate::error::{ArchiveError, Code, Result};

/// Method 8: raw deflate via flate2.
pub struct DeflateCodec;

impl Codec for DeflateCodec {
    fn method_id(&self) -> u16 {
        method::DEFLATE
    }

    fn name(&self) -> &'static str {
        "deflate"
    }

    fn supports_compress(&self) -> bool {
        true
    }

    fn decompress<'r>(
        &self,
        input: Box<dyn Read + Send + 'r>,
        _ctx: &DecodeContext,
    ) -> Result<Box<dyn Read + Send + 'r>> {
        Ok(Box::new(DeflateDecoder::new(input)))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .and_then(|()| encoder.finish())
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveBadHeader))
    }
}

/// Method 9: recognized so audits can name it, but no decoder is wired in.
pub struct Deflate64Codec;

impl Codec for Deflate64Codec {
    fn method_id(&self) -> u16 {
        method::DEFLATE64
    }

    fn name(&self) -> &'static str {
        "deflate64"
    }

    fn supports_decompress(&self) -> bool {
        false
    }

    fn decompress<'r>(
        &self,
        _input: Box<dyn Read + Send + 'r>,
        _ctx: &DecodeContext,
    ) -> Result<Box<dyn Read + Send + 'r>> {
        Err(ArchiveError::new(
            Code::CompressionBackendUnavailable,
            "no deflate64 decoder in this build",
        ))
    }
}
