use std::io::{Read, Write};

use bzip2::Compression;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;

use super::{Codec, DecodeContext, method};
use crate::error::{ArchiveError, Code, Result};

/// Method 12: bzip2 via the system-grade bzip2 crate.
pub struct Bzip2Codec;

impl Codec for Bzip2Codec {
    fn method_id(&self) -> u16 {
        method::BZIP2
    }

    fn name(&self) -> &'static str {
        "bzip2"
    }

    fn supports_compress(&self) -> bool {
        true
    }

    fn decompress<'r>(
        &self,
        input: Box<dyn Read + Send + 'r>,
        _ctx: &DecodeContext,
    ) -> Result<Box<dyn Read + Send + 'r>> {
        Ok(Box::new(BzDecoder::new(input)))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .and_then(|()| encoder.finish())
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveBadHeader))
    }
}
