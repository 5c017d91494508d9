use std::io::Read;

use super::{Codec, DecodeContext, method};
use crate::error::Result;

/// Method 0: bytes pass through untouched.
pub struct StoreCodec;

impl Codec for StoreCodec {
    fn method_id(&self) -> u16 {
        method::STORE
    }

    fn name(&self) -> &'static str {
        "store"
    }

    fn supports_compress(&self) -> bool {
        true
    }

    fn decompress<'r>(
        &self,
        input: Box<dyn Read + Send + 'r>,
        _ctx: &DecodeContext,
    ) -> Result<Box<dyn Read + Send + 'r>> {
        Ok(input)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
