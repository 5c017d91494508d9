//! Method 95: a whole `.xz` stream as a ZIP entry body.

use std::io::Read;

use super::{Codec, DecodeContext, method};
use crate::error::Result;
use crate::xz::XzReader;
use crate::xz::reader::XzOptions;

pub struct XzCodec;

impl Codec for XzCodec {
    fn method_id(&self) -> u16 {
        method::XZ
    }

    fn name(&self) -> &'static str {
        "xz"
    }

    fn decompress<'r>(
        &self,
        input: Box<dyn Read + Send + 'r>,
        ctx: &DecodeContext,
    ) -> Result<Box<dyn Read + Send + 'r>> {
        let max_output = ctx
            .uncompressed_size
            .unwrap_or(ctx.limits.max_uncompressed_entry_bytes);
        let options = XzOptions::from_limits(&ctx.limits, ctx.profile, max_output);
        Ok(Box::new(XzReader::new(input, options, ctx.cancel.clone())))
    }
}
