//! The codec registry: pluggable transforms keyed by ZIP method id.
//!
//! Decompressors are synchronous `Read` adapters so they compose with the
//! substrate bridge and each other; compressors are one-shot (the normalizer
//! spools per-entry, bounded by the limits). The registry is frozen after
//! construction — the facade owns a snapshot built at startup.

mod aes;
mod bzip2;
mod deflate;
mod lzma;
mod store;
mod xz;
mod zstd;

pub use aes::AesReader;

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use crate::cancel::Cancel;
use crate::error::{ArchiveError, Code, Result};
use crate::limits::{Limits, Profile};
use crate::sniff::Compression;

/// ZIP compression method ids the engine knows about.
pub mod method {
    pub const STORE: u16 = 0;
    pub const DEFLATE: u16 = 8;
    pub const DEFLATE64: u16 = 9;
    pub const BZIP2: u16 = 12;
    pub const LZMA: u16 = 14;
    pub const ZSTD: u16 = 93;
    pub const XZ: u16 = 95;
    pub const AES: u16 = 99;

    pub fn name(method: u16) -> &'static str {
        match method {
            STORE => "store",
            DEFLATE => "deflate",
            DEFLATE64 => "deflate64",
            BZIP2 => "bzip2",
            LZMA => "lzma",
            ZSTD => "zstd",
            XZ => "xz",
            AES => "aes",
            _ => "unknown",
        }
    }
}

/// Everything a decompressor needs beyond the bytes.
#[derive(Clone)]
pub struct DecodeContext {
    pub limits: Limits,
    pub profile: Profile,
    pub cancel: Cancel,
    /// Declared uncompressed size, when the container stores one (ZIP).
    pub uncompressed_size: Option<u64>,
    /// ZIP general-purpose flags (LZMA end-marker bit lives there).
    pub flags: u16,
}

impl DecodeContext {
    pub fn new(limits: Limits, profile: Profile, cancel: Cancel) -> Self {
        DecodeContext {
            limits,
            profile,
            cancel,
            uncompressed_size: None,
            flags: 0,
        }
    }

    pub fn with_entry(mut self, uncompressed_size: u64, flags: u16) -> Self {
        self.uncompressed_size = Some(uncompressed_size);
        self.flags = flags;
        self
    }
}

/// One registered transform.
pub trait Codec: Send + Sync {
    fn method_id(&self) -> u16;
    fn name(&self) -> &'static str;

    fn supports_decompress(&self) -> bool {
        true
    }

    fn supports_compress(&self) -> bool {
        false
    }

    /// Wrap `input` (the compressed byte window) in a decoding reader.
    fn decompress<'r>(
        &self,
        input: Box<dyn Read + Send + 'r>,
        ctx: &DecodeContext,
    ) -> Result<Box<dyn Read + Send + 'r>>;

    /// One-shot compression for the normalizer spool.
    fn compress(&self, _data: &[u8]) -> Result<Vec<u8>> {
        Err(ArchiveError::new(
            Code::CompressionBackendUnavailable,
            format!("no {} compressor available", self.name()),
        ))
    }
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("method_id", &self.method_id())
            .field("name", &self.name())
            .finish()
    }
}

/// Frozen method-id → codec table.
pub struct CodecRegistry {
    codecs: HashMap<u16, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// The built-in set: 0 store, 8 deflate, 9 deflate64 (listed, decode
    /// unavailable), 12 bzip2, 14 LZMA, 93 zstd, 95 xz, 99 AES marker.
    pub fn builtin() -> Arc<CodecRegistry> {
        let mut registry = CodecRegistry {
            codecs: HashMap::new(),
        };
        registry.register(Arc::new(store::StoreCodec));
        registry.register(Arc::new(deflate::DeflateCodec));
        registry.register(Arc::new(deflate::Deflate64Codec));
        registry.register(Arc::new(bzip2::Bzip2Codec));
        registry.register(Arc::new(lzma::LzmaCodec));
        registry.register(Arc::new(zstd::ZstdCodec));
        registry.register(Arc::new(xz::XzCodec));
        registry.register(Arc::new(aes::AesMarkerCodec));
        Arc::new(registry)
    }

    fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.method_id(), codec);
    }

    pub fn get(&self, method: u16) -> Option<&Arc<dyn Codec>> {
        self.codecs.get(&method)
    }

    /// Resolve a decompressor or fail with the method-specific code.
    pub fn decompressor(&self, method: u16) -> Result<&Arc<dyn Codec>> {
        let codec = self.codecs.get(&method).ok_or_else(|| {
            ArchiveError::new(
                Code::ZipUnsupportedMethod,
                format!("no codec registered for method {method}"),
            )
        })?;
        if !codec.supports_decompress() {
            return Err(ArchiveError::new(
                Code::CompressionBackendUnavailable,
                format!("method {method} ({}) has no decoder in this build", codec.name()),
            ));
        }
        Ok(codec)
    }

    pub fn compressor(&self, method: u16) -> Result<&Arc<dyn Codec>> {
        let codec = self.codecs.get(&method).ok_or_else(|| {
            ArchiveError::new(
                Code::ZipUnsupportedMethod,
                format!("no codec registered for method {method}"),
            )
        })?;
        if !codec.supports_compress() {
            return Err(ArchiveError::new(
                Code::CompressionBackendUnavailable,
                format!("method {method} ({}) has no encoder in this build", codec.name()),
            ));
        }
        Ok(codec)
    }
}

/// Decoder for an outer compression layer (`.tar.gz`, bare `.xz`, …).
pub fn outer_decoder<'r>(
    compression: Compression,
    input: Box<dyn Read + Send + 'r>,
    ctx: &DecodeContext,
    max_output: u64,
) -> Result<Box<dyn Read + Send + 'r>> {
    match compression {
        Compression::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(input))),
        Compression::Bzip2 => Ok(Box::new(::bzip2::read::MultiBzDecoder::new(input))),
        Compression::Xz => {
            let options =
                crate::xz::reader::XzOptions::from_limits(&ctx.limits, ctx.profile, max_output);
            Ok(Box::new(crate::xz::XzReader::new(
                input,
                options,
                ctx.cancel.clone(),
            )))
        }
        Compression::Zstd => {
            let mut decoder = ::zstd::stream::read::Decoder::new(input)
                .map_err(|e| ArchiveError::from_io(e, Code::ArchiveBadHeader))?;
            let window_log = 64 - u64::max(ctx.limits.max_dictionary_bytes, 1024).leading_zeros();
            decoder
                .window_log_max(window_log)
                .map_err(|e| ArchiveError::from_io(e, Code::CompressionResourceLimit))?;
            Ok(Box::new(decoder))
        }
        Compression::Brotli => Err(ArchiveError::new(
            Code::CompressionBackendUnavailable,
            "no brotli decoder in this build",
        )),
    }
}

/// `Read` adapter that fails once more than `cap` bytes have passed through.
pub struct BoundedReader<R> {
    inner: R,
    produced: u64,
    cap: u64,
    code: Code,
}

impl<R: Read> BoundedReader<R> {
    pub fn new(inner: R, cap: u64, code: Code) -> Self {
        BoundedReader {
            inner,
            produced: 0,
            cap,
            code,
        }
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.produced += n as u64;
        if self.produced > self.cap {
            return Err(ArchiveError::new(
                self.code,
                format!("output exceeds the cap of {} bytes", self.cap),
            )
            .into());
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_lists_the_contract_methods() {
        let registry = CodecRegistry::builtin();
        for id in [0u16, 8, 9, 12, 14, 93, 95, 99] {
            assert!(registry.get(id).is_some(), "method {id} missing");
        }
        assert!(registry.get(4).is_none());
    }

    #[test]
    fn deflate64_is_listed_but_not_decodable() {
        let registry = CodecRegistry::builtin();
        let err = registry.decompressor(method::DEFLATE64).unwrap_err();
        assert_eq!(err.code, Code::CompressionBackendUnavailable);
    }

    #[test]
    fn unknown_method_is_unsupported() {
        let registry = CodecRegistry::builtin();
        let err = registry.decompressor(42).unwrap_err();
        assert_eq!(err.code, Code::ZipUnsupportedMethod);
    }

    #[test]
    fn bounded_reader_trips_past_cap() {
        let data = vec![0u8; 100];
        let mut reader = BoundedReader::new(&data[..], 50, Code::ArchiveLimitExceeded);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        let err = ArchiveError::from_io(err, Code::ArchiveBadHeader);
        assert_eq!(err.code, Code::ArchiveLimitExceeded);
    }

    #[test]
    fn deflate_round_trip_through_registry() {
        let registry = CodecRegistry::builtin();
        let codec = registry.compressor(method::DEFLATE).unwrap();
        let compressed = codec.compress(b"hello hello hello hello").unwrap();
        let ctx = DecodeContext::new(Limits::default(), Profile::Strict, Cancel::none());
        let mut reader = codec
            .decompress(Box::new(&compressed[..]), &ctx)
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello hello hello hello");
    }
}
