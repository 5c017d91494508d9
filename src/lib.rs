//! shuck — defensive inspection, audit, and deterministic normalization of
//! untrusted ZIP and TAR archives (and their gzip/bzip2/xz/zstd layers).
//!
//! The engine assumes every input is adversarial: resource limits are
//! enforced before allocation, ZIP local headers are reconciled against the
//! central directory byte for byte, decompression is bounded and
//! CRC-verified, and names are screened for traversal and collision attacks.
//!
//! Three operations per archive:
//!
//! ```no_run
//! # async fn demo() -> shuck::Result<()> {
//! use shuck::{OpenOptions, Profile, open_archive};
//!
//! let archive = open_archive(
//!     std::fs::read("untrusted.zip").unwrap(),
//!     OpenOptions::with_profile(Profile::Strict),
//! )
//! .await?;
//!
//! for entry in archive.entries() {
//!     println!("{} ({} bytes)", entry.name, entry.size);
//! }
//!
//! let report = archive.audit().await?;
//! report.assert_safe()?;
//!
//! let mut normalized = Vec::new();
//! archive.normalize_to(&mut normalized, &Default::default()).await?;
//! # Ok(())
//! # }
//! ```

mod audit;
mod cancel;
mod codec;
mod entry;
mod error;
mod facade;
mod gzip;
mod limits;
mod names;
mod normalize;
mod preflight;
mod report;
mod sniff;
mod substrate;
mod tar;
mod xz;
mod zip;

pub use cancel::Cancel;
pub use codec::{Codec, CodecRegistry, DecodeContext, method};
pub use entry::{AesStrength, Encryption, Entry, EntryKind};
pub use error::{ArchiveError, Code, Result};
pub use facade::{ArchiveInput, ArchiveReader, CompressedReader, OpenOptions, ReaderKind, open_archive};
pub use gzip::{GzipHeader, GzipReader};
pub use limits::{Limits, Profile};
pub use normalize::{ConflictPolicy, NormalizeMode, NormalizeOptions, OnUnsupported};
pub use report::{
    AuditIssue, AuditReport, CollisionKind, NormalizeReport, SCHEMA_VERSION, Severity, Summary,
    assert_safe,
};
pub use sniff::{Compression, Format};
pub use substrate::{
    BufferSubstrate, FileSubstrate, HttpOptions, HttpRangeSubstrate, RangeResponse, RangeTransport,
    Substrate, SubstrateExt,
};
pub use tar::TarReader;
pub use xz::XzReader;
pub use zip::ZipReader;
