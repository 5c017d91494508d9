//! `open_archive`: detect the format, build the right reader stack, and hand
//! back one uniform handle.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audit;
use crate::cancel::Cancel;
use crate::codec::{BoundedReader, CodecRegistry, DecodeContext, outer_decoder};
use crate::entry::{Entry, EntryKind};
use crate::error::{ArchiveError, Code, Result};
use crate::gzip::GzipReader;
use crate::limits::{Limits, Profile};
use crate::names;
use crate::normalize::{self, NormalizeOptions};
use crate::preflight;
use crate::report::{AuditIssue, AuditReport, NormalizeReport, Summary};
use crate::sniff::{Compression, Format};
use crate::substrate::{BufferSubstrate, FileSubstrate, Substrate, SyncReader};
use crate::tar::TarReader;
use crate::zip::ZipReader;

/// What to open.
pub enum ArchiveInput {
    Bytes(Bytes),
    Path(PathBuf),
    Substrate(Arc<dyn Substrate>),
}

impl From<Vec<u8>> for ArchiveInput {
    fn from(bytes: Vec<u8>) -> Self {
        ArchiveInput::Bytes(Bytes::from(bytes))
    }
}

impl From<Bytes> for ArchiveInput {
    fn from(bytes: Bytes) -> Self {
        ArchiveInput::Bytes(bytes)
    }
}

/// Explicit open parameters; unknown knobs cannot exist by construction.
#[derive(Default)]
pub struct OpenOptions {
    pub profile: Profile,
    /// Clamped against the profile before use.
    pub limits: Option<Limits>,
    pub password: Option<String>,
    pub cancel: Option<CancellationToken>,
    /// Original file name, used for format tiebreaks and member naming.
    pub filename: Option<String>,
    /// Skip detection and force a format.
    pub format: Option<Format>,
    /// Override the built-in codec registry.
    pub registry: Option<Arc<CodecRegistry>>,
}

impl OpenOptions {
    pub fn with_profile(profile: Profile) -> Self {
        OpenOptions {
            profile,
            ..OpenOptions::default()
        }
    }
}

/// Uniform archive handle: entries, audit, normalize, close.
pub struct ArchiveReader {
    kind: ReaderKind,
    format: Format,
    preflight_issues: Vec<AuditIssue>,
}

pub enum ReaderKind {
    Zip(ZipReader),
    Tar(TarReader),
    GzipSingleFile(GzipReader),
    CompressedSingleFile(CompressedReader),
}

impl std::fmt::Debug for ReaderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReaderKind::Zip(_) => "Zip",
            ReaderKind::Tar(_) => "Tar",
            ReaderKind::GzipSingleFile(_) => "GzipSingleFile",
            ReaderKind::CompressedSingleFile(_) => "CompressedSingleFile",
        };
        f.debug_tuple(name).finish()
    }
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("preflight_issues", &self.preflight_issues)
            .finish()
    }
}

impl ArchiveReader {
    pub fn format(&self) -> Format {
        self.format
    }

    pub fn kind(&self) -> &ReaderKind {
        &self.kind
    }

    /// Entries in container order (central-directory order for ZIP, block
    /// order for TAR).
    pub fn entries(&self) -> &[Entry] {
        match &self.kind {
            ReaderKind::Zip(reader) => reader.entries(),
            ReaderKind::Tar(reader) => reader.entries(),
            ReaderKind::GzipSingleFile(reader) => reader.entries(),
            ReaderKind::CompressedSingleFile(reader) => reader.entries(),
        }
    }

    /// Read one entry's body in full, with every integrity check applied.
    pub async fn read_entry(&self, entry: &Entry) -> Result<Bytes> {
        match &self.kind {
            ReaderKind::Zip(reader) => reader.read_entry(entry).await,
            ReaderKind::Tar(reader) => reader.read_entry(entry).await,
            ReaderKind::GzipSingleFile(reader) => reader.read_entry().await,
            ReaderKind::CompressedSingleFile(reader) => reader.read_entry().await,
        }
    }

    /// Walk the archive against its profile and produce a report. Never
    /// fails for a defective archive — only for I/O or cancellation.
    pub async fn audit(&self) -> Result<AuditReport> {
        self.audit_with(None).await
    }

    /// Audit with a per-call cancellation token, merged with the reader's
    /// own ("any signals abort").
    pub async fn audit_with(&self, cancel: Option<CancellationToken>) -> Result<AuditReport> {
        let mut report = match &self.kind {
            ReaderKind::Zip(reader) => {
                let cancel = reader.cancel().merged(cancel);
                audit::audit_zip(reader, &cancel).await?
            }
            ReaderKind::Tar(reader) => {
                let cancel = reader.cancel().merged(cancel);
                audit::audit_tar(reader, &cancel).await?
            }
            ReaderKind::GzipSingleFile(reader) => audit::audit_gzip(reader),
            ReaderKind::CompressedSingleFile(reader) => reader.audit(),
        };
        if !self.preflight_issues.is_empty() {
            let mut issues = self.preflight_issues.clone();
            issues.extend(report.issues);
            let profile = match report.summary.profile.as_str() {
                "agent" => Profile::Agent,
                "compat" => Profile::Compat,
                _ => Profile::Strict,
            };
            report = AuditReport::assemble(profile, report.summary, issues);
        }
        Ok(report)
    }

    /// Re-emit the archive in normalized form into `out`.
    pub async fn normalize_to<W: std::io::Write>(
        &self,
        out: W,
        options: &NormalizeOptions,
    ) -> Result<NormalizeReport> {
        match &self.kind {
            ReaderKind::Zip(reader) => normalize::normalize_zip(reader, out, options).await,
            ReaderKind::Tar(reader) => normalize::normalize_tar(reader, out, options).await,
            ReaderKind::GzipSingleFile(reader) => {
                normalize::normalize_gzip(reader, out, options).await
            }
            ReaderKind::CompressedSingleFile(reader) => reader.normalize_to(out, options).await,
        }
    }

    /// Close the reader and its substrate.
    pub async fn close(&self) -> Result<()> {
        match &self.kind {
            ReaderKind::Zip(reader) => reader.close().await,
            ReaderKind::Tar(reader) => reader.close().await,
            ReaderKind::GzipSingleFile(reader) => reader.close().await,
            ReaderKind::CompressedSingleFile(reader) => reader.close().await,
        }
    }
}

/// Open an archive: detect the format, run pre-flight for the layers that
/// need it, and build the reader stack.
pub async fn open_archive(
    input: impl Into<ArchiveInput>,
    options: OpenOptions,
) -> Result<ArchiveReader> {
    let profile = options.profile;
    let limits = options
        .limits
        .map(|l| l.clamped(profile))
        .unwrap_or_else(|| profile.default_limits());
    let cancel = Cancel::none().merged(options.cancel.clone());
    let registry = options
        .registry
        .clone()
        .unwrap_or_else(CodecRegistry::builtin);

    let substrate: Arc<dyn Substrate> = match input.into() {
        ArchiveInput::Bytes(bytes) => Arc::new(BufferSubstrate::new(bytes)),
        ArchiveInput::Path(path) => Arc::new(FileSubstrate::open(&path).await?),
        ArchiveInput::Substrate(substrate) => substrate,
    };

    let head = substrate.read_range(0, 4096, &cancel).await?;
    let format = options
        .format
        .or_else(|| Format::detect(options.filename.as_deref(), &head))
        .ok_or_else(|| {
            ArchiveError::new(
                Code::ArchiveUnsupportedFormat,
                "input matches no supported archive format",
            )
        })?;
    debug!(format = format.name(), size = substrate.size(), "opening archive");

    // Pre-flight the dangerous wrappers before any decoder exists — the
    // tar-inside sniff below already decodes a few hundred bytes.
    let preflight_issues =
        preflight::run(substrate.as_ref(), format, &limits, profile, &cancel).await?;

    // Resolve bare compression layers into their tar variants by sniffing
    // the decompressed head.
    let format = match (format.outer(), format.is_tar()) {
        (Some(compression), false) if compression != Compression::Brotli => {
            match decompressed_head(&substrate, compression, &limits, profile, &cancel).await {
                Ok(inner_head) if Format::sniff(&inner_head) == Some(Format::Tar) => {
                    format.with_tar_inside()
                }
                _ => format,
            }
        }
        _ => format,
    };

    let kind = match format {
        Format::Zip => ReaderKind::Zip(
            ZipReader::open(
                substrate,
                registry,
                limits,
                profile,
                options.password.clone(),
                cancel,
            )
            .await?,
        ),
        Format::Tar => {
            ReaderKind::Tar(TarReader::open(substrate, None, limits, profile, cancel).await?)
        }
        Format::TarGz | Format::TarBz2 | Format::TarXz | Format::TarZstd => ReaderKind::Tar(
            TarReader::open(
                substrate,
                format.outer(),
                limits,
                profile,
                cancel,
            )
            .await?,
        ),
        Format::Gzip => ReaderKind::GzipSingleFile(
            GzipReader::open(substrate, limits, profile, cancel).await?,
        ),
        Format::Bzip2 | Format::Xz | Format::Zstd | Format::Brotli => {
            ReaderKind::CompressedSingleFile(CompressedReader::new(
                substrate,
                format
                    .outer()
                    .expect("single-file formats always have a compression layer"),
                limits,
                profile,
                cancel,
                options.filename.as_deref(),
            ))
        }
    };

    Ok(ArchiveReader {
        kind,
        format,
        preflight_issues,
    })
}

/// Decompress just enough of the stream to sniff what is inside.
async fn decompressed_head(
    substrate: &Arc<dyn Substrate>,
    compression: Compression,
    limits: &Limits,
    profile: Profile,
    cancel: &Cancel,
) -> Result<Vec<u8>> {
    let substrate = Arc::clone(substrate);
    let limits = limits.clone();
    let cancel = cancel.clone();
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let raw = SyncReader::new(substrate, handle, cancel.clone());
        let ctx = DecodeContext::new(limits, profile, cancel);
        let mut decoder = outer_decoder(compression, Box::new(raw), &ctx, 1024 * 1024)?;
        let mut head = vec![0u8; 512];
        let mut filled = 0usize;
        while filled < head.len() {
            match decoder.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(ArchiveError::from_io(e, Code::ArchiveBadHeader)),
            }
        }
        head.truncate(filled);
        Ok(head)
    })
    .await
    .map_err(|e| ArchiveError::new(Code::ArchiveTruncated, format!("blocking task failed: {e}")))?
}

/// A single compressed payload with no container (bare `.xz`, `.bz2`, …).
pub struct CompressedReader {
    substrate: Arc<dyn Substrate>,
    handle: tokio::runtime::Handle,
    compression: Compression,
    limits: Limits,
    profile: Profile,
    cancel: Cancel,
    entry: Entry,
}

impl CompressedReader {
    fn new(
        substrate: Arc<dyn Substrate>,
        compression: Compression,
        limits: Limits,
        profile: Profile,
        cancel: Cancel,
        filename: Option<&str>,
    ) -> Self {
        // Member name: the outer filename minus its compression extension,
        // sanitized; `data` when nothing usable remains.
        let name = filename
            .and_then(|f| {
                let base = f.rsplit(['/', '\\']).next()?;
                let stem = base.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(base);
                names::normalize_name(stem).ok().filter(|n| !n.ends_with('/'))
            })
            .unwrap_or_else(|| "data".to_string());
        let mut entry = Entry::new(name, 0, EntryKind::File);
        entry.compressed_size = substrate.size();
        CompressedReader {
            substrate,
            handle: tokio::runtime::Handle::current(),
            compression,
            limits,
            profile,
            cancel,
            entry,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        std::slice::from_ref(&self.entry)
    }

    pub async fn close(&self) -> Result<()> {
        self.substrate.close().await
    }

    fn body(&self) -> Result<Box<dyn Read + Send>> {
        let raw = SyncReader::new(
            Arc::clone(&self.substrate),
            self.handle.clone(),
            self.cancel.clone(),
        );
        let ctx = DecodeContext::new(self.limits.clone(), self.profile, self.cancel.clone());
        let decoder = outer_decoder(
            self.compression,
            Box::new(raw),
            &ctx,
            self.limits.max_uncompressed_entry_bytes,
        )?;
        Ok(Box::new(BoundedReader::new(
            decoder,
            self.limits.max_uncompressed_entry_bytes,
            Code::ArchiveLimitExceeded,
        )))
    }

    pub async fn read_entry(&self) -> Result<Bytes> {
        self.cancel.check()?;
        let mut body = self.body()?;
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut out = Vec::new();
            body.read_to_end(&mut out)
                .map_err(|e| ArchiveError::from_io(e, Code::ArchiveBadHeader))?;
            Ok(out)
        })
        .await
        .map_err(|e| {
            ArchiveError::new(Code::ArchiveTruncated, format!("blocking task failed: {e}"))
        })??;
        Ok(Bytes::from(bytes))
    }

    fn audit(&self) -> AuditReport {
        let mut summary = Summary::new(self.profile, match self.compression {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
            Compression::Brotli => "brotli",
        });
        summary.entries = 1;
        summary.total_compressed_bytes = self.entry.compressed_size;
        let mut issues = Vec::new();
        if self.compression == Compression::Brotli {
            issues.push(AuditIssue::warning(
                Code::CompressionBackendUnavailable,
                "no brotli decoder in this build; payload cannot be inspected",
            ));
        }
        AuditReport::assemble(self.profile, summary, issues)
    }

    /// Normalized single-file form: a deterministic gzip member.
    async fn normalize_to<W: std::io::Write>(
        &self,
        mut out: W,
        options: &NormalizeOptions,
    ) -> Result<NormalizeReport> {
        use flate2::{Compression as Level, GzBuilder};
        use std::io::Write;

        let cancel = self.cancel.clone().merged(options.cancel.clone());
        cancel.check()?;
        let body = self.read_entry().await?;
        let mut encoder = GzBuilder::new().write(&mut out, Level::default());
        encoder
            .write_all(&body)
            .and_then(|()| encoder.finish().map(drop))
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated))?;

        let mut summary = Summary::new(self.profile, "gzip");
        summary.entries = 1;
        summary.total_uncompressed_bytes = body.len() as u64;
        let audit = AuditReport::assemble(self.profile, summary, Vec::new());
        let mut report = NormalizeReport::from_audit(audit);
        report.output_entries = 1;
        report.recompressed_entries = 1;
        Ok(report)
    }
}
