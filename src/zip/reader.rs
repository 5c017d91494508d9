//! The reader proper: EOCD → central directory → validated entry streams.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::cancel::Cancel;
use crate::codec::{AesReader, CodecRegistry, DecodeContext};
use crate::entry::{Encryption, Entry};
use crate::error::{ArchiveError, Code, Result};
use crate::limits::{Limits, Profile};
use crate::report::AuditIssue;
use crate::substrate::{Substrate, SubstrateExt, SyncReader};

use super::{LOCAL_MIN, LOCAL_SIG, central, eocd};

/// Random-access ZIP reader. Owns its substrate; `close` releases it.
pub struct ZipReader {
    substrate: Arc<dyn Substrate>,
    handle: tokio::runtime::Handle,
    registry: Arc<CodecRegistry>,
    limits: Limits,
    profile: Profile,
    cancel: Cancel,
    password: Option<String>,
    eocd: eocd::Eocd,
    entries: Vec<Entry>,
    parse_issues: Vec<AuditIssue>,
}

/// Result of reconciling one entry's local header against the central
/// directory.
pub struct LocalCheck {
    pub data_offset: u64,
    pub data_end: u64,
    pub issues: Vec<AuditIssue>,
}

impl ZipReader {
    pub async fn open(
        substrate: Arc<dyn Substrate>,
        registry: Arc<CodecRegistry>,
        limits: Limits,
        profile: Profile,
        password: Option<String>,
        cancel: Cancel,
    ) -> Result<ZipReader> {
        let size = substrate.size();
        if size > limits.max_input_bytes {
            return Err(ArchiveError::new(
                Code::ArchiveLimitExceeded,
                format!("{size}-byte input exceeds the cap of {}", limits.max_input_bytes),
            ));
        }
        let eocd = eocd::locate(substrate.as_ref(), &limits, &cancel).await?;
        debug!(
            cd_offset = eocd.cd_offset,
            cd_size = eocd.cd_size,
            entries = eocd.total_entries,
            zip64 = eocd.zip64,
            "EOCD located"
        );
        let cd = substrate
            .read_exact_range(eocd.cd_offset, eocd.cd_size, &cancel)
            .await?;
        let (entries, parse_issues) = central::parse(&cd, size, eocd.total_entries, &limits)?;

        Ok(ZipReader {
            substrate,
            handle: tokio::runtime::Handle::current(),
            registry,
            limits,
            profile,
            cancel,
            password,
            eocd,
            entries,
            parse_issues,
        })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn eocd(&self) -> &eocd::Eocd {
        &self.eocd
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub(crate) fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    pub(crate) fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    pub(crate) fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub(crate) fn cancel(&self) -> &Cancel {
        &self.cancel
    }

    /// Findings collected while parsing (EOCD anomalies, name decoding).
    pub fn parse_issues(&self) -> Vec<AuditIssue> {
        let mut issues = self.eocd.warnings.clone();
        issues.extend(self.parse_issues.iter().cloned());
        issues
    }

    pub async fn close(&self) -> Result<()> {
        self.substrate.close().await
    }

    /// Read the local header for `entry` and reconcile it against the
    /// central directory record byte for byte.
    pub async fn reconcile(&self, entry: &Entry, cancel: &Cancel) -> Result<LocalCheck> {
        let lho = entry.local_header_offset;
        let header = self
            .substrate
            .read_exact_range(lho, LOCAL_MIN, cancel)
            .await?;
        if header[..4] != LOCAL_SIG {
            return Err(ArchiveError::new(
                Code::ZipInvalidSignature,
                "bad local file header signature",
            )
            .with_entry(&entry.name)
            .with_offset(lho));
        }
        let l_flags = u16::from_le_bytes([header[6], header[7]]);
        let l_method = u16::from_le_bytes([header[8], header[9]]);
        let l_name_len = u16::from_le_bytes([header[26], header[27]]) as u64;
        let l_extra_len = u16::from_le_bytes([header[28], header[29]]) as u64;

        let mut issues = Vec::new();
        let mismatch = |what: &str, cd: String, local: String| {
            ArchiveError::new(
                Code::ZipHeaderMismatch,
                format!("local header {what} ({local}) differs from central directory ({cd})"),
            )
            .with_entry(&entry.name)
            .with_offset(lho)
        };
        if l_flags != entry.flags {
            return Err(mismatch(
                "flags",
                format!("{:#06x}", entry.flags),
                format!("{l_flags:#06x}"),
            ));
        }
        if l_method != entry.method {
            return Err(mismatch(
                "method",
                entry.method.to_string(),
                l_method.to_string(),
            ));
        }
        if l_name_len != entry.raw_name.len() as u64 {
            return Err(mismatch(
                "name length",
                entry.raw_name.len().to_string(),
                l_name_len.to_string(),
            ));
        }
        if l_name_len > 0 {
            let name = self
                .substrate
                .read_exact_range(lho + LOCAL_MIN, l_name_len, cancel)
                .await?;
            if name[..] != entry.raw_name[..] {
                return Err(mismatch(
                    "name bytes",
                    String::from_utf8_lossy(&entry.raw_name).into_owned(),
                    String::from_utf8_lossy(&name).into_owned(),
                ));
            }
        }
        if l_extra_len != u64::from(entry.cd_extra_len) {
            // Real writers routinely shrink the central copy, so compat
            // accepts the local value; strict profiles treat it as tampering.
            let issue = mismatch(
                "extra length",
                entry.cd_extra_len.to_string(),
                l_extra_len.to_string(),
            );
            if self.profile != Profile::Compat {
                return Err(issue);
            }
            issues.push(
                AuditIssue::warning(Code::ZipHeaderMismatch, issue.message().to_string())
                    .with_entry(&entry.name),
            );
        }

        let data_offset = lho
            .checked_add(LOCAL_MIN)
            .and_then(|v| v.checked_add(l_name_len))
            .and_then(|v| v.checked_add(l_extra_len))
            .ok_or_else(|| {
                ArchiveError::new(Code::ZipBadCentralDirectory, "data offset overflow")
                    .with_entry(&entry.name)
            })?;
        let data_end = data_offset.checked_add(entry.compressed_size).ok_or_else(|| {
            ArchiveError::new(Code::ZipBadCentralDirectory, "data end overflow")
                .with_entry(&entry.name)
        })?;
        if data_end > self.eocd.cd_offset {
            return Err(ArchiveError::new(
                Code::ZipOverlappingEntries,
                format!(
                    "entry data [{data_offset}, {data_end}) runs into the central directory at {}",
                    self.eocd.cd_offset
                ),
            )
            .with_entry(&entry.name));
        }
        Ok(LocalCheck {
            data_offset,
            data_end,
            issues,
        })
    }

    /// Open a streaming body for `entry`. The stream verifies the CRC-32 of
    /// the decompressed bytes when the final byte is read; use it from a
    /// blocking context.
    pub async fn open_entry(&self, entry: &Entry) -> Result<EntryBody> {
        self.cancel.check()?;

        let (method, check_crc) = match entry.encryption {
            Encryption::None => (entry.method, true),
            Encryption::Aes {
                actual_method,
                vendor,
                ..
            } => {
                if self.password.is_none() {
                    return Err(ArchiveError::new(
                        Code::ZipPasswordRequired,
                        "entry is AES-encrypted and no password was supplied",
                    )
                    .with_entry(&entry.name));
                }
                // AE-2 zeroes the CRC field; authentication covers integrity.
                (actual_method, vendor < 2)
            }
            Encryption::ZipCrypto => {
                return Err(ArchiveError::new(
                    Code::ZipUnsupportedEncryption,
                    "legacy PKWARE encryption is not supported",
                )
                .with_entry(&entry.name));
            }
            Encryption::Strong => {
                return Err(ArchiveError::new(
                    Code::ZipUnsupportedEncryption,
                    "strong encryption (flag bit 6) is not supported",
                )
                .with_entry(&entry.name));
            }
        };

        if entry.size > self.limits.max_uncompressed_entry_bytes {
            return Err(ArchiveError::new(
                Code::ArchiveLimitExceeded,
                format!(
                    "entry declares {} bytes, cap is {}",
                    entry.size, self.limits.max_uncompressed_entry_bytes
                ),
            )
            .with_entry(&entry.name));
        }
        if entry.compressed_size > 0
            && entry.size / entry.compressed_size > self.limits.max_compression_ratio
        {
            return Err(ArchiveError::new(
                Code::ArchiveLimitExceeded,
                format!(
                    "compression ratio {}:1 exceeds the cap of {}:1",
                    entry.size / entry.compressed_size,
                    self.limits.max_compression_ratio
                ),
            )
            .with_entry(&entry.name));
        }
        if entry.flags & central::flags::DATA_DESCRIPTOR != 0 && entry.compressed_size == 0 && entry.size > 0
        {
            return Err(ArchiveError::new(
                Code::ZipEntriesNotStored,
                "descriptor entry sizes were never copied into the central directory",
            )
            .with_entry(&entry.name));
        }

        // Resolve the codec now so unsupported methods fail at open.
        self.registry.decompressor(method)?;

        let check = self.reconcile(entry, &self.cancel).await?;
        let ctx = DecodeContext::new(self.limits.clone(), self.profile, self.cancel.clone())
            .with_entry(entry.size, entry.flags);

        Ok(EntryBody {
            state: BodyState::HeaderRead,
            spec: Some(ChainSpec {
                substrate: Arc::clone(&self.substrate),
                handle: self.handle.clone(),
                registry: Arc::clone(&self.registry),
                cancel: self.cancel.clone(),
                ctx,
                data_offset: check.data_offset,
                compressed_size: entry.compressed_size,
                encryption: entry.encryption,
                password: self.password.clone(),
                method,
            }),
            chain: None,
            hasher: crc32fast::Hasher::new(),
            produced: 0,
            expected_size: entry.size,
            expected_crc: entry.crc32,
            check_crc,
            cap: self.limits.max_uncompressed_entry_bytes,
            entry_name: entry.name.clone(),
        })
    }

    /// Read a whole entry body (bounded by the limits).
    pub async fn read_entry(&self, entry: &Entry) -> Result<Bytes> {
        let mut body = self.open_entry(entry).await?;
        let size_hint = entry.size.min(self.limits.max_uncompressed_entry_bytes) as usize;
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut out = Vec::with_capacity(size_hint.min(1 << 20));
            body.read_to_end(&mut out)
                .map_err(|e| ArchiveError::from_io(e, Code::ZipBadCrc))?;
            Ok(out)
        })
        .await
        .map_err(|e| ArchiveError::new(Code::ArchiveTruncated, format!("blocking task failed: {e}")))??;
        Ok(Bytes::from(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    HeaderRead,
    Streaming,
    CrcVerified,
    Closed,
}

struct ChainSpec {
    substrate: Arc<dyn Substrate>,
    handle: tokio::runtime::Handle,
    registry: Arc<CodecRegistry>,
    cancel: Cancel,
    ctx: DecodeContext,
    data_offset: u64,
    compressed_size: u64,
    encryption: Encryption,
    password: Option<String>,
    method: u16,
}

impl ChainSpec {
    /// Build the decrypt → decompress pipeline. Runs on a blocking thread.
    fn build(self) -> Result<Box<dyn Read + Send>> {
        let window = SyncReader::new(self.substrate, self.handle, self.cancel)
            .window(self.data_offset, self.compressed_size);
        let source: Box<dyn Read + Send> = match self.encryption {
            Encryption::Aes { strength, .. } => {
                let password = self.password.as_deref().unwrap_or_default();
                Box::new(AesReader::new(
                    window,
                    strength,
                    password,
                    self.compressed_size,
                )?)
            }
            _ => Box::new(window),
        };
        let codec = self.registry.decompressor(self.method)?;
        codec.decompress(source, &self.ctx)
    }
}

/// Streaming entry body. State machine: header-read → body-streaming →
/// crc-verified; any error closes the stream for good.
pub struct EntryBody {
    state: BodyState,
    spec: Option<ChainSpec>,
    chain: Option<Box<dyn Read + Send>>,
    hasher: crc32fast::Hasher,
    produced: u64,
    expected_size: u64,
    expected_crc: u32,
    check_crc: bool,
    cap: u64,
    entry_name: String,
}

impl EntryBody {
    pub fn bytes_produced(&self) -> u64 {
        self.produced
    }

    /// Has the stream reached EOF with its CRC verified?
    pub fn crc_verified(&self) -> bool {
        self.state == BodyState::CrcVerified
    }

    fn fail(&mut self, err: ArchiveError) -> std::io::Error {
        self.state = BodyState::Closed;
        self.chain = None;
        err.into()
    }
}

impl Read for EntryBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.state {
            BodyState::Closed => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "entry body is closed",
                ));
            }
            BodyState::CrcVerified => return Ok(0),
            BodyState::HeaderRead => {
                let spec = self.spec.take().expect("spec present before streaming");
                match spec.build() {
                    Ok(chain) => {
                        self.chain = Some(chain);
                        self.state = BodyState::Streaming;
                    }
                    Err(err) => return Err(self.fail(err)),
                }
            }
            BodyState::Streaming => {}
        }

        let chain = self.chain.as_mut().expect("chain built");
        let n = match chain.read(buf) {
            Ok(n) => n,
            Err(e) => {
                let err = ArchiveError::from_io(e, Code::ZipBadCrc);
                return Err(self.fail(err));
            }
        };
        if n == 0 {
            // EOF: verify byte count and CRC before reporting success.
            if self.produced != self.expected_size {
                let err = ArchiveError::new(
                    Code::ZipBadCrc,
                    format!(
                        "entry produced {} bytes, central directory declared {}",
                        self.produced, self.expected_size
                    ),
                )
                .with_entry(&self.entry_name);
                return Err(self.fail(err));
            }
            let actual = std::mem::take(&mut self.hasher).finalize();
            if self.check_crc && actual != self.expected_crc {
                let err = ArchiveError::new(
                    Code::ZipBadCrc,
                    format!(
                        "CRC-32 mismatch: stored {:#010x}, computed {actual:#010x}",
                        self.expected_crc
                    ),
                )
                .with_entry(&self.entry_name);
                return Err(self.fail(err));
            }
            self.state = BodyState::CrcVerified;
            self.chain = None;
            return Ok(0);
        }

        self.hasher.update(&buf[..n]);
        self.produced += n as u64;
        if self.produced > self.cap {
            let err = ArchiveError::new(
                Code::ArchiveLimitExceeded,
                format!("entry output exceeds the cap of {} bytes", self.cap),
            )
            .with_entry(&self.entry_name);
            return Err(self.fail(err));
        }
        if self.produced > self.expected_size {
            let err = ArchiveError::new(
                Code::ZipBadCrc,
                format!(
                    "entry produced more than the declared {} bytes",
                    self.expected_size
                ),
            )
            .with_entry(&self.entry_name);
            return Err(self.fail(err));
        }
        Ok(n)
    }
}
