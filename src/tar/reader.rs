//! TAR scanning over a (possibly compressed) substrate stream.
//!
//! The whole index is built in one pass on a blocking thread, the way a
//! remote-substrate reader has to: compressed outer layers make offsets
//! meaningless until decompressed, so each body open re-streams from the
//! start and skips to the recorded payload offset.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use chrono::TimeZone;
use tracing::debug;

use crate::cancel::{Cancel, CancelCounter};
use crate::codec::{DecodeContext, outer_decoder};
use crate::entry::{Entry, EntryKind};
use crate::error::{ArchiveError, Code, Result};
use crate::limits::{Limits, Profile};
use crate::report::{AuditIssue, Severity};
use crate::sniff::Compression;
use crate::substrate::{Substrate, SyncReader};

use super::header::{self, BLOCK, TypeFlag};
use super::pax;

/// Cap on pax / GNU-longname payloads; metadata this large is an attack.
const META_PAYLOAD_CAP: u64 = 1024 * 1024;
/// How far past the terminator the trailing-bytes check looks.
const TRAILER_SCAN: usize = 64 * 1024;

pub struct TarReader {
    substrate: Arc<dyn Substrate>,
    handle: tokio::runtime::Handle,
    outer: Option<Compression>,
    limits: Limits,
    profile: Profile,
    cancel: Cancel,
    entries: Vec<Entry>,
    issues: Vec<AuditIssue>,
}

impl TarReader {
    pub async fn open(
        substrate: Arc<dyn Substrate>,
        outer: Option<Compression>,
        limits: Limits,
        profile: Profile,
        cancel: Cancel,
    ) -> Result<TarReader> {
        let size = substrate.size();
        if size > limits.max_input_bytes {
            return Err(ArchiveError::new(
                Code::ArchiveLimitExceeded,
                format!("{size}-byte input exceeds the cap of {}", limits.max_input_bytes),
            ));
        }
        let handle = tokio::runtime::Handle::current();
        let scan_substrate = Arc::clone(&substrate);
        let scan_limits = limits.clone();
        let scan_cancel = cancel.clone();
        let scan_handle = handle.clone();
        let (entries, issues) = tokio::task::spawn_blocking(move || {
            let stream = build_stream(
                scan_substrate,
                scan_handle,
                outer,
                &scan_limits,
                profile,
                scan_cancel.clone(),
            )?;
            scan(stream, &scan_limits, profile, scan_cancel)
        })
        .await
        .map_err(|e| ArchiveError::new(Code::ArchiveTruncated, format!("blocking task failed: {e}")))??;
        debug!(entries = entries.len(), "tar index built");

        Ok(TarReader {
            substrate,
            handle,
            outer,
            limits,
            profile,
            cancel,
            entries,
            issues,
        })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Findings collected during the scan (checksums, truncation, trailers).
    pub fn parse_issues(&self) -> Vec<AuditIssue> {
        self.issues.clone()
    }

    pub(crate) fn cancel(&self) -> &Cancel {
        &self.cancel
    }

    pub async fn close(&self) -> Result<()> {
        self.substrate.close().await
    }

    /// Open a streaming body; reads happen from a blocking context and skip
    /// to the payload on first use.
    pub async fn open_entry(&self, entry: &Entry) -> Result<TarBody> {
        self.cancel.check()?;
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
        Ok(TarBody {
            spec: Some(BodySpec {
                substrate: Arc::clone(&self.substrate),
                handle: self.handle.clone(),
                outer: self.outer,
                limits: self.limits.clone(),
                profile: self.profile,
                cancel: self.cancel.clone(),
                payload_offset: entry.payload_offset,
            }),
            chain: None,
            remaining: entry.size,
            entry_name: entry.name.clone(),
        })
    }

    /// Whole-body convenience read.
    pub async fn read_entry(&self, entry: &Entry) -> Result<Bytes> {
        let mut body = self.open_entry(entry).await?;
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut out = Vec::new();
            body.read_to_end(&mut out)
                .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated))?;
            Ok(out)
        })
        .await
        .map_err(|e| ArchiveError::new(Code::ArchiveTruncated, format!("blocking task failed: {e}")))??;
        Ok(Bytes::from(bytes))
    }
}

fn build_stream(
    substrate: Arc<dyn Substrate>,
    handle: tokio::runtime::Handle,
    outer: Option<Compression>,
    limits: &Limits,
    profile: Profile,
    cancel: Cancel,
) -> Result<Box<dyn Read + Send>> {
    let raw = SyncReader::new(substrate, handle, cancel.clone());
    match outer {
        None => Ok(Box::new(raw)),
        Some(compression) => {
            let ctx = DecodeContext::new(limits.clone(), profile, cancel);
            outer_decoder(
                compression,
                Box::new(raw),
                &ctx,
                limits.max_total_uncompressed_bytes,
            )
        }
    }
}

fn severity_for_checksum(profile: Profile) -> Severity {
    match profile {
        Profile::Compat => Severity::Warning,
        Profile::Strict | Profile::Agent => Severity::Error,
    }
}

fn read_block<R: Read>(stream: &mut R, block: &mut [u8]) -> Result<bool> {
    let mut filled = 0usize;
    while filled < block.len() {
        let n = stream
            .read(&mut block[filled..])
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated))?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ArchiveError::new(
                Code::ArchiveTruncated,
                "input ends inside a tar block",
            ));
        }
        filled += n;
    }
    Ok(true)
}

fn skip<R: Read>(stream: &mut R, mut n: u64, counter: &mut CancelCounter) -> Result<()> {
    let mut buf = [0u8; 8192];
    while n > 0 {
        let take = n.min(buf.len() as u64) as usize;
        let got = stream
            .read(&mut buf[..take])
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated))?;
        if got == 0 {
            return Err(ArchiveError::new(
                Code::ArchiveTruncated,
                "input ends inside an entry payload",
            ));
        }
        counter.step(got)?;
        n -= got as u64;
    }
    Ok(())
}

fn read_meta_payload<R: Read>(
    stream: &mut R,
    size: u64,
    counter: &mut CancelCounter,
) -> Result<Vec<u8>> {
    if size > META_PAYLOAD_CAP {
        return Err(ArchiveError::new(
            Code::ArchiveLimitExceeded,
            format!("metadata record of {size} bytes exceeds the cap of {META_PAYLOAD_CAP}"),
        ));
    }
    let mut payload = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < payload.len() {
        let n = stream
            .read(&mut payload[filled..])
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated))?;
        if n == 0 {
            return Err(ArchiveError::new(
                Code::ArchiveTruncated,
                "input ends inside a metadata payload",
            ));
        }
        counter.step(n)?;
        filled += n;
    }
    Ok(payload)
}

fn padding_for(size: u64) -> u64 {
    (BLOCK as u64 - size % BLOCK as u64) % BLOCK as u64
}

/// One pass over the stream building the entry index.
fn scan(
    mut stream: Box<dyn Read + Send>,
    limits: &Limits,
    profile: Profile,
    cancel: Cancel,
) -> Result<(Vec<Entry>, Vec<AuditIssue>)> {
    let mut counter = CancelCounter::new(cancel);
    let mut entries: Vec<Entry> = Vec::new();
    let mut issues: Vec<AuditIssue> = Vec::new();
    let mut globals: BTreeMap<String, String> = BTreeMap::new();
    let mut pending_pax: Option<BTreeMap<String, String>> = None;
    let mut pending_long_name: Option<String> = None;
    let mut pending_long_link: Option<String> = None;
    let mut offset = 0u64;
    let mut zero_blocks = 0u32;
    let mut total_declared = 0u64;
    let mut block = [0u8; BLOCK];

    loop {
        let got = read_block(&mut stream, &mut block)?;
        if !got {
            if entries.is_empty() && offset == 0 {
                return Err(ArchiveError::new(Code::ArchiveBadHeader, "empty tar input"));
            }
            let issue = AuditIssue::new(
                Code::ArchiveTruncated,
                severity_for_checksum(profile),
                "input ended without the double zero-block terminator",
            );
            issues.push(issue.with_offset(offset));
            break;
        }
        offset += BLOCK as u64;
        counter.step(BLOCK)?;

        if header::is_zero_block(&block) {
            zero_blocks += 1;
            if zero_blocks == 2 {
                check_trailer(&mut stream, offset, &mut issues, &mut counter)?;
                break;
            }
            continue;
        }
        if zero_blocks == 1 {
            issues.push(
                AuditIssue::warning(Code::ArchiveBadHeader, "lone zero block inside the archive")
                    .with_offset(offset - BLOCK as u64),
            );
            zero_blocks = 0;
        }

        let head = header::parse(&block)?;
        if !head.checksum_ok {
            issues.push(
                AuditIssue::new(
                    Code::TarBadChecksum,
                    severity_for_checksum(profile),
                    "header checksum mismatch",
                )
                .with_entry(head.name.clone())
                .with_offset(offset - BLOCK as u64),
            );
        }
        let padded = head.size + padding_for(head.size);

        match head.typeflag {
            TypeFlag::GnuLongName => {
                let payload = read_meta_payload(&mut stream, head.size, &mut counter)?;
                offset += padded;
                skip(&mut stream, padding_for(head.size), &mut counter)?;
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                pending_long_name = Some(String::from_utf8_lossy(&payload[..end]).into_owned());
            }
            TypeFlag::GnuLongLink => {
                let payload = read_meta_payload(&mut stream, head.size, &mut counter)?;
                offset += padded;
                skip(&mut stream, padding_for(head.size), &mut counter)?;
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                pending_long_link = Some(String::from_utf8_lossy(&payload[..end]).into_owned());
            }
            TypeFlag::PaxGlobal => {
                let payload = read_meta_payload(&mut stream, head.size, &mut counter)?;
                offset += padded;
                skip(&mut stream, padding_for(head.size), &mut counter)?;
                globals.extend(pax::parse(&payload)?);
            }
            TypeFlag::PaxEntry => {
                let payload = read_meta_payload(&mut stream, head.size, &mut counter)?;
                offset += padded;
                skip(&mut stream, padding_for(head.size), &mut counter)?;
                pending_pax = Some(pax::parse(&payload)?);
            }
            flag => {
                // Effective pax view: globals overlaid by this entry's records.
                let mut pax_records = globals.clone();
                if let Some(own) = pending_pax.take() {
                    pax_records.extend(own);
                }

                let mut name = pending_long_name.take().unwrap_or(head.name);
                if let Some(path) = pax_records.get("path") {
                    name = path.clone();
                }
                let mut link_name = pending_long_link.take().or(head.link_name);
                if let Some(linkpath) = pax_records.get("linkpath") {
                    link_name = Some(linkpath.clone());
                }
                let mut size = head.size;
                if let Some(pax_size) = pax_records.get("size") {
                    size = pax_size.parse().map_err(|_| {
                        ArchiveError::new(
                            Code::ArchiveBadHeader,
                            format!("invalid pax size {pax_size:?}"),
                        )
                    })?;
                }
                let mut mtime = head.mtime;
                if let Some(pax_mtime) = pax_records.get("mtime") {
                    let seconds = pax_mtime
                        .split('.')
                        .next()
                        .and_then(|s| s.parse::<i64>().ok());
                    if let Some(seconds) = seconds {
                        mtime = Some(seconds);
                    }
                }

                let mut kind = flag.entry_kind();
                if kind == EntryKind::File && name.ends_with('/') {
                    kind = EntryKind::Directory;
                }
                if kind == EntryKind::Directory && !name.ends_with('/') {
                    name.push('/');
                }

                if entries.len() as u64 >= limits.max_entries {
                    return Err(ArchiveError::new(
                        Code::ArchiveLimitExceeded,
                        format!("more than {} entries", limits.max_entries),
                    ));
                }
                total_declared = total_declared.saturating_add(size);
                if total_declared > limits.max_total_uncompressed_bytes {
                    return Err(ArchiveError::new(
                        Code::ArchiveLimitExceeded,
                        format!(
                            "declared payload total exceeds the cap of {}",
                            limits.max_total_uncompressed_bytes
                        ),
                    ));
                }

                let entry_size = if kind == EntryKind::Directory { 0 } else { size };
                let mut entry = Entry::new(name, entry_size, kind);
                entry.mode = head.mode;
                entry.uid = head.uid;
                entry.gid = head.gid;
                entry.mtime = mtime
                    .and_then(|secs| chrono::Utc.timestamp_opt(secs, 0).single());
                entry.link_name = link_name;
                entry.pax = pax_records;
                entry.payload_offset = offset;
                entry.compressed_size = entry_size;
                entries.push(entry);

                // A pax size override also governs how many data blocks the
                // payload occupies (POSIX pax semantics).
                let occupied = size + padding_for(size);
                skip(&mut stream, occupied, &mut counter)?;
                offset += occupied;
            }
        }
    }

    Ok((entries, issues))
}

/// After the double zero block, anything non-zero is suspicious trailing
/// data.
fn check_trailer(
    stream: &mut Box<dyn Read + Send>,
    offset: u64,
    issues: &mut Vec<AuditIssue>,
    counter: &mut CancelCounter,
) -> Result<()> {
    let mut buf = vec![0u8; TRAILER_SCAN];
    let mut filled = 0usize;
    loop {
        let n = stream
            .read(&mut buf[filled..])
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated))?;
        if n == 0 {
            break;
        }
        counter.step(n)?;
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    if buf[..filled].iter().any(|&b| b != 0) {
        issues.push(
            AuditIssue::warning(
                Code::ArchiveTrailingBytes,
                "non-zero bytes after the tar terminator",
            )
            .with_offset(offset),
        );
    }
    Ok(())
}

struct BodySpec {
    substrate: Arc<dyn Substrate>,
    handle: tokio::runtime::Handle,
    outer: Option<Compression>,
    limits: Limits,
    profile: Profile,
    cancel: Cancel,
    payload_offset: u64,
}

/// Streaming TAR entry body; skips to the payload lazily on first read.
pub struct TarBody {
    spec: Option<BodySpec>,
    chain: Option<Box<dyn Read + Send>>,
    remaining: u64,
    entry_name: String,
}

impl Read for TarBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.chain.is_none() {
            let spec = match self.spec.take() {
                Some(spec) => spec,
                None => return Ok(0),
            };
            let mut counter = CancelCounter::new(spec.cancel.clone());
            let mut stream = build_stream(
                spec.substrate,
                spec.handle,
                spec.outer,
                &spec.limits,
                spec.profile,
                spec.cancel,
            )
            .map_err(std::io::Error::from)?;
            skip(&mut stream, spec.payload_offset, &mut counter).map_err(|e| {
                std::io::Error::from(e.with_entry(self.entry_name.clone()))
            })?;
            self.chain = Some(stream);
        }
        if self.remaining == 0 {
            return Ok(0);
        }
        let chain = self.chain.as_mut().expect("chain built");
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = chain.read(&mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("payload of {} ended early", self.entry_name),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
