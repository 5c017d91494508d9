//! Deterministic re-emission: collision-resolved names, scrubbed metadata,
//! recompressed or byte-preserved bodies, and a machine-readable report.
//!
//! Normalization fails fast on the first defect the chosen policies cannot
//! absorb; callers must treat partial output as corrupt.

mod tar_writer;
mod zip_writer;

use std::collections::HashMap;
use std::io::Write;

use chrono::{TimeZone, Utc};
use tracing::debug;

use crate::cancel::Cancel;
use crate::codec::method;
use crate::entry::{Encryption, Entry, EntryKind};
use crate::error::{ArchiveError, Code, Result};
use crate::gzip::GzipReader;
use crate::names;
use crate::report::{AuditIssue, AuditReport, CollisionKind, NormalizeReport, Summary};
use crate::substrate::SubstrateExt;
use crate::tar::TarReader;
use crate::zip::ZipReader;

pub use tar_writer::{TarEntrySpec, TarWriter};
pub use zip_writer::{EntrySpec, ZipWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalizeMode {
    /// Decode and re-encode bodies with the target method.
    #[default]
    Safe,
    /// Copy compressed bodies byte-for-byte; rewrite only the framing.
    Lossless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    Error,
    LastWins,
    Rename,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnUnsupported {
    #[default]
    Fail,
    Drop,
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub mode: NormalizeMode,
    /// Scrub timestamps/ownership/modes and sort entries by name.
    pub deterministic: bool,
    /// Target method for safe-mode recompression (ZIP output).
    pub target_method: u16,
    pub on_duplicate: ConflictPolicy,
    pub on_case_collision: ConflictPolicy,
    pub on_unsupported: OnUnsupported,
    pub cancel: Option<tokio_util::sync::CancellationToken>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        NormalizeOptions {
            mode: NormalizeMode::Safe,
            deterministic: true,
            target_method: method::DEFLATE,
            on_duplicate: ConflictPolicy::Error,
            on_case_collision: ConflictPolicy::Error,
            on_unsupported: OnUnsupported::Fail,
            cancel: None,
        }
    }
}

/// The deterministic-mode epoch: 1980-01-01T00:00:00Z (DOS time zero-day).
pub fn deterministic_epoch() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0).single().expect("fixed date")
}

fn collision_error(kind: CollisionKind, name: &str, existing: &str) -> ArchiveError {
    ArchiveError::new(
        Code::ArchiveNameCollision,
        format!(
            "{:?} collides with {:?} (collisionKind={})",
            name,
            existing,
            kind.as_str()
        ),
    )
    .with_entry(name)
}

#[derive(Debug)]
struct Plan {
    source: usize,
    name: String,
}

struct Planner {
    plans: Vec<Option<Plan>>,
    exact: HashMap<String, usize>,
    nfc: HashMap<String, (String, usize)>,
    folded: HashMap<String, (String, usize)>,
    renamed: u64,
    dropped: u64,
}

impl Planner {
    fn new() -> Self {
        Planner {
            plans: Vec::new(),
            exact: HashMap::new(),
            nfc: HashMap::new(),
            folded: HashMap::new(),
            renamed: 0,
            dropped: 0,
        }
    }

    fn would_collide(&self, name: &str) -> bool {
        self.exact.contains_key(name) || self.folded.contains_key(&names::casefold_key(name))
    }

    fn insert(&mut self, source: usize, name: String) {
        let slot = self.plans.len();
        self.exact.insert(name.clone(), slot);
        self.nfc
            .insert(names::nfc_key(&name), (name.clone(), slot));
        self.folded
            .insert(names::casefold_key(&name), (name.clone(), slot));
        self.plans.push(Some(Plan { source, name }));
    }

    fn drop_plan(&mut self, slot: usize) {
        if let Some(plan) = self.plans[slot].take() {
            self.exact.remove(&plan.name);
            self.dropped += 1;
        }
    }

    /// Place one entry under the conflict policies.
    fn place(
        &mut self,
        source: usize,
        name: String,
        on_duplicate: ConflictPolicy,
        on_case_collision: ConflictPolicy,
    ) -> Result<()> {
        if let Some(&slot) = self.exact.get(&name) {
            return match on_duplicate {
                ConflictPolicy::Error => {
                    Err(collision_error(CollisionKind::Duplicate, &name, &name))
                }
                ConflictPolicy::LastWins => {
                    self.drop_plan(slot);
                    self.insert(source, name);
                    Ok(())
                }
                ConflictPolicy::Rename => {
                    let renamed = self.rename(&name)?;
                    self.insert(source, renamed);
                    self.renamed += 1;
                    Ok(())
                }
            };
        }
        if let Some((existing, _)) = self.nfc.get(&names::nfc_key(&name))
            && *existing != name
        {
            // Distinct bytes, one NFC form: unrecoverable without rewriting.
            return Err(collision_error(CollisionKind::UnicodeNfc, &name, existing));
        }
        if let Some((existing, slot)) = self.folded.get(&names::casefold_key(&name)).cloned() {
            return match on_case_collision {
                ConflictPolicy::Error => {
                    Err(collision_error(CollisionKind::Casefold, &name, &existing))
                }
                ConflictPolicy::LastWins => {
                    self.drop_plan(slot);
                    self.insert(source, name);
                    Ok(())
                }
                ConflictPolicy::Rename => {
                    let renamed = self.rename(&name)?;
                    self.insert(source, renamed);
                    self.renamed += 1;
                    Ok(())
                }
            };
        }
        self.insert(source, name);
        Ok(())
    }

    /// Smallest `~N` candidate free in both the exact and case-fold indexes.
    fn rename(&self, name: &str) -> Result<String> {
        for n in 1..=u32::MAX {
            let candidate = names::renamed(name, n);
            if !self.would_collide(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ArchiveError::new(
            Code::ArchiveNameCollision,
            format!("no rename candidate left for {name:?}"),
        ))
    }

    fn into_plans(self, deterministic: bool) -> (Vec<Plan>, u64, u64) {
        let mut plans: Vec<Plan> = self.plans.into_iter().flatten().collect();
        if deterministic {
            plans.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        }
        (plans, self.renamed, self.dropped)
    }
}

fn plan_entries(
    entries: &[Entry],
    options: &NormalizeOptions,
) -> Result<(Vec<Plan>, u64, u64)> {
    let mut planner = Planner::new();
    for (index, entry) in entries.iter().enumerate() {
        let name = names::normalize_name(&entry.name)?;
        planner.place(index, name, options.on_duplicate, options.on_case_collision)?;
    }
    Ok(planner.into_plans(options.deterministic))
}

fn deterministic_mode(kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Directory => 0o755,
        EntryKind::Symlink => 0o777,
        _ => 0o644,
    }
}

/// Re-emit a ZIP archive into `out`.
pub async fn normalize_zip<W: Write>(
    reader: &ZipReader,
    out: W,
    options: &NormalizeOptions,
) -> Result<NormalizeReport> {
    let cancel = reader.cancel().merged(options.cancel.clone());
    let profile = reader.profile();
    let (plans, renamed, mut dropped) = plan_entries(reader.entries(), options)?;

    let mut writer = ZipWriter::new(out);
    let mut issues: Vec<AuditIssue> = Vec::new();
    let mut summary = Summary::new(profile, "zip");
    let mut output_entries = 0u64;
    let mut recompressed = 0u64;
    let mut preserved = 0u64;

    for plan in &plans {
        cancel.check()?;
        let entry = &reader.entries()[plan.source];
        summary.entries += 1;

        let (dos_time, dos_date, external_attrs) = if options.deterministic {
            let (time, date) = crate::zip::central::to_dos_datetime(deterministic_epoch());
            let attrs = if entry.is_dir() { 0x10 } else { 0 };
            (time, date, attrs)
        } else {
            let when = entry.mtime.unwrap_or_else(deterministic_epoch);
            let (time, date) = crate::zip::central::to_dos_datetime(when);
            (time, date, entry.external_attrs)
        };

        if entry.is_dir() {
            writer.add_entry(
                EntrySpec {
                    name: plan.name.clone(),
                    method: method::STORE,
                    crc32: 0,
                    uncompressed_size: 0,
                    dos_time,
                    dos_date,
                    external_attrs,
                },
                &[],
            )?;
            output_entries += 1;
            continue;
        }

        match options.mode {
            NormalizeMode::Lossless => {
                if entry.is_encrypted() {
                    match options.on_unsupported {
                        OnUnsupported::Fail => {
                            return Err(ArchiveError::new(
                                Code::ZipUnsupportedEncryption,
                                "cannot losslessly rewrite an encrypted entry",
                            )
                            .with_entry(&entry.name));
                        }
                        OnUnsupported::Drop => {
                            issues.push(
                                AuditIssue::warning(
                                    Code::ZipUnsupportedEncryption,
                                    "encrypted entry dropped in lossless mode",
                                )
                                .with_entry(&entry.name),
                            );
                            dropped += 1;
                            continue;
                        }
                    }
                }
                let check = reader.reconcile(entry, &cancel).await?;
                let body = reader
                    .substrate()
                    .read_exact_range(check.data_offset, entry.compressed_size, &cancel)
                    .await?;
                writer.add_entry(
                    EntrySpec {
                        name: plan.name.clone(),
                        method: entry.method(),
                        crc32: entry.crc32(),
                        uncompressed_size: entry.size,
                        dos_time,
                        dos_date,
                        external_attrs,
                    },
                    &body,
                )?;
                summary.total_uncompressed_bytes += entry.size;
                summary.total_compressed_bytes += body.len() as u64;
                preserved += 1;
                output_entries += 1;
            }
            NormalizeMode::Safe => {
                let body = match reader.read_entry(entry).await {
                    Ok(body) => body,
                    Err(err)
                        if matches!(
                            err.code,
                            Code::ZipUnsupportedMethod
                                | Code::ZipUnsupportedEncryption
                                | Code::ZipPasswordRequired
                                | Code::CompressionBackendUnavailable
                        ) && options.on_unsupported == OnUnsupported::Drop =>
                    {
                        issues.push(
                            AuditIssue::warning(err.code, err.message().to_string())
                                .with_entry(&entry.name),
                        );
                        dropped += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                let crc = crc32fast::hash(&body);
                let target = options.target_method;
                let compressed = reader
                    .registry()
                    .compressor(target)?
                    .compress(&body)?;
                writer.add_entry(
                    EntrySpec {
                        name: plan.name.clone(),
                        method: target,
                        crc32: crc,
                        uncompressed_size: body.len() as u64,
                        dos_time,
                        dos_date,
                        external_attrs,
                    },
                    &compressed,
                )?;
                summary.total_uncompressed_bytes += body.len() as u64;
                summary.total_compressed_bytes += compressed.len() as u64;
                recompressed += 1;
                output_entries += 1;
            }
        }
    }

    writer.finish(&[])?;
    debug!(output_entries, renamed, dropped, "zip normalization complete");

    let audit = AuditReport::assemble(profile, summary, issues);
    let mut report = NormalizeReport::from_audit(audit);
    report.output_entries = output_entries;
    report.dropped_entries = dropped;
    report.renamed_entries = renamed;
    report.recompressed_entries = recompressed;
    report.preserved_entries = preserved;
    Ok(report)
}

/// Re-emit a TAR stream into `out` (plain tar; outer compression is the
/// caller's concern).
pub async fn normalize_tar<W: Write>(
    reader: &TarReader,
    out: W,
    options: &NormalizeOptions,
) -> Result<NormalizeReport> {
    let cancel = reader.cancel().merged(options.cancel.clone());
    let profile = reader.profile();
    let (plans, renamed, mut dropped) = plan_entries(reader.entries(), options)?;

    let mut writer = TarWriter::new(out);
    let mut issues: Vec<AuditIssue> = Vec::new();
    let mut summary = Summary::new(profile, "tar");
    let mut output_entries = 0u64;
    let mut preserved = 0u64;

    for plan in &plans {
        cancel.check()?;
        let entry = &reader.entries()[plan.source];
        summary.entries += 1;

        if entry.kind == EntryKind::Hardlink {
            // Hardlink preservation is out of scope; dropping is the safe
            // default and is always reported.
            issues.push(
                AuditIssue::warning(
                    Code::ArchiveUnsupportedFeature,
                    "hardlink entry dropped during normalization",
                )
                .with_entry(&entry.name),
            );
            dropped += 1;
            continue;
        }

        let (mode, uid, gid, mtime) = if options.deterministic {
            (
                deterministic_mode(entry.kind),
                0,
                0,
                deterministic_epoch().timestamp(),
            )
        } else {
            (
                entry.mode.unwrap_or(0o644),
                entry.uid.unwrap_or(0),
                entry.gid.unwrap_or(0),
                entry.mtime.map(|t| t.timestamp()).unwrap_or(0),
            )
        };

        let body = if entry.kind == EntryKind::File {
            reader.read_entry(entry).await?
        } else {
            bytes::Bytes::new()
        };
        summary.total_uncompressed_bytes += body.len() as u64;
        summary.total_compressed_bytes += body.len() as u64;

        writer.add_entry(
            &TarEntrySpec {
                name: plan.name.clone(),
                kind: entry.kind,
                mode,
                uid,
                gid,
                mtime,
                link_name: entry.link_name.clone(),
            },
            &body,
        )?;
        output_entries += 1;
        preserved += 1;
    }

    writer.finish()?;
    debug!(output_entries, renamed, dropped, "tar normalization complete");

    let audit = AuditReport::assemble(profile, summary, issues);
    let mut report = NormalizeReport::from_audit(audit);
    report.output_entries = output_entries;
    report.dropped_entries = dropped;
    report.renamed_entries = renamed;
    report.preserved_entries = preserved;
    Ok(report)
}

/// Re-emit a gzip member deterministically (mtime zero, no name field in
/// deterministic mode, default-level deflate).
pub async fn normalize_gzip<W: Write>(
    reader: &GzipReader,
    mut out: W,
    options: &NormalizeOptions,
) -> Result<NormalizeReport> {
    use flate2::{Compression, GzBuilder};

    let cancel = Cancel::none().merged(options.cancel.clone());
    cancel.check()?;
    let profile = reader.profile();
    let entry = &reader.entries()[0];
    let name = names::normalize_name(&entry.name)?;
    let body = reader.read_entry().await?;

    let mut builder = GzBuilder::new();
    if !options.deterministic {
        builder = builder.filename(name.as_bytes());
        if let Some(mtime) = entry.mtime {
            builder = builder.mtime(mtime.timestamp() as u32);
        }
    }
    let mut encoder = builder.write(&mut out, Compression::default());
    encoder
        .write_all(&body)
        .and_then(|()| encoder.finish().map(drop))
        .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated))?;

    let mut summary = Summary::new(profile, "gzip");
    summary.entries = 1;
    summary.total_uncompressed_bytes = body.len() as u64;
    let audit = AuditReport::assemble(profile, summary, Vec::new());
    let mut report = NormalizeReport::from_audit(audit);
    report.output_entries = 1;
    report.recompressed_entries = 1;
    Ok(report)
}
