//! The audit pass: deterministic walk, issue accumulator, never throws for a
//! defective archive — only for I/O failure or cancellation.
//!
//! Issue ordering is fixed: structural findings first (headers, truncation,
//! trailers), then per-entry findings in container order (path, size, method,
//! encryption, limits, local header), then the post-pass (range overlap,
//! collisions).

use crate::cancel::Cancel;
use crate::entry::{Encryption, Entry, EntryKind};
use crate::error::{Code, Result};
use crate::gzip::GzipReader;
use crate::limits::{Limits, Profile};
use crate::names::{self, NameIndex};
use crate::report::{AuditIssue, AuditReport, CollisionKind, Severity, Summary};
use crate::tar::TarReader;
use crate::zip::ZipReader;

/// Per-profile severity of a symlink entry.
fn symlink_severity(profile: Profile) -> Severity {
    match profile {
        Profile::Agent => Severity::Error,
        Profile::Strict => Severity::Warning,
        Profile::Compat => Severity::Info,
    }
}

/// Promote structural warnings that the profile treats as fatal.
fn adjust_severity(mut issue: AuditIssue, profile: Profile) -> AuditIssue {
    let fatal = match issue.code {
        Code::ZipMultipleEocd => profile != Profile::Compat,
        Code::ArchiveTrailingBytes => profile.trailing_bytes_fatal(),
        _ => false,
    };
    if fatal && issue.severity == Severity::Warning {
        issue.severity = Severity::Error;
    }
    issue
}

/// Name sanitation issues for one entry.
fn path_issues(entry: &Entry, issues: &mut Vec<AuditIssue>) {
    if let Err(err) = names::normalize_name(&entry.name) {
        issues.push(
            AuditIssue::error(err.code, err.message().to_string()).with_entry(&entry.name),
        );
    }
    if let Some(link) = entry.link_name.as_deref()
        && !link.is_empty()
        && (link.starts_with('/') || link.split('/').any(|seg| seg == ".."))
    {
        issues.push(
            AuditIssue::error(
                Code::ArchivePathTraversal,
                format!("link target {link:?} escapes the archive root"),
            )
            .with_entry(&entry.name),
        );
    }
}

fn limit_issues(entry: &Entry, limits: &Limits, issues: &mut Vec<AuditIssue>) {
    if entry.size > limits.max_uncompressed_entry_bytes {
        issues.push(
            AuditIssue::error(
                Code::ArchiveLimitExceeded,
                format!(
                    "entry declares {} bytes, cap is {}",
                    entry.size, limits.max_uncompressed_entry_bytes
                ),
            )
            .with_entry(&entry.name),
        );
    }
    if entry.compressed_size > 0 && entry.size / entry.compressed_size > limits.max_compression_ratio
    {
        issues.push(
            AuditIssue::error(
                Code::ArchiveLimitExceeded,
                format!(
                    "compression ratio {}:1 exceeds the cap of {}:1",
                    entry.size / entry.compressed_size,
                    limits.max_compression_ratio
                ),
            )
            .with_entry(&entry.name),
        );
    }
}

fn symlink_issue(entry: &Entry, profile: Profile, issues: &mut Vec<AuditIssue>) {
    if entry.kind == EntryKind::Symlink {
        issues.push(
            AuditIssue::new(
                Code::ArchiveUnsupportedFeature,
                symlink_severity(profile),
                "symlink entry",
            )
            .with_entry(&entry.name),
        );
    }
}

/// Collision post-pass over already-validated names.
fn collision_issues(
    entries: &[Entry],
    duplicate_code: Code,
    casefold_code: Code,
    nfc_code: Code,
    profile: Profile,
    issues: &mut Vec<AuditIssue>,
) {
    let mut index = NameIndex::new();
    for entry in entries {
        for collision in index.insert(&entry.name) {
            let issue = match collision.kind {
                CollisionKind::Duplicate => AuditIssue::new(
                    duplicate_code,
                    if profile == Profile::Agent {
                        Severity::Error
                    } else {
                        Severity::Warning
                    },
                    format!("exact duplicate of {:?}", collision.existing),
                ),
                CollisionKind::Casefold => AuditIssue::new(
                    casefold_code,
                    if profile == Profile::Agent {
                        Severity::Error
                    } else {
                        Severity::Warning
                    },
                    format!("collides with {:?} under case folding", collision.existing),
                ),
                // Two byte sequences, one filesystem name: never safe.
                CollisionKind::UnicodeNfc => AuditIssue::error(
                    nfc_code,
                    format!("collides with {:?} after Unicode NFC", collision.existing),
                ),
            };
            issues.push(
                issue
                    .with_entry(&entry.name)
                    .with_collision_kind(collision.kind),
            );
        }
    }
}

/// Audit a ZIP reader: structural → per-entry (with local-header
/// reconciliation) → overlap & collision post-pass.
pub async fn audit_zip(reader: &ZipReader, cancel: &Cancel) -> Result<AuditReport> {
    let profile = reader.profile();
    let limits = reader.limits().clone();
    let mut issues: Vec<AuditIssue> = reader
        .parse_issues()
        .into_iter()
        .map(|issue| adjust_severity(issue, profile))
        .collect();

    let mut ranges: Vec<(u64, u64, String)> = Vec::new();
    let mut summary = Summary::new(profile, "zip");

    for entry in reader.entries() {
        cancel.check()?;
        summary.entries += 1;
        summary.total_compressed_bytes += entry.compressed_size;
        summary.total_uncompressed_bytes += entry.size;

        path_issues(entry, &mut issues);
        symlink_issue(entry, profile, &mut issues);
        limit_issues(entry, &limits, &mut issues);

        match entry.encryption {
            Encryption::None => {}
            Encryption::Aes { .. } => {
                if reader.password().is_none() {
                    issues.push(
                        AuditIssue::warning(
                            Code::ZipPasswordRequired,
                            "AES-encrypted entry; no password supplied",
                        )
                        .with_entry(&entry.name),
                    );
                }
            }
            Encryption::ZipCrypto => issues.push(
                AuditIssue::error(
                    Code::ZipUnsupportedEncryption,
                    "legacy PKWARE encryption",
                )
                .with_entry(&entry.name),
            ),
            Encryption::Strong => issues.push(
                AuditIssue::error(
                    Code::ZipUnsupportedEncryption,
                    "strong encryption (flag bit 6)",
                )
                .with_entry(&entry.name),
            ),
        }

        let method = match entry.encryption {
            Encryption::Aes { actual_method, .. } => actual_method,
            _ => entry.method(),
        };
        if let Err(err) = reader.registry().decompressor(method) {
            issues.push(
                AuditIssue::error(err.code, err.message().to_string()).with_entry(&entry.name),
            );
        }

        match reader.reconcile(entry, cancel).await {
            Ok(check) => {
                issues.extend(check.issues);
                ranges.push((entry.local_header_offset, check.data_end, entry.name.clone()));
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                issues.push(
                    AuditIssue::error(err.code, err.message().to_string())
                        .with_entry(&entry.name)
                        .with_offset(entry.local_header_offset),
                );
            }
        }
    }

    // Post-pass: overlapping ranges, then collisions.
    ranges.sort_by_key(|&(start, _, _)| start);
    for pair in ranges.windows(2) {
        let (_, prev_end, prev_name) = &pair[0];
        let (next_start, _, next_name) = &pair[1];
        if next_start < prev_end {
            issues.push(
                AuditIssue::error(
                    Code::ZipOverlappingEntries,
                    format!("{next_name:?} overlaps the body of {prev_name:?}"),
                )
                .with_entry(next_name.clone())
                .with_offset(*next_start),
            );
        }
    }
    collision_issues(
        reader.entries(),
        Code::ZipDuplicateName,
        Code::ZipCaseCollision,
        Code::ZipUnicodeCollision,
        profile,
        &mut issues,
    );

    Ok(AuditReport::assemble(profile, summary, issues))
}

/// Audit a TAR reader: scan findings → per-entry → collision post-pass.
pub async fn audit_tar(reader: &TarReader, cancel: &Cancel) -> Result<AuditReport> {
    let profile = reader.profile();
    let limits = reader.limits().clone();
    let mut issues: Vec<AuditIssue> = reader
        .parse_issues()
        .into_iter()
        .map(|issue| adjust_severity(issue, profile))
        .collect();
    let mut summary = Summary::new(profile, "tar");

    for entry in reader.entries() {
        cancel.check()?;
        summary.entries += 1;
        summary.total_compressed_bytes += entry.compressed_size;
        summary.total_uncompressed_bytes += entry.size;

        path_issues(entry, &mut issues);
        symlink_issue(entry, profile, &mut issues);
        limit_issues(entry, &limits, &mut issues);
        if entry.kind == EntryKind::Unknown {
            issues.push(
                AuditIssue::warning(Code::ArchiveUnsupportedFeature, "unknown typeflag")
                    .with_entry(&entry.name),
            );
        }
    }

    collision_issues(
        reader.entries(),
        Code::TarDuplicateName,
        Code::TarCaseCollision,
        Code::TarUnicodeCollision,
        profile,
        &mut issues,
    );
    Ok(AuditReport::assemble(profile, summary, issues))
}

/// Audit a single gzip member.
pub fn audit_gzip(reader: &GzipReader) -> AuditReport {
    let profile = reader.profile();
    let limits = reader.limits().clone();
    let mut issues = Vec::new();
    let mut summary = Summary::new(profile, "gzip");
    for entry in reader.entries() {
        summary.entries += 1;
        summary.total_compressed_bytes += entry.compressed_size;
        summary.total_uncompressed_bytes += entry.size;
        path_issues(entry, &mut issues);
        limit_issues(entry, &limits, &mut issues);
    }
    AuditReport::assemble(profile, summary, issues)
}
