//! Machine-readable, schema-versioned reports.
//!
//! Reports are serialization-stable: struct field order is declaration order,
//! maps are `BTreeMap`, and every numeric field that can exceed 53-bit safe
//! integer range (offsets, byte totals) is emitted as a decimal string so
//! JSON consumers on any platform read it losslessly.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{ArchiveError, Code, Result};
use crate::limits::Profile;

/// Report schema version; bump only with a documented migration.
pub const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Why two entry names conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionKind {
    /// Exact normalized-name duplicate.
    Duplicate,
    /// Distinct byte sequences that are identical after Unicode NFC.
    UnicodeNfc,
    /// Identical after full case folding.
    Casefold,
}

impl CollisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CollisionKind::Duplicate => "duplicate",
            CollisionKind::UnicodeNfc => "unicode_nfc",
            CollisionKind::Casefold => "casefold",
        }
    }
}

mod u64_string {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(v)
    }
}

mod opt_u64_string {
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.collect_str(v),
            None => s.serialize_none(),
        }
    }
}

/// One finding from the auditor or a parser.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditIssue {
    #[serde(serialize_with = "serialize_code")]
    pub code: Code,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_name: Option<String>,
    #[serde(serialize_with = "opt_u64_string::serialize")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

fn serialize_code<S: serde::Serializer>(
    code: &Code,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(code.as_str())
}

impl AuditIssue {
    pub fn new(code: Code, severity: Severity, message: impl Into<String>) -> Self {
        AuditIssue {
            code,
            severity,
            message: message.into(),
            entry_name: None,
            offset: None,
            details: BTreeMap::new(),
        }
    }

    pub fn error(code: Code, message: impl Into<String>) -> Self {
        AuditIssue::new(code, Severity::Error, message)
    }

    pub fn warning(code: Code, message: impl Into<String>) -> Self {
        AuditIssue::new(code, Severity::Warning, message)
    }

    pub fn info(code: Code, message: impl Into<String>) -> Self {
        AuditIssue::new(code, Severity::Info, message)
    }

    pub fn with_entry(mut self, name: impl Into<String>) -> Self {
        self.entry_name = Some(name.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_collision_kind(self, kind: CollisionKind) -> Self {
        self.with_detail("collisionKind", kind.as_str())
    }
}

/// Fixed summary block of every report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub profile: String,
    pub format: String,
    pub entries: u64,
    pub errors: u64,
    pub warnings: u64,
    pub infos: u64,
    #[serde(serialize_with = "u64_string::serialize")]
    pub total_compressed_bytes: u64,
    #[serde(serialize_with = "u64_string::serialize")]
    pub total_uncompressed_bytes: u64,
}

impl Summary {
    pub fn new(profile: Profile, format: impl Into<String>) -> Self {
        let profile = match profile {
            Profile::Strict => "strict",
            Profile::Compat => "compat",
            Profile::Agent => "agent",
        };
        Summary {
            profile: profile.to_string(),
            format: format.into(),
            entries: 0,
            errors: 0,
            warnings: 0,
            infos: 0,
            total_compressed_bytes: 0,
            total_uncompressed_bytes: 0,
        }
    }
}

/// Result of auditing an archive against a profile.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub schema_version: String,
    pub ok: bool,
    pub summary: Summary,
    pub issues: Vec<AuditIssue>,
}

impl AuditReport {
    /// Assemble a report from accumulated issues, computing `ok` per profile:
    /// errors always fail, and in `agent` warnings fail too.
    pub fn assemble(profile: Profile, mut summary: Summary, issues: Vec<AuditIssue>) -> Self {
        summary.errors = issues.iter().filter(|i| i.severity == Severity::Error).count() as u64;
        summary.warnings = issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .count() as u64;
        summary.infos = issues.iter().filter(|i| i.severity == Severity::Info).count() as u64;
        let ok = summary.errors == 0
            && (!profile.warnings_are_errors() || summary.warnings == 0);
        AuditReport {
            schema_version: SCHEMA_VERSION.to_string(),
            ok,
            summary,
            issues,
        }
    }

    /// Canonical JSON form (stable byte-for-byte for a given report).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("report serialization is infallible")
    }

    /// Convert a not-ok report into a typed error carrying the report.
    pub fn assert_safe(&self) -> Result<()> {
        assert_safe(self)
    }
}

/// The single place a report becomes an error.
pub fn assert_safe(report: &AuditReport) -> Result<()> {
    if report.ok {
        return Ok(());
    }
    Err(ArchiveError::new(
        Code::ArchiveAuditFailed,
        format!(
            "audit failed with {} error(s), {} warning(s)",
            report.summary.errors, report.summary.warnings
        ),
    )
    .with_report(report.clone()))
}

/// Audit report plus normalization accounting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizeReport {
    pub schema_version: String,
    pub ok: bool,
    pub summary: Summary,
    pub issues: Vec<AuditIssue>,
    pub output_entries: u64,
    pub dropped_entries: u64,
    pub renamed_entries: u64,
    pub recompressed_entries: u64,
    pub preserved_entries: u64,
}

impl NormalizeReport {
    pub fn from_audit(report: AuditReport) -> Self {
        NormalizeReport {
            schema_version: report.schema_version,
            ok: report.ok,
            summary: report.summary,
            issues: report.issues,
            output_entries: 0,
            dropped_entries: 0,
            renamed_entries: 0,
            recompressed_entries: 0,
            preserved_entries: 0,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("report serialization is infallible")
    }
}
