use std::fmt;

use thiserror::Error;

use crate::report::AuditReport;

/// Stable machine-readable failure and issue codes.
///
/// Every fallible operation in the crate fails with one of these, and every
/// audit issue is tagged with one. The string form (`as_str`) is part of the
/// report schema and must never change for an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    // Structural
    ArchiveUnsupportedFormat,
    ArchiveBadHeader,
    ArchiveTruncated,
    ArchiveLimitExceeded,
    ArchivePathTraversal,
    ArchiveNameCollision,
    ArchiveUnsupportedFeature,
    ArchiveAuditFailed,
    ArchiveTrailingBytes,

    // ZIP
    ZipEocdNotFound,
    ZipBadEocd,
    ZipMultipleEocd,
    ZipBadZip64,
    ZipBadCentralDirectory,
    ZipHeaderMismatch,
    ZipOverlappingEntries,
    ZipUnsupportedMethod,
    ZipUnsupportedEncryption,
    ZipBadCrc,
    ZipBadPassword,
    ZipPasswordRequired,
    ZipAuthFailed,
    ZipZip64Required,
    ZipInvalidSignature,
    ZipEntriesNotStored,
    ZipDuplicateName,
    ZipCaseCollision,
    ZipUnicodeCollision,

    // TAR
    TarBadChecksum,
    TarDuplicateName,
    TarCaseCollision,
    TarUnicodeCollision,

    // HTTP range substrate
    HttpRangeUnsupported,
    HttpResourceChanged,
    HttpRangeInvalid,
    HttpBadResponse,
    HttpSizeUnknown,
    HttpContentEncoding,
    HttpStrongEtagRequired,

    // Compression
    CompressionXzBadData,
    CompressionXzTruncated,
    CompressionXzBadCheck,
    CompressionXzUnsupportedCheck,
    CompressionXzUnsupportedFilter,
    CompressionXzBufferLimit,
    CompressionXzLimitExceeded,
    CompressionResourceLimit,
    CompressionResourcePreflightIncomplete,
    CompressionLzmaBadData,
    CompressionGzipBadHeader,
    CompressionUnsupportedAlgorithm,
    CompressionBackendUnavailable,

    // Cancellation
    Cancelled,
}

impl Code {
    /// Stable string form used in reports and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Code::ArchiveUnsupportedFormat => "ARCHIVE_UNSUPPORTED_FORMAT",
            Code::ArchiveBadHeader => "ARCHIVE_BAD_HEADER",
            Code::ArchiveTruncated => "ARCHIVE_TRUNCATED",
            Code::ArchiveLimitExceeded => "ARCHIVE_LIMIT_EXCEEDED",
            Code::ArchivePathTraversal => "ARCHIVE_PATH_TRAVERSAL",
            Code::ArchiveNameCollision => "ARCHIVE_NAME_COLLISION",
            Code::ArchiveUnsupportedFeature => "ARCHIVE_UNSUPPORTED_FEATURE",
            Code::ArchiveAuditFailed => "ARCHIVE_AUDIT_FAILED",
            Code::ArchiveTrailingBytes => "ARCHIVE_TRAILING_BYTES",
            Code::ZipEocdNotFound => "ZIP_EOCD_NOT_FOUND",
            Code::ZipBadEocd => "ZIP_BAD_EOCD",
            Code::ZipMultipleEocd => "ZIP_MULTIPLE_EOCD",
            Code::ZipBadZip64 => "ZIP_BAD_ZIP64",
            Code::ZipBadCentralDirectory => "ZIP_BAD_CENTRAL_DIRECTORY",
            Code::ZipHeaderMismatch => "ZIP_HEADER_MISMATCH",
            Code::ZipOverlappingEntries => "ZIP_OVERLAPPING_ENTRIES",
            Code::ZipUnsupportedMethod => "ZIP_UNSUPPORTED_METHOD",
            Code::ZipUnsupportedEncryption => "ZIP_UNSUPPORTED_ENCRYPTION",
            Code::ZipBadCrc => "ZIP_BAD_CRC",
            Code::ZipBadPassword => "ZIP_BAD_PASSWORD",
            Code::ZipPasswordRequired => "ZIP_PASSWORD_REQUIRED",
            Code::ZipAuthFailed => "ZIP_AUTH_FAILED",
            Code::ZipZip64Required => "ZIP_ZIP64_REQUIRED",
            Code::ZipInvalidSignature => "ZIP_INVALID_SIGNATURE",
            Code::ZipEntriesNotStored => "ZIP_ENTRIES_NOT_STORED",
            Code::ZipDuplicateName => "ZIP_DUPLICATE_NAME",
            Code::ZipCaseCollision => "ZIP_CASE_COLLISION",
            Code::ZipUnicodeCollision => "ZIP_UNICODE_COLLISION",
            Code::TarBadChecksum => "TAR_BAD_CHECKSUM",
            Code::TarDuplicateName => "TAR_DUPLICATE_NAME",
            Code::TarCaseCollision => "TAR_CASE_COLLISION",
            Code::TarUnicodeCollision => "TAR_UNICODE_COLLISION",
            Code::HttpRangeUnsupported => "HTTP_RANGE_UNSUPPORTED",
            Code::HttpResourceChanged => "HTTP_RESOURCE_CHANGED",
            Code::HttpRangeInvalid => "HTTP_RANGE_INVALID",
            Code::HttpBadResponse => "HTTP_BAD_RESPONSE",
            Code::HttpSizeUnknown => "HTTP_SIZE_UNKNOWN",
            Code::HttpContentEncoding => "HTTP_CONTENT_ENCODING",
            Code::HttpStrongEtagRequired => "HTTP_STRONG_ETAG_REQUIRED",
            Code::CompressionXzBadData => "COMPRESSION_XZ_BAD_DATA",
            Code::CompressionXzTruncated => "COMPRESSION_XZ_TRUNCATED",
            Code::CompressionXzBadCheck => "COMPRESSION_XZ_BAD_CHECK",
            Code::CompressionXzUnsupportedCheck => "COMPRESSION_XZ_UNSUPPORTED_CHECK",
            Code::CompressionXzUnsupportedFilter => "COMPRESSION_XZ_UNSUPPORTED_FILTER",
            Code::CompressionXzBufferLimit => "COMPRESSION_XZ_BUFFER_LIMIT",
            Code::CompressionXzLimitExceeded => "COMPRESSION_XZ_LIMIT_EXCEEDED",
            Code::CompressionResourceLimit => "COMPRESSION_RESOURCE_LIMIT",
            Code::CompressionResourcePreflightIncomplete => {
                "COMPRESSION_RESOURCE_PREFLIGHT_INCOMPLETE"
            }
            Code::CompressionLzmaBadData => "COMPRESSION_LZMA_BAD_DATA",
            Code::CompressionGzipBadHeader => "COMPRESSION_GZIP_BAD_HEADER",
            Code::CompressionUnsupportedAlgorithm => "COMPRESSION_UNSUPPORTED_ALGORITHM",
            Code::CompressionBackendUnavailable => "COMPRESSION_BACKEND_UNAVAILABLE",
            Code::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one error type of the crate.
///
/// Always carries a stable [`Code`]; optionally carries the entry name and
/// byte offset the failure is about, an underlying source error, and (for
/// `ARCHIVE_AUDIT_FAILED` only) the report that failed.
#[derive(Debug, Error)]
#[error("{code}: {message}{suffix}", suffix = context_suffix(.entry_name, .offset))]
pub struct ArchiveError {
    pub code: Code,
    message: String,
    entry_name: Option<String>,
    offset: Option<u64>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    report: Option<Box<AuditReport>>,
}

fn context_suffix(entry_name: &Option<String>, offset: &Option<u64>) -> String {
    let mut suffix = String::new();
    if let Some(name) = entry_name {
        suffix.push_str(&format!(" (entry {name:?})"));
    }
    if let Some(offset) = offset {
        suffix.push_str(&format!(" (offset {offset})"));
    }
    suffix
}

impl ArchiveError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        ArchiveError {
            code,
            message: message.into(),
            entry_name: None,
            offset: None,
            source: None,
            report: None,
        }
    }

    pub fn with_entry(mut self, name: impl Into<String>) -> Self {
        self.entry_name = Some(name.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach the failing report; used only by `assert_safe`.
    pub(crate) fn with_report(mut self, report: AuditReport) -> Self {
        self.report = Some(Box::new(report));
        self
    }

    pub fn cancelled() -> Self {
        ArchiveError::new(Code::Cancelled, "operation cancelled")
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn entry_name(&self) -> Option<&str> {
        self.entry_name.as_deref()
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// The report that produced an `ARCHIVE_AUDIT_FAILED` error.
    pub fn report(&self) -> Option<&AuditReport> {
        self.report.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == Code::Cancelled
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;

// The codec layer composes `std::io::Read` adapters, so archive errors must
// survive a round trip through `std::io::Error` without losing their code.

impl From<ArchiveError> for std::io::Error {
    fn from(err: ArchiveError) -> Self {
        let kind = match err.code {
            Code::ArchiveTruncated | Code::CompressionXzTruncated => {
                std::io::ErrorKind::UnexpectedEof
            }
            Code::Cancelled => std::io::ErrorKind::Interrupted,
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, err)
    }
}

impl ArchiveError {
    /// Recover an `ArchiveError` smuggled through `std::io::Error`, or wrap a
    /// plain I/O failure under the given code.
    pub fn from_io(err: std::io::Error, fallback: Code) -> Self {
        match err.downcast::<ArchiveError>() {
            Ok(inner) => inner,
            Err(err) => {
                let code = if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    Code::ArchiveTruncated
                } else {
                    fallback
                };
                ArchiveError::new(code, err.to_string()).with_source(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings_are_stable() {
        assert_eq!(Code::ZipBadCrc.as_str(), "ZIP_BAD_CRC");
        assert_eq!(Code::HttpResourceChanged.as_str(), "HTTP_RESOURCE_CHANGED");
        assert_eq!(
            Code::CompressionResourcePreflightIncomplete.as_str(),
            "COMPRESSION_RESOURCE_PREFLIGHT_INCOMPLETE"
        );
    }

    #[test]
    fn error_round_trips_through_io() {
        let err = ArchiveError::new(Code::ZipBadCrc, "crc mismatch").with_entry("a.txt");
        let io: std::io::Error = err.into();
        let back = ArchiveError::from_io(io, Code::ArchiveBadHeader);
        assert_eq!(back.code, Code::ZipBadCrc);
        assert_eq!(back.entry_name(), Some("a.txt"));
    }

    #[test]
    fn unexpected_eof_maps_to_truncated() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err = ArchiveError::from_io(io, Code::CompressionXzBadData);
        assert_eq!(err.code, Code::ArchiveTruncated);
    }
}
