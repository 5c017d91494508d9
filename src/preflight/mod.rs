//! Header-only resource scans, run before any decoder state is allocated.
//!
//! The XZ and bzip2 wrappers can demand large dictionaries or unbounded
//! index structures; pre-flight reads wrapper bytes only — never payload —
//! and raises `COMPRESSION_RESOURCE_LIMIT` while the cost is still zero.

mod bzip2;
mod xz;

pub use bzip2::scan_bzip2;
pub use xz::scan_xz;

use crate::cancel::Cancel;
use crate::error::Result;
use crate::limits::{Limits, Profile};
use crate::report::AuditIssue;
use crate::sniff::Format;
use crate::substrate::{Substrate, SubstrateExt};

/// How much of each end of the input pre-flight is willing to look at.
const HEAD_BYTES: u64 = 64 * 1024;
const TAIL_BYTES: u64 = 64 * 1024;

/// Run the appropriate scan for an outer compression layer. Formats without
/// dangerous headers (gzip, zstd) pass trivially.
pub async fn run(
    substrate: &dyn Substrate,
    format: Format,
    limits: &Limits,
    profile: Profile,
    cancel: &Cancel,
) -> Result<Vec<AuditIssue>> {
    match format {
        Format::Xz | Format::TarXz => {
            let head = substrate.read_range(0, HEAD_BYTES, cancel).await?;
            let tail = if substrate.size() > head.len() as u64 {
                Some(substrate.read_tail(TAIL_BYTES, cancel).await?)
            } else {
                None
            };
            scan_xz(&head, tail.as_deref(), limits, profile)
        }
        Format::Bzip2 | Format::TarBz2 => {
            let head = substrate.read_range(0, 4, cancel).await?;
            scan_bzip2(&head, limits)
        }
        _ => Ok(Vec::new()),
    }
}
