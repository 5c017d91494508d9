//! bzip2 pre-flight: the magic carries the block-size class directly.

use crate::error::{ArchiveError, Code, Result};
use crate::limits::Limits;
use crate::report::AuditIssue;

/// Inspect a `BZh{1..9}` magic and compare the block-size class against the
/// limit. Each class buys 100 KiB of block buffer in the decoder.
pub fn scan_bzip2(head: &[u8], limits: &Limits) -> Result<Vec<AuditIssue>> {
    if head.len() < 4 || &head[..3] != b"BZh" {
        return Err(ArchiveError::new(
            Code::ArchiveBadHeader,
            "missing bzip2 magic",
        ));
    }
    let class = head[3];
    if !class.is_ascii_digit() || class == b'0' {
        return Err(ArchiveError::new(
            Code::ArchiveBadHeader,
            format!("invalid bzip2 block-size class {:?}", class as char),
        ));
    }
    let class = u64::from(class - b'0');
    if class > limits.max_bzip2_block_size {
        return Err(ArchiveError::new(
            Code::CompressionResourceLimit,
            format!(
                "bzip2 block-size class {class} exceeds the cap of {}",
                limits.max_bzip2_block_size
            ),
        ));
    }
    Ok(Vec::new())
}
