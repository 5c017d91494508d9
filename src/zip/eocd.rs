//! End-Of-Central-Directory location, including the ZIP64 upgrade path.

use crate::cancel::Cancel;
use crate::error::{ArchiveError, Code, Result};
use crate::limits::Limits;
use crate::report::AuditIssue;
use crate::substrate::{Substrate, SubstrateExt};

pub const EOCD_SIG: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
pub const ZIP64_LOCATOR_SIG: [u8; 4] = [0x50, 0x4B, 0x06, 0x07];
pub const ZIP64_EOCD_SIG: [u8; 4] = [0x50, 0x4B, 0x06, 0x06];

/// 4 signature + 18 fixed fields.
pub const MIN_EOCD: u64 = 22;
const ZIP64_LOCATOR_LEN: u64 = 20;
const ZIP64_EOCD_MIN: u64 = 56;

/// Where the central directory lives, per the (possibly ZIP64) EOCD.
#[derive(Debug)]
pub struct Eocd {
    pub eocd_offset: u64,
    pub cd_offset: u64,
    pub cd_size: u64,
    pub total_entries: u64,
    pub comment: Vec<u8>,
    pub zip64: bool,
    /// Bytes after the EOCD record + comment.
    pub trailing_bytes: u64,
    /// Non-fatal findings for the audit (multiple EOCDs, trailing bytes…).
    pub warnings: Vec<AuditIssue>,
}

/// Scan the substrate tail for the EOCD and resolve ZIP64 indirection.
pub async fn locate(
    substrate: &dyn Substrate,
    limits: &Limits,
    cancel: &Cancel,
) -> Result<Eocd> {
    let size = substrate.size();
    if size < MIN_EOCD {
        return Err(ArchiveError::new(
            Code::ZipEocdNotFound,
            format!("{size}-byte input is smaller than an EOCD record"),
        ));
    }

    let span = limits.max_zip_eocd_search_bytes.min(size);
    let tail = substrate.read_tail(span, cancel).await?;
    let tail_base = size - tail.len() as u64;

    // Take the *last* signature occurrence; note any earlier ones.
    let mut matches = Vec::new();
    for i in 0..=tail.len().saturating_sub(MIN_EOCD as usize) {
        if tail[i..].starts_with(&EOCD_SIG) {
            matches.push(i);
        }
    }
    let Some(&at) = matches.last() else {
        return Err(ArchiveError::new(
            Code::ZipEocdNotFound,
            "no end-of-central-directory signature in the scanned tail",
        ));
    };
    let mut warnings = Vec::new();
    if matches.len() > 1 {
        warnings.push(
            AuditIssue::warning(
                Code::ZipMultipleEocd,
                format!("{} EOCD signatures in the tail; using the last", matches.len()),
            )
            .with_offset(tail_base + at as u64),
        );
    }

    let rec = &tail[at..];
    let eocd_offset = tail_base + at as u64;
    let disk_number = u16::from_le_bytes([rec[4], rec[5]]);
    let disk_with_cd = u16::from_le_bytes([rec[6], rec[7]]);
    let entries_this_disk = u16::from_le_bytes([rec[8], rec[9]]);
    let total_entries_raw = u16::from_le_bytes([rec[10], rec[11]]);
    let cd_size_raw = u32::from_le_bytes([rec[12], rec[13], rec[14], rec[15]]);
    let cd_offset_raw = u32::from_le_bytes([rec[16], rec[17], rec[18], rec[19]]);
    let comment_len = u16::from_le_bytes([rec[20], rec[21]]) as u64;

    let needs_zip64 = total_entries_raw == 0xFFFF
        || entries_this_disk == 0xFFFF
        || cd_size_raw == u32::MAX
        || cd_offset_raw == u32::MAX;

    if !needs_zip64 && (disk_number != 0 || disk_with_cd != 0) {
        return Err(ArchiveError::new(
            Code::ArchiveUnsupportedFeature,
            format!("multi-disk archive (disk {disk_number}, CD on disk {disk_with_cd})"),
        ));
    }

    if comment_len > limits.max_zip_comment_bytes {
        return Err(ArchiveError::new(
            Code::ArchiveLimitExceeded,
            format!(
                "archive comment of {comment_len} bytes exceeds the cap of {}",
                limits.max_zip_comment_bytes
            ),
        ));
    }
    let comment_end = eocd_offset + MIN_EOCD + comment_len;
    if comment_end > size {
        return Err(ArchiveError::new(
            Code::ZipBadEocd,
            "archive comment extends past end of file",
        )
        .with_offset(eocd_offset));
    }
    let comment = if comment_len > 0 {
        let in_tail = at + MIN_EOCD as usize;
        if in_tail + comment_len as usize <= tail.len() {
            tail[in_tail..in_tail + comment_len as usize].to_vec()
        } else {
            substrate
                .read_exact_range(eocd_offset + MIN_EOCD, comment_len, cancel)
                .await?
                .to_vec()
        }
    } else {
        Vec::new()
    };
    let trailing_bytes = size - comment_end;
    if trailing_bytes > 0 {
        warnings.push(
            AuditIssue::warning(
                Code::ArchiveTrailingBytes,
                format!("{trailing_bytes} bytes after the archive comment"),
            )
            .with_offset(comment_end),
        );
    }

    let (cd_offset, cd_size, total_entries, zip64) = if needs_zip64 {
        let zip64 = read_zip64(substrate, eocd_offset, cancel).await?;
        (zip64.0, zip64.1, zip64.2, true)
    } else {
        (
            u64::from(cd_offset_raw),
            u64::from(cd_size_raw),
            u64::from(total_entries_raw),
            false,
        )
    };

    if cd_size > limits.max_zip_central_directory_bytes {
        return Err(ArchiveError::new(
            Code::ArchiveLimitExceeded,
            format!(
                "central directory of {cd_size} bytes exceeds the cap of {}",
                limits.max_zip_central_directory_bytes
            ),
        ));
    }
    if total_entries > limits.max_entries {
        return Err(ArchiveError::new(
            Code::ArchiveLimitExceeded,
            format!(
                "{total_entries} entries exceed the cap of {}",
                limits.max_entries
            ),
        ));
    }
    let cd_end = cd_offset.checked_add(cd_size).ok_or_else(|| {
        ArchiveError::new(Code::ZipBadEocd, "central directory bounds overflow")
    })?;
    if cd_end > eocd_offset {
        return Err(ArchiveError::new(
            Code::ZipBadEocd,
            format!(
                "central directory [{cd_offset}, {cd_end}) runs into the EOCD at {eocd_offset}"
            ),
        ));
    }

    Ok(Eocd {
        eocd_offset,
        cd_offset,
        cd_size,
        total_entries,
        comment,
        zip64,
        trailing_bytes,
        warnings,
    })
}

/// Follow the ZIP64 locator (20 bytes before the EOCD) to the ZIP64 EOCD and
/// read the 64-bit fields.
async fn read_zip64(
    substrate: &dyn Substrate,
    eocd_offset: u64,
    cancel: &Cancel,
) -> Result<(u64, u64, u64)> {
    let locator_offset = eocd_offset.checked_sub(ZIP64_LOCATOR_LEN).ok_or_else(|| {
        ArchiveError::new(Code::ZipBadZip64, "no room for a ZIP64 locator before the EOCD")
    })?;
    let locator = substrate
        .read_exact_range(locator_offset, ZIP64_LOCATOR_LEN, cancel)
        .await?;
    if locator[..4] != ZIP64_LOCATOR_SIG {
        return Err(ArchiveError::new(
            Code::ZipBadZip64,
            "EOCD uses ZIP64 sentinels but no ZIP64 locator precedes it",
        )
        .with_offset(locator_offset));
    }
    let disk_with_zip64 = u32::from_le_bytes(locator[4..8].try_into().expect("4 bytes"));
    let zip64_offset = u64::from_le_bytes(locator[8..16].try_into().expect("8 bytes"));
    let total_disks = u32::from_le_bytes(locator[16..20].try_into().expect("4 bytes"));
    if disk_with_zip64 != 0 || total_disks > 1 {
        return Err(ArchiveError::new(
            Code::ArchiveUnsupportedFeature,
            "multi-disk ZIP64 archive",
        ));
    }
    if zip64_offset >= locator_offset {
        return Err(ArchiveError::new(
            Code::ZipBadZip64,
            "ZIP64 EOCD offset points past its own locator",
        ));
    }

    let rec = substrate
        .read_exact_range(zip64_offset, ZIP64_EOCD_MIN, cancel)
        .await?;
    if rec[..4] != ZIP64_EOCD_SIG {
        return Err(ArchiveError::new(
            Code::ZipBadZip64,
            "bad ZIP64 EOCD signature",
        )
        .with_offset(zip64_offset));
    }
    let disk_number = u32::from_le_bytes(rec[16..20].try_into().expect("4 bytes"));
    let disk_with_cd = u32::from_le_bytes(rec[20..24].try_into().expect("4 bytes"));
    if disk_number != 0 || disk_with_cd != 0 {
        return Err(ArchiveError::new(
            Code::ArchiveUnsupportedFeature,
            "multi-disk ZIP64 archive",
        ));
    }
    let entries_this_disk = u64::from_le_bytes(rec[24..32].try_into().expect("8 bytes"));
    let total_entries = u64::from_le_bytes(rec[32..40].try_into().expect("8 bytes"));
    if entries_this_disk != total_entries {
        return Err(ArchiveError::new(
            Code::ArchiveUnsupportedFeature,
            "multi-disk ZIP64 archive",
        ));
    }
    let cd_size = u64::from_le_bytes(rec[40..48].try_into().expect("8 bytes"));
    let cd_offset = u64::from_le_bytes(rec[48..56].try_into().expect("8 bytes"));
    Ok((cd_offset, cd_size, total_entries))
}
