//! Central-directory record parsing.

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::entry::{Encryption, Entry, EntryKind};
use crate::error::{ArchiveError, Code, Result};
use crate::limits::Limits;
use crate::report::AuditIssue;

use super::cp437;
use super::extra;

pub const CDFH_SIG: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
pub const CDFH_MIN: usize = 46;

/// General-purpose flag bits the reader cares about.
pub mod flags {
    pub const ENCRYPTED: u16 = 1 << 0;
    pub const DATA_DESCRIPTOR: u16 = 1 << 3;
    pub const STRONG_ENCRYPTION: u16 = 1 << 6;
    pub const UTF8_NAME: u16 = 1 << 11;
}

/// DOS date/time pair → UTC. Out-of-range fields yield `None` rather than a
/// fabricated date.
pub fn dos_datetime(time: u16, date: u16) -> Option<DateTime<Utc>> {
    let year = 1980 + i32::from(date >> 9);
    let month = u32::from((date >> 5) & 0x0F);
    let day = u32::from(date & 0x1F);
    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3F);
    let second = u32::from(time & 0x1F) * 2;
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
}

/// Encode back to DOS fields (the normalizer writes these).
pub fn to_dos_datetime(when: DateTime<Utc>) -> (u16, u16) {
    use chrono::{Datelike, Timelike};
    let year = when.year().clamp(1980, 2107) as u16 - 1980;
    let date = (year << 9) | ((when.month() as u16) << 5) | when.day() as u16;
    let time = ((when.hour() as u16) << 11)
        | ((when.minute() as u16) << 5)
        | (when.second() as u16 / 2);
    (time, date)
}

const S_IFMT: u32 = 0xF000;
const S_IFLNK: u32 = 0xA000;
const DOS_DIRECTORY: u32 = 0x10;

/// Parse every record in the central directory buffer.
///
/// Structural breakage fails fast; recoverable oddities (lossy names,
/// descriptor entries with zeroed sizes) accumulate as issues.
pub fn parse(
    cd: &[u8],
    archive_size: u64,
    total_entries: u64,
    limits: &Limits,
) -> Result<(Vec<Entry>, Vec<AuditIssue>)> {
    let mut entries = Vec::new();
    let mut issues = Vec::new();
    let mut pos = 0usize;

    while pos < cd.len() {
        if cd.len() - pos < CDFH_MIN {
            return Err(ArchiveError::new(
                Code::ZipBadCentralDirectory,
                "truncated central directory record",
            ));
        }
        let rec = &cd[pos..];
        if rec[..4] != CDFH_SIG {
            return Err(ArchiveError::new(
                Code::ZipBadCentralDirectory,
                format!("bad central directory signature at offset {pos}"),
            ));
        }
        if entries.len() as u64 >= limits.max_entries {
            return Err(ArchiveError::new(
                Code::ArchiveLimitExceeded,
                format!("more than {} central directory records", limits.max_entries),
            ));
        }

        let gp_flags = u16::from_le_bytes([rec[8], rec[9]]);
        let method = u16::from_le_bytes([rec[10], rec[11]]);
        let mtime_raw = u16::from_le_bytes([rec[12], rec[13]]);
        let mdate_raw = u16::from_le_bytes([rec[14], rec[15]]);
        let crc32 = u32::from_le_bytes(rec[16..20].try_into().expect("4 bytes"));
        let compressed_raw = u32::from_le_bytes(rec[20..24].try_into().expect("4 bytes"));
        let uncompressed_raw = u32::from_le_bytes(rec[24..28].try_into().expect("4 bytes"));
        let name_len = u16::from_le_bytes([rec[28], rec[29]]) as usize;
        let extra_len = u16::from_le_bytes([rec[30], rec[31]]) as usize;
        let comment_len = u16::from_le_bytes([rec[32], rec[33]]) as usize;
        let disk_start = u16::from_le_bytes([rec[34], rec[35]]);
        let external_attrs = u32::from_le_bytes(rec[38..42].try_into().expect("4 bytes"));
        let lho_raw = u32::from_le_bytes(rec[42..46].try_into().expect("4 bytes"));

        let record_len = CDFH_MIN
            .checked_add(name_len)
            .and_then(|v| v.checked_add(extra_len))
            .and_then(|v| v.checked_add(comment_len))
            .ok_or_else(|| {
                ArchiveError::new(Code::ZipBadCentralDirectory, "record length overflow")
            })?;
        if pos + record_len > cd.len() {
            return Err(ArchiveError::new(
                Code::ZipBadCentralDirectory,
                format!("record at offset {pos} overruns the central directory"),
            ));
        }

        let raw_name = &rec[CDFH_MIN..CDFH_MIN + name_len];
        let extra_raw = &rec[CDFH_MIN + name_len..CDFH_MIN + name_len + extra_len];
        let comment =
            &rec[CDFH_MIN + name_len + extra_len..CDFH_MIN + name_len + extra_len + comment_len];

        let fields = extra::split(extra_raw)?;

        // ZIP64 sentinel resolution, in field order.
        let need_unc = uncompressed_raw == extra::SENTINEL32;
        let need_comp = compressed_raw == extra::SENTINEL32;
        let need_lho = lho_raw == extra::SENTINEL32;
        let need_disk = disk_start == extra::SENTINEL16;
        let mut uncompressed = u64::from(uncompressed_raw);
        let mut compressed = u64::from(compressed_raw);
        let mut lho = u64::from(lho_raw);
        let mut disk = u32::from(disk_start);
        if need_unc || need_comp || need_lho || need_disk {
            let data = fields
                .iter()
                .find(|(tag, _)| *tag == extra::TAG_ZIP64)
                .map(|(_, data)| data.as_slice())
                .ok_or_else(|| {
                    ArchiveError::new(
                        Code::ZipBadZip64,
                        "sentinel fields without a ZIP64 extra field",
                    )
                })?;
            let zip64 = extra::parse_zip64(data, need_unc, need_comp, need_lho, need_disk)?;
            if let Some(v) = zip64.uncompressed_size {
                uncompressed = v;
            }
            if let Some(v) = zip64.compressed_size {
                compressed = v;
            }
            if let Some(v) = zip64.local_header_offset {
                lho = v;
            }
            if let Some(v) = zip64.disk_number {
                disk = v;
            }
        }
        if disk != 0 {
            return Err(ArchiveError::new(
                Code::ArchiveUnsupportedFeature,
                "entry claims to start on another disk",
            ));
        }
        if lho >= archive_size {
            return Err(ArchiveError::new(
                Code::ZipBadCentralDirectory,
                format!("local header offset {lho} outside the {archive_size}-byte archive"),
            ));
        }

        // Name decoding: UTF-8 flag, then the Unicode-path extra (gated on
        // its CRC over the stored bytes), then CP437.
        let name = if gp_flags & flags::UTF8_NAME != 0 {
            match std::str::from_utf8(raw_name) {
                Ok(name) => name.to_string(),
                Err(_) => {
                    issues.push(
                        AuditIssue::warning(
                            Code::ZipBadCentralDirectory,
                            "name flagged UTF-8 but is not valid UTF-8; decoded lossily",
                        )
                        .with_offset(pos as u64),
                    );
                    String::from_utf8_lossy(raw_name).into_owned()
                }
            }
        } else if let Some(unicode) = fields
            .iter()
            .find(|(tag, _)| *tag == extra::TAG_UNICODE_PATH)
            .and_then(|(_, data)| extra::parse_unicode_path(data, raw_name))
        {
            unicode
        } else {
            cp437::decode(raw_name)
        };

        // Encryption classification.
        let encryption = if gp_flags & flags::STRONG_ENCRYPTION != 0 {
            Encryption::Strong
        } else if method == crate::codec::method::AES {
            let data = fields
                .iter()
                .find(|(tag, _)| *tag == extra::TAG_AES)
                .map(|(_, data)| data.as_slice())
                .ok_or_else(|| {
                    ArchiveError::new(
                        Code::ZipUnsupportedEncryption,
                        "method 99 without an AES extra field",
                    )
                    .with_entry(name.clone())
                })?;
            let aes = extra::parse_aes(data)?;
            Encryption::Aes {
                strength: aes.strength,
                vendor: aes.vendor_version,
                actual_method: aes.actual_method,
            }
        } else if gp_flags & flags::ENCRYPTED != 0 {
            Encryption::ZipCrypto
        } else {
            Encryption::None
        };

        let unix_mode = external_attrs >> 16;
        let is_dir =
            name.ends_with('/') || (external_attrs & DOS_DIRECTORY != 0 && uncompressed == 0);
        let kind = if is_dir {
            EntryKind::Directory
        } else if unix_mode & S_IFMT == S_IFLNK {
            EntryKind::Symlink
        } else {
            EntryKind::File
        };

        if gp_flags & flags::DATA_DESCRIPTOR != 0 && (crc32 == 0 && uncompressed != 0) {
            issues.push(
                AuditIssue::warning(
                    Code::ZipEntriesNotStored,
                    "descriptor entry whose central directory carries no CRC",
                )
                .with_entry(name.clone()),
            );
        }

        let mut mtime = dos_datetime(mtime_raw, mdate_raw);
        if let Some(unix) = fields
            .iter()
            .find(|(tag, _)| *tag == extra::TAG_EXT_TIMESTAMP)
            .and_then(|(_, data)| extra::parse_ext_timestamp(data))
        {
            mtime = Utc.timestamp_opt(unix, 0).single().or(mtime);
        }

        let mut entry = Entry::new(name, uncompressed, kind);
        entry.raw_name = raw_name.to_vec();
        entry.mtime = mtime;
        entry.mode = if unix_mode != 0 {
            Some(unix_mode & 0o777)
        } else {
            None
        };
        entry.comment = if comment.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(comment).into_owned())
        };
        entry.extra = fields;
        entry.local_header_offset = lho;
        entry.compressed_size = compressed;
        entry.method = method;
        entry.crc32 = crc32;
        entry.flags = gp_flags;
        entry.cd_extra_len = extra_len as u16;
        entry.external_attrs = external_attrs;
        entry.encryption = encryption;
        if entry.is_symlink() {
            // The target is the file body; filled in lazily by callers that
            // read the entry. Recorded as present for the invariant.
            entry.link_name = Some(String::new());
        }
        entries.push(entry);
        pos += record_len;
    }

    if entries.len() as u64 != total_entries {
        return Err(ArchiveError::new(
            Code::ZipBadCentralDirectory,
            format!(
                "EOCD promised {total_entries} entries, central directory holds {}",
                entries.len()
            ),
        ));
    }
    debug!(entries = entries.len(), "central directory parsed");
    Ok((entries, issues))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn build_record(
        name: &[u8],
        gp_flags: u16,
        method: u16,
        crc: u32,
        compressed: u32,
        uncompressed: u32,
        lho: u32,
        extra: &[u8],
        external_attrs: u32,
    ) -> Vec<u8> {
        let mut rec = Vec::new();
        rec.extend_from_slice(&CDFH_SIG);
        rec.extend_from_slice(&20u16.to_le_bytes()); // version made by
        rec.extend_from_slice(&20u16.to_le_bytes()); // version needed
        rec.extend_from_slice(&gp_flags.to_le_bytes());
        rec.extend_from_slice(&method.to_le_bytes());
        rec.extend_from_slice(&0u16.to_le_bytes()); // mtime
        rec.extend_from_slice(&0x21u16.to_le_bytes()); // mdate (1980-01-01)
        rec.extend_from_slice(&crc.to_le_bytes());
        rec.extend_from_slice(&compressed.to_le_bytes());
        rec.extend_from_slice(&uncompressed.to_le_bytes());
        rec.extend_from_slice(&(name.len() as u16).to_le_bytes());
        rec.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        rec.extend_from_slice(&0u16.to_le_bytes()); // comment len
        rec.extend_from_slice(&0u16.to_le_bytes()); // disk start
        rec.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        rec.extend_from_slice(&external_attrs.to_le_bytes());
        rec.extend_from_slice(&lho.to_le_bytes());
        rec.extend_from_slice(name);
        rec.extend_from_slice(extra);
        rec
    }

    #[test]
    fn parses_a_plain_entry() {
        let cd = build_record(b"dir/file.txt", 0, 8, 0xDEAD_BEEF, 100, 400, 0, &[], 0);
        let (entries, issues) = parse(&cd, 10_000, 1, &Limits::default()).unwrap();
        assert!(issues.is_empty());
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.name, "dir/file.txt");
        assert_eq!(e.size, 400);
        assert_eq!(e.compressed_size(), 100);
        assert_eq!(e.method(), 8);
        assert_eq!(e.crc32(), 0xDEAD_BEEF);
        assert_eq!(e.kind, EntryKind::File);
    }

    #[test]
    fn resolves_zip64_sentinels_in_order() {
        let mut extra = Vec::new();
        extra.extend_from_slice(&extra::TAG_ZIP64.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&(1u64 << 32).to_le_bytes()); // uncompressed
        extra.extend_from_slice(&123u64.to_le_bytes()); // compressed
        let cd = build_record(
            b"big.bin",
            0,
            0,
            0,
            extra::SENTINEL32,
            extra::SENTINEL32,
            0,
            &extra,
            0,
        );
        let (entries, _) = parse(&cd, u64::MAX, 1, &Limits::default()).unwrap();
        assert_eq!(entries[0].size, 1 << 32);
        assert_eq!(entries[0].compressed_size(), 123);
    }

    #[test]
    fn sentinel_without_zip64_extra_is_an_error() {
        let cd = build_record(b"x", 0, 0, 0, extra::SENTINEL32, 0, 0, &[], 0);
        let err = parse(&cd, 10_000, 1, &Limits::default()).unwrap_err();
        assert_eq!(err.code, Code::ZipBadZip64);
    }

    #[test]
    fn detects_directory_and_symlink() {
        let mut cd = build_record(b"dir/", 0, 0, 0, 0, 0, 0, &[], DOS_DIRECTORY);
        cd.extend(build_record(b"link", 0, 0, 0, 4, 4, 100, &[], S_IFLNK << 16));
        let (entries, _) = parse(&cd, 10_000, 2, &Limits::default()).unwrap();
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[1].kind, EntryKind::Symlink);
        assert!(entries[1].link_name.is_some());
    }

    #[test]
    fn cp437_fallback_without_utf8_flag() {
        let cd = build_record(&[b'f', 0x81, b'r'], 0, 0, 0, 0, 0, 0, &[], 0);
        let (entries, _) = parse(&cd, 10_000, 1, &Limits::default()).unwrap();
        assert_eq!(entries[0].name, "für");
    }

    #[test]
    fn method_99_requires_aes_extra() {
        let cd = build_record(b"enc", flags::ENCRYPTED, 99, 0, 50, 40, 0, &[], 0);
        let err = parse(&cd, 10_000, 1, &Limits::default()).unwrap_err();
        assert_eq!(err.code, Code::ZipUnsupportedEncryption);
    }

    #[test]
    fn entry_count_must_match_eocd() {
        let cd = build_record(b"a", 0, 0, 0, 0, 0, 0, &[], 0);
        let err = parse(&cd, 10_000, 2, &Limits::default()).unwrap_err();
        assert_eq!(err.code, Code::ZipBadCentralDirectory);
    }

    #[test]
    fn dos_datetime_round_trip() {
        let when = Utc.with_ymd_and_hms(2024, 6, 15, 12, 30, 44).unwrap();
        let (time, date) = to_dos_datetime(when);
        assert_eq!(dos_datetime(time, date), Some(when));
        // The 1980 floor used by deterministic mode.
        assert_eq!(
            dos_datetime(0, 0x21),
            Some(Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0).unwrap())
        );
    }
}
