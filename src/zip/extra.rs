//! ZIP extra-field parsing: ZIP64 (0x0001), extended timestamp (0x5455),
//! Info-ZIP Unicode path (0x7075), AES-WinZip (0x9901).

use crate::entry::AesStrength;
use crate::error::{ArchiveError, Code, Result};

pub const TAG_ZIP64: u16 = 0x0001;
pub const TAG_EXT_TIMESTAMP: u16 = 0x5455;
pub const TAG_UNICODE_PATH: u16 = 0x7075;
pub const TAG_AES: u16 = 0x9901;

/// Split an extra-field blob into (tag, data) pairs. Truncated trailing
/// garbage is rejected — real writers never emit it and attackers do.
pub fn split(extra: &[u8]) -> Result<Vec<(u16, Vec<u8>)>> {
    let mut fields = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= extra.len() {
        let tag = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let len = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let end = pos + 4 + len;
        if end > extra.len() {
            return Err(ArchiveError::new(
                Code::ZipBadCentralDirectory,
                format!("extra field {tag:#06x} overruns the extra block"),
            ));
        }
        fields.push((tag, extra[pos + 4..end].to_vec()));
        pos = end;
    }
    if pos != extra.len() {
        return Err(ArchiveError::new(
            Code::ZipBadCentralDirectory,
            "trailing bytes after the last extra field",
        ));
    }
    Ok(fields)
}

/// The 32-bit sentinels that defer a field to the ZIP64 extra.
pub const SENTINEL32: u32 = 0xFFFF_FFFF;
pub const SENTINEL16: u16 = 0xFFFF;

/// Resolve ZIP64 deferred fields. Values appear in a fixed order, present
/// only for the fields whose 32-bit slot holds the sentinel.
#[derive(Debug)]
pub struct Zip64Fields {
    pub uncompressed_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub local_header_offset: Option<u64>,
    pub disk_number: Option<u32>,
}

pub fn parse_zip64(
    data: &[u8],
    need_uncompressed: bool,
    need_compressed: bool,
    need_offset: bool,
    need_disk: bool,
) -> Result<Zip64Fields> {
    let mut pos = 0usize;
    let mut take_u64 = |needed: bool| -> Result<Option<u64>> {
        if !needed {
            return Ok(None);
        }
        let bytes = data.get(pos..pos + 8).ok_or_else(|| {
            ArchiveError::new(Code::ZipBadZip64, "ZIP64 extra field is too short")
        })?;
        pos += 8;
        Ok(Some(u64::from_le_bytes(bytes.try_into().expect("8 bytes"))))
    };
    let uncompressed_size = take_u64(need_uncompressed)?;
    let compressed_size = take_u64(need_compressed)?;
    let local_header_offset = take_u64(need_offset)?;
    let disk_number = if need_disk {
        let bytes = data.get(pos..pos + 4).ok_or_else(|| {
            ArchiveError::new(Code::ZipBadZip64, "ZIP64 extra field is too short")
        })?;
        Some(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    } else {
        None
    };
    Ok(Zip64Fields {
        uncompressed_size,
        compressed_size,
        local_header_offset,
        disk_number,
    })
}

/// Extended timestamp: flags byte, then up to three u32 unix times; only
/// mtime (bit 0) is taken.
pub fn parse_ext_timestamp(data: &[u8]) -> Option<i64> {
    let flags = *data.first()?;
    if flags & 0x01 == 0 {
        return None;
    }
    let bytes = data.get(1..5)?;
    Some(i64::from(u32::from_le_bytes(bytes.try_into().ok()?)))
}

/// Info-ZIP Unicode path: version byte 1, CRC-32 of the *stored* name bytes,
/// then the UTF-8 name. The CRC gate keeps a stale field from renaming an
/// entry whose primary name was edited.
pub fn parse_unicode_path(data: &[u8], raw_name: &[u8]) -> Option<String> {
    if data.len() < 5 || data[0] != 1 {
        return None;
    }
    let stored_crc = u32::from_le_bytes(data[1..5].try_into().ok()?);
    if crc32fast::hash(raw_name) != stored_crc {
        return None;
    }
    String::from_utf8(data[5..].to_vec()).ok()
}

/// AES-WinZip extra field: vendor version, vendor id `AE`, strength code,
/// and the real compression method hidden behind method 99.
pub struct AesExtra {
    pub vendor_version: u16,
    pub strength: AesStrength,
    pub actual_method: u16,
}

pub fn parse_aes(data: &[u8]) -> Result<AesExtra> {
    if data.len() < 7 {
        return Err(ArchiveError::new(
            Code::ZipUnsupportedEncryption,
            "AES extra field is too short",
        ));
    }
    let vendor_version = u16::from_le_bytes([data[0], data[1]]);
    if &data[2..4] != b"AE" {
        return Err(ArchiveError::new(
            Code::ZipUnsupportedEncryption,
            "AES extra field has a foreign vendor id",
        ));
    }
    let strength = AesStrength::from_code(data[4]).ok_or_else(|| {
        ArchiveError::new(
            Code::ZipUnsupportedEncryption,
            format!("unknown AES strength code {}", data[4]),
        )
    })?;
    let actual_method = u16::from_le_bytes([data[5], data[6]]);
    Ok(AesExtra {
        vendor_version,
        strength,
        actual_method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_well_formed_extras() {
        let mut extra = Vec::new();
        extra.extend_from_slice(&0x5455u16.to_le_bytes());
        extra.extend_from_slice(&5u16.to_le_bytes());
        extra.extend_from_slice(&[1, 0, 0, 0, 0]);
        extra.extend_from_slice(&0x9901u16.to_le_bytes());
        extra.extend_from_slice(&7u16.to_le_bytes());
        extra.extend_from_slice(&[2, 0, b'A', b'E', 3, 8, 0]);
        let fields = split(&extra).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].0, TAG_EXT_TIMESTAMP);
        assert_eq!(fields[1].0, TAG_AES);
    }

    #[test]
    fn rejects_overrunning_extra() {
        let mut extra = Vec::new();
        extra.extend_from_slice(&0x0001u16.to_le_bytes());
        extra.extend_from_slice(&100u16.to_le_bytes());
        extra.extend_from_slice(&[0; 4]);
        assert_eq!(
            split(&extra).unwrap_err().code,
            Code::ZipBadCentralDirectory
        );
    }

    #[test]
    fn zip64_fields_in_order() {
        let mut data = Vec::new();
        data.extend_from_slice(&(1u64 << 33).to_le_bytes());
        data.extend_from_slice(&(77u64).to_le_bytes());
        let fields = parse_zip64(&data, true, true, false, false).unwrap();
        assert_eq!(fields.uncompressed_size, Some(1 << 33));
        assert_eq!(fields.compressed_size, Some(77));
        assert!(fields.local_header_offset.is_none());

        assert_eq!(
            parse_zip64(&data[..8], true, true, false, false)
                .unwrap_err()
                .code,
            Code::ZipBadZip64
        );
    }

    #[test]
    fn unicode_path_requires_crc_over_raw_name() {
        let raw = b"caf\x82.txt"; // CP437 é
        let mut data = vec![1u8];
        data.extend_from_slice(&crc32fast::hash(raw).to_le_bytes());
        data.extend_from_slice("café.txt".as_bytes());
        assert_eq!(parse_unicode_path(&data, raw).as_deref(), Some("café.txt"));
        // Same field against a different primary name: ignored.
        assert_eq!(parse_unicode_path(&data, b"other"), None);
    }

    #[test]
    fn aes_extra_parses_strength_and_method() {
        let data = [2u8, 0, b'A', b'E', 3, 8, 0];
        let aes = parse_aes(&data).unwrap();
        assert_eq!(aes.strength, AesStrength::Aes256);
        assert_eq!(aes.actual_method, 8);
        assert_eq!(aes.vendor_version, 2);
    }
}
