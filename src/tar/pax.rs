//! Pax extended-header payloads: `LEN␠KEY=VALUE\n` records, LEN counting
//! itself.

use std::collections::BTreeMap;

use crate::error::{ArchiveError, Code, Result};

/// Parse one pax payload into its key→value records.
pub fn parse(payload: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut records = BTreeMap::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        let space = payload[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| {
                ArchiveError::new(Code::ArchiveBadHeader, "pax record without a length field")
            })?;
        let len_text = std::str::from_utf8(&payload[pos..pos + space])
            .map_err(|_| ArchiveError::new(Code::ArchiveBadHeader, "non-ASCII pax length"))?;
        let record_len: usize = len_text.parse().map_err(|_| {
            ArchiveError::new(
                Code::ArchiveBadHeader,
                format!("invalid pax record length {len_text:?}"),
            )
        })?;
        if record_len == 0 || pos + record_len > payload.len() {
            return Err(ArchiveError::new(
                Code::ArchiveBadHeader,
                "pax record length overruns the payload",
            ));
        }
        let body = &payload[pos + space + 1..pos + record_len];
        let body = body.strip_suffix(b"\n").ok_or_else(|| {
            ArchiveError::new(Code::ArchiveBadHeader, "pax record missing its newline")
        })?;
        let eq = body.iter().position(|&b| b == b'=').ok_or_else(|| {
            ArchiveError::new(Code::ArchiveBadHeader, "pax record without '='")
        })?;
        let key = String::from_utf8_lossy(&body[..eq]).into_owned();
        let value = String::from_utf8_lossy(&body[eq + 1..]).into_owned();
        records.insert(key, value);
        pos += record_len;
    }
    Ok(records)
}

/// Encode records back into a pax payload (used by the TAR normalizer for
/// long names and large sizes).
pub fn encode(records: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in records {
        // LEN includes itself, so the digit width has to stabilize.
        let body_len = 1 + key.len() + 1 + value.len() + 1; // ␠ KEY = VALUE ␊
        let mut total = body_len + 1;
        loop {
            let digits = total.to_string().len();
            let candidate = body_len + digits;
            if candidate == total {
                break;
            }
            total = candidate;
        }
        out.extend_from_slice(total.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_records() {
        let payload = b"32 path=some/long/path/name.txt\n21 size=138493824398\n";
        let records = parse(payload).unwrap();
        assert_eq!(records["path"], "some/long/path/name.txt");
        assert_eq!(records["size"], "138493824398");
    }

    #[test]
    fn round_trips_through_encode() {
        let mut records = BTreeMap::new();
        records.insert("path".to_string(), "a/very/long/path".repeat(20));
        records.insert("mtime".to_string(), "1700000000.5".to_string());
        let encoded = encode(&records);
        assert_eq!(parse(&encoded).unwrap(), records);
    }

    #[test]
    fn rejects_overrunning_length() {
        assert_eq!(
            parse(b"999 path=x\n").unwrap_err().code,
            Code::ArchiveBadHeader
        );
        assert_eq!(parse(b"abc path=x\n").unwrap_err().code, Code::ArchiveBadHeader);
    }

    #[test]
    fn value_may_contain_equals() {
        let records = parse(b"17 comment=a=b=c\n").unwrap();
        assert_eq!(records["comment"], "a=b=c");
    }
}
