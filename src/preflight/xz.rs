//! XZ pre-flight: walk block headers for dictionary demands and, when the
//! tail is available, read the index through the footer's backward-size.

use crate::error::{ArchiveError, Code, Result};
use crate::limits::{Limits, Profile};
use crate::report::AuditIssue;
use crate::xz::{CheckType, FILTER_DELTA, FILTER_LZMA2, FOOTER_MAGIC, STREAM_MAGIC, lzma2_dict_size, vli};

fn bad_header(message: impl Into<String>) -> ArchiveError {
    ArchiveError::new(Code::CompressionXzBadData, message.into())
}

fn incomplete(what: &str) -> AuditIssue {
    AuditIssue::info(
        Code::CompressionResourcePreflightIncomplete,
        format!("pre-flight stopped early: {what}"),
    )
}

/// Scan wrapper bytes only. `head` is a prefix of the stream, `tail` (when
/// the substrate is seekable) its suffix. Resource violations are hard
/// errors raised before any LZMA allocation; an incomplete traversal is a
/// non-fatal info issue.
pub fn scan_xz(
    head: &[u8],
    tail: Option<&[u8]>,
    limits: &Limits,
    profile: Profile,
) -> Result<Vec<AuditIssue>> {
    let mut issues = Vec::new();

    if head.len() < 12 || head[..6] != STREAM_MAGIC {
        return Err(bad_header("missing XZ stream header magic"));
    }
    let flags = [head[6], head[7]];
    if flags[0] != 0 || flags[1] & 0xF0 != 0 {
        return Err(bad_header("reserved stream flag bits set"));
    }
    if crc32fast::hash(&flags) != u32::from_le_bytes([head[8], head[9], head[10], head[11]]) {
        return Err(bad_header("stream header CRC mismatch"));
    }
    if let Err(id) = CheckType::from_id(flags[1] & 0x0F) {
        if profile.unsupported_check_fatal() {
            return Err(ArchiveError::new(
                Code::CompressionXzUnsupportedCheck,
                format!("unsupported check type {id}"),
            ));
        }
        issues.push(AuditIssue::info(
            Code::CompressionXzUnsupportedCheck,
            format!("check type {id} not verifiable; integrity not checked"),
        ));
    }

    walk_block_headers(head, limits, &mut issues)?;
    match tail {
        Some(tail) => scan_index(tail, limits, &mut issues)?,
        None => issues.push(incomplete("no seekable tail to read the index from")),
    }
    Ok(issues)
}

/// Parse block headers from the head prefix, hopping over block data when the
/// header pre-declares its compressed size.
fn walk_block_headers(head: &[u8], limits: &Limits, issues: &mut Vec<AuditIssue>) -> Result<()> {
    let dict_cap = limits.max_xz_dictionary_bytes.min(limits.max_dictionary_bytes);
    let mut pos = 12usize;
    let mut headers_seen = 0u64;

    loop {
        let Some(&size_byte) = head.get(pos) else {
            issues.push(incomplete("next block header lies outside the scanned prefix"));
            return Ok(());
        };
        if size_byte == 0 {
            // Index indicator: every block header has been seen.
            return Ok(());
        }
        if headers_seen >= limits.max_xz_preflight_block_headers {
            issues.push(incomplete("block-header scan limit reached"));
            return Ok(());
        }
        let header_size = (usize::from(size_byte) + 1) * 4;
        let Some(header) = head.get(pos..pos + header_size) else {
            issues.push(incomplete("block header extends past the scanned prefix"));
            return Ok(());
        };
        let crc_offset = header_size - 4;
        if crc32fast::hash(&header[..crc_offset])
            != u32::from_le_bytes(header[crc_offset..].try_into().expect("4 bytes"))
        {
            return Err(bad_header("block header CRC mismatch"));
        }

        let block_flags = header[1];
        if block_flags & 0x3C != 0 {
            return Err(bad_header("reserved block flag bits set"));
        }
        let filter_count = (block_flags & 0x03) as usize + 1;
        let mut offset = 2usize;
        let mut compressed_size = None;
        if block_flags & 0x40 != 0 {
            let (value, used) = vli::decode(&header[offset..crc_offset])?;
            compressed_size = Some(value);
            offset += used;
        }
        if block_flags & 0x80 != 0 {
            let (_, used) = vli::decode(&header[offset..crc_offset])?;
            offset += used;
        }
        for index in 0..filter_count {
            let (id, used) = vli::decode(&header[offset..crc_offset])?;
            offset += used;
            let (props_len, used) = vli::decode(&header[offset..crc_offset])?;
            offset += used;
            let props = header
                .get(offset..offset + props_len as usize)
                .ok_or_else(|| bad_header("filter properties overflow the header"))?;
            offset += props_len as usize;

            if id == FILTER_LZMA2 && index == filter_count - 1 {
                let props_byte = *props
                    .first()
                    .ok_or_else(|| bad_header("LZMA2 filter without properties"))?;
                let dict = lzma2_dict_size(props_byte)
                    .ok_or_else(|| bad_header("invalid LZMA2 dictionary-size properties byte"))?;
                if dict > dict_cap {
                    return Err(ArchiveError::new(
                        Code::CompressionResourceLimit,
                        format!("declared dictionary of {dict} bytes exceeds the cap of {dict_cap}"),
                    ));
                }
            } else if id != FILTER_DELTA && id != FILTER_LZMA2 {
                return Err(ArchiveError::new(
                    Code::CompressionXzUnsupportedFilter,
                    format!("unsupported filter id {id:#x}"),
                ));
            }
        }
        headers_seen += 1;

        match compressed_size {
            Some(size) => {
                let padded = size + (4 - size % 4) % 4;
                let check = crate::xz::check::check_field_size(flags_check_id(head)) as u64;
                let Some(next) = (pos as u64)
                    .checked_add(header_size as u64)
                    .and_then(|v| v.checked_add(padded))
                    .and_then(|v| v.checked_add(check))
                else {
                    return Err(bad_header("block offsets overflow"));
                };
                if next > head.len() as u64 {
                    issues.push(incomplete("block data extends past the scanned prefix"));
                    return Ok(());
                }
                pos = next as usize;
            }
            None => {
                issues.push(incomplete(
                    "block header does not declare its compressed size",
                ));
                return Ok(());
            }
        }
    }
}

fn flags_check_id(head: &[u8]) -> u8 {
    head[7] & 0x0F
}

/// Locate the footer at the end of `tail`, follow backward-size to the
/// index, and total its records.
fn scan_index(tail: &[u8], limits: &Limits, issues: &mut Vec<AuditIssue>) -> Result<()> {
    if tail.len() < 12 {
        issues.push(incomplete("tail shorter than a stream footer"));
        return Ok(());
    }
    let footer = &tail[tail.len() - 12..];
    if footer[10..12] != FOOTER_MAGIC {
        return Err(bad_header("missing stream footer magic"));
    }
    if crc32fast::hash(&footer[4..10])
        != u32::from_le_bytes(footer[..4].try_into().expect("4 bytes"))
    {
        return Err(bad_header("stream footer CRC mismatch"));
    }
    let index_size =
        (u64::from(u32::from_le_bytes(footer[4..8].try_into().expect("4 bytes"))) + 1) * 4;
    if index_size > limits.max_xz_index_bytes {
        return Err(ArchiveError::new(
            Code::CompressionResourceLimit,
            format!(
                "index of {index_size} bytes exceeds the cap of {}",
                limits.max_xz_index_bytes
            ),
        ));
    }
    let Some(index_start) = (tail.len() as u64)
        .checked_sub(12)
        .and_then(|v| v.checked_sub(index_size))
    else {
        issues.push(incomplete("index lies outside the scanned tail"));
        return Ok(());
    };
    let index = &tail[index_start as usize..tail.len() - 12];
    if index.first() != Some(&0) {
        return Err(bad_header("index does not start with its indicator byte"));
    }
    let crc_split = index.len() - 4;
    if crc32fast::hash(&index[..crc_split])
        != u32::from_le_bytes(index[crc_split..].try_into().expect("4 bytes"))
    {
        return Err(bad_header("index CRC mismatch"));
    }
    let (records, used) = vli::decode(&index[1..])?;
    if records > limits.max_xz_index_records {
        return Err(ArchiveError::new(
            Code::CompressionResourceLimit,
            format!(
                "index declares {records} records, cap is {}",
                limits.max_xz_index_records
            ),
        ));
    }
    // Sum the record sizes; they must fit the declared index size.
    let mut offset = 1 + used;
    let body_end = index.len() - 4;
    for _ in 0..records {
        for _ in 0..2 {
            if offset >= body_end {
                return Err(bad_header("index records overflow the index size"));
            }
            let (_, used) = vli::decode(&index[offset..body_end])?;
            offset += used;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_only(check_id: u8, dict_props: u8) -> Vec<u8> {
        let mut head = Vec::new();
        let flags = [0u8, check_id];
        head.extend_from_slice(&STREAM_MAGIC);
        head.extend_from_slice(&flags);
        head.extend_from_slice(&crc32fast::hash(&flags).to_le_bytes());
        let mut block = vec![0x02, 0x00, 0x21, 0x01, dict_props, 0, 0, 0];
        let crc = crc32fast::hash(&block);
        block.extend_from_slice(&crc.to_le_bytes());
        head.extend_from_slice(&block);
        head
    }

    #[test]
    fn oversized_dictionary_rejected_before_allocation() {
        // props 32 → 256 MiB; agent caps at 32 MiB.
        let head = header_only(0x00, 32);
        let limits = Limits::for_profile(Profile::Agent);
        let err = scan_xz(&head, None, &limits, Profile::Agent).unwrap_err();
        assert_eq!(err.code, Code::CompressionResourceLimit);
    }

    #[test]
    fn modest_dictionary_passes_with_incomplete_note() {
        let head = header_only(0x00, 0);
        let limits = Limits::default();
        let issues = scan_xz(&head, None, &limits, Profile::Strict).unwrap();
        assert!(
            issues
                .iter()
                .any(|i| i.code == Code::CompressionResourcePreflightIncomplete)
        );
    }

    #[test]
    fn unsupported_check_fatal_per_profile() {
        let head = header_only(0x09, 0);
        let limits = Limits::default();
        let err = scan_xz(&head, None, &limits, Profile::Strict).unwrap_err();
        assert_eq!(err.code, Code::CompressionXzUnsupportedCheck);
        let issues = scan_xz(&head, None, &limits, Profile::Compat).unwrap();
        assert!(issues.iter().any(|i| i.code == Code::CompressionXzUnsupportedCheck));
    }

    #[test]
    fn index_record_cap_enforced_from_tail() {
        // Build a fake tail: index with a huge record count + footer.
        let mut index = vec![0x00];
        vli::encode(1_000_000, &mut index);
        while index.len() % 4 != 0 {
            index.push(0);
        }
        index.extend_from_slice(&crc32fast::hash(&index).to_le_bytes());
        let index_size = index.len() as u64;

        let mut tail = index;
        let backward = ((index_size / 4) - 1) as u32;
        let mut tail_fields = Vec::new();
        tail_fields.extend_from_slice(&backward.to_le_bytes());
        tail_fields.extend_from_slice(&[0, 0]);
        tail.extend_from_slice(&crc32fast::hash(&tail_fields).to_le_bytes());
        tail.extend_from_slice(&tail_fields);
        tail.extend_from_slice(&FOOTER_MAGIC);

        let head = header_only(0x00, 0);
        let err = scan_xz(&head, Some(&tail), &Limits::default(), Profile::Strict).unwrap_err();
        assert_eq!(err.code, Code::CompressionResourceLimit);
    }
}
