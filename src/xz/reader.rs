//! The `.xz` container state machine.
//!
//! Pull-driven: `read` drains decoded bytes, and when the buffer runs dry the
//! machine advances `stream-header → block-header → block-data →
//! block-padding → block-check → (block-header | index) → footer →
//! stream-padding → (done | stream-header)`. Concatenated streams are
//! accepted only when their flags match the first stream's.

use std::io::Read;

use crate::cancel::{Cancel, CancelCounter};
use crate::error::{ArchiveError, Code, Result};
use crate::limits::{Limits, Profile};
use crate::report::AuditIssue;

use super::check::BlockCheck;
use super::lzma2::Lzma2Decoder;
use super::{CheckType, FILTER_DELTA, FILTER_LZMA2, FOOTER_MAGIC, STREAM_MAGIC, lzma2_dict_size, vli};

fn bad_data(message: impl Into<String>) -> ArchiveError {
    ArchiveError::new(Code::CompressionXzBadData, message.into())
}

use super::check::check_field_size;

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        CountingReader { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Delta filter state (the one non-terminal filter in a supported chain).
struct DeltaState {
    dist: usize,
    history: [u8; 256],
    pos: usize,
}

impl DeltaState {
    fn new(dist: usize) -> Self {
        DeltaState {
            dist,
            history: [0; 256],
            pos: 0,
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            let prev = self.history[(self.pos + self.dist) & 0xFF];
            *byte = byte.wrapping_add(prev);
            self.pos = self.pos.wrapping_sub(1) & 0xFF;
            self.history[self.pos] = *byte;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StreamHeader,
    BlockOrIndex,
    BlockData,
    Footer,
    StreamPadding,
    Done,
}

struct BlockState {
    header_size: u64,
    compressed_expected: Option<u64>,
    uncompressed_expected: Option<u64>,
    data_start_count: u64,
    uncompressed_out: u64,
    check: BlockCheck,
    deltas: Vec<DeltaState>,
}

/// Resource caps the decoder enforces, extracted from [`Limits`].
#[derive(Debug, Clone)]
pub struct XzOptions {
    pub max_output_bytes: u64,
    pub max_compression_ratio: u64,
    pub max_dictionary_bytes: u64,
    pub max_index_records: u64,
    pub max_index_bytes: u64,
    pub max_buffered_input_bytes: u64,
    /// Fail on check types this build cannot verify (strict/agent); compat
    /// skips them and surfaces an info note instead.
    pub unsupported_check_fatal: bool,
}

impl XzOptions {
    pub fn from_limits(limits: &Limits, profile: Profile, max_output_bytes: u64) -> Self {
        XzOptions {
            max_output_bytes,
            max_compression_ratio: limits.max_compression_ratio,
            max_dictionary_bytes: limits
                .max_xz_dictionary_bytes
                .min(limits.max_dictionary_bytes),
            max_index_records: limits.max_xz_index_records,
            max_index_bytes: limits.max_xz_index_bytes,
            max_buffered_input_bytes: limits.max_xz_buffered_input_bytes,
            unsupported_check_fatal: profile.unsupported_check_fatal(),
        }
    }
}

pub struct XzReader<R: Read> {
    input: CountingReader<R>,
    options: XzOptions,
    cancel: CancelCounter,
    state: State,
    /// Flags of the first stream; later concatenated members must match.
    stream_flags: Option<[u8; 2]>,
    check_id: u8,
    check_type: Option<CheckType>,
    lzma2: Option<Lzma2Decoder>,
    block: Option<BlockState>,
    records: Vec<(u64, u64)>,
    index_size: u64,
    total_out: u64,
    out_buf: Vec<u8>,
    out_pos: usize,
    notes: Vec<AuditIssue>,
}

impl<R: Read> XzReader<R> {
    pub fn new(input: R, options: XzOptions, cancel: Cancel) -> Self {
        XzReader {
            input: CountingReader::new(input),
            options,
            cancel: CancelCounter::new(cancel),
            state: State::StreamHeader,
            stream_flags: None,
            check_id: 0,
            check_type: Some(CheckType::None),
            lzma2: None,
            block: None,
            records: Vec::new(),
            index_size: 0,
            total_out: 0,
            out_buf: Vec::new(),
            out_pos: 0,
            notes: Vec::new(),
        }
    }

    /// Non-fatal observations (e.g. skipped checks in compat mode).
    pub fn notes(&self) -> &[AuditIssue] {
        &self.notes
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.input
            .read_exact(buf)
            .map_err(|e| ArchiveError::from_io(e, Code::CompressionXzTruncated))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Parse the 12-byte stream header; `first_byte` is pre-read when we got
    /// here from stream padding.
    fn stream_header(&mut self, first_byte: Option<u8>) -> Result<()> {
        let mut header = [0u8; 12];
        match first_byte {
            Some(byte) => {
                header[0] = byte;
                let rest = &mut header[1..];
                self.input
                    .read_exact(rest)
                    .map_err(|e| ArchiveError::from_io(e, Code::CompressionXzTruncated))?;
            }
            None => self.read_exact(&mut header)?,
        }
        if header[..6] != STREAM_MAGIC {
            return Err(bad_data("bad stream header magic"));
        }
        let flags = [header[6], header[7]];
        if flags[0] != 0 || flags[1] & 0xF0 != 0 {
            return Err(bad_data("reserved stream flag bits set"));
        }
        let stored_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if crc32fast::hash(&flags) != stored_crc {
            return Err(bad_data("stream header CRC mismatch"));
        }
        if let Some(first) = self.stream_flags
            && first != flags
        {
            return Err(bad_data(
                "concatenated stream declares different flags than the first",
            ));
        }
        self.stream_flags = Some(flags);
        self.check_id = flags[1] & 0x0F;
        self.check_type = match CheckType::from_id(self.check_id) {
            Ok(check) => Some(check),
            Err(id) => {
                if self.options.unsupported_check_fatal {
                    return Err(ArchiveError::new(
                        Code::CompressionXzUnsupportedCheck,
                        format!("unsupported check type {id}"),
                    ));
                }
                self.notes.push(AuditIssue::info(
                    Code::CompressionXzUnsupportedCheck,
                    format!("check type {id} not verifiable; integrity not checked"),
                ));
                None
            }
        };
        self.records.clear();
        self.state = State::BlockOrIndex;
        Ok(())
    }

    fn block_header(&mut self, size_byte: u8) -> Result<()> {
        let header_size = (u64::from(size_byte) + 1) * 4;
        if header_size > self.options.max_buffered_input_bytes {
            return Err(ArchiveError::new(
                Code::CompressionXzBufferLimit,
                "block header exceeds the buffered-input cap",
            ));
        }
        let mut header = vec![0u8; header_size as usize];
        header[0] = size_byte;
        self.read_exact(&mut header[1..])?;

        let crc_offset = header.len() - 4;
        let stored_crc = u32::from_le_bytes(header[crc_offset..].try_into().expect("4 bytes"));
        if crc32fast::hash(&header[..crc_offset]) != stored_crc {
            return Err(bad_data("block header CRC mismatch"));
        }

        let flags = header[1];
        if flags & 0x3C != 0 {
            return Err(bad_data("reserved block flag bits set"));
        }
        let filter_count = (flags & 0x03) as usize + 1;
        let mut pos = 2usize;

        let mut compressed_expected = None;
        let mut uncompressed_expected = None;
        if flags & 0x40 != 0 {
            let (value, used) = vli::decode(&header[pos..crc_offset])?;
            compressed_expected = Some(value);
            pos += used;
        }
        if flags & 0x80 != 0 {
            let (value, used) = vli::decode(&header[pos..crc_offset])?;
            uncompressed_expected = Some(value);
            pos += used;
        }

        let mut deltas = Vec::new();
        let mut dict_size = None;
        for index in 0..filter_count {
            let (id, used) = vli::decode(&header[pos..crc_offset])?;
            pos += used;
            let (props_len, used) = vli::decode(&header[pos..crc_offset])?;
            pos += used;
            let props_end = pos
                .checked_add(props_len as usize)
                .filter(|&end| end <= crc_offset)
                .ok_or_else(|| bad_data("filter properties overflow the header"))?;
            let props = &header[pos..props_end];
            pos = props_end;

            let last = index == filter_count - 1;
            match (id, last) {
                (FILTER_LZMA2, true) => {
                    if props.len() != 1 {
                        return Err(bad_data("LZMA2 filter must carry one properties byte"));
                    }
                    dict_size = Some(lzma2_dict_size(props[0]).ok_or_else(|| {
                        bad_data("invalid LZMA2 dictionary-size properties byte")
                    })?);
                }
                (FILTER_DELTA, false) => {
                    if props.len() != 1 {
                        return Err(bad_data("delta filter must carry one properties byte"));
                    }
                    deltas.push(DeltaState::new(usize::from(props[0]) + 1));
                }
                (id, true) => {
                    return Err(ArchiveError::new(
                        Code::CompressionXzUnsupportedFilter,
                        format!("filter chain must end in LZMA2, found id {id:#x}"),
                    ));
                }
                (id, false) => {
                    return Err(ArchiveError::new(
                        Code::CompressionXzUnsupportedFilter,
                        format!("unsupported non-terminal filter id {id:#x}"),
                    ));
                }
            }
        }
        let dict_size = dict_size.ok_or_else(|| bad_data("no LZMA2 filter in chain"))?;
        if dict_size > self.options.max_dictionary_bytes {
            return Err(ArchiveError::new(
                Code::CompressionResourceLimit,
                format!(
                    "declared dictionary of {dict_size} bytes exceeds the cap of {}",
                    self.options.max_dictionary_bytes
                ),
            ));
        }

        // Header padding after the filter list must be zero.
        if header[pos..crc_offset].iter().any(|&b| b != 0) {
            return Err(bad_data("non-zero block header padding"));
        }

        // Decode order is the reverse of the declared chain.
        deltas.reverse();
        self.lzma2 = Some(Lzma2Decoder::new(dict_size));
        self.block = Some(BlockState {
            header_size,
            compressed_expected,
            uncompressed_expected,
            data_start_count: self.input.count,
            uncompressed_out: 0,
            check: BlockCheck::new(self.check_type.unwrap_or(CheckType::None)),
            deltas,
        });
        self.state = State::BlockData;
        Ok(())
    }

    /// Finish a block after the LZMA2 end marker: padding, check, record.
    fn finish_block(&mut self) -> Result<()> {
        let mut block = self.block.take().expect("in block");
        let compressed = self.input.count - block.data_start_count;

        if let Some(expected) = block.compressed_expected
            && expected != compressed
        {
            return Err(bad_data(format!(
                "block compressed size {compressed} does not match declared {expected}"
            )));
        }
        if let Some(expected) = block.uncompressed_expected
            && expected != block.uncompressed_out
        {
            return Err(bad_data(format!(
                "block uncompressed size {} does not match declared {expected}",
                block.uncompressed_out
            )));
        }

        let padding = (4 - (compressed % 4) as usize) % 4;
        for _ in 0..padding {
            if self.read_u8()? != 0 {
                return Err(bad_data("non-zero block padding"));
            }
        }

        let check_size = check_field_size(self.check_id);
        let mut stored = vec![0u8; check_size];
        self.read_exact(&mut stored)?;
        if self.check_type.is_some() {
            let check = std::mem::replace(&mut block.check, BlockCheck::None);
            if !check.matches(&stored) {
                return Err(ArchiveError::new(
                    Code::CompressionXzBadCheck,
                    "block check mismatch",
                ));
            }
        }

        let unpadded = block.header_size + compressed + check_size as u64;
        self.records.push((unpadded, block.uncompressed_out));
        self.state = State::BlockOrIndex;
        Ok(())
    }

    /// Parse and verify the index against the blocks we actually decoded.
    /// The indicator byte 0x00 has already been consumed.
    fn index(&mut self) -> Result<()> {
        let cap = self
            .options
            .max_index_bytes
            .min(self.options.max_buffered_input_bytes) as usize;
        let mut raw = vec![0u8];
        let mut read_vli = |this: &mut Self, raw: &mut Vec<u8>| -> Result<u64> {
            let start = raw.len();
            loop {
                if raw.len() - start >= vli::MAX_VLI_BYTES {
                    return Err(bad_data("index integer exceeds 9 bytes"));
                }
                if raw.len() >= cap {
                    return Err(ArchiveError::new(
                        Code::CompressionXzBufferLimit,
                        "index exceeds the buffered-input cap",
                    ));
                }
                let byte = this.read_u8()?;
                raw.push(byte);
                if byte & 0x80 == 0 {
                    break;
                }
            }
            Ok(vli::decode(&raw[start..])?.0)
        };

        let count = read_vli(self, &mut raw)?;
        if count > self.options.max_index_records {
            return Err(ArchiveError::new(
                Code::CompressionResourceLimit,
                format!(
                    "index declares {count} records, cap is {}",
                    self.options.max_index_records
                ),
            ));
        }
        if count != self.records.len() as u64 {
            return Err(bad_data(format!(
                "index declares {count} records, stream carried {}",
                self.records.len()
            )));
        }
        let records = self.records.clone();
        for &(unpadded, uncompressed) in &records {
            let got_unpadded = read_vli(self, &mut raw)?;
            let got_uncompressed = read_vli(self, &mut raw)?;
            if got_unpadded != unpadded || got_uncompressed != uncompressed {
                return Err(bad_data("index record does not match decoded block"));
            }
        }

        while raw.len() % 4 != 0 {
            let byte = self.read_u8()?;
            if byte != 0 {
                return Err(bad_data("non-zero index padding"));
            }
            raw.push(0);
        }
        if raw.len() as u64 > self.options.max_index_bytes {
            return Err(ArchiveError::new(
                Code::CompressionResourceLimit,
                "index exceeds the index-size cap",
            ));
        }

        let mut stored = [0u8; 4];
        self.read_exact(&mut stored)?;
        if crc32fast::hash(&raw) != u32::from_le_bytes(stored) {
            return Err(bad_data("index CRC mismatch"));
        }

        // Footer needs the real index size (including its CRC).
        self.index_size = raw.len() as u64 + 4;
        self.state = State::Footer;
        Ok(())
    }

    fn footer(&mut self) -> Result<()> {
        let mut footer = [0u8; 12];
        self.read_exact(&mut footer)?;
        let stored_crc = u32::from_le_bytes(footer[..4].try_into().expect("4 bytes"));
        if crc32fast::hash(&footer[4..10]) != stored_crc {
            return Err(bad_data("stream footer CRC mismatch"));
        }
        let backward = (u64::from(u32::from_le_bytes(footer[4..8].try_into().expect("4 bytes")))
            + 1)
            * 4;
        if backward != self.index_size {
            return Err(bad_data(format!(
                "footer backward-size {backward} does not match index size {}",
                self.index_size
            )));
        }
        if Some([footer[8], footer[9]]) != self.stream_flags {
            return Err(bad_data("footer flags differ from stream header flags"));
        }
        if footer[10..12] != FOOTER_MAGIC {
            return Err(bad_data("bad stream footer magic"));
        }
        self.state = State::StreamPadding;
        Ok(())
    }

    /// Consume zero padding; EOF ends the file, a non-zero byte at 4-byte
    /// alignment starts the next concatenated stream.
    fn stream_padding(&mut self) -> Result<()> {
        let mut padding = 0u64;
        loop {
            let mut byte = [0u8; 1];
            match self.input.read(&mut byte) {
                Ok(0) => {
                    if padding % 4 != 0 {
                        return Err(bad_data("stream padding is not a multiple of four"));
                    }
                    self.flush_checks()?;
                    self.state = State::Done;
                    return Ok(());
                }
                Ok(_) => {
                    if byte[0] == 0 {
                        padding += 1;
                        continue;
                    }
                    if padding % 4 != 0 {
                        return Err(bad_data("stream padding is not a multiple of four"));
                    }
                    self.state = State::StreamHeader;
                    return self.stream_header(Some(byte[0]));
                }
                Err(e) => return Err(ArchiveError::from_io(e, Code::CompressionXzTruncated)),
            }
        }
    }

    /// Final ratio check, run once the last stream ends.
    fn flush_checks(&self) -> Result<()> {
        let ceiling = self
            .input
            .count
            .saturating_mul(self.options.max_compression_ratio);
        if self.total_out > ceiling {
            return Err(ArchiveError::new(
                Code::CompressionXzLimitExceeded,
                format!(
                    "output of {} bytes exceeds {}x the {}-byte input",
                    self.total_out, self.options.max_compression_ratio, self.input.count
                ),
            ));
        }
        Ok(())
    }

    /// Advance the machine until output is buffered or the stream is done.
    fn fill(&mut self) -> Result<()> {
        while self.out_pos >= self.out_buf.len() && self.state != State::Done {
            match self.state {
                State::StreamHeader => self.stream_header(None)?,
                State::BlockOrIndex => {
                    let byte = self.read_u8()?;
                    if byte == 0 {
                        self.index()?;
                    } else {
                        self.block_header(byte)?;
                    }
                }
                State::BlockData => {
                    let lzma2 = self.lzma2.as_mut().expect("decoder in block");
                    match lzma2.decode_chunk(&mut self.input, &mut self.cancel)? {
                        None => self.finish_block()?,
                        Some(mut chunk) => {
                            let block = self.block.as_mut().expect("in block");
                            for delta in &mut block.deltas {
                                delta.apply(&mut chunk);
                            }
                            block.check.update(&chunk);
                            block.uncompressed_out += chunk.len() as u64;
                            self.total_out += chunk.len() as u64;
                            if self.total_out > self.options.max_output_bytes {
                                return Err(ArchiveError::new(
                                    Code::CompressionXzLimitExceeded,
                                    format!(
                                        "decoded output exceeds the cap of {} bytes",
                                        self.options.max_output_bytes
                                    ),
                                ));
                            }
                            self.out_buf = chunk;
                            self.out_pos = 0;
                        }
                    }
                }
                State::Footer => self.footer()?,
                State::StreamPadding => self.stream_padding()?,
                State::Done => unreachable!(),
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for XzReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.out_pos >= self.out_buf.len() {
            self.fill().map_err(std::io::Error::from)?;
            if self.out_pos >= self.out_buf.len() {
                return Ok(0);
            }
        }
        let n = (self.out_buf.len() - self.out_pos).min(buf.len());
        buf[..n].copy_from_slice(&self.out_buf[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> XzOptions {
        XzOptions::from_limits(&Limits::default(), Profile::Strict, 1 << 30)
    }

    /// Assemble a whole single-block stream around uncompressed LZMA2 chunks,
    /// with the given stream-flags check nibble.
    fn build_xz(payload: &[u8], check_id: u8, dict_props: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let flags = [0u8, check_id];
        out.extend_from_slice(&STREAM_MAGIC);
        out.extend_from_slice(&flags);
        out.extend_from_slice(&crc32fast::hash(&flags).to_le_bytes());

        // Block header: one LZMA2 filter, no declared sizes.
        let mut header = vec![0x02, 0x00, 0x21, 0x01, dict_props, 0, 0, 0];
        let crc = crc32fast::hash(&header);
        header.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(header.len(), 12);
        out.extend_from_slice(&header);

        // Block data: one uncompressed chunk with dict reset, then the end
        // marker.
        let mut data = vec![0x01];
        data.extend_from_slice(&((payload.len() - 1) as u16).to_be_bytes());
        data.extend_from_slice(payload);
        data.push(0x00);
        let compressed = data.len() as u64;
        out.extend_from_slice(&data);
        let pad = (4 - (compressed % 4) as usize) % 4;
        out.extend(std::iter::repeat_n(0u8, pad));

        let check_size = check_field_size(check_id) as u64;
        if check_id == 0x01 {
            out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        } else {
            // For "none" this is empty; for ids the builder cannot compute it
            // writes a zero field (only read by compat-mode skipping).
            out.extend(std::iter::repeat_n(0u8, check_size as usize));
        }

        // Index.
        let mut index = vec![0x00];
        vli::encode(1, &mut index);
        vli::encode(12 + compressed + check_size, &mut index);
        vli::encode(payload.len() as u64, &mut index);
        while index.len() % 4 != 0 {
            index.push(0);
        }
        let index_crc = crc32fast::hash(&index);
        out.extend_from_slice(&index);
        out.extend_from_slice(&index_crc.to_le_bytes());
        let index_size = index.len() as u64 + 4;

        // Footer.
        let backward = ((index_size / 4) - 1) as u32;
        let mut tail = Vec::new();
        tail.extend_from_slice(&backward.to_le_bytes());
        tail.extend_from_slice(&flags);
        out.extend_from_slice(&crc32fast::hash(&tail).to_le_bytes());
        out.extend_from_slice(&tail);
        out.extend_from_slice(&FOOTER_MAGIC);
        out
    }

    #[test]
    fn decodes_single_stream_with_crc32_check() {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let stream = build_xz(payload, 0x01, 0);
        let mut reader = XzReader::new(&stream[..], options(), Cancel::none());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn decodes_concatenated_streams_with_matching_flags() {
        let mut stream = build_xz(b"first", 0x00, 0);
        stream.extend([0u8; 8]); // two words of stream padding
        stream.extend(build_xz(b"second", 0x00, 0));
        let mut reader = XzReader::new(&stream[..], options(), Cancel::none());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"firstsecond");
    }

    #[test]
    fn rejects_concatenated_stream_with_different_flags() {
        let mut stream = build_xz(b"first", 0x01, 0);
        stream.extend(build_xz(b"second", 0x00, 0));
        let mut reader = XzReader::new(&stream[..], options(), Cancel::none());
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        let err = ArchiveError::from_io(err, Code::CompressionXzBadData);
        assert_eq!(err.code, Code::CompressionXzBadData);
        assert_eq!(out, b"first");
    }

    #[test]
    fn rejects_corrupt_block_check() {
        let mut stream = build_xz(b"payload bytes", 0x01, 0);
        // Flip a payload byte after the fact; the stored CRC no longer holds.
        let pos = stream
            .windows(13)
            .position(|w| w == b"payload bytes")
            .unwrap();
        stream[pos] ^= 0xFF;
        let mut reader = XzReader::new(&stream[..], options(), Cancel::none());
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        let err = ArchiveError::from_io(err, Code::ArchiveBadHeader);
        assert_eq!(err.code, Code::CompressionXzBadCheck);
    }

    #[test]
    fn oversized_dictionary_is_a_resource_error() {
        // props 32 declares a 256 MiB dictionary; the default cap is 64 MiB.
        let stream = build_xz(b"x", 0x00, 32);
        let mut reader = XzReader::new(&stream[..], options(), Cancel::none());
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        let err = ArchiveError::from_io(err, Code::ArchiveBadHeader);
        assert_eq!(err.code, Code::CompressionResourceLimit);
    }

    #[test]
    fn unsupported_check_is_fatal_in_strict_and_noted_in_compat() {
        let stream = build_xz(b"irrelevant", 0x09, 0);
        let mut strict = XzReader::new(&stream[..], options(), Cancel::none());
        let err = strict.read_to_end(&mut Vec::new()).unwrap_err();
        let err = ArchiveError::from_io(err, Code::ArchiveBadHeader);
        assert_eq!(err.code, Code::CompressionXzUnsupportedCheck);

        let mut opts = options();
        opts.unsupported_check_fatal = false;
        let mut compat = XzReader::new(&stream[..], opts, Cancel::none());
        let mut out = Vec::new();
        compat.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"irrelevant");
        assert_eq!(compat.notes().len(), 1);
    }

    #[test]
    fn truncated_stream_reports_truncation() {
        let stream = build_xz(b"some payload", 0x00, 0);
        let cut = &stream[..stream.len() - 6];
        let mut reader = XzReader::new(cut, options(), Cancel::none());
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        let err = ArchiveError::from_io(err, Code::CompressionXzBadData);
        assert_eq!(err.code, Code::ArchiveTruncated);
    }
}
