//! Single-member gzip (RFC 1952): header fields, member naming, and a
//! CRC-verified body stream.
//!
//! Multi-member files only occur on the tar path, where the codec layer's
//! multi-member decoder handles them; a bare `.gz` is treated as one member
//! whose trailer closes the file.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use chrono::TimeZone;
use flate2::read::DeflateDecoder;

use crate::cancel::Cancel;
use crate::entry::{Entry, EntryKind};
use crate::error::{ArchiveError, Code, Result};
use crate::limits::{Limits, Profile};
use crate::names;
use crate::substrate::{Substrate, SubstrateExt, SyncReader};

const MAGIC: [u8; 2] = [0x1F, 0x8B];
const METHOD_DEFLATE: u8 = 8;

const FTEXT: u8 = 1 << 0;
const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;

/// Parsed RFC 1952 member header.
#[derive(Debug)]
pub struct GzipHeader {
    pub fname: Option<String>,
    pub fcomment: Option<String>,
    pub extra: Option<Vec<u8>>,
    pub mtime: Option<i64>,
    /// Total header length in bytes, i.e. where deflate data starts.
    pub header_len: u64,
}

/// Parse a member header from the start of `head`.
pub fn parse_header(head: &[u8]) -> Result<GzipHeader> {
    let bad = |message: &str| ArchiveError::new(Code::CompressionGzipBadHeader, message);

    if head.len() < 10 || head[..2] != MAGIC {
        return Err(bad("missing gzip magic"));
    }
    if head[2] != METHOD_DEFLATE {
        return Err(bad("gzip member uses a method other than deflate"));
    }
    let gz_flags = head[3];
    if gz_flags & 0xE0 != 0 {
        return Err(bad("reserved gzip flag bits set"));
    }
    let mtime_raw = u32::from_le_bytes(head[4..8].try_into().expect("4 bytes"));
    let mut pos = 10usize;

    let mut extra = None;
    if gz_flags & FEXTRA != 0 {
        let len = head
            .get(pos..pos + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .ok_or_else(|| bad("truncated FEXTRA length"))?;
        pos += 2;
        let data = head
            .get(pos..pos + len)
            .ok_or_else(|| bad("truncated FEXTRA payload"))?;
        extra = Some(data.to_vec());
        pos += len;
    }

    let mut read_zstr = |pos: &mut usize| -> Result<String> {
        let start = *pos;
        let nul = head[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| bad("unterminated gzip string field"))?;
        *pos = start + nul + 1;
        // Latin-1 per RFC 1952.
        Ok(head[start..start + nul].iter().map(|&b| b as char).collect())
    };

    let fname = if gz_flags & FNAME != 0 {
        Some(read_zstr(&mut pos)?)
    } else {
        None
    };
    let fcomment = if gz_flags & FCOMMENT != 0 {
        Some(read_zstr(&mut pos)?)
    } else {
        None
    };

    if gz_flags & FHCRC != 0 {
        let stored = head
            .get(pos..pos + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .ok_or_else(|| bad("truncated FHCRC"))?;
        let computed = (crc32fast::hash(&head[..pos]) & 0xFFFF) as u16;
        if stored != computed {
            return Err(bad("gzip header CRC16 mismatch"));
        }
        pos += 2;
    }

    Ok(GzipHeader {
        fname,
        fcomment,
        extra,
        mtime: if mtime_raw == 0 {
            None
        } else {
            Some(i64::from(mtime_raw))
        },
        header_len: pos as u64,
    })
}

/// Member naming rule: sanitize the declared FNAME; when there is none, or
/// sanitation leaves nothing usable, the member is called `data`.
pub fn member_name(fname: Option<&str>) -> String {
    if let Some(fname) = fname {
        // Drop any directory part a hostile FNAME smuggles in.
        let base = fname.rsplit(['/', '\\']).next().unwrap_or(fname);
        if let Ok(name) = names::normalize_name(base)
            && !name.ends_with('/')
        {
            return name;
        }
    }
    "data".to_string()
}

/// Reader for one gzip member over a substrate.
pub struct GzipReader {
    substrate: Arc<dyn Substrate>,
    handle: tokio::runtime::Handle,
    limits: Limits,
    profile: Profile,
    cancel: Cancel,
    header: GzipHeader,
    entry: Entry,
    trailer_crc: u32,
}

impl GzipReader {
    pub async fn open(
        substrate: Arc<dyn Substrate>,
        limits: Limits,
        profile: Profile,
        cancel: Cancel,
    ) -> Result<GzipReader> {
        let size = substrate.size();
        if size < 20 {
            return Err(ArchiveError::new(
                Code::CompressionGzipBadHeader,
                "input is smaller than an empty gzip member",
            ));
        }
        if size > limits.max_input_bytes {
            return Err(ArchiveError::new(
                Code::ArchiveLimitExceeded,
                format!("{size}-byte input exceeds the cap of {}", limits.max_input_bytes),
            ));
        }
        let head = substrate
            .read_range(0, (64 * 1024).min(size), &cancel)
            .await?;
        let header = parse_header(&head)?;

        let trailer = substrate.read_tail(8, &cancel).await?;
        let trailer_crc = u32::from_le_bytes(trailer[0..4].try_into().expect("4 bytes"));
        let isize = u32::from_le_bytes(trailer[4..8].try_into().expect("4 bytes"));

        let mut entry = Entry::new(member_name(header.fname.as_deref()), u64::from(isize), EntryKind::File);
        entry.mtime = header
            .mtime
            .and_then(|secs| chrono::Utc.timestamp_opt(secs, 0).single());
        entry.comment = header.fcomment.clone();
        entry.crc32 = trailer_crc;
        entry.payload_offset = header.header_len;
        entry.compressed_size = size - header.header_len - 8;
        Ok(GzipReader {
            substrate,
            handle: tokio::runtime::Handle::current(),
            limits,
            profile,
            cancel,
            header,
            entry,
            trailer_crc,
        })
    }

    pub fn header(&self) -> &GzipHeader {
        &self.header
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// The single pseudo-entry a gzip member exposes.
    pub fn entries(&self) -> &[Entry] {
        std::slice::from_ref(&self.entry)
    }

    pub async fn close(&self) -> Result<()> {
        self.substrate.close().await
    }

    pub fn open_entry(&self) -> Result<GzipBody> {
        self.cancel.check()?;
        if self.entry.size > self.limits.max_uncompressed_entry_bytes {
            return Err(ArchiveError::new(
                Code::ArchiveLimitExceeded,
                format!(
                    "member declares {} bytes, cap is {}",
                    self.entry.size, self.limits.max_uncompressed_entry_bytes
                ),
            ));
        }
        let window = SyncReader::new(
            Arc::clone(&self.substrate),
            self.handle.clone(),
            self.cancel.clone(),
        )
        .window(self.entry.payload_offset, self.entry.compressed_size);
        Ok(GzipBody {
            inner: DeflateDecoder::new(window),
            hasher: crc32fast::Hasher::new(),
            produced: 0,
            cap: self.limits.max_uncompressed_entry_bytes,
            expected_crc: self.trailer_crc,
            expected_isize: self.entry.size as u32,
            done: false,
        })
    }

    pub async fn read_entry(&self) -> Result<Bytes> {
        let mut body = self.open_entry()?;
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut out = Vec::new();
            body.read_to_end(&mut out)
                .map_err(|e| ArchiveError::from_io(e, Code::ZipBadCrc))?;
            Ok(out)
        })
        .await
        .map_err(|e| ArchiveError::new(Code::ArchiveTruncated, format!("blocking task failed: {e}")))??;
        Ok(Bytes::from(bytes))
    }
}

/// Decompressing body stream; verifies the trailer CRC and ISIZE at EOF.
pub struct GzipBody {
    inner: DeflateDecoder<crate::substrate::WindowReader>,
    hasher: crc32fast::Hasher,
    produced: u64,
    cap: u64,
    expected_crc: u32,
    expected_isize: u32,
    done: bool,
}

impl Read for GzipBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.done {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.done = true;
            if self.produced as u32 != self.expected_isize {
                return Err(ArchiveError::new(
                    Code::ZipBadCrc,
                    format!(
                        "gzip ISIZE mismatch: trailer says {}, got {}",
                        self.expected_isize,
                        self.produced as u32
                    ),
                )
                .into());
            }
            let actual = std::mem::take(&mut self.hasher).finalize();
            if actual != self.expected_crc {
                return Err(ArchiveError::new(
                    Code::ZipBadCrc,
                    format!(
                        "gzip CRC-32 mismatch: trailer {:#010x}, computed {actual:#010x}",
                        self.expected_crc
                    ),
                )
                .into());
            }
            return Ok(0);
        }
        self.hasher.update(&buf[..n]);
        self.produced += n as u64;
        if self.produced > self.cap {
            return Err(ArchiveError::new(
                Code::ArchiveLimitExceeded,
                format!("member output exceeds the cap of {} bytes", self.cap),
            )
            .into());
        }
        Ok(n)
    }
}
