//! Byte sources the container readers sit on.
//!
//! A [`Substrate`] is a random-access view with a known size: an in-memory
//! buffer, a local file, or an HTTP range session. All reads are async and
//! honor cancellation before each I/O; [`SyncReader`] bridges a substrate
//! into the synchronous `Read`/`Seek` world the codec stack lives in (it
//! parks on a runtime handle, so it must only be used from blocking threads).

mod file;
mod http;

pub use file::FileSubstrate;
pub use http::{HttpOptions, HttpRangeSubstrate, RangeResponse, RangeTransport};

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cancel::Cancel;
use crate::error::{ArchiveError, Code, Result};

/// Fetch granularity of [`SyncReader`] and the HTTP block cache.
pub const BLOCK_SIZE: u64 = 64 * 1024;

/// Random-access byte source with cancellation.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Total size in bytes, known up front.
    fn size(&self) -> u64;

    /// Read up to `len` bytes at `offset`. Short returns happen only at EOF;
    /// reading at `offset > size` is an error.
    async fn read_range(&self, offset: u64, len: u64, cancel: &Cancel) -> Result<Bytes>;

    /// Release underlying resources. Always callable, including after
    /// cancellation.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Extension helpers shared by every substrate.
#[async_trait]
pub trait SubstrateExt: Substrate {
    /// Read the last `len` bytes (EOCD scans).
    async fn read_tail(&self, len: u64, cancel: &Cancel) -> Result<Bytes> {
        let len = len.min(self.size());
        self.read_range(self.size() - len, len, cancel).await
    }

    /// Read exactly `len` bytes or fail with `ARCHIVE_TRUNCATED`.
    async fn read_exact_range(&self, offset: u64, len: u64, cancel: &Cancel) -> Result<Bytes> {
        let bytes = self.read_range(offset, len, cancel).await?;
        if bytes.len() as u64 != len {
            return Err(ArchiveError::new(
                Code::ArchiveTruncated,
                format!(
                    "wanted {len} bytes at offset {offset}, source ended after {}",
                    bytes.len()
                ),
            )
            .with_offset(offset));
        }
        Ok(bytes)
    }
}

impl<S: Substrate + ?Sized> SubstrateExt for S {}

/// In-memory substrate: size is the buffer length, reads are sub-slice
/// clamps. Offsets are validated to fit the native integer range.
pub struct BufferSubstrate {
    data: Bytes,
}

impl BufferSubstrate {
    pub fn new(data: impl Into<Bytes>) -> Self {
        BufferSubstrate { data: data.into() }
    }
}

#[async_trait]
impl Substrate for BufferSubstrate {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, offset: u64, len: u64, cancel: &Cancel) -> Result<Bytes> {
        cancel.check()?;
        if offset > self.data.len() as u64 {
            return Err(ArchiveError::new(
                Code::ArchiveTruncated,
                format!("read at {offset} past end of {}-byte buffer", self.data.len()),
            )
            .with_offset(offset));
        }
        let start = offset as usize;
        let end = usize::try_from(offset.saturating_add(len).min(self.data.len() as u64))
            .map_err(|_| {
                ArchiveError::new(Code::ArchiveLimitExceeded, "range exceeds native integer range")
            })?;
        Ok(self.data.slice(start..end))
    }
}

/// Synchronous `Read + Seek` adapter over a substrate.
///
/// The TAR and codec paths are synchronous `Read` pipelines executed under
/// `spawn_blocking`; this adapter parks each chunk fetch on the runtime
/// handle. Fetches are 64 KiB aligned-ish chunks with a one-block lookback
/// buffer, so sequential scans issue one ranged read per block.
pub struct SyncReader {
    substrate: Arc<dyn Substrate>,
    handle: tokio::runtime::Handle,
    cancel: Cancel,
    position: u64,
    buffer: Option<Bytes>,
    buffer_offset: u64,
}

impl SyncReader {
    pub fn new(substrate: Arc<dyn Substrate>, handle: tokio::runtime::Handle, cancel: Cancel) -> Self {
        SyncReader {
            substrate,
            handle,
            cancel,
            position: 0,
            buffer: None,
            buffer_offset: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.substrate.size()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Restrict to a window `[start, start+len)` of the substrate.
    pub fn window(self, start: u64, len: u64) -> WindowReader {
        WindowReader {
            inner: self,
            start,
            len,
            position: 0,
        }
    }
}

impl Read for SyncReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || self.position >= self.substrate.size() {
            return Ok(0);
        }

        if let Some(buffer) = &self.buffer {
            let in_buffer = self.position.checked_sub(self.buffer_offset);
            if let Some(pos) = in_buffer
                && (pos as usize) < buffer.len()
            {
                let pos = pos as usize;
                let n = (buffer.len() - pos).min(buf.len());
                buf[..n].copy_from_slice(&buffer[pos..pos + n]);
                self.position += n as u64;
                return Ok(n);
            }
        }

        let remaining = self.substrate.size() - self.position;
        let fetch = BLOCK_SIZE.min(remaining);
        let substrate = Arc::clone(&self.substrate);
        let cancel = self.cancel.clone();
        let offset = self.position;
        let bytes = self
            .handle
            .block_on(async move { substrate.read_range(offset, fetch, &cancel).await })
            .map_err(std::io::Error::from)?;

        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        self.buffer_offset = self.position;
        self.buffer = Some(bytes);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for SyncReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let size = self.substrate.size();
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::End(offset) => {
                if offset >= 0 {
                    size.saturating_add(offset as u64)
                } else {
                    size.saturating_sub(offset.unsigned_abs())
                }
            }
            SeekFrom::Current(offset) => {
                if offset >= 0 {
                    self.position.saturating_add(offset as u64)
                } else {
                    self.position.saturating_sub(offset.unsigned_abs())
                }
            }
        };
        if new_pos > size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek beyond end of substrate",
            ));
        }
        self.position = new_pos;
        // Drop the buffer if the seek left it.
        if let Some(buffer) = &self.buffer {
            let end = self.buffer_offset + buffer.len() as u64;
            if new_pos < self.buffer_offset || new_pos >= end {
                self.buffer = None;
            }
        }
        Ok(new_pos)
    }
}

/// A bounded window over a [`SyncReader`], used for compressed entry bodies.
pub struct WindowReader {
    inner: SyncReader,
    start: u64,
    len: u64,
    position: u64,
}

impl Read for WindowReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.len - self.position;
        if remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        self.inner
            .seek(SeekFrom::Start(self.start + self.position))?;
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "substrate ended inside entry body",
            ));
        }
        self.position += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffer_reads_clamp_at_eof() {
        let sub = BufferSubstrate::new(&b"hello world"[..]);
        let cancel = Cancel::none();
        assert_eq!(sub.size(), 11);
        let bytes = sub.read_range(6, 100, &cancel).await.unwrap();
        assert_eq!(&bytes[..], b"world");
        assert!(sub.read_range(12, 1, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn read_tail_returns_suffix() {
        let sub = BufferSubstrate::new(&b"0123456789"[..]);
        let tail = sub.read_tail(4, &Cancel::none()).await.unwrap();
        assert_eq!(&tail[..], b"6789");
    }

    #[tokio::test]
    async fn read_exact_fails_short() {
        let sub = BufferSubstrate::new(&b"abc"[..]);
        let err = sub
            .read_exact_range(1, 10, &Cancel::none())
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::ArchiveTruncated);
    }

    #[tokio::test]
    async fn cancelled_read_fails_before_io() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let sub = BufferSubstrate::new(&b"abc"[..]);
        let err = sub
            .read_range(0, 1, &Cancel::from_token(token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn sync_reader_reads_and_seeks() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let handle = rt.handle().clone();
        let sub: Arc<dyn Substrate> = Arc::new(BufferSubstrate::new(&b"0123456789"[..]));
        let mut reader = SyncReader::new(sub, handle, Cancel::none());
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"0123");
        reader.seek(SeekFrom::Start(8)).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"89");
    }

    #[test]
    fn window_reader_is_bounded() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let sub: Arc<dyn Substrate> = Arc::new(BufferSubstrate::new(&b"0123456789"[..]));
        let reader = SyncReader::new(sub, rt.handle().clone(), Cancel::none());
        let mut window = reader.window(2, 5);
        let mut out = Vec::new();
        window.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"23456");
    }
}
