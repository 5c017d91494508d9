//! HTTP range-session substrate.
//!
//! The HTTP client itself is out of scope; this module is generic over a
//! [`RangeTransport`] that issues one conditional ranged GET per call and
//! hands back the handful of headers the session contract cares about. The
//! transport must always send `Accept-Encoding: identity`.
//!
//! Session rules: the first successful 206 pins the resource identity (ETag,
//! Last-Modified, total size from `Content-Range`). Later requests carry
//! `If-Range` when a strong ETag is held. Any response that would change the
//! snapshot identity fails fast with a typed error and is never cached;
//! blocks cached earlier stay valid for reads already returned.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use tracing::{debug, warn};

use super::Substrate;
use crate::cancel::Cancel;
use crate::error::{ArchiveError, Code, Result};

/// One ranged response, reduced to the fields the session logic consumes.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    /// HTTP status (206 expected; 200 and 412 have dedicated handling).
    pub status: u16,
    /// Raw `Content-Range` header value, e.g. `bytes 0-65535/123456`.
    pub content_range: Option<String>,
    /// `Content-Encoding` header, if any. Anything but identity is an error.
    pub content_encoding: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub body: Bytes,
}

/// The one HTTP operation the substrate depends on.
#[async_trait]
pub trait RangeTransport: Send + Sync {
    /// Issue `Range: bytes=start-end` (inclusive), with `If-Range` when
    /// given. Implementations always send `Accept-Encoding: identity`.
    async fn fetch(
        &self,
        start: u64,
        end: u64,
        if_range: Option<&str>,
    ) -> Result<RangeResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Refuse to open a session when the server offers no strong ETag.
    pub require_strong_etag: bool,
    /// Cache block size in bytes.
    pub block_size: u64,
    /// Number of cached blocks.
    pub cache_blocks: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        HttpOptions {
            require_strong_etag: false,
            block_size: super::BLOCK_SIZE,
            cache_blocks: 64,
        }
    }
}

struct Pinned {
    size: u64,
    /// Strong ETag usable in `If-Range`; weak ETags are held for display only.
    strong_etag: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
}

/// Random-access substrate over a remote resource supporting byte ranges.
pub struct HttpRangeSubstrate<T: RangeTransport> {
    transport: T,
    options: HttpOptions,
    pinned: Pinned,
    cache: Mutex<LruCache<u64, Bytes>>,
}

impl<T: RangeTransport> std::fmt::Debug for HttpRangeSubstrate<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRangeSubstrate")
            .field("size", &self.pinned.size)
            .field("etag", &self.pinned.etag)
            .finish()
    }
}

fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    // bytes <start>-<end>/<total|*>
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

fn is_strong_etag(etag: &str) -> bool {
    !etag.trim_start().starts_with("W/")
}

impl<T: RangeTransport> HttpRangeSubstrate<T> {
    /// Open a session: issue the first ranged request, pin the resource
    /// identity, and seed the cache with the first block.
    pub async fn open(transport: T, options: HttpOptions) -> Result<Self> {
        let probe_end = options.block_size.saturating_sub(1);
        let response = transport.fetch(0, probe_end, None).await?;
        let (size, body) = Self::validate_initial(&response)?;

        let strong_etag = response
            .etag
            .as_deref()
            .filter(|e| is_strong_etag(e))
            .map(str::to_string);
        if options.require_strong_etag && strong_etag.is_none() {
            return Err(ArchiveError::new(
                Code::HttpStrongEtagRequired,
                "session policy requires a strong ETag and the server sent none",
            ));
        }
        debug!(size, etag = ?response.etag, "http range session pinned");

        let cache_blocks = NonZeroUsize::new(options.cache_blocks)
            .unwrap_or_else(|| NonZeroUsize::new(64).unwrap());
        let mut cache = LruCache::new(cache_blocks);
        cache.put(0, body);

        Ok(HttpRangeSubstrate {
            transport,
            pinned: Pinned {
                size,
                strong_etag,
                etag: response.etag.clone(),
                last_modified: response.last_modified.clone(),
            },
            options,
            cache: Mutex::new(cache),
        })
    }

    pub fn etag(&self) -> Option<&str> {
        self.pinned.etag.as_deref()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.pinned.last_modified.as_deref()
    }

    fn validate_initial(response: &RangeResponse) -> Result<(u64, Bytes)> {
        if response.status == 200 {
            return Err(ArchiveError::new(
                Code::HttpRangeUnsupported,
                "server ignored Range and returned 200",
            ));
        }
        if response.status != 206 {
            return Err(ArchiveError::new(
                Code::HttpBadResponse,
                format!("unexpected status {} for ranged request", response.status),
            ));
        }
        Self::check_identity_encoding(response)?;
        let header = response.content_range.as_deref().ok_or_else(|| {
            ArchiveError::new(Code::HttpBadResponse, "206 without Content-Range")
        })?;
        let (start, end, total) = parse_content_range(header).ok_or_else(|| {
            ArchiveError::new(
                Code::HttpBadResponse,
                format!("unparseable Content-Range {header:?}"),
            )
        })?;
        let size = total.ok_or_else(|| {
            ArchiveError::new(Code::HttpSizeUnknown, "Content-Range total is unknown (*)")
        })?;
        if start != 0 {
            return Err(ArchiveError::new(
                Code::HttpRangeInvalid,
                format!("asked for range starting at 0, got {start}"),
            ));
        }
        let expected = end - start + 1;
        if response.body.len() as u64 != expected {
            return Err(ArchiveError::new(
                Code::HttpBadResponse,
                format!("body is {} bytes, Content-Range promised {expected}", response.body.len()),
            ));
        }
        Ok((size, response.body.clone()))
    }

    fn check_identity_encoding(response: &RangeResponse) -> Result<()> {
        match response.content_encoding.as_deref() {
            None => Ok(()),
            Some(enc) if enc.eq_ignore_ascii_case("identity") => Ok(()),
            Some(enc) => Err(ArchiveError::new(
                Code::HttpContentEncoding,
                format!("server applied Content-Encoding {enc:?}; identity required"),
            )),
        }
    }

    /// Fetch one cache block, enforcing the snapshot identity rules.
    async fn fetch_block(&self, block: u64) -> Result<Bytes> {
        let start = block * self.options.block_size;
        let end = (start + self.options.block_size - 1).min(self.pinned.size - 1);
        let if_range = self.pinned.strong_etag.as_deref();
        let response = self.transport.fetch(start, end, if_range).await?;

        match response.status {
            206 => {}
            200 if if_range.is_some() => {
                // §If-Range: 200 means the resource changed, never a fallback.
                warn!(block, "resource changed under the session (200 after If-Range)");
                return Err(ArchiveError::new(
                    Code::HttpResourceChanged,
                    "server returned 200 after If-Range: resource changed",
                ));
            }
            200 => {
                return Err(ArchiveError::new(
                    Code::HttpRangeUnsupported,
                    "server stopped honoring Range requests (200)",
                ));
            }
            412 => {
                return Err(ArchiveError::new(
                    Code::HttpResourceChanged,
                    "server rejected the pinned validator (412)",
                ));
            }
            status => {
                return Err(ArchiveError::new(
                    Code::HttpBadResponse,
                    format!("unexpected status {status} for ranged request"),
                ));
            }
        }

        Self::check_identity_encoding(&response)?;

        if let (Some(pinned), Some(fresh)) = (self.pinned.etag.as_deref(), response.etag.as_deref())
            && pinned != fresh
        {
            return Err(ArchiveError::new(
                Code::HttpResourceChanged,
                format!("ETag changed from {pinned:?} to {fresh:?}"),
            ));
        }

        let header = response.content_range.as_deref().ok_or_else(|| {
            ArchiveError::new(Code::HttpBadResponse, "206 without Content-Range")
        })?;
        let (got_start, got_end, total) = parse_content_range(header).ok_or_else(|| {
            ArchiveError::new(
                Code::HttpBadResponse,
                format!("unparseable Content-Range {header:?}"),
            )
        })?;
        if total != Some(self.pinned.size) {
            return Err(ArchiveError::new(
                Code::HttpResourceChanged,
                format!(
                    "resource size changed: pinned {}, Content-Range says {:?}",
                    self.pinned.size, total
                ),
            ));
        }
        if got_start != start || got_end != end {
            return Err(ArchiveError::new(
                Code::HttpRangeInvalid,
                format!("asked bytes {start}-{end}, server returned {got_start}-{got_end}"),
            ));
        }
        let expected = end - start + 1;
        if response.body.len() as u64 != expected {
            return Err(ArchiveError::new(
                Code::HttpBadResponse,
                format!("body is {} bytes, expected exactly {expected}", response.body.len()),
            ));
        }
        Ok(response.body)
    }
}

#[async_trait]
impl<T: RangeTransport> Substrate for HttpRangeSubstrate<T> {
    fn size(&self) -> u64 {
        self.pinned.size
    }

    async fn read_range(&self, offset: u64, len: u64, cancel: &Cancel) -> Result<Bytes> {
        if offset > self.pinned.size {
            return Err(ArchiveError::new(
                Code::ArchiveTruncated,
                format!("read at {offset} past end of {}-byte resource", self.pinned.size),
            )
            .with_offset(offset));
        }
        let len = len.min(self.pinned.size - offset);
        if len == 0 {
            return Ok(Bytes::new());
        }

        let block_size = self.options.block_size;
        let first_block = offset / block_size;
        let last_block = (offset + len - 1) / block_size;
        let mut assembled = BytesMut::with_capacity(len as usize);

        for block in first_block..=last_block {
            cancel.check()?;
            let cached = { self.cache.lock().expect("cache lock").get(&block).cloned() };
            let bytes = match cached {
                Some(bytes) => bytes,
                None => {
                    let bytes = self.fetch_block(block).await?;
                    self.cache
                        .lock()
                        .expect("cache lock")
                        .put(block, bytes.clone());
                    bytes
                }
            };
            let block_start = block * block_size;
            let copy_from = offset.max(block_start) - block_start;
            let copy_to = ((offset + len).min(block_start + bytes.len() as u64)) - block_start;
            assembled.extend_from_slice(&bytes[copy_from as usize..copy_to as usize]);
        }

        Ok(assembled.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Scripted in-memory remote with a mutable "current" representation.
    struct FakeRemote {
        data: Vec<u8>,
        etag: Mutex<String>,
        honor_ranges: Mutex<bool>,
        requests: AtomicU64,
    }

    impl FakeRemote {
        fn new(data: Vec<u8>) -> Self {
            FakeRemote {
                data,
                etag: Mutex::new("\"v1\"".to_string()),
                honor_ranges: Mutex::new(true),
                requests: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl RangeTransport for &FakeRemote {
        async fn fetch(
            &self,
            start: u64,
            end: u64,
            if_range: Option<&str>,
        ) -> Result<RangeResponse> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let etag = self.etag.lock().unwrap().clone();
            if !*self.honor_ranges.lock().unwrap() {
                return Ok(RangeResponse {
                    status: 200,
                    content_range: None,
                    content_encoding: None,
                    etag: Some(etag),
                    last_modified: None,
                    body: Bytes::copy_from_slice(&self.data),
                });
            }
            if let Some(validator) = if_range
                && validator != etag
            {
                return Ok(RangeResponse {
                    status: 200,
                    content_range: None,
                    content_encoding: None,
                    etag: Some(etag),
                    last_modified: None,
                    body: Bytes::copy_from_slice(&self.data),
                });
            }
            let end = end.min(self.data.len() as u64 - 1);
            Ok(RangeResponse {
                status: 206,
                content_range: Some(format!("bytes {start}-{end}/{}", self.data.len())),
                content_encoding: None,
                etag: Some(etag),
                last_modified: Some("Thu, 01 Jan 2026 00:00:00 GMT".to_string()),
                body: Bytes::copy_from_slice(&self.data[start as usize..=end as usize]),
            })
        }
    }

    fn options(block: u64) -> HttpOptions {
        HttpOptions {
            block_size: block,
            cache_blocks: 4,
            require_strong_etag: false,
        }
    }

    #[tokio::test]
    async fn pins_size_and_serves_cached_blocks() {
        let remote = FakeRemote::new((0u8..=255).cycle().take(300).collect());
        let sub = HttpRangeSubstrate::open(&remote, options(128)).await.unwrap();
        assert_eq!(sub.size(), 300);
        assert_eq!(sub.etag(), Some("\"v1\""));

        let bytes = sub.read_range(0, 100, &Cancel::none()).await.unwrap();
        assert_eq!(bytes.len(), 100);
        // Block 0 was seeded by the probe: still exactly one request.
        assert_eq!(remote.requests.load(Ordering::SeqCst), 1);

        let tail = sub.read_range(250, 50, &Cancel::none()).await.unwrap();
        assert_eq!(tail.len(), 50);
        assert_eq!(tail[0], remote.data[250]);
    }

    #[tokio::test]
    async fn etag_change_fails_with_resource_changed() {
        let remote = FakeRemote::new(vec![7u8; 400]);
        let sub = HttpRangeSubstrate::open(&remote, options(128)).await.unwrap();
        *remote.etag.lock().unwrap() = "\"v2\"".to_string();
        let err = sub.read_range(300, 10, &Cancel::none()).await.unwrap_err();
        assert_eq!(err.code, Code::HttpResourceChanged);
        // Cached block 0 remains readable.
        let ok = sub.read_range(0, 10, &Cancel::none()).await.unwrap();
        assert_eq!(ok.len(), 10);
    }

    #[tokio::test]
    async fn bare_200_fails_with_range_unsupported() {
        let remote = FakeRemote::new(vec![1u8; 400]);
        // No strong etag → no If-Range header on follow-ups.
        *remote.etag.lock().unwrap() = "W/\"weak\"".to_string();
        let sub = HttpRangeSubstrate::open(&remote, options(128)).await.unwrap();
        *remote.honor_ranges.lock().unwrap() = false;
        let err = sub.read_range(300, 10, &Cancel::none()).await.unwrap_err();
        assert_eq!(err.code, Code::HttpRangeUnsupported);
    }

    #[tokio::test]
    async fn strong_etag_policy_refuses_weak_sessions() {
        let remote = FakeRemote::new(vec![1u8; 64]);
        *remote.etag.lock().unwrap() = "W/\"weak\"".to_string();
        let mut opts = options(128);
        opts.require_strong_etag = true;
        let err = HttpRangeSubstrate::open(&remote, opts).await.unwrap_err();
        assert_eq!(err.code, Code::HttpStrongEtagRequired);
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range("bytes 0-99/1000"), Some((0, 99, Some(1000))));
        assert_eq!(parse_content_range("bytes 5-9/*"), Some((5, 9, None)));
        assert_eq!(parse_content_range("chunks 0-1/2"), None);
    }
}
