//! Local-file substrate using positioned reads off the blocking pool.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::Substrate;
use crate::cancel::Cancel;
use crate::error::{ArchiveError, Code, Result};

pub struct FileSubstrate {
    file: Arc<File>,
    size: u64,
}

impl FileSubstrate {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let (file, size) = tokio::task::spawn_blocking(move || -> std::io::Result<(File, u64)> {
            let file = File::open(&path)?;
            let size = file.metadata()?.len();
            Ok((file, size))
        })
        .await
        .map_err(|e| ArchiveError::new(Code::ArchiveTruncated, format!("blocking task failed: {e}")))?
        .map_err(|e| {
            ArchiveError::new(Code::ArchiveUnsupportedFormat, format!("cannot open input: {e}"))
                .with_source(e)
        })?;
        Ok(FileSubstrate {
            file: Arc::new(file),
            size,
        })
    }

    pub fn from_file(file: File) -> Result<Self> {
        let size = file
            .metadata()
            .map_err(|e| ArchiveError::from_io(e, Code::ArchiveUnsupportedFormat))?
            .len();
        Ok(FileSubstrate {
            file: Arc::new(file),
            size,
        })
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[async_trait]
impl Substrate for FileSubstrate {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, len: u64, cancel: &Cancel) -> Result<Bytes> {
        cancel.check()?;
        if offset > self.size {
            return Err(ArchiveError::new(
                Code::ArchiveTruncated,
                format!("read at {offset} past end of {}-byte file", self.size),
            )
            .with_offset(offset));
        }
        let len = len.min(self.size - offset) as usize;
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || -> std::io::Result<Bytes> {
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                match read_at(&file, &mut buf[filled..], offset + filled as u64)? {
                    0 => break,
                    n => filled += n,
                }
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| ArchiveError::new(Code::ArchiveTruncated, format!("blocking task failed: {e}")))?
        .map_err(|e| ArchiveError::from_io(e, Code::ArchiveTruncated).with_offset(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_ranges_from_disk() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"file substrate contents").unwrap();
        let sub = FileSubstrate::open(tmp.path()).await.unwrap();
        assert_eq!(sub.size(), 23);
        let bytes = sub.read_range(5, 9, &Cancel::none()).await.unwrap();
        assert_eq!(&bytes[..], b"substrate");
        let clamped = sub.read_range(18, 100, &Cancel::none()).await.unwrap();
        assert_eq!(&clamped[..], b"tents");
    }
}
