//! ustar emission with pax fallback for long names and oversized values.

use std::collections::BTreeMap;
use std::io::Write;

use crate::entry::EntryKind;
use crate::error::{ArchiveError, Code, Result};
use crate::tar::header::BLOCK;
use crate::tar::pax;

pub struct TarEntrySpec {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: i64,
    pub link_name: Option<String>,
}

fn io_err(e: std::io::Error) -> ArchiveError {
    ArchiveError::from_io(e, Code::ArchiveTruncated)
}

fn typeflag_for(kind: EntryKind) -> u8 {
    match kind {
        EntryKind::Directory => b'5',
        EntryKind::Symlink => b'2',
        EntryKind::Hardlink => b'1',
        EntryKind::Char => b'3',
        EntryKind::Block => b'4',
        EntryKind::Fifo => b'6',
        _ => b'0',
    }
}

/// Largest value an 11-digit octal field can hold.
const OCTAL11_MAX: u64 = 0o77777777777;
const NAME_FIELD: usize = 100;
const LINK_FIELD: usize = 100;

pub struct TarWriter<W: Write> {
    out: W,
    written: u64,
}

impl<W: Write> TarWriter<W> {
    pub fn new(out: W) -> Self {
        TarWriter { out, written: 0 }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes).map_err(io_err)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn write_padded(&mut self, payload: &[u8]) -> Result<()> {
        self.write(payload)?;
        let pad = (BLOCK - payload.len() % BLOCK) % BLOCK;
        if pad > 0 {
            self.write(&vec![0u8; pad])?;
        }
        Ok(())
    }

    fn header_block(
        name: &str,
        spec: &TarEntrySpec,
        size: u64,
        typeflag: u8,
        link: &str,
    ) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK];
        let name_bytes = name.as_bytes();
        block[..name_bytes.len().min(NAME_FIELD)]
            .copy_from_slice(&name_bytes[..name_bytes.len().min(NAME_FIELD)]);
        block[100..108].copy_from_slice(format!("{:07o}\0", spec.mode & 0o7777).as_bytes());
        block[108..116].copy_from_slice(format!("{:07o}\0", spec.uid.min(0o7777777)).as_bytes());
        block[116..124].copy_from_slice(format!("{:07o}\0", spec.gid.min(0o7777777)).as_bytes());
        block[124..136].copy_from_slice(format!("{:011o}\0", size.min(OCTAL11_MAX)).as_bytes());
        let mtime = spec.mtime.clamp(0, OCTAL11_MAX as i64) as u64;
        block[136..148].copy_from_slice(format!("{mtime:011o}\0").as_bytes());
        block[156] = typeflag;
        let link_bytes = link.as_bytes();
        block[157..157 + link_bytes.len().min(LINK_FIELD)]
            .copy_from_slice(&link_bytes[..link_bytes.len().min(LINK_FIELD)]);
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        let checksum = crate::tar::header::compute_checksum(&block);
        block[148..156].copy_from_slice(format!("{checksum:06o}\0 ").as_bytes());
        block
    }

    /// Emit one entry. Long names/links and oversized numerics spill into a
    /// pax `x` record ahead of the real header.
    pub fn add_entry(&mut self, spec: &TarEntrySpec, body: &[u8]) -> Result<()> {
        let size = body.len() as u64;
        let link = spec.link_name.as_deref().unwrap_or("");

        let mut pax_records: BTreeMap<String, String> = BTreeMap::new();
        if spec.name.len() > NAME_FIELD {
            pax_records.insert("path".to_string(), spec.name.clone());
        }
        if link.len() > LINK_FIELD {
            pax_records.insert("linkpath".to_string(), link.to_string());
        }
        if size > OCTAL11_MAX {
            pax_records.insert("size".to_string(), size.to_string());
        }

        if !pax_records.is_empty() {
            let payload = pax::encode(&pax_records);
            let pax_spec = TarEntrySpec {
                name: "./PaxHeaders/".to_string()
                    + spec.name.rsplit('/').find(|s| !s.is_empty()).unwrap_or("entry"),
                kind: EntryKind::File,
                mode: 0o644,
                uid: 0,
                gid: 0,
                mtime: spec.mtime,
                link_name: None,
            };
            let header = Self::header_block(
                &pax_spec.name,
                &pax_spec,
                payload.len() as u64,
                b'x',
                "",
            );
            self.write(&header)?;
            self.write_padded(&payload)?;
        }

        let header = Self::header_block(
            &truncate_name(&spec.name),
            spec,
            size,
            typeflag_for(spec.kind),
            &truncate_link(link),
        );
        self.write(&header)?;
        if !body.is_empty() {
            self.write_padded(body)?;
        }
        Ok(())
    }

    /// Two zero blocks close the archive.
    pub fn finish(mut self) -> Result<u64> {
        self.write(&[0u8; BLOCK])?;
        self.write(&[0u8; BLOCK])?;
        self.out.flush().map_err(io_err)?;
        Ok(self.written)
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() <= NAME_FIELD {
        name.to_string()
    } else {
        // The pax record carries the real path; the header holds a stub.
        name.chars().take(NAME_FIELD).collect()
    }
}

fn truncate_link(link: &str) -> String {
    if link.len() <= LINK_FIELD {
        link.to_string()
    } else {
        link.chars().take(LINK_FIELD).collect()
    }
}
