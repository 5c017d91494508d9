//! The normalized entry record every container reader produces.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// What an entry is, across both container families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
    /// TAR pax `g` record (metadata for all subsequent entries).
    PaxGlobal,
    /// TAR pax `x` record (metadata for the next entry).
    PaxEntry,
    Unknown,
}

/// ZIP encryption scheme detected from flags and extra fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encryption {
    #[default]
    None,
    /// Legacy PKWARE stream cipher (flag bit 0 without an AES extra field).
    ZipCrypto,
    /// WinZip AES (method 99 + extra field 0x9901).
    Aes {
        strength: AesStrength,
        vendor: u16,
        /// The real compression method hidden behind method 99.
        actual_method: u16,
    },
    /// "Strong encryption" (flag bit 6); never supported.
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesStrength {
    Aes128,
    Aes192,
    Aes256,
}

impl AesStrength {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AesStrength::Aes128),
            2 => Some(AesStrength::Aes192),
            3 => Some(AesStrength::Aes256),
            _ => None,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            AesStrength::Aes128 => 16,
            AesStrength::Aes192 => 24,
            AesStrength::Aes256 => 32,
        }
    }

    /// Salt length is half the key length in the WinZip scheme.
    pub fn salt_len(self) -> usize {
        self.key_len() / 2
    }
}

/// One archive member with validated metadata.
///
/// Entries are by-value records: they carry no borrow of the reader that
/// produced them and stay usable after the reader is closed.
#[derive(Debug, Clone)]
pub struct Entry {
    /// POSIX path as stored (readers validate, the normalizer rewrites).
    pub name: String,
    /// Uncompressed size in bytes. Always zero for directories.
    pub size: u64,
    pub kind: EntryKind,
    pub mtime: Option<DateTime<Utc>>,
    /// Unix permission bits (9 bits), when the container recorded them.
    pub mode: Option<u32>,
    pub uid: Option<u64>,
    pub gid: Option<u64>,
    /// Target of a symlink or hardlink.
    pub link_name: Option<String>,
    pub comment: Option<String>,
    /// Raw pax key→value records attached to this entry (TAR only).
    pub pax: BTreeMap<String, String>,

    // Reader-private plumbing. Offsets are into the substrate for ZIP and
    // into the (decompressed) stream for TAR.
    pub(crate) raw_name: Vec<u8>,
    pub(crate) extra: Vec<(u16, Vec<u8>)>,
    pub(crate) local_header_offset: u64,
    pub(crate) payload_offset: u64,
    pub(crate) compressed_size: u64,
    pub(crate) method: u16,
    pub(crate) crc32: u32,
    pub(crate) flags: u16,
    pub(crate) cd_extra_len: u16,
    pub(crate) external_attrs: u32,
    pub(crate) encryption: Encryption,
}

impl Entry {
    pub(crate) fn new(name: String, size: u64, kind: EntryKind) -> Self {
        Entry {
            raw_name: name.as_bytes().to_vec(),
            name,
            size,
            kind,
            mtime: None,
            mode: None,
            uid: None,
            gid: None,
            link_name: None,
            comment: None,
            pax: BTreeMap::new(),
            extra: Vec::new(),
            local_header_offset: 0,
            payload_offset: 0,
            compressed_size: 0,
            method: 0,
            crc32: 0,
            flags: 0,
            cd_extra_len: 0,
            external_attrs: 0,
            encryption: Encryption::None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption != Encryption::None
    }

    /// ZIP compression method id (0 for TAR/gzip entries).
    pub fn method(&self) -> u16 {
        self.method
    }

    /// Stored compressed size (equals `size` for stored/TAR entries).
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Stored CRC-32 of the uncompressed body (ZIP and gzip).
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// The name bytes exactly as stored in the container.
    pub fn raw_name(&self) -> &[u8] {
        &self.raw_name
    }
}
