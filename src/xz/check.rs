//! Integrity checks used by XZ blocks: CRC-32, CRC-64/XZ, SHA-256.

use sha2::{Digest, Sha256};

use super::CheckType;

/// CRC-64/XZ polynomial (reflected form of ECMA-182).
const CRC64_POLY: u64 = 0xC96C_5795_D787_0F42;

const fn build_crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC64_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC64_TABLE: [u64; 256] = build_crc64_table();

pub fn crc64(data: &[u8]) -> u64 {
    let mut crc = !0u64;
    for &byte in data {
        let index = ((crc ^ byte as u64) & 0xFF) as usize;
        crc = CRC64_TABLE[index] ^ (crc >> 8);
    }
    !crc
}

/// Stored size of the check field for every id, including reserved ones, so
/// compat mode can hop over checks it cannot verify.
pub fn check_field_size(id: u8) -> usize {
    match id {
        0 => 0,
        1..=3 => 4,
        4..=6 => 8,
        7..=9 => 16,
        10..=12 => 32,
        _ => 64,
    }
}

/// Running digest for one block, selected by the stream's check type.
pub enum BlockCheck {
    None,
    Crc32(crc32fast::Hasher),
    Crc64(u64),
    Sha256(Box<Sha256>),
}

impl BlockCheck {
    pub fn new(check: CheckType) -> Self {
        match check {
            CheckType::None => BlockCheck::None,
            CheckType::Crc32 => BlockCheck::Crc32(crc32fast::Hasher::new()),
            CheckType::Crc64 => BlockCheck::Crc64(!0u64),
            CheckType::Sha256 => BlockCheck::Sha256(Box::new(Sha256::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            BlockCheck::None => {}
            BlockCheck::Crc32(hasher) => hasher.update(data),
            BlockCheck::Crc64(crc) => {
                for &byte in data {
                    let index = ((*crc ^ byte as u64) & 0xFF) as usize;
                    *crc = CRC64_TABLE[index] ^ (*crc >> 8);
                }
            }
            BlockCheck::Sha256(digest) => digest.update(data),
        }
    }

    /// Does the stored check field match this digest? Field length must
    /// already equal `CheckType::size`.
    pub fn matches(self, stored: &[u8]) -> bool {
        match self {
            BlockCheck::None => stored.is_empty(),
            BlockCheck::Crc32(hasher) => stored == hasher.finalize().to_le_bytes(),
            BlockCheck::Crc64(crc) => stored == (!crc).to_le_bytes(),
            BlockCheck::Sha256(digest) => stored == digest.finalize().as_slice(),
        }
    }
}
