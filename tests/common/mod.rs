//! Fixture builders shared by the integration tests: hand-assembled ZIP and
//! TAR images, with flate2 as the reference compressor.
#![allow(dead_code)]

use std::io::Write;

pub const METHOD_STORE: u16 = 0;
pub const METHOD_DEFLATE: u16 = 8;

pub struct ZipEntryFixture {
    pub name: &'static str,
    pub data: Vec<u8>,
    pub method: u16,
    /// Override the stored CRC (to fabricate corrupt entries).
    pub crc_override: Option<u32>,
}

impl ZipEntryFixture {
    pub fn stored(name: &'static str, data: &[u8]) -> Self {
        ZipEntryFixture {
            name,
            data: data.to_vec(),
            method: METHOD_STORE,
            crc_override: None,
        }
    }

    pub fn deflated(name: &'static str, data: &[u8]) -> Self {
        ZipEntryFixture {
            name,
            data: data.to_vec(),
            method: METHOD_DEFLATE,
            crc_override: None,
        }
    }
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Assemble a ZIP image: local headers, bodies, central directory, EOCD.
pub fn build_zip(entries: &[ZipEntryFixture]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cd = Vec::new();
    let mut count = 0u16;

    for fixture in entries {
        let offset = out.len() as u32;
        let crc = fixture
            .crc_override
            .unwrap_or_else(|| crc32fast::hash(&fixture.data));
        let body = match fixture.method {
            METHOD_DEFLATE => deflate(&fixture.data),
            _ => fixture.data.clone(),
        };
        let name = fixture.name.as_bytes();

        // Local header.
        out.extend_from_slice(&[0x50, 0x4B, 0x03, 0x04]);
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&fixture.method.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // time
        out.extend_from_slice(&0x21u16.to_le_bytes()); // date 1980-01-01
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(fixture.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // extra len
        out.extend_from_slice(name);
        out.extend_from_slice(&body);

        // Central directory record.
        cd.extend_from_slice(&[0x50, 0x4B, 0x01, 0x02]);
        cd.extend_from_slice(&20u16.to_le_bytes()); // made by
        cd.extend_from_slice(&20u16.to_le_bytes()); // needed
        cd.extend_from_slice(&0u16.to_le_bytes()); // flags
        cd.extend_from_slice(&fixture.method.to_le_bytes());
        cd.extend_from_slice(&0u16.to_le_bytes());
        cd.extend_from_slice(&0x21u16.to_le_bytes());
        cd.extend_from_slice(&crc.to_le_bytes());
        cd.extend_from_slice(&(body.len() as u32).to_le_bytes());
        cd.extend_from_slice(&(fixture.data.len() as u32).to_le_bytes());
        cd.extend_from_slice(&(name.len() as u16).to_le_bytes());
        cd.extend_from_slice(&0u16.to_le_bytes()); // extra
        cd.extend_from_slice(&0u16.to_le_bytes()); // comment
        cd.extend_from_slice(&0u16.to_le_bytes()); // disk
        cd.extend_from_slice(&0u16.to_le_bytes()); // internal
        let external: u32 = if fixture.name.ends_with('/') { 0x10 } else { 0 };
        cd.extend_from_slice(&external.to_le_bytes());
        cd.extend_from_slice(&offset.to_le_bytes());
        cd.extend_from_slice(name);
        count += 1;
    }

    let cd_offset = out.len() as u32;
    out.extend_from_slice(&cd);

    out.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06]);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&(cd.len() as u32).to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

const TAR_BLOCK: usize = 512;

fn tar_checksum(block: &[u8]) -> u64 {
    block
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            if (148..156).contains(&i) {
                u64::from(b' ')
            } else {
                u64::from(b)
            }
        })
        .sum()
}

pub fn tar_header(name: &str, size: u64, typeflag: u8, link: &str) -> Vec<u8> {
    let mut block = vec![0u8; TAR_BLOCK];
    block[..name.len()].copy_from_slice(name.as_bytes());
    block[100..108].copy_from_slice(b"0000644\0");
    block[108..116].copy_from_slice(b"0000000\0");
    block[116..124].copy_from_slice(b"0000000\0");
    block[124..136].copy_from_slice(format!("{size:011o}\0").as_bytes());
    block[136..148].copy_from_slice(b"00000000000\0");
    block[156] = typeflag;
    block[157..157 + link.len()].copy_from_slice(link.as_bytes());
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    let checksum = tar_checksum(&block);
    block[148..156].copy_from_slice(format!("{checksum:06o}\0 ").as_bytes());
    block
}

fn pad_to_block(out: &mut Vec<u8>) {
    while out.len() % TAR_BLOCK != 0 {
        out.push(0);
    }
}

/// Assemble a TAR image from (name, data, typeflag, linkname) tuples.
pub fn build_tar(entries: &[(&str, &[u8], u8, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for &(name, data, typeflag, link) in entries {
        out.extend_from_slice(&tar_header(name, data.len() as u64, typeflag, link));
        out.extend_from_slice(data);
        pad_to_block(&mut out);
    }
    out.extend_from_slice(&[0u8; TAR_BLOCK]);
    out.extend_from_slice(&[0u8; TAR_BLOCK]);
    out
}

/// A pax `x` record followed by its subject entry.
pub fn pax_then_entry(pax_records: &[(&str, &str)], name: &str, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    for &(key, value) in pax_records {
        let body_len = 1 + key.len() + 1 + value.len() + 1;
        let mut total = body_len + 1;
        loop {
            let digits = total.to_string().len();
            if body_len + digits == total {
                break;
            }
            total = body_len + digits;
        }
        payload.extend_from_slice(format!("{total} {key}={value}\n").as_bytes());
    }
    let mut out = Vec::new();
    out.extend_from_slice(&tar_header("pax-meta", payload.len() as u64, b'x', ""));
    out.extend_from_slice(&payload);
    pad_to_block(&mut out);
    out.extend_from_slice(&tar_header(name, data.len() as u64, b'0', ""));
    out.extend_from_slice(data);
    pad_to_block(&mut out);
    out
}

pub fn gzip_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}
