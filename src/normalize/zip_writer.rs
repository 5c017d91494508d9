//! Low-level ZIP emission: local headers, central directory, EOCD, with
//! automatic ZIP64 when any size or offset outgrows 32 bits.

use std::io::Write;

use crate::error::{ArchiveError, Code, Result};
use crate::zip::eocd::{EOCD_SIG, ZIP64_EOCD_SIG, ZIP64_LOCATOR_SIG};
use crate::zip::{LOCAL_SIG, central, extra};

/// Everything needed to emit one entry whose body is already spooled.
pub struct EntrySpec {
    pub name: String,
    pub method: u16,
    pub crc32: u32,
    pub uncompressed_size: u64,
    pub dos_time: u16,
    pub dos_date: u16,
    pub external_attrs: u32,
}

struct CdRecord {
    spec: EntrySpec,
    compressed_size: u64,
    local_header_offset: u64,
}

fn name_flags(name: &str) -> u16 {
    if name.is_ascii() {
        0
    } else {
        central::flags::UTF8_NAME
    }
}

const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;

pub struct ZipWriter<W: Write> {
    out: W,
    offset: u64,
    records: Vec<CdRecord>,
}

fn io_err(e: std::io::Error) -> ArchiveError {
    ArchiveError::from_io(e, Code::ArchiveTruncated)
}

impl<W: Write> ZipWriter<W> {
    pub fn new(out: W) -> Self {
        ZipWriter {
            out,
            offset: 0,
            records: Vec::new(),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes).map_err(io_err)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Emit local header + body for one entry.
    pub fn add_entry(&mut self, spec: EntrySpec, body: &[u8]) -> Result<()> {
        let local_header_offset = self.offset;
        let compressed_size = body.len() as u64;
        let zip64 = compressed_size >= u64::from(extra::SENTINEL32)
            || spec.uncompressed_size >= u64::from(extra::SENTINEL32);

        let mut extra_field = Vec::new();
        if zip64 {
            extra_field.extend_from_slice(&extra::TAG_ZIP64.to_le_bytes());
            extra_field.extend_from_slice(&16u16.to_le_bytes());
            extra_field.extend_from_slice(&spec.uncompressed_size.to_le_bytes());
            extra_field.extend_from_slice(&compressed_size.to_le_bytes());
        }

        let mut header = Vec::with_capacity(30 + spec.name.len() + extra_field.len());
        header.extend_from_slice(&LOCAL_SIG);
        header.extend_from_slice(
            &if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT }.to_le_bytes(),
        );
        header.extend_from_slice(&name_flags(&spec.name).to_le_bytes());
        header.extend_from_slice(&spec.method.to_le_bytes());
        header.extend_from_slice(&spec.dos_time.to_le_bytes());
        header.extend_from_slice(&spec.dos_date.to_le_bytes());
        header.extend_from_slice(&spec.crc32.to_le_bytes());
        if zip64 {
            header.extend_from_slice(&extra::SENTINEL32.to_le_bytes());
            header.extend_from_slice(&extra::SENTINEL32.to_le_bytes());
        } else {
            header.extend_from_slice(&(compressed_size as u32).to_le_bytes());
            header.extend_from_slice(&(spec.uncompressed_size as u32).to_le_bytes());
        }
        header.extend_from_slice(&(spec.name.len() as u16).to_le_bytes());
        header.extend_from_slice(&(extra_field.len() as u16).to_le_bytes());
        header.extend_from_slice(spec.name.as_bytes());
        header.extend_from_slice(&extra_field);
        self.write(&header)?;
        self.write(body)?;

        self.records.push(CdRecord {
            spec,
            compressed_size,
            local_header_offset,
        });
        Ok(())
    }

    /// Emit the central directory, ZIP64 structures when required, and the
    /// EOCD. Returns total bytes written.
    pub fn finish(mut self, comment: &[u8]) -> Result<u64> {
        let cd_offset = self.offset;
        let mut any_zip64 = false;

        let records = std::mem::take(&mut self.records);
        for record in &records {
            let zip64_sizes = record.compressed_size >= u64::from(extra::SENTINEL32)
                || record.spec.uncompressed_size >= u64::from(extra::SENTINEL32);
            let zip64_offset = record.local_header_offset >= u64::from(extra::SENTINEL32);
            any_zip64 |= zip64_sizes || zip64_offset;

            let mut extra_field = Vec::new();
            if zip64_sizes || zip64_offset {
                let mut payload = Vec::new();
                if zip64_sizes {
                    payload.extend_from_slice(&record.spec.uncompressed_size.to_le_bytes());
                    payload.extend_from_slice(&record.compressed_size.to_le_bytes());
                }
                if zip64_offset {
                    payload.extend_from_slice(&record.local_header_offset.to_le_bytes());
                }
                extra_field.extend_from_slice(&extra::TAG_ZIP64.to_le_bytes());
                extra_field.extend_from_slice(&(payload.len() as u16).to_le_bytes());
                extra_field.extend_from_slice(&payload);
            }

            let mut rec = Vec::with_capacity(46 + record.spec.name.len() + extra_field.len());
            rec.extend_from_slice(&central::CDFH_SIG);
            // Version made by: unix, matching the attrs we synthesize.
            rec.extend_from_slice(&(0x0300 | u16::from(VERSION_ZIP64 as u8)).to_le_bytes());
            rec.extend_from_slice(
                &if zip64_sizes || zip64_offset {
                    VERSION_ZIP64
                } else {
                    VERSION_DEFAULT
                }
                .to_le_bytes(),
            );
            rec.extend_from_slice(&name_flags(&record.spec.name).to_le_bytes());
            rec.extend_from_slice(&record.spec.method.to_le_bytes());
            rec.extend_from_slice(&record.spec.dos_time.to_le_bytes());
            rec.extend_from_slice(&record.spec.dos_date.to_le_bytes());
            rec.extend_from_slice(&record.spec.crc32.to_le_bytes());
            if zip64_sizes {
                rec.extend_from_slice(&extra::SENTINEL32.to_le_bytes());
                rec.extend_from_slice(&extra::SENTINEL32.to_le_bytes());
            } else {
                rec.extend_from_slice(&(record.compressed_size as u32).to_le_bytes());
                rec.extend_from_slice(&(record.spec.uncompressed_size as u32).to_le_bytes());
            }
            rec.extend_from_slice(&(record.spec.name.len() as u16).to_le_bytes());
            rec.extend_from_slice(&(extra_field.len() as u16).to_le_bytes());
            rec.extend_from_slice(&0u16.to_le_bytes()); // comment len
            rec.extend_from_slice(&0u16.to_le_bytes()); // disk start
            rec.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            rec.extend_from_slice(&record.spec.external_attrs.to_le_bytes());
            if zip64_offset {
                rec.extend_from_slice(&extra::SENTINEL32.to_le_bytes());
            } else {
                rec.extend_from_slice(&(record.local_header_offset as u32).to_le_bytes());
            }
            rec.extend_from_slice(record.spec.name.as_bytes());
            rec.extend_from_slice(&extra_field);
            self.write(&rec)?;
        }

        let cd_size = self.offset - cd_offset;
        let needs_zip64_eocd = any_zip64
            || records.len() > usize::from(extra::SENTINEL16)
            || cd_offset >= u64::from(extra::SENTINEL32)
            || cd_size >= u64::from(extra::SENTINEL32);

        if needs_zip64_eocd {
            let zip64_eocd_offset = self.offset;
            let mut rec = Vec::with_capacity(56);
            rec.extend_from_slice(&ZIP64_EOCD_SIG);
            rec.extend_from_slice(&44u64.to_le_bytes()); // size of remainder
            rec.extend_from_slice(&(0x0300 | u16::from(VERSION_ZIP64 as u8)).to_le_bytes());
            rec.extend_from_slice(&VERSION_ZIP64.to_le_bytes());
            rec.extend_from_slice(&0u32.to_le_bytes()); // this disk
            rec.extend_from_slice(&0u32.to_le_bytes()); // cd disk
            rec.extend_from_slice(&(records.len() as u64).to_le_bytes());
            rec.extend_from_slice(&(records.len() as u64).to_le_bytes());
            rec.extend_from_slice(&cd_size.to_le_bytes());
            rec.extend_from_slice(&cd_offset.to_le_bytes());
            self.write(&rec)?;

            let mut locator = Vec::with_capacity(20);
            locator.extend_from_slice(&ZIP64_LOCATOR_SIG);
            locator.extend_from_slice(&0u32.to_le_bytes());
            locator.extend_from_slice(&zip64_eocd_offset.to_le_bytes());
            locator.extend_from_slice(&1u32.to_le_bytes());
            self.write(&locator)?;
        }

        let clamp16 = |v: usize| -> u16 { v.min(usize::from(extra::SENTINEL16)) as u16 };
        let clamp32 = |v: u64| -> u32 {
            if v >= u64::from(extra::SENTINEL32) {
                extra::SENTINEL32
            } else {
                v as u32
            }
        };
        let entries16 = if records.len() >= usize::from(extra::SENTINEL16) && needs_zip64_eocd {
            extra::SENTINEL16
        } else {
            clamp16(records.len())
        };

        let mut eocd_rec = Vec::with_capacity(22 + comment.len());
        eocd_rec.extend_from_slice(&EOCD_SIG);
        eocd_rec.extend_from_slice(&0u16.to_le_bytes());
        eocd_rec.extend_from_slice(&0u16.to_le_bytes());
        eocd_rec.extend_from_slice(&entries16.to_le_bytes());
        eocd_rec.extend_from_slice(&entries16.to_le_bytes());
        eocd_rec.extend_from_slice(
            &if needs_zip64_eocd && cd_size >= u64::from(extra::SENTINEL32) {
                extra::SENTINEL32
            } else {
                clamp32(cd_size)
            }
            .to_le_bytes(),
        );
        eocd_rec.extend_from_slice(
            &if needs_zip64_eocd {
                extra::SENTINEL32
            } else {
                clamp32(cd_offset)
            }
            .to_le_bytes(),
        );
        eocd_rec.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        eocd_rec.extend_from_slice(comment);
        self.write(&eocd_rec)?;

        self.out.flush().map_err(io_err)?;
        Ok(self.offset)
    }
}
