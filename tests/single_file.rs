mod common;

use common::gzip_compress;
use shuck::{Code, Format, OpenOptions, Profile, open_archive};

#[tokio::test(flavor = "multi_thread")]
async fn bare_gzip_member_is_a_single_file_archive() -> anyhow::Result<()> {
    let image = gzip_compress(b"just one payload");
    let mut options = OpenOptions::default();
    options.filename = Some("notes.txt.gz".to_string());
    let archive = open_archive(image, options).await?;
    assert_eq!(archive.format(), Format::Gzip);
    // No FNAME was written, so the member takes the fallback name.
    assert_eq!(archive.entries()[0].name, "data");
    let body = archive.read_entry(&archive.entries()[0]).await?;
    assert_eq!(&body[..], b"just one payload");
    let report = archive.audit().await?;
    assert!(report.ok);
    Ok(())
}

/// Minimal XZ image: stream header + one block header declaring an LZMA2
/// dictionary via `props`, enough for pre-flight to weigh it.
fn xz_with_dict_props(props: u8) -> Vec<u8> {
    let mut out = Vec::new();
    let flags = [0u8, 0x00];
    out.extend_from_slice(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]);
    out.extend_from_slice(&flags);
    out.extend_from_slice(&crc32fast::hash(&flags).to_le_bytes());
    let mut block = vec![0x02, 0x00, 0x21, 0x01, props, 0, 0, 0];
    let crc = crc32fast::hash(&block);
    block.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&block);
    // No payload needed: pre-flight must reject before decoding anything.
    out.extend_from_slice(&[0u8; 64]);
    out
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_profile_rejects_oversized_xz_dictionary_at_open() {
    // props 32 → 256 MiB declared dictionary; agent caps at 32 MiB.
    let image = xz_with_dict_props(32);
    let err = open_archive(image, OpenOptions::with_profile(Profile::Agent))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::CompressionResourceLimit);
}

#[tokio::test(flavor = "multi_thread")]
async fn strict_profile_accepts_modest_xz_dictionary_at_open() -> anyhow::Result<()> {
    let image = xz_with_dict_props(0);
    let archive = open_archive(image, OpenOptions::with_profile(Profile::Strict)).await?;
    assert_eq!(archive.format(), Format::Xz);
    // Pre-flight could not finish (no index in the fixture): the audit
    // carries the incomplete-scan note rather than failing.
    let report = archive.audit().await?;
    assert!(
        report
            .issues
            .iter()
            .any(|i| i.code == Code::CompressionResourcePreflightIncomplete)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bzip2_block_class_checked_before_decode() {
    let mut limits = Profile::Strict.default_limits();
    limits.max_bzip2_block_size = 1;
    // A BZh9 header with garbage behind it: pre-flight must trip first.
    let mut image = b"BZh9".to_vec();
    image.extend_from_slice(&[0x31, 0x41, 0x59, 0x26, 0x53, 0x59, 0, 0, 0, 0]);
    let mut options = OpenOptions::default();
    options.limits = Some(limits);
    let err = open_archive(image, options).await.unwrap_err();
    assert_eq!(err.code, Code::CompressionResourceLimit);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_bytes_are_rejected() {
    let err = open_archive(vec![0u8; 100], OpenOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ArchiveUnsupportedFormat);
}

#[tokio::test(flavor = "multi_thread")]
async fn gzip_member_with_fname_uses_sanitized_name() -> anyhow::Result<()> {
    use std::io::Write;
    let mut encoder = flate2::GzBuilder::new()
        .filename("../../evil.sh")
        .write(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"#!/bin/sh").unwrap();
    let image = encoder.finish().unwrap();

    let archive = open_archive(image, OpenOptions::default()).await?;
    // Directory components are dropped, traversal neutralized.
    assert_eq!(archive.entries()[0].name, "evil.sh");
    Ok(())
}
