mod common;

use common::{ZipEntryFixture, build_zip};
use shuck::{Code, OpenOptions, Profile, Severity, open_archive};

#[tokio::test(flavor = "multi_thread")]
async fn lists_and_reads_entries() -> anyhow::Result<()> {
    let image = build_zip(&[
        ZipEntryFixture::stored("docs/", b""),
        ZipEntryFixture::deflated("docs/guide.md", b"# guide\n\nthe content repeats repeats repeats"),
        ZipEntryFixture::stored("bin.dat", &[0u8, 1, 2, 3, 255]),
    ]);
    let archive = open_archive(image, OpenOptions::default()).await?;

    let names: Vec<&str> = archive.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["docs/", "docs/guide.md", "bin.dat"]);
    assert!(archive.entries()[0].is_dir());

    let body = archive.read_entry(&archive.entries()[1]).await?;
    assert_eq!(&body[..], &b"# guide\n\nthe content repeats repeats repeats"[..]);
    let report = archive.audit().await?;
    assert!(report.ok, "clean archive should audit ok: {}", report.to_json());
    archive.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn case_collision_warns_in_strict() -> anyhow::Result<()> {
    let image = build_zip(&[
        ZipEntryFixture::stored("README.md", b"upper"),
        ZipEntryFixture::stored("readme.md", b"lower"),
    ]);
    let archive = open_archive(image, OpenOptions::with_profile(Profile::Strict)).await?;
    let report = archive.audit().await?;
    assert!(report.ok, "case collisions warn in strict");
    let collisions: Vec<_> = report
        .issues
        .iter()
        .filter(|i| i.code == Code::ZipCaseCollision)
        .collect();
    assert_eq!(collisions.len(), 1);
    assert_eq!(collisions[0].severity, Severity::Warning);
    assert_eq!(collisions[0].details["collisionKind"], "casefold");

    // Agent promotes the same finding to a failure.
    let image = build_zip(&[
        ZipEntryFixture::stored("README.md", b"upper"),
        ZipEntryFixture::stored("readme.md", b"lower"),
    ]);
    let agent = open_archive(image, OpenOptions::with_profile(Profile::Agent)).await?;
    let report = agent.audit().await?;
    assert!(!report.ok);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn crc_mismatch_surfaces_at_stream_end() -> anyhow::Result<()> {
    let mut fixture = ZipEntryFixture::deflated("data.bin", &vec![7u8; 1024]);
    fixture.crc_override = Some(0x1234_5678);
    let image = build_zip(&[fixture]);
    let archive = open_archive(image, OpenOptions::default()).await?;

    // The entry lists fine; only streaming to completion trips the check.
    assert_eq!(archive.entries().len(), 1);
    let err = archive.read_entry(&archive.entries()[0]).await.unwrap_err();
    assert_eq!(err.code, Code::ZipBadCrc);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_central_directory_is_rejected() {
    let image = build_zip(&[ZipEntryFixture::stored("a.txt", b"abc")]);
    // Cut into the central directory: EOCD now points past the end.
    let cut = &image[..image.len() - 30];
    let err = open_archive(cut.to_vec(), OpenOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.code,
            Code::ZipEocdNotFound | Code::ZipBadEocd | Code::ArchiveTruncated
        ),
        "unexpected code {:?}",
        err.code
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn traversal_names_are_audit_errors_not_parse_errors() -> anyhow::Result<()> {
    let image = build_zip(&[ZipEntryFixture::stored("../../etc/shadow", b"oops")]);
    let archive = open_archive(image, OpenOptions::default()).await?;
    // The entry is still listed; audit is where the verdict lands.
    assert_eq!(archive.entries()[0].name, "../../etc/shadow");
    let report = archive.audit().await?;
    assert!(!report.ok);
    assert!(
        report
            .issues
            .iter()
            .any(|i| i.code == Code::ArchivePathTraversal && i.severity == Severity::Error)
    );
    let err = report.assert_safe().unwrap_err();
    assert_eq!(err.code, Code::ArchiveAuditFailed);
    assert!(err.report().is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn multiple_eocd_signatures_flagged() -> anyhow::Result<()> {
    let mut image = build_zip(&[ZipEntryFixture::stored("x", b"1")]);
    // Append a second, fully valid empty-archive EOCD; the last one wins.
    let mut fake = Vec::new();
    fake.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06]);
    fake.extend_from_slice(&[0u8; 16]);
    fake.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&fake);

    let archive = open_archive(image, OpenOptions::default()).await?;
    // The trailing empty EOCD was selected: zero entries.
    assert!(archive.entries().is_empty());
    let report = archive.audit().await?;
    assert!(
        report
            .issues
            .iter()
            .any(|i| i.code == Code::ZipMultipleEocd && i.severity == Severity::Error),
        "strict promotes multiple EOCDs to an error: {}",
        report.to_json()
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn eocd_with_comment_is_found() -> anyhow::Result<()> {
    let mut image = build_zip(&[ZipEntryFixture::stored("c.txt", b"body")]);
    let comment = b"release artifact, do not edit";
    let at = image.len() - 2;
    image[at..].copy_from_slice(&(comment.len() as u16).to_le_bytes());
    image.extend_from_slice(comment);

    let archive = open_archive(image, OpenOptions::default()).await?;
    assert_eq!(archive.entries().len(), 1);
    let report = archive.audit().await?;
    assert!(report.ok, "{}", report.to_json());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn zip64_eocd_locator_path() -> anyhow::Result<()> {
    // Hand-build: [local header + body][central directory][ZIP64 EOCD]
    // [ZIP64 locator][EOCD with sentinel fields].
    let name = b"wide.bin";
    let body = b"small body, wide bookkeeping";
    let crc = crc32fast::hash(body);

    let mut image = Vec::new();
    image.extend_from_slice(&[0x50, 0x4B, 0x03, 0x04]);
    image.extend_from_slice(&20u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes()); // store
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0x21u16.to_le_bytes());
    image.extend_from_slice(&crc.to_le_bytes());
    image.extend_from_slice(&(body.len() as u32).to_le_bytes());
    image.extend_from_slice(&(body.len() as u32).to_le_bytes());
    image.extend_from_slice(&(name.len() as u16).to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(name);
    image.extend_from_slice(body);

    let cd_offset = image.len() as u64;
    image.extend_from_slice(&[0x50, 0x4B, 0x01, 0x02]);
    image.extend_from_slice(&20u16.to_le_bytes());
    image.extend_from_slice(&20u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0x21u16.to_le_bytes());
    image.extend_from_slice(&crc.to_le_bytes());
    image.extend_from_slice(&(body.len() as u32).to_le_bytes());
    image.extend_from_slice(&(body.len() as u32).to_le_bytes());
    image.extend_from_slice(&(name.len() as u16).to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes()); // local header offset
    image.extend_from_slice(name);
    let cd_size = image.len() as u64 - cd_offset;

    let zip64_eocd_offset = image.len() as u64;
    image.extend_from_slice(&[0x50, 0x4B, 0x06, 0x06]);
    image.extend_from_slice(&44u64.to_le_bytes());
    image.extend_from_slice(&45u16.to_le_bytes());
    image.extend_from_slice(&45u16.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&1u64.to_le_bytes());
    image.extend_from_slice(&1u64.to_le_bytes());
    image.extend_from_slice(&cd_size.to_le_bytes());
    image.extend_from_slice(&cd_offset.to_le_bytes());

    image.extend_from_slice(&[0x50, 0x4B, 0x06, 0x07]);
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&zip64_eocd_offset.to_le_bytes());
    image.extend_from_slice(&1u32.to_le_bytes());

    image.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06]);
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0xFFFFu16.to_le_bytes());
    image.extend_from_slice(&0xFFFFu16.to_le_bytes());
    image.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    image.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());

    let archive = open_archive(image, OpenOptions::default()).await?;
    assert_eq!(archive.entries().len(), 1);
    assert_eq!(archive.entries()[0].name, "wide.bin");
    let read = archive.read_entry(&archive.entries()[0]).await?;
    assert_eq!(&read[..], body);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_token_stops_open() {
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let image = build_zip(&[ZipEntryFixture::stored("a", b"a")]);
    let mut options = OpenOptions::default();
    options.cancel = Some(token);
    let err = open_archive(image, options).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_and_deflated_bodies_round_trip() -> anyhow::Result<()> {
    let blob: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
    let image = build_zip(&[
        ZipEntryFixture::stored("raw.bin", &blob),
        ZipEntryFixture::deflated("packed.bin", &blob),
    ]);
    let archive = open_archive(image, OpenOptions::default()).await?;
    for entry in archive.entries() {
        let body = archive.read_entry(entry).await?;
        assert_eq!(&body[..], &blob[..], "{} mismatched", entry.name);
    }
    Ok(())
}
