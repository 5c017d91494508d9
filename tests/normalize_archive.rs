mod common;

use common::{ZipEntryFixture, build_tar, build_zip};
use shuck::{
    Code, ConflictPolicy, EntryKind, NormalizeMode, NormalizeOptions, OpenOptions, Profile,
    open_archive,
};

#[tokio::test(flavor = "multi_thread")]
async fn rename_policy_resolves_case_collisions() -> anyhow::Result<()> {
    let image = build_zip(&[
        ZipEntryFixture::stored("README.md", b"upper body"),
        ZipEntryFixture::stored("readme.md", b"lower body"),
    ]);
    let archive = open_archive(image, OpenOptions::with_profile(Profile::Strict)).await?;

    let mut out = Vec::new();
    let mut options = NormalizeOptions::default();
    options.on_case_collision = ConflictPolicy::Rename;
    let report = archive.normalize_to(&mut out, &options).await?;
    assert_eq!(report.renamed_entries, 1);
    assert_eq!(report.output_entries, 2);
    assert!(report.ok);

    let normalized = open_archive(out, OpenOptions::default()).await?;
    let names: Vec<&str> = normalized.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["README.md", "readme~1.md"]);
    // Bodies survive the rename untouched.
    assert_eq!(
        &normalized.read_entry(&normalized.entries()[0]).await?[..],
        b"upper body"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_default_policy_fails_normalization() -> anyhow::Result<()> {
    let image = build_zip(&[
        ZipEntryFixture::stored("same.txt", b"one"),
        ZipEntryFixture::stored("same.txt", b"two"),
    ]);
    let archive = open_archive(image, OpenOptions::default()).await?;
    let err = archive
        .normalize_to(Vec::new(), &NormalizeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ArchiveNameCollision);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn last_wins_keeps_the_later_body() -> anyhow::Result<()> {
    let image = build_zip(&[
        ZipEntryFixture::stored("same.txt", b"one"),
        ZipEntryFixture::stored("same.txt", b"two"),
    ]);
    let archive = open_archive(image, OpenOptions::default()).await?;
    let mut out = Vec::new();
    let mut options = NormalizeOptions::default();
    options.on_duplicate = ConflictPolicy::LastWins;
    let report = archive.normalize_to(&mut out, &options).await?;
    assert_eq!(report.output_entries, 1);
    assert_eq!(report.dropped_entries, 1);

    let normalized = open_archive(out, OpenOptions::default()).await?;
    assert_eq!(
        &normalized.read_entry(&normalized.entries()[0]).await?[..],
        b"two"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn deterministic_output_is_sorted_and_scrubbed() -> anyhow::Result<()> {
    let image = build_zip(&[
        ZipEntryFixture::deflated("zzz/last.txt", b"tail content here"),
        ZipEntryFixture::stored("aaa/", b""),
        ZipEntryFixture::deflated("aaa/first.txt", b"head content here"),
    ]);
    let archive = open_archive(image, OpenOptions::default()).await?;
    let mut out = Vec::new();
    let report = archive
        .normalize_to(&mut out, &NormalizeOptions::default())
        .await?;
    assert!(report.ok);

    let normalized = open_archive(out, OpenOptions::default()).await?;
    let names: Vec<&str> = normalized.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["aaa/", "aaa/first.txt", "zzz/last.txt"]);
    for entry in normalized.entries() {
        if let Some(mtime) = entry.mtime {
            assert_eq!(mtime.to_rfc3339(), "1980-01-01T00:00:00+00:00");
        }
        assert_eq!(entry.uid, None);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn normalization_is_idempotent() -> anyhow::Result<()> {
    let image = build_zip(&[
        ZipEntryFixture::deflated("b.txt", b"second body second body"),
        ZipEntryFixture::stored("a.txt", b"first body"),
    ]);
    let archive = open_archive(image, OpenOptions::default()).await?;
    let mut once = Vec::new();
    archive
        .normalize_to(&mut once, &NormalizeOptions::default())
        .await?;

    let reopened = open_archive(once.clone(), OpenOptions::default()).await?;
    let mut twice = Vec::new();
    reopened
        .normalize_to(&mut twice, &NormalizeOptions::default())
        .await?;
    assert_eq!(once, twice, "normalize(normalize(A)) must be byte-identical");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn lossless_mode_preserves_compressed_bytes_and_crc() -> anyhow::Result<()> {
    let payload = b"compressible compressible compressible compressible";
    let image = build_zip(&[ZipEntryFixture::deflated("keep.bin", payload)]);
    let archive = open_archive(image, OpenOptions::default()).await?;
    let original_crc = archive.entries()[0].crc32();

    let mut out = Vec::new();
    let mut options = NormalizeOptions::default();
    options.mode = NormalizeMode::Lossless;
    let report = archive.normalize_to(&mut out, &options).await?;
    assert_eq!(report.preserved_entries, 1);
    assert_eq!(report.recompressed_entries, 0);

    let normalized = open_archive(out, OpenOptions::default()).await?;
    let entry = &normalized.entries()[0];
    assert_eq!(entry.crc32(), original_crc);
    assert_eq!(entry.method(), 8);
    assert_eq!(&normalized.read_entry(entry).await?[..], payload);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn tar_normalization_drops_hardlinks_with_a_warning() -> anyhow::Result<()> {
    let image = build_tar(&[
        ("real.txt", b"content", b'0', ""),
        ("alias.txt", b"", b'1', "real.txt"),
    ]);
    let archive = open_archive(image, OpenOptions::default()).await?;
    let mut out = Vec::new();
    let report = archive
        .normalize_to(&mut out, &NormalizeOptions::default())
        .await?;
    assert_eq!(report.output_entries, 1);
    assert_eq!(report.dropped_entries, 1);
    assert!(
        report
            .issues
            .iter()
            .any(|i| i.code == Code::ArchiveUnsupportedFeature)
    );

    let normalized = open_archive(out, OpenOptions::default()).await?;
    assert_eq!(normalized.entries().len(), 1);
    assert_eq!(normalized.entries()[0].name, "real.txt");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn tar_symlinks_survive_normalization() -> anyhow::Result<()> {
    let image = build_tar(&[
        ("target.txt", b"pointed at", b'0', ""),
        ("pointer", b"", b'2', "target.txt"),
    ]);
    let archive = open_archive(image, OpenOptions::default()).await?;
    let mut out = Vec::new();
    archive
        .normalize_to(&mut out, &NormalizeOptions::default())
        .await?;

    let normalized = open_archive(out, OpenOptions::default()).await?;
    let link = normalized
        .entries()
        .iter()
        .find(|e| e.kind == EntryKind::Symlink)
        .expect("symlink kept");
    assert_eq!(link.link_name.as_deref(), Some("target.txt"));
    assert_eq!(link.mode, Some(0o777));
    Ok(())
}
