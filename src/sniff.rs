//! Format detection: magic bytes first, filename as a tiebreaker.

/// Outer compression layer around a single payload or a TAR stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Brotli,
}

/// Container format the facade dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    TarZstd,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Brotli,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Zip => "zip",
            Format::Tar => "tar",
            Format::TarGz => "tar+gzip",
            Format::TarBz2 => "tar+bzip2",
            Format::TarXz => "tar+xz",
            Format::TarZstd => "tar+zstd",
            Format::Gzip => "gzip",
            Format::Bzip2 => "bzip2",
            Format::Xz => "xz",
            Format::Zstd => "zstd",
            Format::Brotli => "brotli",
        }
    }

    /// Detect from a file name, the way shell tools do.
    pub fn from_filename(name: &str) -> Option<Format> {
        let lower = name.to_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            return Some(Format::TarGz);
        }
        if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") {
            return Some(Format::TarBz2);
        }
        if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            return Some(Format::TarXz);
        }
        if lower.ends_with(".tar.zst") || lower.ends_with(".tzst") {
            return Some(Format::TarZstd);
        }
        if lower.ends_with(".tar") {
            return Some(Format::Tar);
        }
        if lower.ends_with(".zip") || lower.ends_with(".jar") {
            return Some(Format::Zip);
        }
        if lower.ends_with(".gz") {
            return Some(Format::Gzip);
        }
        if lower.ends_with(".bz2") {
            return Some(Format::Bzip2);
        }
        if lower.ends_with(".xz") {
            return Some(Format::Xz);
        }
        if lower.ends_with(".zst") {
            return Some(Format::Zstd);
        }
        if lower.ends_with(".br") {
            return Some(Format::Brotli);
        }
        None
    }

    /// Detect from leading bytes. `head` should cover at least the first 512
    /// bytes so plain TAR can be recognized by its ustar magic.
    pub fn sniff(head: &[u8]) -> Option<Format> {
        if head.len() >= 4 && head[..2] == *b"PK" {
            if matches!(
                [head[2], head[3]],
                [0x03, 0x04] | [0x05, 0x06] | [0x07, 0x08]
            ) {
                return Some(Format::Zip);
            }
        }
        if head.len() >= 2 && head[..2] == [0x1F, 0x8B] {
            return Some(Format::Gzip);
        }
        if head.len() >= 4 && &head[..3] == b"BZh" && head[3].is_ascii_digit() {
            return Some(Format::Bzip2);
        }
        if head.len() >= 6 && head[..6] == [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00] {
            return Some(Format::Xz);
        }
        if head.len() >= 4 && head[..4] == [0x28, 0xB5, 0x2F, 0xFD] {
            return Some(Format::Zstd);
        }
        if head.len() >= 263 && &head[257..262] == b"ustar" {
            return Some(Format::Tar);
        }
        None
    }

    /// Magic and filename combined; magic wins, the filename upgrades a bare
    /// compression layer to its tar variant (`.tar.gz` vs `.gz`).
    pub fn detect(filename: Option<&str>, head: &[u8]) -> Option<Format> {
        let by_name = filename.and_then(Format::from_filename);
        let by_magic = Format::sniff(head);
        match (by_magic, by_name) {
            (Some(magic), Some(name))
                if magic.into_compression().is_some()
                    && name.outer() == magic.into_compression() =>
            {
                Some(name)
            }
            (Some(magic), _) => Some(magic),
            (None, name) => name,
        }
    }

    fn into_compression(self) -> Option<Compression> {
        match self {
            Format::Gzip => Some(Compression::Gzip),
            Format::Bzip2 => Some(Compression::Bzip2),
            Format::Xz => Some(Compression::Xz),
            Format::Zstd => Some(Compression::Zstd),
            Format::Brotli => Some(Compression::Brotli),
            _ => None,
        }
    }

    /// The compression layer wrapped around this format, if any.
    pub fn outer(self) -> Option<Compression> {
        match self {
            Format::TarGz | Format::Gzip => Some(Compression::Gzip),
            Format::TarBz2 | Format::Bzip2 => Some(Compression::Bzip2),
            Format::TarXz | Format::Xz => Some(Compression::Xz),
            Format::TarZstd | Format::Zstd => Some(Compression::Zstd),
            Format::Brotli => Some(Compression::Brotli),
            Format::Zip | Format::Tar => None,
        }
    }

    /// Is there a TAR stream inside the outer layer?
    pub fn is_tar(self) -> bool {
        matches!(
            self,
            Format::Tar | Format::TarGz | Format::TarBz2 | Format::TarXz | Format::TarZstd
        )
    }

    /// Upgrade a bare compression format to its tar variant (used when the
    /// decompressed head turns out to be a tar stream).
    pub fn with_tar_inside(self) -> Format {
        match self {
            Format::Gzip => Format::TarGz,
            Format::Bzip2 => Format::TarBz2,
            Format::Xz => Format::TarXz,
            Format::Zstd => Format::TarZstd,
            other => other,
        }
    }
}
