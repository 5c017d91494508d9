//! Safety profiles and resource limits.
//!
//! Every limit is clamped on construction: a value outside its allowed range
//! falls back to the profile default instead of being accepted silently.

/// Named bundle of defaults selecting limit tightness and how lenient parsing
/// is about recoverable defects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Reject malformed structure, warn on suspicious-but-decodable input.
    #[default]
    Strict,
    /// Loose decoder: most warnings stay warnings, some errors soften.
    Compat,
    /// Strictest: warnings become errors, tighter resource caps.
    Agent,
}

impl Profile {
    /// Do audit warnings make the report not-ok?
    pub fn warnings_are_errors(self) -> bool {
        matches!(self, Profile::Agent)
    }

    /// Are symlink entries fatal during audit?
    pub fn symlinks_fatal(self) -> bool {
        matches!(self, Profile::Agent)
    }

    /// Are bytes after the EOCD / final TAR block fatal?
    pub fn trailing_bytes_fatal(self) -> bool {
        matches!(self, Profile::Agent)
    }

    /// Is an out-of-profile XZ check type fatal (vs. skipped with a note)?
    pub fn unsupported_check_fatal(self) -> bool {
        !matches!(self, Profile::Compat)
    }

    pub fn default_limits(self) -> Limits {
        Limits::for_profile(self)
    }
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Resource caps enforced while parsing and decoding.
///
/// Construct with [`Limits::for_profile`] and adjust fields; every accessor
/// the parsers use goes through [`Limits::clamped`], so hand-set values
/// outside the legal range quietly revert to the profile default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of entries per archive.
    pub max_entries: u64,
    /// Maximum uncompressed size of a single entry.
    pub max_uncompressed_entry_bytes: u64,
    /// Maximum cumulative uncompressed size across the archive.
    pub max_total_uncompressed_bytes: u64,
    /// Maximum uncompressed:compressed ratio before an entry is treated as a bomb.
    pub max_compression_ratio: u64,
    /// Generic decompression dictionary/window cap.
    pub max_dictionary_bytes: u64,
    /// XZ LZMA2 dictionary cap (checked during pre-flight, before allocation).
    pub max_xz_dictionary_bytes: u64,
    /// Cap on bytes buffered inside the XZ decoder between pulls.
    pub max_xz_buffered_input_bytes: u64,
    /// Maximum number of XZ index records.
    pub max_xz_index_records: u64,
    /// Maximum encoded size of the XZ index.
    pub max_xz_index_bytes: u64,
    /// Block headers examined during XZ pre-flight before giving up.
    pub max_xz_preflight_block_headers: u64,
    /// Maximum ZIP central directory size.
    pub max_zip_central_directory_bytes: u64,
    /// Maximum ZIP archive comment length.
    pub max_zip_comment_bytes: u64,
    /// How far back from EOF the EOCD signature scan may go.
    pub max_zip_eocd_search_bytes: u64,
    /// Maximum bzip2 block-size class (the digit in `BZh1`..`BZh9`).
    pub max_bzip2_block_size: u64,
    /// Maximum size of the input archive itself.
    pub max_input_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits::for_profile(Profile::Strict)
    }
}

/// ZIP spec: the EOCD comment length field is 16-bit, so the record can sit
/// at most 65535 + 22 bytes from EOF.
pub const EOCD_SEARCH_CEILING: u64 = 65_535 + 22;

impl Limits {
    pub fn for_profile(profile: Profile) -> Self {
        let tight = matches!(profile, Profile::Agent);
        Limits {
            max_entries: if tight { 10_000 } else { 100_000 },
            max_uncompressed_entry_bytes: if tight { 256 * MIB } else { GIB },
            max_total_uncompressed_bytes: if tight { GIB } else { 4 * GIB },
            max_compression_ratio: if tight { 200 } else { 1000 },
            max_dictionary_bytes: if tight { 32 * MIB } else { 64 * MIB },
            max_xz_dictionary_bytes: if tight { 32 * MIB } else { 64 * MIB },
            max_xz_buffered_input_bytes: 4 * MIB,
            max_xz_index_records: if tight { 1_000 } else { 10_000 },
            max_xz_index_bytes: MIB,
            max_xz_preflight_block_headers: 64,
            max_zip_central_directory_bytes: if tight { 16 * MIB } else { 64 * MIB },
            max_zip_comment_bytes: 65_535,
            max_zip_eocd_search_bytes: 64 * KIB + 22,
            max_bzip2_block_size: 9,
            max_input_bytes: if tight { 16 * GIB } else { 1024 * GIB },
        }
    }

    /// Clamp every field into its legal range, falling back to the given
    /// profile's default for anything out of range. Zero is out of range for
    /// nearly every field (a zero cap would make every archive unreadable);
    /// the one exception is `max_zip_comment_bytes`, where zero legitimately
    /// means "refuse archives that carry a comment".
    pub fn clamped(&self, profile: Profile) -> Limits {
        let d = Limits::for_profile(profile);
        fn pick(value: u64, default: u64, lo: u64, hi: u64) -> u64 {
            if value < lo || value > hi { default } else { value }
        }
        Limits {
            max_entries: pick(self.max_entries, d.max_entries, 1, 100_000_000),
            max_uncompressed_entry_bytes: pick(
                self.max_uncompressed_entry_bytes,
                d.max_uncompressed_entry_bytes,
                1,
                64 * GIB,
            ),
            max_total_uncompressed_bytes: pick(
                self.max_total_uncompressed_bytes,
                d.max_total_uncompressed_bytes,
                1,
                256 * GIB,
            ),
            max_compression_ratio: pick(self.max_compression_ratio, d.max_compression_ratio, 1, 100_000),
            max_dictionary_bytes: pick(self.max_dictionary_bytes, d.max_dictionary_bytes, KIB, GIB),
            max_xz_dictionary_bytes: pick(
                self.max_xz_dictionary_bytes,
                d.max_xz_dictionary_bytes,
                KIB,
                GIB,
            ),
            max_xz_buffered_input_bytes: pick(
                self.max_xz_buffered_input_bytes,
                d.max_xz_buffered_input_bytes,
                64 * KIB,
                GIB,
            ),
            max_xz_index_records: pick(self.max_xz_index_records, d.max_xz_index_records, 1, 100_000_000),
            max_xz_index_bytes: pick(self.max_xz_index_bytes, d.max_xz_index_bytes, 64, GIB),
            max_xz_preflight_block_headers: pick(
                self.max_xz_preflight_block_headers,
                d.max_xz_preflight_block_headers,
                1,
                1_000_000,
            ),
            max_zip_central_directory_bytes: pick(
                self.max_zip_central_directory_bytes,
                d.max_zip_central_directory_bytes,
                46,
                4 * GIB,
            ),
            max_zip_comment_bytes: pick(self.max_zip_comment_bytes, d.max_zip_comment_bytes, 0, 65_535),
            max_zip_eocd_search_bytes: pick(
                self.max_zip_eocd_search_bytes,
                d.max_zip_eocd_search_bytes,
                22,
                EOCD_SEARCH_CEILING,
            ),
            max_bzip2_block_size: pick(self.max_bzip2_block_size, d.max_bzip2_block_size, 1, 9),
            max_input_bytes: pick(self.max_input_bytes, d.max_input_bytes, 22, u64::MAX),
        }
    }
}
