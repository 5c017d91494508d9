//! Entry-name sanitation and collision indexing.
//!
//! Names from untrusted archives get the same treatment regardless of
//! container: backslash unification, traversal rejection, segment cleanup.
//! Collisions are tracked in three indexes (exact, NFC, case-fold) so reports
//! can say *why* two names conflict.

use std::collections::HashMap;

use unicode_normalization::UnicodeNormalization;

use crate::error::{ArchiveError, Code, Result};
use crate::report::CollisionKind;

/// Normalize a stored entry name into a safe relative POSIX path.
///
/// Directories keep their trailing `/`. Fails on NUL bytes, absolute paths,
/// Windows drive prefixes, `..` segments, and names that normalize to
/// nothing.
pub fn normalize_name(raw: &str) -> Result<String> {
    if raw.as_bytes().contains(&0) {
        return Err(ArchiveError::new(Code::ArchiveBadHeader, "NUL byte in entry name"));
    }
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(ArchiveError::new(
            Code::ArchivePathTraversal,
            format!("absolute path {raw:?}"),
        ));
    }
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(ArchiveError::new(
            Code::ArchivePathTraversal,
            format!("Windows drive prefix in {raw:?}"),
        ));
    }
    let is_dir = unified.ends_with('/');
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(ArchiveError::new(
                    Code::ArchivePathTraversal,
                    format!("parent-directory segment in {raw:?}"),
                ));
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(ArchiveError::new(
            Code::ArchiveBadHeader,
            format!("entry name {raw:?} normalizes to nothing"),
        ));
    }
    let mut name = segments.join("/");
    if is_dir {
        name.push('/');
    }
    Ok(name)
}

/// NFC form of a name; two distinct byte sequences with equal NFC collide on
/// common filesystems.
pub fn nfc_key(name: &str) -> String {
    name.nfc().collect()
}

/// Full case-fold key, combined with directory-trailing-slash normalization
/// so `Dir/` and `dir` collide.
pub fn casefold_key(name: &str) -> String {
    name.trim_end_matches('/')
        .nfc()
        .flat_map(char::to_lowercase)
        .collect()
}

/// A collision found while inserting into a [`NameIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub kind: CollisionKind,
    /// The previously-inserted name this one conflicts with.
    pub existing: String,
}

/// The three collision maps of §name-resolution, shared by the auditor and
/// the normalizer.
#[derive(Debug, Default)]
pub struct NameIndex {
    exact: HashMap<String, String>,
    nfc: HashMap<String, String>,
    folded: HashMap<String, String>,
}

impl NameIndex {
    pub fn new() -> Self {
        NameIndex::default()
    }

    /// Record `name`, reporting every kind of collision it causes. Each kind
    /// is reported at most once, most severe first (duplicate, then NFC, then
    /// case-fold), and an exact duplicate suppresses the derived kinds.
    pub fn insert(&mut self, name: &str) -> Vec<Collision> {
        let mut collisions = Vec::new();
        if let Some(existing) = self.exact.get(name) {
            collisions.push(Collision {
                kind: CollisionKind::Duplicate,
                existing: existing.clone(),
            });
            return collisions;
        }
        self.exact.insert(name.to_string(), name.to_string());

        let nfc = nfc_key(name);
        if let Some(existing) = self.nfc.get(&nfc) {
            collisions.push(Collision {
                kind: CollisionKind::UnicodeNfc,
                existing: existing.clone(),
            });
        } else {
            self.nfc.insert(nfc, name.to_string());
        }

        let folded = casefold_key(name);
        if let Some(existing) = self.folded.get(&folded) {
            // Don't double-report when the fold collision is the same pair as
            // the NFC collision.
            if collisions.is_empty() || nfc_key(existing) != nfc_key(name) {
                collisions.push(Collision {
                    kind: CollisionKind::Casefold,
                    existing: existing.clone(),
                });
            }
        } else {
            self.folded.insert(folded, name.to_string());
        }

        collisions
    }

    /// Would `name` collide in the exact or case-fold index? Used by the
    /// rename policy to probe candidates.
    pub fn would_collide(&self, name: &str) -> bool {
        self.exact.contains_key(name) || self.folded.contains_key(&casefold_key(name))
    }

    pub fn contains_exact(&self, name: &str) -> bool {
        self.exact.contains_key(name)
    }
}

/// Build the `name~N[.ext][/]` rename candidate for collision resolution.
pub fn renamed(name: &str, n: u32) -> String {
    let (body, dir_slash) = match name.strip_suffix('/') {
        Some(body) => (body, "/"),
        None => (name, ""),
    };
    // The extension stays attached to the tail segment only.
    let (prefix, last) = match body.rfind('/') {
        Some(pos) => (&body[..=pos], &body[pos + 1..]),
        None => ("", body),
    };
    let candidate = match last.rfind('.') {
        Some(dot) if dot > 0 => format!("{}{}~{}{}", prefix, &last[..dot], n, &last[dot..]),
        _ => format!("{prefix}{last}~{n}"),
    };
    format!("{candidate}{dir_slash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_backslashes_and_dot_segments() {
        assert_eq!(normalize_name("a\\b\\.\\c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_name("./a//b/").unwrap(), "a/b/");
    }

    #[test]
    fn rejects_traversal_and_absolute() {
        assert_eq!(
            normalize_name("../etc/passwd").unwrap_err().code,
            Code::ArchivePathTraversal
        );
        assert_eq!(
            normalize_name("/etc/passwd").unwrap_err().code,
            Code::ArchivePathTraversal
        );
        assert_eq!(
            normalize_name("C:\\windows\\system32").unwrap_err().code,
            Code::ArchivePathTraversal
        );
        assert_eq!(
            normalize_name("a/../b").unwrap_err().code,
            Code::ArchivePathTraversal
        );
    }

    #[test]
    fn rejects_nul_and_empty() {
        assert_eq!(
            normalize_name("a\0b").unwrap_err().code,
            Code::ArchiveBadHeader
        );
        assert_eq!(normalize_name("././").unwrap_err().code, Code::ArchiveBadHeader);
    }

    #[test]
    fn casefold_collision_detected() {
        let mut index = NameIndex::new();
        assert!(index.insert("README.md").is_empty());
        let collisions = index.insert("readme.md");
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].kind, CollisionKind::Casefold);
        assert_eq!(collisions[0].existing, "README.md");
    }

    #[test]
    fn nfc_collision_detected() {
        // U+00E9 vs e + U+0301: same NFC, different bytes.
        let nfc = "caf\u{e9}.txt";
        let nfd = "cafe\u{301}.txt";
        let mut index = NameIndex::new();
        assert!(index.insert(nfc).is_empty());
        let collisions = index.insert(nfd);
        assert_eq!(collisions[0].kind, CollisionKind::UnicodeNfc);
    }

    #[test]
    fn exact_duplicate_wins_over_derived_kinds() {
        let mut index = NameIndex::new();
        assert!(index.insert("a.txt").is_empty());
        let collisions = index.insert("a.txt");
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].kind, CollisionKind::Duplicate);
    }

    #[test]
    fn dir_and_file_casefold_collide() {
        let mut index = NameIndex::new();
        assert!(index.insert("Docs/").is_empty());
        let collisions = index.insert("docs");
        assert_eq!(collisions[0].kind, CollisionKind::Casefold);
    }

    #[test]
    fn rename_candidates() {
        assert_eq!(renamed("readme.md", 1), "readme~1.md");
        assert_eq!(renamed("a/b/readme.md", 2), "a/b/readme~2.md");
        assert_eq!(renamed("dir/", 1), "dir~1/");
        assert_eq!(renamed(".hidden", 1), ".hidden~1");
        assert_eq!(renamed("noext", 3), "noext~3");
    }
}
