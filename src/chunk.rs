//! Chunk and logical-file naming ("Chunk file" / "Logical file").
//!
//! A chunk file on disk is named `<logical>.<NNN>`, optionally followed by
//! `.hmac` or `.enc`. This module is the single place that knows how to
//! take those names apart and put them back together so the rest of the
//! pipeline never does its own string surgery on scratch-directory paths.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suffix {
    /// A plain chunk, `<logical>.<NNN>`.
    None,
    /// `<logical>.<NNN>.hmac` (v2/v3).
    Hmac,
    /// `<logical>.<NNN>.enc` (v4).
    Enc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub logical: String,
    pub ordinal: u32,
    pub suffix: Suffix,
}

impl ChunkName {
    /// Parses a tar member path as emitted by the outer extractor, e.g.
    /// `myvm/private.img.003.enc`.
    pub fn parse(path: &str) -> Option<Self> {
        let (suffix, rest) = if let Some(stem) = path.strip_suffix(".hmac") {
            (Suffix::Hmac, stem)
        } else if let Some(stem) = path.strip_suffix(".enc") {
            (Suffix::Enc, stem)
        } else {
            (Suffix::None, path)
        };
        let dot = rest.rfind('.')?;
        let (logical, digits) = (rest[..dot].to_owned(), &rest[dot + 1..]);
        if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let ordinal = digits.parse::<u32>().ok()?;
        Some(Self {
            logical,
            ordinal,
            suffix,
        })
    }

    pub fn is_first(&self) -> bool {
        self.ordinal == 0
    }

    /// File name this chunk has on disk in the scratch directory.
    pub fn filename(&self) -> String {
        let base = format!("{}.{:03}", self.logical, self.ordinal);
        match self.suffix {
            Suffix::None => base,
            Suffix::Hmac => format!("{}.hmac", base),
            Suffix::Enc => format!("{}.enc", base),
        }
    }
}

/// A chunk file that exists on disk, with its path inside the scratch
/// directory and its parsed name.
#[derive(Debug, Clone)]
pub struct ChunkPath {
    pub scratch: PathBuf,
    pub name: ChunkName,
}

impl ChunkPath {
    pub fn new(scratch_dir: &Path, member_path: &str) -> Option<Self> {
        let name = ChunkName::parse(member_path)?;
        Some(Self {
            scratch: scratch_dir.join(name.filename()),
            name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.scratch
    }

    pub fn delete(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.scratch) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_chunk() {
        let c = ChunkName::parse("myvm/private.img.003").unwrap();
        assert_eq!(c.logical, "myvm/private.img");
        assert_eq!(c.ordinal, 3);
        assert_eq!(c.suffix, Suffix::None);
        assert!(!c.is_first());
    }

    #[test]
    fn parses_enc_chunk() {
        let c = ChunkName::parse("qubes.xml.000.enc").unwrap();
        assert_eq!(c.logical, "qubes.xml");
        assert_eq!(c.ordinal, 0);
        assert_eq!(c.suffix, Suffix::Enc);
        assert!(c.is_first());
    }

    #[test]
    fn bare_header_file_has_no_ordinal() {
        // `backup-header`/`backup-header.hmac` are fetched as named files,
        // not through the `<logical>.<NNN>` chunk naming scheme.
        assert!(ChunkName::parse("backup-header").is_none());
    }

    #[test]
    fn rejects_bad_ordinal_width() {
        assert!(ChunkName::parse("foo.12").is_none());
        assert!(ChunkName::parse("foo.abcd").is_none());
    }

    fn filename_round_trips(member: &str) {
        let c = ChunkName::parse(member).unwrap();
        assert_eq!(c.filename(), member);
    }

    #[test]
    fn filename_is_inverse_of_parse() {
        filename_round_trips("myvm/private.img.003");
        filename_round_trips("myvm/private.img.003.enc");
        filename_round_trips("qubes.xml.000.hmac");
    }
}
