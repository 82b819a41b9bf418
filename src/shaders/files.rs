//! Naming and discovery of shader source files on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use eyre::{Result, WrapErr};

use super::hash::ShaderHash;
use crate::driver::Stage;

/// The kind of source a file holds. Later variants win when several files exist for one hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum SourceKind {
    /// A precompiled container (`.bin`).
    Binary,

    /// Disassembled low-level text (`.txt`).
    Assembly,

    /// High-level source (`_replace.txt`).
    Hlsl,
}

impl SourceKind {
    fn suffix(self) -> &'static str {
        match self {
            SourceKind::Binary => ".bin",
            SourceKind::Assembly => ".txt",
            SourceKind::Hlsl => "_replace.txt",
        }
    }
}

lazy_static::lazy_static! {
    static ref FILE_NAME: regex::Regex =
        regex::Regex::new(r"^([0-9a-fA-F]{16})-(vs|ps|gs|hs|ds|cs)(_replace)?\.(txt|bin)$").unwrap();
}

/// Splits a file name like `0123456789abcdef-ps_replace.txt` into its parts.
pub fn parse_file_name(name: &str) -> Option<(ShaderHash, Stage, SourceKind)> {
    let captures = FILE_NAME.captures(name)?;

    let hash = captures[1].parse().ok()?;
    let stage = Stage::from_abbrev(&captures[2])?;

    // A `_replace.bin` is still just a compiled container.
    let kind = match (&captures[4], captures.get(3).is_some()) {
        ("bin", _) => SourceKind::Binary,
        (_, true) => SourceKind::Hlsl,
        (_, false) => SourceKind::Assembly,
    };

    Some((hash, stage, kind))
}

pub fn file_name(hash: ShaderHash, stage: Stage, kind: SourceKind) -> String {
    format!("{}-{}{}", hash, stage, kind.suffix())
}

pub fn consts_file_name(hash: ShaderHash, stage: Stage) -> String {
    format!("{}-{}-consts.txt", hash, stage)
}

/// One override file found in the fixes directory.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SourceFile {
    pub hash: ShaderHash,
    pub stage: Stage,
    pub kind: SourceKind,
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl SourceFile {
    fn from_path(path: PathBuf) -> Option<SourceFile> {
        let (hash, stage, kind) = parse_file_name(path.file_name()?.to_str()?)?;

        let modified = match path.metadata().and_then(|metadata| metadata.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                log::warn!("Unable to read modification time of {}: {}", path.display(), err);
                return None;
            }
        };

        Some(SourceFile {
            hash,
            stage,
            kind,
            path,
            modified,
        })
    }
}

/// Lists the override files in `dir`, keeping only the highest-priority file for each hash.
/// A directory that does not exist holds no overrides. The result is ordered by hash.
pub fn scan(dir: &Path) -> Result<Vec<SourceFile>> {
    if !dir.exists() {
        log::debug!("{} does not exist, so there are no overrides", dir.display());
        return Ok(vec![]);
    }

    let entries = std::fs::read_dir(dir).wrap_err_with(|| format!("failed to read {}", dir.display()))?;
    let mut chosen: HashMap<ShaderHash, SourceFile> = HashMap::new();

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("Error while reading {}: {}", dir.display(), err);
                continue;
            }
        };

        let file = match SourceFile::from_path(entry.path()) {
            Some(file) => file,
            None => continue,
        };

        match chosen.get(&file.hash) {
            Some(existing) if existing.kind >= file.kind => {
                log::debug!("Ignoring {} in favour of {}", file.path.display(), existing.path.display());
            }

            _ => {
                chosen.insert(file.hash, file);
            }
        }
    }

    let mut files: Vec<SourceFile> = chosen.into_values().collect();
    files.sort_by_key(|file| file.hash);

    Ok(files)
}

/// Finds the highest-priority override for one hash, if any.
pub fn find(dir: &Path, hash: ShaderHash, stage: Stage) -> Option<SourceFile> {
    [SourceKind::Hlsl, SourceKind::Assembly, SourceKind::Binary]
        .iter()
        .map(|&kind| dir.join(file_name(hash, stage, kind)))
        .find(|path| path.is_file())
        .and_then(SourceFile::from_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: ShaderHash = ShaderHash(0x0123_4567_89ab_cdef);

    #[test]
    fn parses_names() {
        assert_eq!(
            parse_file_name("0123456789abcdef-ps_replace.txt"),
            Some((HASH, Stage::Pixel, SourceKind::Hlsl))
        );

        assert_eq!(
            parse_file_name("0123456789ABCDEF-vs.txt"),
            Some((HASH, Stage::Vertex, SourceKind::Assembly))
        );

        assert_eq!(
            parse_file_name("0123456789abcdef-cs_replace.bin"),
            Some((HASH, Stage::Compute, SourceKind::Binary))
        );

        assert_eq!(parse_file_name("0123456789abcdef-ps-consts.txt"), None);
        assert_eq!(parse_file_name("0123456789abcde-ps.txt"), None);
        assert_eq!(parse_file_name("0123456789abcdef-xs.txt"), None);
        assert_eq!(parse_file_name("0123456789abcdef-ps.txt.bak"), None);
    }

    #[test]
    fn names_round_trip() {
        for kind in [SourceKind::Hlsl, SourceKind::Assembly, SourceKind::Binary] {
            let name = file_name(HASH, Stage::Geometry, kind);
            assert_eq!(parse_file_name(&name), Some((HASH, Stage::Geometry, kind)));
        }

        assert_eq!(consts_file_name(HASH, Stage::Pixel), "0123456789abcdef-ps-consts.txt");
    }

    #[test]
    fn scan_prefers_high_level_source() {
        let dir = tempfile::tempdir().unwrap();
        let other = ShaderHash(0xffff_0000_ffff_0000);

        for name in [
            "0123456789abcdef-ps.bin",
            "0123456789abcdef-ps.txt",
            "0123456789abcdef-ps_replace.txt",
            "0123456789abcdef-ps-consts.txt",
            "ffff0000ffff0000-vs.bin",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }

        let files = scan(dir.path()).unwrap();
        assert_eq!(files.len(), 2);

        assert_eq!(files[0].hash, HASH);
        assert_eq!(files[0].kind, SourceKind::Hlsl);
        assert!(files[0].path.ends_with("0123456789abcdef-ps_replace.txt"));

        assert_eq!(files[1].hash, other);
        assert_eq!(files[1].kind, SourceKind::Binary);

        let found = find(dir.path(), HASH, Stage::Pixel).unwrap();
        assert_eq!(found.kind, SourceKind::Hlsl);
        assert!(find(dir.path(), HASH, Stage::Vertex).is_none());
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(&dir.path().join("absent")).unwrap().is_empty());
    }
}
