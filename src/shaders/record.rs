use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use super::files::SourceKind;
use super::hash::ShaderHash;
use crate::driver::{same_shader, CompiledShader, Stage};

/// The shader exactly as the game created it.
#[derive(Clone, Debug)]
pub struct Original {
    pub bytecode: Arc<[u8]>,
    pub shader: CompiledShader,
}

/// A shader built from an override file.
#[derive(Clone, Debug)]
pub struct Replacement {
    pub shader: CompiledShader,
    pub bytecode: Arc<[u8]>,
    pub kind: SourceKind,
    pub path: PathBuf,
}

/// Everything known about one shader hash.
///
/// Records are created either when the game creates a shader, or lazily when an override file
/// names a hash the game has not created yet. In the second case `original` stays empty until
/// the game catches up. Records are never removed.
#[derive(Debug)]
pub struct ShaderRecord {
    pub hash: ShaderHash,
    pub stage: Stage,
    pub original: Option<Original>,
    pub replacement: Option<Replacement>,

    /// Modification time of the file the current replacement was built from.
    pub source_timestamp: Option<SystemTime>,

    /// Whether the last reload pass saw a file for this hash.
    pub found_on_disk: bool,

    /// How many times different bytecode arrived with this hash.
    pub collisions: u32,

    /// How many distinct handles the game has created for this hash.
    pub creations: u32,
    pub exported: bool,
}

impl ShaderRecord {
    pub fn new(hash: ShaderHash, stage: Stage) -> ShaderRecord {
        ShaderRecord {
            hash,
            stage,
            original: None,
            replacement: None,
            source_timestamp: None,
            found_on_disk: false,
            collisions: 0,
            creations: 0,
            exported: false,
        }
    }

    /// The object binds of this hash resolve to: the replacement if there is one.
    pub fn active(&self) -> Option<&CompiledShader> {
        self.replacement
            .as_ref()
            .map(|replacement| &replacement.shader)
            .or_else(|| self.original.as_ref().map(|original| &original.shader))
    }

    pub fn original_shader(&self) -> Option<&CompiledShader> {
        self.original.as_ref().map(|original| &original.shader)
    }

    pub fn source_kind(&self) -> Option<SourceKind> {
        self.replacement.as_ref().map(|replacement| replacement.kind)
    }

    /// Swaps in a new replacement and returns the one it displaced. The caller drops the old
    /// object outside the registry lock.
    pub fn replace(&mut self, replacement: Replacement, timestamp: SystemTime) -> Option<Replacement> {
        self.source_timestamp = Some(timestamp);
        self.replacement.replace(replacement)
    }

    /// Drops back to the original and returns the stale replacement, if there was one.
    pub fn revert(&mut self) -> Option<Replacement> {
        self.source_timestamp = None;
        self.replacement.take()
    }

    /// True if `shader` is this record's original or replacement object.
    pub fn owns(&self, shader: &CompiledShader) -> bool {
        self.original_shader().map_or(false, |original| same_shader(original, shader))
            || self
                .replacement
                .as_ref()
                .map_or(false, |replacement| same_shader(&replacement.shader, shader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockShader;

    fn replacement(shader: &CompiledShader) -> Replacement {
        Replacement {
            shader: shader.clone(),
            bytecode: Arc::from(&b"new"[..]),
            kind: SourceKind::Hlsl,
            path: PathBuf::from("fix.txt"),
        }
    }

    #[test]
    fn active_prefers_replacement() {
        let original: CompiledShader = MockShader::new(Stage::Pixel);
        let new: CompiledShader = MockShader::new(Stage::Pixel);

        let mut record = ShaderRecord::new(ShaderHash(1), Stage::Pixel);
        assert!(record.active().is_none());

        record.original = Some(Original {
            bytecode: Arc::from(&b"old"[..]),
            shader: original.clone(),
        });

        assert!(same_shader(record.active().unwrap(), &original));

        let time = SystemTime::now();
        assert!(record.replace(replacement(&new), time).is_none());
        assert!(same_shader(record.active().unwrap(), &new));
        assert_eq!(record.source_timestamp, Some(time));
        assert_eq!(record.source_kind(), Some(SourceKind::Hlsl));
        assert!(record.owns(&original) && record.owns(&new));

        let stale = record.revert().unwrap();
        assert!(same_shader(&stale.shader, &new));
        assert!(same_shader(record.active().unwrap(), &original));
        assert_eq!(record.source_timestamp, None);
        assert!(!record.owns(&new));
    }
}
