//! Shader identity: hashing, per-hash records, and the files that override them.

pub mod export;
pub mod files;
pub mod hash;
pub mod record;

pub use files::{SourceFile, SourceKind};
pub use hash::ShaderHash;
pub use record::{Original, Replacement, ShaderRecord};
