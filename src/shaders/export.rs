//! Writes shaders out for a person to read and edit.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use super::files::{self, SourceKind};
use super::hash::ShaderHash;
use crate::asm;
use crate::driver::{Decompiler, Stage};

#[derive(Clone, Copy, Debug)]
pub struct ExportOptions {
    /// Also write decompiled high-level source when a decompiler is available.
    pub hlsl: bool,

    /// Also write the declared bindings.
    pub consts: bool,
}

/// Writes `contents` unless the file is already there. Returns whether it wrote anything.
fn write_new(path: &Path, contents: &[u8]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    std::fs::write(path, contents).wrap_err_with(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

/// High-level source with the assembly appended as a comment, so the file still compiles.
fn hlsl_with_assembly(hlsl: &str, assembly: &str) -> String {
    let mut text = hlsl.trim_end().to_string();

    text.push_str("\n\n/****************************** assembly ******************************\n");

    for line in assembly.lines() {
        // A stray terminator inside the dump would end the comment early.
        text.push_str(&line.replace("*/", "* /"));
        text.push('\n');
    }

    text.push_str("*/\n");
    text
}

/// Exports one shader into `dir`. Existing files are left alone, since they may have been
/// edited. Returns the files that were written.
pub fn export(
    dir: &Path,
    hash: ShaderHash,
    stage: Stage,
    bytecode: &[u8],
    decompiler: Option<&dyn Decompiler>,
    options: ExportOptions,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).wrap_err_with(|| format!("failed to create {}", dir.display()))?;

    let mut written = vec![];

    let assembly = match asm::disassemble(bytecode) {
        Ok(assembly) => assembly,
        Err(err) => {
            log::warn!("Unable to disassemble {}-{}: {:?}. Exporting the binary instead.", hash, stage, err);

            let path = dir.join(files::file_name(hash, stage, SourceKind::Binary));

            if write_new(&path, bytecode)? {
                written.push(path);
            }

            return Ok(written);
        }
    };

    let path = dir.join(files::file_name(hash, stage, SourceKind::Assembly));

    if write_new(&path, assembly.as_bytes())? {
        written.push(path);
    }

    if let (true, Some(decompiler)) = (options.hlsl, decompiler) {
        let path = dir.join(files::file_name(hash, stage, SourceKind::Hlsl));

        if !path.exists() {
            match decompiler.decompile(bytecode, &assembly) {
                Ok(hlsl) => {
                    write_new(&path, hlsl_with_assembly(&hlsl, &assembly).as_bytes())?;
                    written.push(path);
                }

                Err(err) => log::warn!("Unable to decompile {}-{}: {}", hash, stage, err),
            }
        }
    }

    if options.consts {
        let path = dir.join(files::consts_file_name(hash, stage));

        match asm::declared_bindings(bytecode) {
            Ok(bindings) => {
                if write_new(&path, asm::bindings::render(&bindings).as_bytes())? {
                    written.push(path);
                }
            }

            Err(err) => log::warn!("Unable to read bindings of {}-{}: {:?}", hash, stage, err),
        }
    }

    if !written.is_empty() {
        log::info!("Exported {}-{} to {}", hash, stage, dir.display());
    }

    Ok(written)
}

/// Copies a shader's exports from the cache into the fixes directory, exporting it first if
/// needed. Files already in the fixes directory are never overwritten.
pub fn copy_to_fixes(
    cache_dir: &Path,
    fixes_dir: &Path,
    hash: ShaderHash,
    stage: Stage,
    bytecode: &[u8],
    decompiler: Option<&dyn Decompiler>,
    options: ExportOptions,
) -> Result<Vec<PathBuf>> {
    export(cache_dir, hash, stage, bytecode, decompiler, options)?;

    std::fs::create_dir_all(fixes_dir).wrap_err_with(|| format!("failed to create {}", fixes_dir.display()))?;

    let names = [
        files::file_name(hash, stage, SourceKind::Hlsl),
        files::file_name(hash, stage, SourceKind::Assembly),
        files::file_name(hash, stage, SourceKind::Binary),
        files::consts_file_name(hash, stage),
    ];

    let mut copied = vec![];

    for name in names.iter() {
        let from = cache_dir.join(name);
        let to = fixes_dir.join(name);

        if !from.is_file() || to.exists() {
            continue;
        }

        std::fs::copy(&from, &to).wrap_err_with(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
        copied.push(to);
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MockDecompiler};

    const OPTIONS: ExportOptions = ExportOptions { hlsl: true, consts: true };

    #[test]
    fn exports_every_form() {
        let dir = tempfile::tempdir().unwrap();
        let bytecode = testing::pixel_shader("0.5");
        let hash = ShaderHash::of(&bytecode);

        let written = export(dir.path(), hash, Stage::Pixel, &bytecode, Some(&MockDecompiler), OPTIONS).unwrap();
        assert_eq!(written.len(), 3);

        let assembly = std::fs::read_to_string(dir.path().join(format!("{}-ps.txt", hash))).unwrap();
        assert!(assembly.starts_with("ps_5_0"));

        let hlsl = std::fs::read_to_string(dir.path().join(format!("{}-ps_replace.txt", hash))).unwrap();
        assert!(hlsl.starts_with("// decompiled"));
        assert!(hlsl.contains("/*****"));
        assert!(hlsl.trim_end().ends_with("*/"));

        let consts = std::fs::read_to_string(dir.path().join(format!("{}-ps-consts.txt", hash))).unwrap();
        assert!(consts.contains("cb"));

        // Nothing is rewritten the second time.
        let again = export(dir.path(), hash, Stage::Pixel, &bytecode, Some(&MockDecompiler), OPTIONS).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn unreadable_bytecode_is_exported_as_binary() {
        let dir = tempfile::tempdir().unwrap();
        let hash = ShaderHash::of(b"garbage");

        let written = export(dir.path(), hash, Stage::Vertex, b"garbage", None, OPTIONS).unwrap();
        assert_eq!(written, vec![dir.path().join(format!("{}-vs.bin", hash))]);
    }

    #[test]
    fn marking_copies_without_overwriting() {
        let cache = tempfile::tempdir().unwrap();
        let fixes = tempfile::tempdir().unwrap();
        let bytecode = testing::pixel_shader("0.5");
        let hash = ShaderHash::of(&bytecode);

        let edited = fixes.path().join(format!("{}-ps.txt", hash));
        std::fs::write(&edited, "edited").unwrap();

        let options = ExportOptions { hlsl: false, consts: true };
        let copied = copy_to_fixes(cache.path(), fixes.path(), hash, Stage::Pixel, &bytecode, None, options).unwrap();

        assert_eq!(copied, vec![fixes.path().join(format!("{}-ps-consts.txt", hash))]);
        assert_eq!(std::fs::read_to_string(&edited).unwrap(), "edited");
    }

    #[test]
    fn assembly_comment_cannot_close_early() {
        let text = hlsl_with_assembly("float4 main() : SV_Target { return 0; }\n", "ps_5_0\n// a */ b\nret\n");

        assert_eq!(text.matches("*/").count(), 1);
        assert!(text.ends_with("*/\n"));
    }
}
