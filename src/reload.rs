//! Rebuilds shaders from the files in the fixes directory and swaps them into the registry.
//!
//! A pass scans the directory, then handles each file on its own: unchanged files are skipped,
//! changed ones are compiled or assembled, validated and swapped in, and failures leave the
//! previous shader in place. Records whose file has gone are reverted at the end.

use std::fmt::{self, Display};
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{bail, ensure, format_err, Result, WrapErr};

use crate::asm;
use crate::driver::{DriverDevice, Stage};
use crate::notice::Level;
use crate::service::Service;
use crate::shaders::{files, Replacement, ShaderHash, SourceFile, SourceKind};

/// What a pass did with one file.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum FileOutcome {
    /// The file has not changed since its shader was last built.
    Unchanged,

    /// A new shader was built from the file and is now active.
    Recompiled,

    /// The file could not be turned into a shader. Whatever was active before still is.
    Failed(String),
}

#[derive(Clone, Debug, Default)]
pub struct ReloadReport {
    pub outcomes: Vec<(ShaderHash, PathBuf, FileOutcome)>,

    /// Hashes that went back to their original because their file disappeared.
    pub reverted: Vec<ShaderHash>,
}

impl ReloadReport {
    pub fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, _, outcome)| pred(outcome)).count()
    }

    pub fn outcome(&self, hash: ShaderHash) -> Option<&FileOutcome> {
        self.outcomes
            .iter()
            .find(|(found, _, _)| *found == hash)
            .map(|(_, _, outcome)| outcome)
    }

    pub fn summary(&self) -> String {
        format!(
            "Reloaded shaders: {} rebuilt, {} unchanged, {} failed, {} reverted",
            self.count(|outcome| *outcome == FileOutcome::Recompiled),
            self.count(|outcome| *outcome == FileOutcome::Unchanged),
            self.count(|outcome| matches!(outcome, FileOutcome::Failed(_))),
            self.reverted.len()
        )
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ReloadError {
    /// Another pass is still running.
    Busy,

    /// The fixes directory could not be read. Nothing was changed.
    Scan(String),
}

impl Display for ReloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadError::Busy => f.write_str("a reload is already running"),
            ReloadError::Scan(reason) => write!(f, "unable to scan for shaders: {}", reason),
        }
    }
}

impl std::error::Error for ReloadError {}

/// Picks the compiler profile for a high-level source file: the original's shader model if it
/// can be read, otherwise the configured default.
fn profile(original: Option<&[u8]>, stage: Stage, default_model: &str) -> String {
    match original.and_then(asm::shader_version) {
        Some(version) if version.stage == stage => version.to_string(),
        _ => format!("{}_{}", stage, default_model),
    }
}

fn build(service: &Service, file: &SourceFile, original: Option<&[u8]>) -> Result<Vec<u8>> {
    let bytecode = match file.kind {
        SourceKind::Hlsl => {
            let source = std::fs::read_to_string(&file.path).wrap_err("failed to read source")?;

            let compiler = match service.compiler() {
                Some(compiler) => compiler,
                None => bail!("no shader compiler is available"),
            };

            let name = file.path.file_name().and_then(|name| name.to_str()).unwrap_or("shader");
            let profile = profile(original, file.stage, &service.config().default_shader_model);

            compiler
                .compile(&source, name, &profile)
                .map_err(|err| format_err!("compile error: {}", err.trim()))?
        }

        SourceKind::Assembly => {
            let source = std::fs::read_to_string(&file.path).wrap_err("failed to read assembly")?;

            // Keep the original's signature chunks where there is an original to take them from.
            match original {
                Some(original) => asm::assemble_into(&source, original)?,
                None => asm::assemble(&source)?,
            }
        }

        SourceKind::Binary => std::fs::read(&file.path).wrap_err("failed to read binary")?,
    };

    asm::validate(&bytecode).wrap_err("built shader is not a valid container")?;

    let version = asm::shader_version(&bytecode).ok_or_else(|| format_err!("built shader has no version"))?;

    ensure!(
        version.stage == file.stage,
        "file is named for a {} shader but contains {}",
        file.stage,
        version
    );

    Ok(bytecode)
}

/// Handles one file. Also used when the game creates a shader that already has a file.
pub(crate) fn load_file(service: &Service, device: &dyn DriverDevice, file: &SourceFile) -> FileOutcome {
    let registry = service.registry();

    registry.ensure_record(file.hash, file.stage);
    registry.mark_found(file.hash);

    let state = registry.with_record(file.hash, |record| {
        let unchanged = record.source_timestamp == Some(file.modified)
            && record
                .replacement
                .as_ref()
                .map_or(false, |replacement| replacement.path == file.path);

        (
            unchanged,
            record.stage,
            record.original.as_ref().map(|original| original.bytecode.clone()),
        )
    });

    let (unchanged, stage, original) = match state {
        Some(state) => state,
        None => return FileOutcome::Failed("record disappeared".to_string()),
    };

    if stage != file.stage {
        let reason = format!("{} is a {} shader, but the file is named for {}", file.hash, stage, file.stage);

        service.notices().post(
            Level::Error,
            format!("Failed to load {}: {}", file.path.display(), reason),
        );

        return FileOutcome::Failed(reason);
    }

    if unchanged {
        return FileOutcome::Unchanged;
    }

    let built = build(service, file, original.as_deref()).and_then(|bytecode| {
        let shader = device
            .create_shader(file.stage, &bytecode)
            .map_err(|err| format_err!("driver refused the shader: {}", err))?;

        Ok((shader, bytecode))
    });

    let (shader, bytecode) = match built {
        Ok(built) => built,
        Err(err) => {
            let reason = format!("{:#}", err);

            service.notices().post(
                Level::Error,
                format!("Failed to load {}: {}", file.path.display(), reason),
            );

            return FileOutcome::Failed(reason);
        }
    };

    let stale = registry.install(
        file.hash,
        Replacement {
            shader,
            bytecode: Arc::from(bytecode),
            kind: file.kind,
            path: file.path.clone(),
        },
        file.modified,
    );

    // The displaced shader is released here, outside the registry lock.
    drop(stale);

    log::info!("Loaded {} from {}", file.hash, file.path.display());
    FileOutcome::Recompiled
}

/// Runs one pass over the fixes directory.
pub(crate) fn run(service: &Service, device: &dyn DriverDevice) -> Result<ReloadReport, ReloadError> {
    let dir = &service.config().fixes_dir;

    let files = files::scan(dir).map_err(|err| {
        log::error!("Unable to scan {}: {:?}", dir.display(), err);
        ReloadError::Scan(format!("{:#}", err))
    })?;

    let registry = service.registry();
    registry.clear_found();

    let mut report = ReloadReport::default();

    for file in &files {
        let outcome = load_file(service, device, file);
        log::debug!("{}: {:?}", file.path.display(), outcome);

        report.outcomes.push((file.hash, file.path.clone(), outcome));
    }

    let stale = registry.revert_unfound();

    for (hash, replacement) in &stale {
        log::info!("{} reverted, {} is gone", hash, replacement.path.display());
    }

    report.reverted = stale.into_iter().map(|(hash, _)| hash).collect();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_follows_original() {
        let vertex = crate::testing::vertex_shader();

        assert_eq!(profile(Some(&vertex), Stage::Vertex, "4_0"), "vs_5_0");
        assert_eq!(profile(None, Stage::Pixel, "4_0"), "ps_4_0");
        assert_eq!(profile(Some(b"junk"), Stage::Hull, "5_0"), "hs_5_0");

        // A mismatched original is ignored.
        assert_eq!(profile(Some(&vertex), Stage::Pixel, "5_0"), "ps_5_0");
    }

    #[test]
    fn report_summary() {
        let report = ReloadReport {
            outcomes: vec![
                (ShaderHash(1), "a".into(), FileOutcome::Recompiled),
                (ShaderHash(2), "b".into(), FileOutcome::Failed("x".to_string())),
                (ShaderHash(3), "c".into(), FileOutcome::Unchanged),
            ],
            reverted: vec![ShaderHash(4)],
        };

        assert_eq!(
            report.summary(),
            "Reloaded shaders: 1 rebuilt, 1 unchanged, 1 failed, 1 reverted"
        );

        assert_eq!(report.outcome(ShaderHash(3)), Some(&FileOutcome::Unchanged));
        assert_eq!(report.outcome(ShaderHash(9)), None);
    }
}
