//! Reads `shaderfix.json`. The file is optional and never written back.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::hunting::MarkingMode;
use crate::shaders::ShaderHash;

pub const FILE_NAME: &str = "shaderfix.json";

/// What happens when a particular shader is bound.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Handling {
    /// Bind the active shader. This is the default.
    Normal,

    /// Skip every draw that uses the shader.
    Skip,
}

impl Default for Handling {
    fn default() -> Self {
        Handling::Normal
    }
}

#[derive(Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Debug)]
#[serde(default)]
pub struct ShaderOverride {
    pub handling: Handling,
}

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
#[serde(default)]
pub struct HuntingOptions {
    /// Whether hunting starts switched on. It can be toggled at runtime.
    pub enabled: bool,

    /// What a selected shader is swapped for.
    pub marking_mode: MarkingMode,
}

impl Default for HuntingOptions {
    fn default() -> Self {
        HuntingOptions {
            enabled: false,
            marking_mode: MarkingMode::Skip,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
#[serde(default)]
pub struct Config {
    /// Where override files are read from.
    pub fixes_dir: PathBuf,

    /// Where shaders are exported to.
    pub cache_dir: PathBuf,

    pub log_file: PathBuf,

    /// Export every shader the first time the game creates it.
    pub export_on_create: bool,

    /// Include decompiled source in exports when a decompiler is available.
    pub export_hlsl: bool,

    /// Include a dump of the declared bindings in exports.
    pub export_consts: bool,

    /// Shader model used to compile high-level source when the original's can't be read.
    pub default_shader_model: String,

    /// How long notices stay up, in seconds.
    pub notice_seconds: u64,

    pub hunting: HuntingOptions,

    /// Action name to key name. Actions missing here keep their default key, and an empty key
    /// name unbinds the action.
    pub keys: HashMap<String, String>,

    pub shader_overrides: HashMap<ShaderHash, ShaderOverride>,

    /// Only used with the `debug` feature.
    pub udp_log_address: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fixes_dir: PathBuf::from("ShaderFixes"),
            cache_dir: PathBuf::from("ShaderCache"),
            log_file: PathBuf::from("shaderfix.log"),
            export_on_create: false,
            export_hlsl: true,
            export_consts: false,
            default_shader_model: "5_0".to_string(),
            notice_seconds: 10,
            hunting: HuntingOptions::default(),
            keys: HashMap::new(),
            shader_overrides: HashMap::new(),
            udp_log_address: None,
        }
    }
}

impl Config {
    /// Attempts to parse the contents of `reader` to get a `Config` value.
    pub fn parse_json(reader: impl Read) -> Result<Config> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Reads the config file at `path`. A missing file is not an error.
    pub fn load_from_file(path: &Path) -> Result<Option<Config>> {
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?;
        Ok(Some(Config::parse_json(file)?))
    }

    /// Either loads the config from `path` or generates default values. When defaults are used
    /// the second value says why, for the caller to log once logging is up.
    pub fn load(path: &Path) -> (Config, Option<String>) {
        match Config::load_from_file(path) {
            Ok(Some(config)) => (config, None),

            Ok(None) => (
                Config::default(),
                Some(format!("No config file at {}. Defaults will be used.", path.display())),
            ),

            Err(err) => (
                Config::default(),
                Some(format!("Error loading config file: {:?}. Defaults will be used.", err)),
            ),
        }
    }

    /// Makes every relative path in the config relative to `base` instead of the working
    /// directory.
    pub fn resolve(mut self, base: &Path) -> Config {
        for path in [&mut self.fixes_dir, &mut self.cache_dir, &mut self.log_file] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }

        self
    }

    pub fn handling(&self, hash: ShaderHash) -> Handling {
        self.shader_overrides
            .get(&hash)
            .map(|rule| rule.handling)
            .unwrap_or_default()
    }
}
