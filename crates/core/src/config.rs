use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::UpscaleError;
use crate::model::registry::{DEFAULT_DENOISE_MODEL, DEFAULT_UPSCALE_MODEL};
use crate::model::store::DEFAULT_ONNX_PLANES;
use crate::pipeline::{UpscaleOptions, DEFAULT_FINAL_SCALE};
use crate::resize::ResizeAlgorithm;
use crate::tiling::{DEFAULT_TILE_MARGIN, DEFAULT_TILE_SIZE};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "WAIFU2X_DATA_DIR";
pub const ENV_SCALE: &str = "SCALE";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub models: ModelsConfig,
    pub tiling: TilingConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelsConfig {
    /// Catalog name or path of the noise-reduction model.
    pub denoise: String,
    pub upscale: String,
    /// `cpu`, `cuda`, or `tensorrt`. Only affects ONNX models.
    pub backend: String,
    /// Plane count for ONNX models without catalog metadata.
    pub onnx_planes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TilingConfig {
    pub tile_size: usize,
    pub margin: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub final_scale: f64,
    /// `bilinear` or `nearest`.
    pub filter: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            denoise: DEFAULT_DENOISE_MODEL.to_string(),
            upscale: DEFAULT_UPSCALE_MODEL.to_string(),
            backend: "cpu".to_string(),
            onnx_planes: DEFAULT_ONNX_PLANES,
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            margin: DEFAULT_TILE_MARGIN,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            final_scale: DEFAULT_FINAL_SCALE,
            filter: ResizeAlgorithm::default().to_string(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .map_err(|e| UpscaleError::config(format!("invalid config TOML: {e}")))
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Pipeline options from this config, with `final_scale` taken from the
    /// CLI, then the `SCALE` environment variable, then the config file.
    pub fn upscale_options(&self, cli_scale: Option<f64>) -> Result<UpscaleOptions, UpscaleError> {
        let final_scale =
            resolve_final_scale(cli_scale, env::var(ENV_SCALE).ok(), self.output.final_scale)?;
        let options = UpscaleOptions {
            tile_size: self.tiling.tile_size,
            margin: self.tiling.margin,
            final_scale,
            filter: ResizeAlgorithm::from_str_lossy(&self.output.filter),
        };
        options.validate()?;
        Ok(options)
    }
}

pub fn resolve_final_scale(
    cli: Option<f64>,
    env_value: Option<String>,
    configured: f64,
) -> Result<f64, UpscaleError> {
    if let Some(scale) = cli {
        return Ok(scale);
    }
    match env_value.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw.parse::<f64>().map_err(|_| {
            UpscaleError::config(format!("{ENV_SCALE}={raw:?} is not a number"))
        }),
        _ => Ok(configured),
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. WAIFU2X_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
