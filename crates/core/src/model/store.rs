//! Lazily-built, explicitly-owned inference adapter.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use super::backend::InferenceBackend;
use super::conv::ConvStack;
use super::onnx::OnnxEngine;
use super::registry::{verify_checksum, ModelFormat, ModelSource};
use crate::error::UpscaleError;
use crate::inference::{InferenceAdapter, InferenceEngine, Pass};

/// Plane count assumed for ONNX models the catalog has no metadata for.
pub const DEFAULT_ONNX_PLANES: usize = 3;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub denoise: ModelSource,
    pub upscale: ModelSource,
    pub backend: InferenceBackend,
    pub onnx_planes: usize,
    pub trt_cache_dir: Option<PathBuf>,
}

/// Owns the model sources and builds the [`InferenceAdapter`] on first use.
/// Every later image reuses the same adapter.
pub struct ModelStore {
    config: Option<StoreConfig>,
    adapter: Option<InferenceAdapter>,
}

impl ModelStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config: Some(config),
            adapter: None,
        }
    }

    /// Wrap an adapter that is already built, e.g. one with in-memory engines.
    pub fn preloaded(adapter: InferenceAdapter) -> Self {
        Self {
            config: None,
            adapter: Some(adapter),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn adapter(&mut self) -> Result<&mut InferenceAdapter> {
        if self.adapter.is_none() {
            let Some(config) = &self.config else {
                bail!("model store has neither an adapter nor model sources");
            };
            let adapter = build_adapter(config)?;
            self.adapter = Some(adapter);
        }
        self.adapter
            .as_mut()
            .context("inference adapter unavailable after loading")
    }
}

fn build_adapter(config: &StoreConfig) -> Result<InferenceAdapter> {
    let denoise = load_engine(&config.denoise, Pass::Denoise, config)?;
    let upscale = load_engine(&config.upscale, Pass::Upscale, config)?;
    let adapter = InferenceAdapter::new(denoise, upscale)?;
    info!(
        denoise = %config.denoise.name,
        upscale = %config.upscale.name,
        backend = %config.backend,
        "Models loaded"
    );
    Ok(adapter)
}

fn load_engine(
    source: &ModelSource,
    pass: Pass,
    config: &StoreConfig,
) -> Result<Box<dyn InferenceEngine>> {
    if !source.path.is_file() {
        return Err(UpscaleError::config(format!(
            "{pass} model '{}' not found at {}",
            source.name,
            source.path.display()
        ))
        .into());
    }
    verify_checksum(source)?;

    let engine: Box<dyn InferenceEngine> = match source.format {
        ModelFormat::Json => {
            if config.backend != InferenceBackend::Cpu {
                warn!(
                    model = %source.name,
                    backend = %config.backend,
                    "JSON models run on the CPU convolution engine; backend ignored"
                );
            }
            Box::new(ConvStack::load(&source.path)?)
        }
        ModelFormat::Onnx => Box::new(OnnxEngine::load(
            &source.path,
            source.input_planes.unwrap_or(config.onnx_planes),
            &config.backend,
            config.trt_cache_dir.as_deref(),
        )?),
    };
    Ok(engine)
}
