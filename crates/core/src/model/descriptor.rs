//! JSON layer descriptors for convolutional upscaling models.
//!
//! A model file is an array of layers, each carrying its plane counts, kernel
//! size, weights laid out `[out][in][kH][kW]`, and one bias per output plane.
//! Unknown keys (`class_name`, `dW`, ...) are ignored.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::UpscaleError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    #[serde(rename = "nInputPlane")]
    pub n_input_plane: usize,
    #[serde(rename = "nOutputPlane")]
    pub n_output_plane: usize,
    #[serde(rename = "kW")]
    pub k_w: usize,
    #[serde(rename = "kH")]
    pub k_h: usize,
    pub weight: Vec<Vec<Vec<Vec<f32>>>>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub layers: Vec<LayerDescriptor>,
}

impl ModelDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model file: {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid model file: {}", path.display()))
    }

    /// Parse and validate. Malformed input is a configuration error.
    pub fn from_json(json: &str) -> Result<Self, UpscaleError> {
        let layers: Vec<LayerDescriptor> = serde_json::from_str(json)
            .map_err(|e| UpscaleError::config(format!("failed to parse model JSON: {e}")))?;
        let descriptor = Self { layers };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn input_planes(&self) -> usize {
        self.layers.first().map_or(0, |l| l.n_input_plane)
    }

    pub fn validate(&self) -> Result<(), UpscaleError> {
        let first = self
            .layers
            .first()
            .ok_or_else(|| UpscaleError::config("model has no layers"))?;

        if first.n_input_plane != 1 && first.n_input_plane != 3 {
            return Err(UpscaleError::config(format!(
                "model declares nInputPlane = {}, expected 1 or 3",
                first.n_input_plane
            )));
        }

        let mut planes = first.n_input_plane;
        for (index, layer) in self.layers.iter().enumerate() {
            if layer.n_input_plane != planes {
                return Err(UpscaleError::config(format!(
                    "layer {index}: nInputPlane = {} but previous layer produces {planes} planes",
                    layer.n_input_plane
                )));
            }
            layer.validate_shapes(index)?;
            planes = layer.n_output_plane;
        }

        if planes != first.n_input_plane {
            return Err(UpscaleError::config(format!(
                "model maps {} planes to {planes}; input and output plane counts must match",
                first.n_input_plane
            )));
        }

        Ok(())
    }
}

impl LayerDescriptor {
    fn validate_shapes(&self, index: usize) -> Result<(), UpscaleError> {
        let bad = |what: String| UpscaleError::config(format!("layer {index}: {what}"));

        if self.k_w == 0 || self.k_h == 0 {
            return Err(bad(format!("kernel size {}x{} is empty", self.k_w, self.k_h)));
        }
        if self.bias.len() != self.n_output_plane {
            return Err(bad(format!(
                "bias has {} values, expected {}",
                self.bias.len(),
                self.n_output_plane
            )));
        }
        if self.weight.len() != self.n_output_plane {
            return Err(bad(format!(
                "weight has {} output planes, expected {}",
                self.weight.len(),
                self.n_output_plane
            )));
        }
        for per_output in &self.weight {
            if per_output.len() != self.n_input_plane {
                return Err(bad(format!(
                    "weight has {} input planes, expected {}",
                    per_output.len(),
                    self.n_input_plane
                )));
            }
            for kernel in per_output {
                if kernel.len() != self.k_h || kernel.iter().any(|row| row.len() != self.k_w) {
                    return Err(bad(format!("kernel is not {}x{}", self.k_h, self.k_w)));
                }
            }
        }
        Ok(())
    }

    /// Weights flattened in `[out][in][kH][kW]` order.
    pub fn flat_weights(&self) -> Vec<f32> {
        self.weight
            .iter()
            .flatten()
            .flatten()
            .flatten()
            .copied()
            .collect()
    }
}
