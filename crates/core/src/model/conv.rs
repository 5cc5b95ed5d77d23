//! CPU convolution stack built from JSON layer descriptors.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{s, Array1, Array3, Array4, Axis};
use tracing::debug;

use super::descriptor::{LayerDescriptor, ModelDescriptor};
use crate::inference::InferenceEngine;

const LEAKY_SLOPE: f32 = 0.1;

#[inline]
fn leaky_relu(v: f32) -> f32 {
    if v < 0.0 {
        v * LEAKY_SLOPE
    } else {
        v
    }
}

struct ConvLayer {
    /// `(out, in, kH, kW)`
    weight: Array4<f32>,
    bias: Array1<f32>,
}

impl ConvLayer {
    fn from_descriptor(layer: &LayerDescriptor) -> Result<Self> {
        let weight = Array4::from_shape_vec(
            (layer.n_output_plane, layer.n_input_plane, layer.k_h, layer.k_w),
            layer.flat_weights(),
        )
        .context("layer weights do not match declared shape")?;
        Ok(Self {
            weight,
            bias: Array1::from(layer.bias.clone()),
        })
    }

    /// Same-size convolution with zero padding, followed by leaky ReLU.
    fn apply(&self, input: &Array3<f32>) -> Array3<f32> {
        let (cin, h, w) = input.dim();
        let (cout, _, kh, kw) = self.weight.dim();
        let (pad_top, pad_left) = ((kh - 1) / 2, (kw - 1) / 2);

        let mut padded = Array3::<f32>::zeros((cin, h + kh - 1, w + kw - 1));
        padded
            .slice_mut(s![.., pad_top..pad_top + h, pad_left..pad_left + w])
            .assign(input);

        let mut out = Array3::<f32>::zeros((cout, h, w));
        for (o, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
            plane.fill(self.bias[o]);
            for i in 0..cin {
                let src = padded.index_axis(Axis(0), i);
                for ky in 0..kh {
                    for kx in 0..kw {
                        let k = self.weight[[o, i, ky, kx]];
                        if k == 0.0 {
                            continue;
                        }
                        plane.scaled_add(k, &src.slice(s![ky..ky + h, kx..kx + w]));
                    }
                }
            }
        }

        out.mapv_inplace(leaky_relu);
        out
    }
}

/// Sequential stack of convolutions evaluated on the CPU.
pub struct ConvStack {
    name: String,
    planes: usize,
    layers: Vec<ConvLayer>,
}

impl ConvStack {
    pub fn load(path: &Path) -> Result<Self> {
        let descriptor = ModelDescriptor::load(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let stack = Self::from_descriptor(name, &descriptor)?;
        debug!(
            model = %path.display(),
            layers = stack.layers.len(),
            planes = stack.planes,
            "Loaded convolution model"
        );
        Ok(stack)
    }

    pub fn from_descriptor(name: impl Into<String>, descriptor: &ModelDescriptor) -> Result<Self> {
        descriptor.validate()?;
        let layers = descriptor
            .layers
            .iter()
            .enumerate()
            .map(|(i, l)| ConvLayer::from_descriptor(l).with_context(|| format!("layer {i}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            planes: descriptor.input_planes(),
            layers,
        })
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

impl InferenceEngine for ConvStack {
    fn input_planes(&self) -> usize {
        self.planes
    }

    fn infer(&mut self, input: Array3<f32>) -> Result<Array3<f32>> {
        let mut x = input;
        for layer in &self.layers {
            x = layer.apply(&x);
        }
        Ok(x)
    }

    fn describe(&self) -> String {
        format!("{} ({} layers, {} planes)", self.name, self.layers.len(), self.planes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::descriptor::tests::pointwise_model_json;
    use serde_json::json;

    fn stack_from(raw: &str) -> ConvStack {
        let descriptor = ModelDescriptor::from_json(raw).unwrap();
        ConvStack::from_descriptor("test", &descriptor).unwrap()
    }

    #[test]
    fn test_pointwise_identity() {
        let mut stack = stack_from(&pointwise_model_json(1, 1.0, 0.0));
        let input = Array3::from_shape_fn((1, 3, 4), |(_, y, x)| (y * 4 + x) as f32 / 12.0);
        let out = stack.infer(input.clone()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_leaky_relu_scales_negatives() {
        let mut stack = stack_from(&pointwise_model_json(1, 1.0, -1.0));
        let input = Array3::from_elem((1, 2, 2), 0.5f32);
        let out = stack.infer(input).unwrap();
        for v in out.iter() {
            assert!((v + 0.05).abs() < 1e-6, "{v}");
        }
    }

    #[test]
    fn test_box_filter_uses_zero_padding() {
        let raw = json!([{
            "nInputPlane": 1, "nOutputPlane": 1, "kW": 3, "kH": 3,
            "weight": [[[[1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 1.0]]]],
            "bias": [0.0]
        }])
        .to_string();
        let mut stack = stack_from(&raw);
        let out = stack.infer(Array3::from_elem((1, 3, 3), 1.0f32)).unwrap();
        assert_eq!(out.dim(), (1, 3, 3));
        assert_eq!(out[[0, 1, 1]], 9.0);
        assert_eq!(out[[0, 0, 0]], 4.0);
        assert_eq!(out[[0, 0, 1]], 6.0);
    }

    #[test]
    fn test_kernel_is_cross_correlation() {
        // Only the right neighbour contributes.
        let raw = json!([{
            "nInputPlane": 1, "nOutputPlane": 1, "kW": 3, "kH": 1,
            "weight": [[[[0.0, 0.0, 1.0]]]],
            "bias": [0.0]
        }])
        .to_string();
        let mut stack = stack_from(&raw);
        let input = Array3::from_shape_vec((1, 1, 3), vec![0.1f32, 0.2, 0.3]).unwrap();
        let out = stack.infer(input).unwrap();
        assert_eq!(out.into_raw_vec_and_offset().0, vec![0.2, 0.3, 0.0]);
    }

    #[test]
    fn test_multi_layer_mixes_channels() {
        let raw = json!([
            {"nInputPlane": 1, "nOutputPlane": 2, "kW": 1, "kH": 1,
             "weight": [[[[1.0]]], [[[2.0]]]], "bias": [0.0, 0.0]},
            {"nInputPlane": 2, "nOutputPlane": 1, "kW": 1, "kH": 1,
             "weight": [[[[1.0]], [[0.5]]]], "bias": [0.25]}
        ])
        .to_string();
        let mut stack = stack_from(&raw);
        assert_eq!(stack.layer_count(), 2);
        assert_eq!(stack.input_planes(), 1);
        let out = stack.infer(Array3::from_elem((1, 1, 1), 0.5f32)).unwrap();
        // 0.5 + 0.5 * 1.0 + 0.25
        assert!((out[[0, 0, 0]] - 1.25).abs() < 1e-6);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise1_model.json");
        std::fs::write(&path, pointwise_model_json(3, 1.0, 0.0)).unwrap();
        let stack = ConvStack::load(&path).unwrap();
        assert_eq!(stack.input_planes(), 3);
        assert!(stack.describe().starts_with("noise1_model"));
    }
}
