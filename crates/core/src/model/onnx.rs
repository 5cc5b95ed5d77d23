//! ONNX Runtime engine for exported upscaling models.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use ndarray::{Array3, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use super::backend::{build_session, InferenceBackend, SessionConfig};
use crate::inference::InferenceEngine;

/// Runs a `(1, C, H, W)` model through an `ort::Session`.
///
/// ONNX graphs rarely carry a trustworthy channel count, so the plane count
/// is supplied by the caller from the model catalog or configuration.
pub struct OnnxEngine {
    session: Session,
    input_name: String,
    output_name: String,
    planes: usize,
    path: PathBuf,
}

impl OnnxEngine {
    pub fn load(
        path: &Path,
        planes: usize,
        backend: &InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        if planes != 1 && planes != 3 {
            bail!("ONNX model {} declared with {planes} planes, expected 1 or 3", path.display());
        }

        debug!(
            model = %path.display(),
            planes,
            %backend,
            "Loading ONNX upscaling model"
        );

        let session = build_session(&SessionConfig {
            model_path: path,
            backend,
            trt_cache_dir,
        })?;

        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();
        debug!(%input_name, %output_name, "Detected model IO");

        Ok(Self {
            session,
            input_name,
            output_name,
            planes,
            path: path.to_path_buf(),
        })
    }
}

impl InferenceEngine for OnnxEngine {
    fn input_planes(&self) -> usize {
        self.planes
    }

    fn infer(&mut self, input: Array3<f32>) -> Result<Array3<f32>> {
        let input_tensor = Tensor::from_array(input.insert_axis(Axis(0)))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        let batched = output_view.to_owned().into_dimensionality::<Ix4>()?;
        if batched.shape()[0] != 1 {
            bail!("model returned batch of {}, expected 1", batched.shape()[0]);
        }
        Ok(batched.index_axis_move(Axis(0), 0))
    }

    fn describe(&self) -> String {
        format!("{} (onnx, {} planes)", self.path.display(), self.planes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsupported_plane_count_before_loading() {
        let err = OnnxEngine::load(
            Path::new("does-not-exist.onnx"),
            4,
            &InferenceBackend::Cpu,
            None,
        )
        .err()
        .expect("should fail");
        assert!(err.to_string().contains("4 planes"));
    }
}
