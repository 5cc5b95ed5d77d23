//! Boundary between the tiling engine and the neural models.
//!
//! [`InferenceEngine`] is a pure tensor-to-tensor function over normalized
//! `(C, H, W)` data. [`InferenceAdapter`] owns one engine per pass and does the
//! color-space and normalization work around each call, so the tile pipeline
//! only ever sees 8-bit RGB.

use anyhow::{bail, Context, Result};
use ndarray::Array3;
use tracing::{debug, trace};

use crate::color::{quantize, YCbCrPlanes};
use crate::error::UpscaleError;
use crate::resize::resize_nearest;
use crate::types::{ProcessedTile, Tile};

pub trait InferenceEngine: Send {
    /// Channel count consumed and produced: 1 (luma) or 3 (RGB).
    fn input_planes(&self) -> usize;

    /// Run the network on a `(C, H, W)` tensor with values in `[0, 1]`.
    /// Must return a tensor of the same shape.
    fn infer(&mut self, input: Array3<f32>) -> Result<Array3<f32>>;

    fn describe(&self) -> String {
        format!("{}-plane model", self.input_planes())
    }
}

/// Returns its input unchanged. Handy for exercising the tile pipeline
/// without weights.
#[derive(Debug, Clone, Copy)]
pub struct IdentityEngine {
    planes: usize,
}

impl IdentityEngine {
    pub fn new(planes: usize) -> Self {
        Self { planes }
    }
}

impl InferenceEngine for IdentityEngine {
    fn input_planes(&self) -> usize {
        self.planes
    }

    fn infer(&mut self, input: Array3<f32>) -> Result<Array3<f32>> {
        Ok(input)
    }

    fn describe(&self) -> String {
        format!("identity ({} planes)", self.planes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Noise reduction; output has the input's resolution.
    Denoise,
    /// 2x upscale; the tile is doubled nearest-neighbor before inference.
    Upscale,
}

impl std::fmt::Display for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Denoise => write!(f, "denoise"),
            Self::Upscale => write!(f, "upscale"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Only luma goes through the network; chroma is carried alongside.
    Luma,
    Rgb,
}

impl ChannelMode {
    pub fn from_planes(planes: usize) -> Result<Self, UpscaleError> {
        match planes {
            1 => Ok(Self::Luma),
            3 => Ok(Self::Rgb),
            n => Err(UpscaleError::config(format!(
                "model declares nInputPlane = {n}, expected 1 or 3"
            ))),
        }
    }

    pub fn planes(self) -> usize {
        match self {
            Self::Luma => 1,
            Self::Rgb => 3,
        }
    }
}

struct PassModel {
    engine: Box<dyn InferenceEngine>,
    mode: ChannelMode,
}

impl PassModel {
    fn new(engine: Box<dyn InferenceEngine>, pass: Pass) -> Result<Self, UpscaleError> {
        let mode = ChannelMode::from_planes(engine.input_planes()).map_err(|e| match e {
            UpscaleError::Config(msg) => UpscaleError::Config(format!("{pass} model: {msg}")),
            other => other,
        })?;
        Ok(Self { engine, mode })
    }
}

/// Holds the denoise and upscale models and applies them to tiles.
pub struct InferenceAdapter {
    denoise: PassModel,
    upscale: PassModel,
}

impl InferenceAdapter {
    /// Fails with a configuration error if either model is not 1- or 3-plane.
    pub fn new(
        denoise: Box<dyn InferenceEngine>,
        upscale: Box<dyn InferenceEngine>,
    ) -> Result<Self, UpscaleError> {
        let denoise = PassModel::new(denoise, Pass::Denoise)?;
        let upscale = PassModel::new(upscale, Pass::Upscale)?;
        debug!(
            denoise = %denoise.engine.describe(),
            upscale = %upscale.engine.describe(),
            "Inference adapter ready"
        );
        Ok(Self { denoise, upscale })
    }

    pub fn mode(&self, pass: Pass) -> ChannelMode {
        match pass {
            Pass::Denoise => self.denoise.mode,
            Pass::Upscale => self.upscale.mode,
        }
    }

    /// Denoise then upscale one margined tile.
    pub fn process(&mut self, tile: &Tile) -> Result<ProcessedTile> {
        let denoised = self.run(tile, Pass::Denoise)?;
        let upscaled = self.run(&denoised, Pass::Upscale)?;

        if upscaled.width != tile.width * 2 || upscaled.height != tile.height * 2 {
            bail!(
                "two-pass output is {}x{}, expected {}x{}",
                upscaled.width,
                upscaled.height,
                tile.width * 2,
                tile.height * 2
            );
        }

        Ok(ProcessedTile {
            width: upscaled.width,
            height: upscaled.height,
            pixels: upscaled.pixels,
        })
    }

    /// Apply a single pass. Production code goes through [`Self::process`].
    pub fn run(&mut self, tile: &Tile, pass: Pass) -> Result<Tile> {
        let model = match pass {
            Pass::Denoise => &mut self.denoise,
            Pass::Upscale => &mut self.upscale,
        };
        trace!(%pass, width = tile.width, height = tile.height, "Running pass");
        match model.mode {
            ChannelMode::Luma => run_luma(model.engine.as_mut(), tile, pass),
            ChannelMode::Rgb => run_rgb(model.engine.as_mut(), tile, pass),
        }
        .with_context(|| format!("{pass} pass failed"))
    }
}

fn run_luma(engine: &mut dyn InferenceEngine, tile: &Tile, pass: Pass) -> Result<Tile> {
    let mut planes = YCbCrPlanes::from_rgb(&tile.pixels, tile.width, tile.height);
    if pass == Pass::Upscale {
        planes = planes.upsample_2x_nearest();
    }
    let (w, h) = (planes.width, planes.height);

    let luma: Vec<f32> = planes.y.iter().map(|v| v / 255.0).collect();
    let input = Array3::from_shape_vec((1, h, w), luma).context("failed to shape luma input")?;
    let output = engine.infer(input)?;
    check_output_shape(&output, 1, h, w)?;

    planes.y = output
        .iter()
        .map(|v| (v * 255.0).clamp(0.0, 255.0).round())
        .collect();

    Ok(Tile {
        width: w,
        height: h,
        pixels: planes.to_rgb(),
    })
}

fn run_rgb(engine: &mut dyn InferenceEngine, tile: &Tile, pass: Pass) -> Result<Tile> {
    let (pixels, w, h) = match pass {
        Pass::Denoise => (tile.pixels.clone(), tile.width, tile.height),
        Pass::Upscale => {
            let (w, h) = (tile.width * 2, tile.height * 2);
            let doubled = resize_nearest(&tile.pixels, 3, tile.width, tile.height, w, h);
            (doubled, w, h)
        }
    };

    let mut input = Array3::<f32>::zeros((3, h, w));
    for (i, px) in pixels.chunks_exact(3).enumerate() {
        let (y, x) = (i / w, i % w);
        for c in 0..3 {
            input[[c, y, x]] = px[c] as f32 / 255.0;
        }
    }

    let output = engine.infer(input)?;
    check_output_shape(&output, 3, h, w)?;

    let mut rgb = vec![0u8; w * h * 3];
    for ((c, y, x), v) in output.indexed_iter() {
        rgb[(y * w + x) * 3 + c] = quantize(v * 255.0);
    }

    Ok(Tile {
        width: w,
        height: h,
        pixels: rgb,
    })
}

fn check_output_shape(output: &Array3<f32>, planes: usize, h: usize, w: usize) -> Result<()> {
    if output.dim() != (planes, h, w) {
        let (c, oh, ow) = output.dim();
        bail!("model returned shape ({c}, {oh}, {ow}), expected ({planes}, {h}, {w})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantEngine {
        planes: usize,
        value: f32,
    }

    impl InferenceEngine for ConstantEngine {
        fn input_planes(&self) -> usize {
            self.planes
        }

        fn infer(&mut self, input: Array3<f32>) -> Result<Array3<f32>> {
            Ok(Array3::from_elem(input.dim(), self.value))
        }
    }

    struct HalvingEngine;

    impl InferenceEngine for HalvingEngine {
        fn input_planes(&self) -> usize {
            3
        }

        fn infer(&mut self, input: Array3<f32>) -> Result<Array3<f32>> {
            let (c, h, w) = input.dim();
            Ok(Array3::zeros((c, h / 2, w / 2)))
        }
    }

    fn checker_tile(w: usize, h: usize) -> Tile {
        let mut pixels = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                let v = if (x + y) % 2 == 0 { 30 } else { 220 };
                pixels.extend_from_slice(&[v, 255 - v, 100]);
            }
        }
        Tile {
            width: w,
            height: h,
            pixels,
        }
    }

    fn identity_adapter(denoise_planes: usize, upscale_planes: usize) -> InferenceAdapter {
        InferenceAdapter::new(
            Box::new(IdentityEngine::new(denoise_planes)),
            Box::new(IdentityEngine::new(upscale_planes)),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_unsupported_plane_count() {
        let err = InferenceAdapter::new(
            Box::new(IdentityEngine::new(2)),
            Box::new(IdentityEngine::new(3)),
        )
        .err()
        .expect("should fail");
        assert!(matches!(err, UpscaleError::Config(_)));
        assert!(err.to_string().contains("denoise model"));
        assert!(err.to_string().contains("nInputPlane = 2"));
    }

    #[test]
    fn test_mode_follows_planes() {
        let adapter = identity_adapter(1, 3);
        assert_eq!(adapter.mode(Pass::Denoise), ChannelMode::Luma);
        assert_eq!(adapter.mode(Pass::Upscale), ChannelMode::Rgb);
    }

    #[test]
    fn test_rgb_identity_process_is_nearest_double() {
        let mut adapter = identity_adapter(3, 3);
        let tile = checker_tile(5, 3);
        let out = adapter.process(&tile).unwrap();
        assert_eq!((out.width, out.height), (10, 6));
        let expected = resize_nearest(&tile.pixels, 3, 5, 3, 10, 6);
        assert_eq!(out.pixels, expected);
    }

    #[test]
    fn test_luma_identity_process_preserves_colors() {
        let mut adapter = identity_adapter(1, 1);
        let tile = checker_tile(4, 4);
        let out = adapter.process(&tile).unwrap();
        assert_eq!((out.width, out.height), (8, 8));
        let expected = resize_nearest(&tile.pixels, 3, 4, 4, 8, 8);
        for (a, b) in out.pixels.iter().zip(&expected) {
            assert!((*a as i32 - *b as i32).abs() <= 2, "{a} vs {b}");
        }
    }

    #[test]
    fn test_denoise_pass_keeps_resolution() {
        let mut adapter = identity_adapter(1, 3);
        let tile = checker_tile(7, 2);
        let out = adapter.run(&tile, Pass::Denoise).unwrap();
        assert_eq!((out.width, out.height), (7, 2));
    }

    #[test]
    fn test_output_is_clipped_to_byte_range() {
        let mut adapter = InferenceAdapter::new(
            Box::new(ConstantEngine {
                planes: 3,
                value: 4.0,
            }),
            Box::new(ConstantEngine {
                planes: 3,
                value: -1.0,
            }),
        )
        .unwrap();
        let tile = checker_tile(2, 2);
        let denoised = adapter.run(&tile, Pass::Denoise).unwrap();
        assert!(denoised.pixels.iter().all(|&v| v == 255));
        let out = adapter.process(&tile).unwrap();
        assert!(out.pixels.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_luma_output_replaces_only_brightness() {
        // Gray input, luma forced to mid-gray: chroma stays neutral.
        let mut adapter = InferenceAdapter::new(
            Box::new(ConstantEngine {
                planes: 1,
                value: 0.5,
            }),
            Box::new(IdentityEngine::new(1)),
        )
        .unwrap();
        let tile = Tile {
            width: 1,
            height: 1,
            pixels: vec![10, 10, 10],
        };
        let out = adapter.run(&tile, Pass::Denoise).unwrap();
        assert_eq!(out.pixels, vec![128, 128, 128]);
    }

    #[test]
    fn test_wrong_output_shape_is_an_error() {
        let mut adapter = InferenceAdapter::new(
            Box::new(IdentityEngine::new(3)),
            Box::new(HalvingEngine),
        )
        .unwrap();
        let err = adapter.process(&checker_tile(4, 4)).unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("upscale pass failed"), "{chain}");
        assert!(chain.contains("expected (3, 8, 8)"), "{chain}");
    }
}
