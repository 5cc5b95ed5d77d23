//! Tiled 2x neural upscaling for still images.
//!
//! An image is cut into margined tiles, each tile is denoised and upscaled by
//! an [`inference::InferenceEngine`], the interiors are stitched onto a 2x
//! canvas, alpha is merged back, and the result is resampled to the final
//! scale.

pub mod alpha;
pub mod color;
pub mod compositor;
pub mod config;
pub mod error;
pub mod image_io;
pub mod inference;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod resize;
pub mod runtime;
pub mod tiling;
pub mod types;

pub use error::UpscaleError;
pub use pipeline::{UpscaleOptions, UpscaledImage, Upscaler};
