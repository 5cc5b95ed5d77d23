//! Error classes for the upscaling pipeline.
//!
//! Callers mostly see these wrapped in `anyhow::Error`; the batch driver
//! downcasts to decide whether a failure is per-image or fatal for the run.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum UpscaleError {
    /// Malformed or unsupported model descriptor, or invalid tiling/output
    /// settings. Surfaced before any tile is processed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The input image could not be read or decoded.
    #[error("failed to decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    /// The inference engine failed or returned a tensor of the wrong shape.
    #[error("inference failed on tile {tile_index}: {reason}")]
    Inference { tile_index: usize, reason: String },

    /// The final scale leaves this image with no pixels (or too many).
    #[error("scale {scale} maps {width}x{height} to an unusable output size")]
    OutputSize { width: u32, height: u32, scale: f64 },
}

impl UpscaleError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True for errors that should abort a whole batch rather than one image.
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Classify an `anyhow` chain by its first `UpscaleError`, if any.
pub fn classify(error: &anyhow::Error) -> Option<&UpscaleError> {
    error.chain().find_map(|cause| cause.downcast_ref::<UpscaleError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_config_is_fatal_for_batch() {
        assert!(UpscaleError::config("bad planes").is_fatal_for_batch());
        let decode = UpscaleError::Decode {
            path: PathBuf::from("a.png"),
            reason: "truncated".to_string(),
        };
        assert!(!decode.is_fatal_for_batch());
        let inference = UpscaleError::Inference {
            tile_index: 3,
            reason: "shape".to_string(),
        };
        assert!(!inference.is_fatal_for_batch());
        let size = UpscaleError::OutputSize {
            width: 1,
            height: 1,
            scale: 0.5,
        };
        assert!(!size.is_fatal_for_batch());
    }

    #[test]
    fn test_classify_finds_wrapped_error() {
        let result: anyhow::Result<()> = Err(UpscaleError::Inference {
            tile_index: 7,
            reason: "engine crashed".to_string(),
        })
        .context("processing input.png");
        let error = result.unwrap_err();
        match classify(&error) {
            Some(UpscaleError::Inference { tile_index, .. }) => assert_eq!(*tile_index, 7),
            other => panic!("expected inference error, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_plain_anyhow_is_none() {
        let error = anyhow::anyhow!("something else");
        assert!(classify(&error).is_none());
    }

    #[test]
    fn test_decode_message_includes_path() {
        let error = UpscaleError::Decode {
            path: PathBuf::from("input/cat.jpg"),
            reason: "unsupported format".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "failed to decode input/cat.jpg: unsupported format"
        );
    }
}
