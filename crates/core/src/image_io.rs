//! Decoding inputs and encoding PNG output with the `image` crate.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageReader};
use tracing::debug;

use crate::error::UpscaleError;
use crate::pipeline::UpscaledImage;
use crate::types::RawImage;

/// Extensions the batch driver treats as images.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "webp"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

pub fn decode(path: &Path) -> Result<RawImage, UpscaleError> {
    let decode_error = |reason: String| UpscaleError::Decode {
        path: path.to_path_buf(),
        reason,
    };
    let dynamic = ImageReader::open(path)
        .map_err(|e| decode_error(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_error(e.to_string()))?
        .decode()
        .map_err(|e| decode_error(e.to_string()))?;
    let image = into_raw(dynamic).map_err(|e| decode_error(format!("{e:#}")))?;
    debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        alpha = image.alpha().is_some(),
        "Decoded image"
    );
    Ok(image)
}

pub fn decode_bytes(bytes: &[u8]) -> Result<RawImage, UpscaleError> {
    let decode_error = |reason: String| UpscaleError::Decode {
        path: "<memory>".into(),
        reason,
    };
    let dynamic = image::load_from_memory(bytes).map_err(|e| decode_error(e.to_string()))?;
    into_raw(dynamic).map_err(|e| decode_error(format!("{e:#}")))
}

fn into_raw(dynamic: DynamicImage) -> Result<RawImage> {
    let rgba = dynamic.into_rgba8();
    let (width, height) = rgba.dimensions();
    RawImage::from_rgba(width, height, rgba.as_raw())
}

/// Encode as PNG: RGBA8 when the image carries alpha, RGB8 otherwise.
pub fn encode_png(image: &UpscaledImage) -> Result<Vec<u8>> {
    let opaque = !image.has_alpha || image.rgba.chunks_exact(4).all(|px| px[3] == u8::MAX);
    let mut out = Cursor::new(Vec::new());
    let encoder = PngEncoder::new(&mut out);

    if opaque {
        let rgb: Vec<u8> = image
            .rgba
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();
        encoder
            .write_image(&rgb, image.width, image.height, ExtendedColorType::Rgb8)
            .context("failed to encode RGB PNG")?;
    } else {
        encoder
            .write_image(&image.rgba, image.width, image.height, ExtendedColorType::Rgba8)
            .context("failed to encode RGBA PNG")?;
    }

    Ok(out.into_inner())
}

pub fn save_png(image: &UpscaledImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory {}", parent.display()))?;
    }
    let bytes = encode_png(image)?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ColorType, RgbaImage};

    fn png_bytes(img: &RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_bytes_drops_opaque_alpha() {
        let img = RgbaImage::from_pixel(3, 2, image::Rgba([9, 8, 7, 255]));
        let raw = decode_bytes(&png_bytes(&img)).unwrap();
        assert_eq!((raw.width(), raw.height()), (3, 2));
        assert!(raw.alpha().is_none());
        assert_eq!(raw.pixel(2, 1), [9, 8, 7]);
    }

    #[test]
    fn test_decode_bytes_keeps_translucent_alpha() {
        let img = RgbaImage::from_pixel(10, 10, image::Rgba([1, 2, 3, 128]));
        let raw = decode_bytes(&png_bytes(&img)).unwrap();
        assert_eq!(raw.alpha().unwrap().data.len(), 100);
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let err = decode_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, UpscaleError::Decode { .. }));
    }

    #[test]
    fn test_decode_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.png");
        match decode(&path) {
            Err(UpscaleError::Decode { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_opaque_as_rgb() {
        let image = UpscaledImage {
            width: 2,
            height: 1,
            rgba: vec![1, 2, 3, 255, 4, 5, 6, 255],
            has_alpha: false,
        };
        let bytes = encode_png(&image).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.color(), ColorType::Rgb8);
        assert_eq!(decoded.into_rgb8().into_raw(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_encode_translucent_as_rgba() {
        let image = UpscaledImage {
            width: 1,
            height: 1,
            rgba: vec![1, 2, 3, 100],
            has_alpha: true,
        };
        let bytes = encode_png(&image).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.color(), ColorType::Rgba8);
    }

    #[test]
    fn test_save_png_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/out.png");
        let image = UpscaledImage {
            width: 1,
            height: 1,
            rgba: vec![0, 0, 0, 255],
            has_alpha: false,
        };
        save_png(&image, &path).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_image(Path::new("a/b.PNG")));
        assert!(is_supported_image(Path::new("photo.jpeg")));
        assert!(!is_supported_image(Path::new("notes.txt")));
        assert!(!is_supported_image(Path::new("noext")));
    }
}
