//! Merge the source alpha plane into the assembled 2x canvas.

use anyhow::{bail, Result};
use tracing::trace;

use crate::compositor::{RgbaCanvas, Surface};
use crate::resize::resize_nearest;
use crate::types::AlphaPlane;

/// Nearest-neighbor resize `alpha` to the canvas size and overwrite only the
/// canvas alpha channel. Returns `false` when there was nothing to merge.
pub fn composite_alpha(alpha: Option<&AlphaPlane>, canvas: &mut RgbaCanvas) -> Result<bool> {
    let Some(plane) = alpha else {
        return Ok(false);
    };

    let (src_w, src_h) = (plane.width as usize, plane.height as usize);
    if src_w == 0 || src_h == 0 || plane.data.len() != src_w * src_h {
        bail!(
            "alpha plane {}x{} has {} values",
            plane.width,
            plane.height,
            plane.data.len()
        );
    }

    let (w, h) = (canvas.width(), canvas.height());
    let resized = resize_nearest(&plane.data, 1, src_w, src_h, w, h);
    for (px, a) in canvas.data_mut().chunks_exact_mut(4).zip(resized) {
        px[3] = a;
    }

    trace!(from_w = src_w, from_h = src_h, to_w = w, to_h = h, "Alpha merged");
    Ok(true)
}

/// Scale RGB by alpha in place, so filtering never pulls color out of
/// fully transparent pixels.
pub fn premultiply(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = u32::from(px[3]);
        for c in &mut px[..3] {
            *c = ((u32::from(*c) * a + 127) / 255) as u8;
        }
    }
}

/// Inverse of [`premultiply`]. Fully transparent pixels come back black.
pub fn unpremultiply(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = u32::from(px[3]);
        for c in &mut px[..3] {
            *c = if a == 0 {
                0
            } else {
                ((u32::from(*c) * 255 + a / 2) / a).min(255) as u8
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resize::{resize, ResizeAlgorithm};
    use crate::types::Rect;

    #[test]
    fn test_no_alpha_is_noop() {
        let mut canvas = RgbaCanvas::new(4, 4);
        let before = canvas.clone();
        assert!(!composite_alpha(None, &mut canvas).unwrap());
        assert_eq!(canvas, before);
    }

    #[test]
    fn test_alpha_is_doubled_and_rgb_untouched() {
        let mut canvas = RgbaCanvas::new(4, 2);
        canvas
            .put_rgb(
                Rect { x: 0, y: 0, width: 4, height: 2 },
                &[7u8; 4 * 2 * 3],
            )
            .unwrap();
        let plane = AlphaPlane {
            width: 2,
            height: 1,
            data: vec![0, 200],
        };

        assert!(composite_alpha(Some(&plane), &mut canvas).unwrap());

        let alpha: Vec<u8> = canvas.data().chunks_exact(4).map(|p| p[3]).collect();
        assert_eq!(alpha, vec![0, 0, 200, 200, 0, 0, 200, 200]);
        assert!(canvas.data().chunks_exact(4).all(|p| p[..3] == [7, 7, 7]));
    }

    #[test]
    fn test_premultiplied_bilinear_keeps_hidden_color_out() {
        let mut rgba = vec![255, 0, 0, 0, 0, 0, 255, 255];
        premultiply(&mut rgba);
        assert_eq!(rgba, vec![0, 0, 0, 0, 0, 0, 255, 255]);

        let mut out = resize(ResizeAlgorithm::Bilinear, &rgba, 4, 2, 1, 3, 1).unwrap();
        unpremultiply(&mut out);
        assert_eq!(&out[4..8], &[0, 0, 255, 128]);
        assert_eq!(&out[8..12], &[0, 0, 255, 255]);
    }

    #[test]
    fn test_unpremultiply_round_trips_opaque_and_translucent() {
        let original = vec![40, 80, 120, 128, 9, 200, 255, 255];
        let mut rgba = original.clone();
        premultiply(&mut rgba);
        unpremultiply(&mut rgba);
        assert_eq!(rgba, original);
    }

    #[test]
    fn test_rejects_inconsistent_plane() {
        let mut canvas = RgbaCanvas::new(2, 2);
        let plane = AlphaPlane {
            width: 2,
            height: 2,
            data: vec![1, 2, 3],
        };
        assert!(composite_alpha(Some(&plane), &mut canvas).is_err());
    }
}
