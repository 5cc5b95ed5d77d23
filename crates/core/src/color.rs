//! Full-range BT.601 RGB <-> YCbCr conversion on planar `f32` data.

use crate::resize::resize_nearest_f32;

const KR: f32 = 0.299;
const KG: f32 = 0.587;
const KB: f32 = 0.114;
const CHROMA_OFFSET: f32 = 128.0;

pub fn rgb_to_ycbcr(r: f32, g: f32, b: f32) -> [f32; 3] {
    let y = KR * r + KG * g + KB * b;
    let cb = CHROMA_OFFSET + (b - y) / 1.772;
    let cr = CHROMA_OFFSET + (r - y) / 1.402;
    [y, cb, cr]
}

pub fn ycbcr_to_rgb(y: f32, cb: f32, cr: f32) -> [f32; 3] {
    let cb = cb - CHROMA_OFFSET;
    let cr = cr - CHROMA_OFFSET;
    let r = y + 1.402 * cr;
    let b = y + 1.772 * cb;
    let g = (y - KR * r - KB * b) / KG;
    [r, g, b]
}

/// Quantize a `[0, 255]`-domain sample: clip, then round to nearest.
#[inline]
pub fn quantize(v: f32) -> u8 {
    v.clamp(0.0, 255.0).round() as u8
}

/// Luma and chroma planes of a tile, in the `[0, 255]` domain.
#[derive(Debug, Clone, PartialEq)]
pub struct YCbCrPlanes {
    pub y: Vec<f32>,
    pub cb: Vec<f32>,
    pub cr: Vec<f32>,
    pub width: usize,
    pub height: usize,
}

impl YCbCrPlanes {
    pub fn from_rgb(pixels: &[u8], width: usize, height: usize) -> Self {
        let size = width * height;
        let mut y = Vec::with_capacity(size);
        let mut cb = Vec::with_capacity(size);
        let mut cr = Vec::with_capacity(size);
        for px in pixels.chunks_exact(3).take(size) {
            let [py, pcb, pcr] = rgb_to_ycbcr(px[0] as f32, px[1] as f32, px[2] as f32);
            y.push(py);
            cb.push(pcb);
            cr.push(pcr);
        }
        Self {
            y,
            cb,
            cr,
            width,
            height,
        }
    }

    /// Nearest-neighbor double of all three planes.
    pub fn upsample_2x_nearest(&self) -> Self {
        let (w, h) = (self.width * 2, self.height * 2);
        Self {
            y: resize_nearest_f32(&self.y, self.width, self.height, w, h),
            cb: resize_nearest_f32(&self.cb, self.width, self.height, w, h),
            cr: resize_nearest_f32(&self.cr, self.width, self.height, w, h),
            width: w,
            height: h,
        }
    }

    /// Convert back to interleaved 8-bit RGB.
    pub fn to_rgb(&self) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(self.width * self.height * 3);
        for ((&y, &cb), &cr) in self.y.iter().zip(&self.cb).zip(&self.cr) {
            let [r, g, b] = ycbcr_to_rgb(y, cb, cr);
            rgb.extend_from_slice(&[quantize(r), quantize(g), quantize(b)]);
        }
        rgb
    }
}
