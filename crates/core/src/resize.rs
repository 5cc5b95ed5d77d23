//! Pure-Rust nearest-neighbor and bilinear resizing for interleaved 8-bit data.

use anyhow::{bail, Result};

/// Supported resize algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeAlgorithm {
    #[default]
    Bilinear,
    Nearest,
}

impl ResizeAlgorithm {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "nearest" | "neighbor" | "nn" => Self::Nearest,
            _ => Self::Bilinear,
        }
    }
}

impl std::fmt::Display for ResizeAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bilinear => write!(f, "bilinear"),
            Self::Nearest => write!(f, "nearest"),
        }
    }
}

pub fn resize(
    algorithm: ResizeAlgorithm,
    src: &[u8],
    channels: usize,
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Result<Vec<u8>> {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        bail!("cannot resize {src_w}x{src_h} to {dst_w}x{dst_h}");
    }
    if src.len() != src_w * src_h * channels {
        bail!(
            "resize input length mismatch: expected {}, got {}",
            src_w * src_h * channels,
            src.len()
        );
    }

    Ok(match algorithm {
        ResizeAlgorithm::Nearest => resize_nearest(src, channels, src_w, src_h, dst_w, dst_h),
        ResizeAlgorithm::Bilinear => resize_bilinear(src, channels, src_w, src_h, dst_w, dst_h),
    })
}

/// Nearest-neighbor resize. At exactly 2x every source pixel becomes a 2x2 block.
pub(crate) fn resize_nearest(
    src: &[u8],
    channels: usize,
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * channels];

    for dst_y in 0..dst_h {
        let src_y = ((dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize;
        let src_y = src_y.min(src_h - 1);

        for dst_x in 0..dst_w {
            let src_x = ((dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize;
            let src_x = src_x.min(src_w - 1);

            let si = (src_y * src_w + src_x) * channels;
            let di = (dst_y * dst_w + dst_x) * channels;
            dst[di..di + channels].copy_from_slice(&src[si..si + channels]);
        }
    }

    dst
}

/// Same mapping as [`resize_nearest`], for `f32` planes.
pub(crate) fn resize_nearest_f32(
    src: &[f32],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<f32> {
    let mut dst = vec![0.0f32; dst_w * dst_h];
    for dst_y in 0..dst_h {
        let src_y = (((dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize).min(src_h - 1);
        for dst_x in 0..dst_w {
            let src_x =
                (((dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize).min(src_w - 1);
            dst[dst_y * dst_w + dst_x] = src[src_y * src_w + src_x];
        }
    }
    dst
}

pub(crate) fn resize_bilinear(
    src: &[u8],
    channels: usize,
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * channels];

    for dst_y in 0..dst_h {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y0 = src_y0.min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = src_xf.floor().max(0.0) as usize;
            let src_x0 = src_x0.min(src_w - 1);
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * channels;

            for c in 0..channels {
                let p00 = src[(src_y0 * src_w + src_x0) * channels + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * channels + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * channels + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * channels + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}
