use anyhow::{bail, Result};

/// Decoded source image: interleaved 8-bit RGB plus an optional alpha plane.
///
/// Immutable once built; every tile is read from the same buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    alpha: Option<AlphaPlane>,
}

/// Single-channel 8-bit mask, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlphaPlane {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RawImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>, alpha: Option<AlphaPlane>) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("image dimensions must be at least 1x1, got {width}x{height}");
        }
        let pixel_count = width as usize * height as usize;
        if pixels.len() != pixel_count * 3 {
            bail!(
                "RGB data length mismatch: expected {} ({}x{}x3), got {}",
                pixel_count * 3,
                width,
                height,
                pixels.len()
            );
        }
        if let Some(plane) = &alpha {
            if plane.width != width || plane.height != height || plane.data.len() != pixel_count {
                bail!(
                    "alpha plane {}x{} ({} values) does not match image {}x{}",
                    plane.width,
                    plane.height,
                    plane.data.len(),
                    width,
                    height
                );
            }
        }
        Ok(Self {
            width,
            height,
            pixels,
            alpha,
        })
    }

    /// Split interleaved RGBA8 into RGB and alpha. The alpha plane is dropped
    /// when every pixel is fully opaque.
    pub fn from_rgba(width: u32, height: u32, rgba: &[u8]) -> Result<Self> {
        let pixel_count = width as usize * height as usize;
        if rgba.len() != pixel_count * 4 {
            bail!(
                "RGBA data length mismatch: expected {} ({}x{}x4), got {}",
                pixel_count * 4,
                width,
                height,
                rgba.len()
            );
        }

        let mut pixels = Vec::with_capacity(pixel_count * 3);
        let mut alpha = Vec::with_capacity(pixel_count);
        for px in rgba.chunks_exact(4) {
            pixels.extend_from_slice(&px[..3]);
            alpha.push(px[3]);
        }

        let alpha = if alpha.iter().all(|&a| a == u8::MAX) {
            None
        } else {
            Some(AlphaPlane {
                width,
                height,
                data: alpha,
            })
        };

        Self::new(width, height, pixels, alpha)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn alpha(&self) -> Option<&AlphaPlane> {
        self.alpha.as_ref()
    }

    /// RGB triple at `(x, y)`. Coordinates must be in bounds.
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }
}

/// One cell of the tile grid plus its context margin, in source coordinates.
///
/// The origin may be negative: the margined extent is never shrunk to fit
/// the image, out-of-range samples are clamped during extraction instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    pub row: usize,
    pub col: usize,
    pub origin_x: i64,
    pub origin_y: i64,
    pub logical_width: usize,
    pub logical_height: usize,
    pub margin_x: usize,
    pub margin_y: usize,
}

impl TileSpec {
    pub fn margined_width(&self) -> usize {
        self.logical_width + 2 * self.margin_x
    }

    pub fn margined_height(&self) -> usize {
        self.logical_height + 2 * self.margin_y
    }

    /// Top-left of the logical region in source coordinates.
    pub fn logical_x(&self) -> usize {
        (self.origin_x + self.margin_x as i64) as usize
    }

    pub fn logical_y(&self) -> usize {
        (self.origin_y + self.margin_y as i64) as usize
    }

    /// Where the 2x interior of this tile lands in the destination surface.
    pub fn placement(&self) -> PlacementRect {
        PlacementRect {
            dest_x: 2 * self.logical_x(),
            dest_y: 2 * self.logical_y(),
            dest_width: 2 * self.logical_width,
            dest_height: 2 * self.logical_height,
            crop_x: 2 * self.margin_x,
            crop_y: 2 * self.margin_y,
        }
    }
}

/// Interleaved RGB pixels for a tile's full margined extent, shape `(h, w, 3)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

/// Two-pass output: a tile at twice the margined size, margins still attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedTile {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl ProcessedTile {
    /// Copy out the block described by `rect`'s crop offset and destination size.
    pub fn crop(&self, rect: &PlacementRect) -> Result<Vec<u8>> {
        if rect.crop_x + rect.dest_width > self.width || rect.crop_y + rect.dest_height > self.height
        {
            bail!(
                "crop {}x{} at ({}, {}) exceeds processed tile {}x{}",
                rect.dest_width,
                rect.dest_height,
                rect.crop_x,
                rect.crop_y,
                self.width,
                self.height
            );
        }

        let mut out = Vec::with_capacity(rect.dest_width * rect.dest_height * 3);
        for y in rect.crop_y..rect.crop_y + rect.dest_height {
            let start = (y * self.width + rect.crop_x) * 3;
            out.extend_from_slice(&self.pixels[start..start + rect.dest_width * 3]);
        }
        Ok(out)
    }
}

/// Maps a processed tile's interior to its place on the 2x surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementRect {
    pub dest_x: usize,
    pub dest_y: usize,
    pub dest_width: usize,
    pub dest_height: usize,
    pub crop_x: usize,
    pub crop_y: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl PlacementRect {
    /// Region read from the processed tile.
    pub fn source_rect(&self) -> Rect {
        Rect {
            x: self.crop_x,
            y: self.crop_y,
            width: self.dest_width,
            height: self.dest_height,
        }
    }

    /// Region written on the destination surface.
    pub fn dest_rect(&self) -> Rect {
        Rect {
            x: self.dest_x,
            y: self.dest_y,
            width: self.dest_width,
            height: self.dest_height,
        }
    }
}
