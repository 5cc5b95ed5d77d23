//! Placement of processed tiles onto the 2x destination surface.

use anyhow::{bail, Result};

use crate::types::{ProcessedTile, Rect, TileSpec};

/// A writable RGB destination at twice the source resolution.
pub trait Surface {
    fn width(&self) -> usize;
    fn height(&self) -> usize;

    /// Write an interleaved RGB block covering `rect`.
    fn put_rgb(&mut self, rect: Rect, pixels: &[u8]) -> Result<()>;
}

/// RGBA8 canvas, initialised fully opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaCanvas {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl RgbaCanvas {
    pub fn new(width: usize, height: usize) -> Self {
        let mut data = vec![0u8; width * height * 4];
        for px in data.chunks_exact_mut(4) {
            px[3] = u8::MAX;
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Copy out the RGBA block covering `rect`.
    #[cfg(test)]
    pub(crate) fn get_pixels(&self, rect: Rect) -> Result<Vec<u8>> {
        check_bounds(rect, self.width, self.height)?;
        let mut out = Vec::with_capacity(rect.width * rect.height * 4);
        for y in rect.y..rect.y + rect.height {
            let start = (y * self.width + rect.x) * 4;
            out.extend_from_slice(&self.data[start..start + rect.width * 4]);
        }
        Ok(out)
    }
}

impl Surface for RgbaCanvas {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn put_rgb(&mut self, rect: Rect, pixels: &[u8]) -> Result<()> {
        check_bounds(rect, self.width, self.height)?;
        if pixels.len() != rect.width * rect.height * 3 {
            bail!(
                "block has {} bytes, expected {} for {}x{}",
                pixels.len(),
                rect.width * rect.height * 3,
                rect.width,
                rect.height
            );
        }
        for (row, src) in pixels.chunks_exact(rect.width * 3).enumerate() {
            let start = ((rect.y + row) * self.width + rect.x) * 4;
            let dst = &mut self.data[start..start + rect.width * 4];
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                d[..3].copy_from_slice(s);
            }
        }
        Ok(())
    }
}

fn check_bounds(rect: Rect, width: usize, height: usize) -> Result<()> {
    if rect.x + rect.width > width || rect.y + rect.height > height {
        bail!(
            "region {}x{} at ({}, {}) exceeds surface {}x{}",
            rect.width,
            rect.height,
            rect.x,
            rect.y,
            width,
            height
        );
    }
    Ok(())
}

/// Emitted after each tile lands on the surface, so a caller can paint the
/// image incrementally.
#[derive(Debug, Clone, PartialEq)]
pub struct TileProgress {
    pub tile_index: usize,
    pub tile_count: usize,
    /// Cropped interior, interleaved RGB.
    pub pixels: Vec<u8>,
    /// Fraction of rows started, `row * tile_size / image_height`.
    pub progress: f32,
    pub width: usize,
    pub height: usize,
    /// Region of the processed tile that was kept.
    pub source: Rect,
    /// Region of the 2x surface that was written.
    pub dest: Rect,
}

#[derive(Debug, Clone, Copy)]
pub struct TileCompositor {
    image_height: usize,
    tile_size: usize,
    tile_count: usize,
}

impl TileCompositor {
    pub fn new(image_height: usize, tile_size: usize, tile_count: usize) -> Self {
        Self {
            image_height,
            tile_size,
            tile_count,
        }
    }

    /// Crop the margins off `tile` and write its interior to `surface`.
    pub fn place<S: Surface + ?Sized>(
        &self,
        tile_index: usize,
        tile: &ProcessedTile,
        spec: &TileSpec,
        surface: &mut S,
    ) -> Result<TileProgress> {
        let placement = spec.placement();
        if tile.width != 2 * spec.margined_width() || tile.height != 2 * spec.margined_height() {
            bail!(
                "processed tile is {}x{}, expected {}x{}",
                tile.width,
                tile.height,
                2 * spec.margined_width(),
                2 * spec.margined_height()
            );
        }

        let pixels = tile.crop(&placement)?;
        let dest = placement.dest_rect();
        surface.put_rgb(dest, &pixels)?;

        let progress =
            (spec.row * self.tile_size) as f32 / self.image_height.max(1) as f32;

        Ok(TileProgress {
            tile_index,
            tile_count: self.tile_count,
            pixels,
            progress: progress.min(1.0),
            width: dest.width,
            height: dest.height,
            source: placement.source_rect(),
            dest,
        })
    }
}
