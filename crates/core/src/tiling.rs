//! Tile grid planning and margin-aware tile extraction.

use crate::error::UpscaleError;
use crate::types::{RawImage, Tile, TileSpec};

pub const DEFAULT_TILE_SIZE: usize = 16;

/// Context pixels added on every side of a tile.
pub const DEFAULT_TILE_MARGIN: usize = 6;

/// Cover a `width x height` image with a row-major grid of tiles.
///
/// Logical regions never overlap and cover the image exactly; the last row
/// and column shrink to the remainder. Margins are applied symmetrically and
/// may reach past the image edges.
pub fn plan_tiles(
    width: u32,
    height: u32,
    tile_size: usize,
    margin: usize,
) -> Result<Vec<TileSpec>, UpscaleError> {
    if tile_size == 0 {
        return Err(UpscaleError::config("tile_size must be at least 1"));
    }
    if width == 0 || height == 0 {
        return Err(UpscaleError::config(format!(
            "cannot tile a {width}x{height} image"
        )));
    }

    let width = width as usize;
    let height = height as usize;
    let rows = height.div_ceil(tile_size);
    let cols = width.div_ceil(tile_size);
    let mut specs = Vec::with_capacity(rows * cols);

    for row in 0..rows {
        let y = row * tile_size;
        let logical_height = tile_size.min(height - y);
        for col in 0..cols {
            let x = col * tile_size;
            let logical_width = tile_size.min(width - x);
            specs.push(TileSpec {
                row,
                col,
                origin_x: x as i64 - margin as i64,
                origin_y: y as i64 - margin as i64,
                logical_width,
                logical_height,
                margin_x: margin,
                margin_y: margin,
            });
        }
    }

    Ok(specs)
}

/// Materialize a tile's margined extent, replicating the nearest edge pixel
/// for coordinates outside the image.
pub fn extract_tile(image: &RawImage, spec: &TileSpec) -> Tile {
    let w = spec.margined_width();
    let h = spec.margined_height();
    let max_x = image.width() as i64 - 1;
    let max_y = image.height() as i64 - 1;

    let mut pixels = vec![0u8; w * h * 3];
    for (i, row) in pixels.chunks_exact_mut(w * 3).enumerate() {
        let sy = (spec.origin_y + i as i64).clamp(0, max_y) as usize;
        for (j, px) in row.chunks_exact_mut(3).enumerate() {
            let sx = (spec.origin_x + j as i64).clamp(0, max_x) as usize;
            px.copy_from_slice(&image.pixel(sx, sy));
        }
    }

    Tile {
        width: w,
        height: h,
        pixels,
    }
}
