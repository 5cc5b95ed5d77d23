//! Per-image orchestration: plan, extract, infer, place, merge alpha, resample.
//!
//! [`Upscaler::tiles`] exposes the tile loop as an iterator of progress
//! events so a caller can paint while the image is still being processed;
//! [`Upscaler::upscale`] drives it to completion.

use std::sync::mpsc::Sender;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, trace};

use crate::alpha::{composite_alpha, premultiply, unpremultiply};
use crate::compositor::{RgbaCanvas, TileCompositor, TileProgress};
use crate::error::UpscaleError;
use crate::inference::InferenceAdapter;
use crate::model::ModelStore;
use crate::resize::{resize, ResizeAlgorithm};
use crate::tiling::{extract_tile, plan_tiles, DEFAULT_TILE_MARGIN, DEFAULT_TILE_SIZE};
use crate::types::{RawImage, TileSpec};

pub const DEFAULT_FINAL_SCALE: f64 = 1.6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpscaleOptions {
    pub tile_size: usize,
    pub margin: usize,
    /// Output size relative to the source, applied after the 2x pass.
    pub final_scale: f64,
    pub filter: ResizeAlgorithm,
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            margin: DEFAULT_TILE_MARGIN,
            final_scale: DEFAULT_FINAL_SCALE,
            filter: ResizeAlgorithm::default(),
        }
    }
}

impl UpscaleOptions {
    pub fn validate(&self) -> Result<(), UpscaleError> {
        if self.tile_size == 0 {
            return Err(UpscaleError::config("tile_size must be at least 1"));
        }
        if !self.final_scale.is_finite() || self.final_scale <= 0.0 {
            return Err(UpscaleError::config(format!(
                "final scale must be a positive number, got {}",
                self.final_scale
            )));
        }
        Ok(())
    }
}

/// `width * scale` by `height * scale`, truncated. An empty result is a
/// per-image failure; the scale itself is checked by [`UpscaleOptions::validate`].
pub fn output_dimensions(width: u32, height: u32, scale: f64) -> Result<(u32, u32), UpscaleError> {
    let w = (width as f64 * scale).trunc();
    let h = (height as f64 * scale).trunc();
    if w < 1.0 || h < 1.0 || w > u32::MAX as f64 || h > u32::MAX as f64 {
        return Err(UpscaleError::OutputSize {
            width,
            height,
            scale,
        });
    }
    Ok((w as u32, h as u32))
}

/// Final image, interleaved RGBA8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaledImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    /// Whether the source carried a non-trivial alpha plane.
    pub has_alpha: bool,
}

pub struct Upscaler<'s> {
    store: &'s mut ModelStore,
    options: UpscaleOptions,
    events: Option<Sender<TileProgress>>,
}

impl<'s> Upscaler<'s> {
    pub fn new(store: &'s mut ModelStore, options: UpscaleOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            store,
            options,
            events: None,
        })
    }

    /// Forward every tile event to `sender` as well as yielding it.
    pub fn with_events(mut self, sender: Sender<TileProgress>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Start processing `image`. Models are loaded here, before any tile.
    pub fn tiles<'a>(&'a mut self, image: &'a RawImage) -> Result<TileStream<'a>> {
        output_dimensions(image.width(), image.height(), self.options.final_scale)?;
        let specs = plan_tiles(
            image.width(),
            image.height(),
            self.options.tile_size,
            self.options.margin,
        )?;
        let adapter = self.store.adapter()?;

        debug!(
            width = image.width(),
            height = image.height(),
            tiles = specs.len(),
            tile_size = self.options.tile_size,
            margin = self.options.margin,
            "Planned tiles"
        );

        let compositor =
            TileCompositor::new(image.height() as usize, self.options.tile_size, specs.len());
        Ok(TileStream {
            adapter,
            image,
            canvas: RgbaCanvas::new(2 * image.width() as usize, 2 * image.height() as usize),
            compositor,
            specs,
            next: 0,
            failed: false,
            events: self.events.as_ref(),
            options: self.options,
        })
    }

    /// Run every tile, merge alpha, and resample to the final size.
    pub fn upscale(&mut self, image: &RawImage) -> Result<UpscaledImage> {
        let started = Instant::now();
        let mut stream = self.tiles(image)?;
        for event in stream.by_ref() {
            event?;
        }
        let result = stream.finish()?;
        info!(
            from = %format!("{}x{}", image.width(), image.height()),
            to = %format!("{}x{}", result.width, result.height),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image upscaled"
        );
        Ok(result)
    }
}

/// Tile loop for one image. Yields one event per placed tile in row-major
/// order and stops after the first error.
pub struct TileStream<'a> {
    adapter: &'a mut InferenceAdapter,
    image: &'a RawImage,
    canvas: RgbaCanvas,
    compositor: TileCompositor,
    specs: Vec<TileSpec>,
    next: usize,
    failed: bool,
    events: Option<&'a Sender<TileProgress>>,
    options: UpscaleOptions,
}

impl TileStream<'_> {
    pub fn tile_count(&self) -> usize {
        self.specs.len()
    }

    pub fn is_complete(&self) -> bool {
        !self.failed && self.next == self.specs.len()
    }

    fn step(&mut self, index: usize) -> Result<TileProgress> {
        let spec = self.specs[index];
        let tile = extract_tile(self.image, &spec);
        let processed = self
            .adapter
            .process(&tile)
            .map_err(|e| UpscaleError::Inference {
                tile_index: index,
                reason: format!("{e:#}"),
            })?;
        let event = self
            .compositor
            .place(index, &processed, &spec, &mut self.canvas)
            .with_context(|| format!("failed to place tile {index}"))?;
        trace!(
            tile_index = index,
            row = spec.row,
            col = spec.col,
            progress = event.progress,
            "Tile placed"
        );
        Ok(event)
    }

    /// The assembled 2x canvas, before alpha and resampling.
    pub fn into_canvas(self) -> Result<RgbaCanvas> {
        if !self.is_complete() {
            bail!(
                "image incomplete: {} of {} tiles placed",
                self.next,
                self.specs.len()
            );
        }
        Ok(self.canvas)
    }

    /// Merge alpha and resample to the configured final size.
    pub fn finish(self) -> Result<UpscaledImage> {
        let image = self.image;
        let options = self.options;
        let mut canvas = self.into_canvas()?;

        let has_alpha = composite_alpha(image.alpha(), &mut canvas)?;
        let (width, height) = output_dimensions(image.width(), image.height(), options.final_scale)?;
        let (src_w, src_h) = (2 * image.width() as usize, 2 * image.height() as usize);

        let (dst_w, dst_h) = (width as usize, height as usize);
        let rgba = if (dst_w, dst_h) == (src_w, src_h) {
            canvas.into_data()
        } else if has_alpha && options.filter == ResizeAlgorithm::Bilinear {
            let mut data = canvas.into_data();
            premultiply(&mut data);
            let mut out = resize(options.filter, &data, 4, src_w, src_h, dst_w, dst_h)
                .context("final resample failed")?;
            unpremultiply(&mut out);
            out
        } else {
            resize(options.filter, canvas.data(), 4, src_w, src_h, dst_w, dst_h)
                .context("final resample failed")?
        };

        Ok(UpscaledImage {
            width,
            height,
            rgba,
            has_alpha,
        })
    }
}

impl Iterator for TileStream<'_> {
    type Item = Result<TileProgress>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.specs.len() {
            return None;
        }
        let index = self.next;
        match self.step(index) {
            Ok(event) => {
                self.next += 1;
                if let Some(sender) = self.events {
                    if sender.send(event.clone()).is_err() {
                        debug!(tile_index = index, "Progress receiver hung up; no more events sent");
                        self.events = None;
                    }
                }
                Some(Ok(event))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
