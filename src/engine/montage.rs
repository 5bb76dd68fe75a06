//! Montage assembly: stitching tile stacks into per-region composites.
//!
//! The canvas covers the whole region with overlap trimmed once per seam:
//! `width = region_width * tile_width - (region_width - 1) * overlap_x`,
//! height analogous. Tiles are blitted in acquisition order, so where
//! neighbors overlap the later tile overwrites the earlier one. The order is
//! fixed, which makes assembly deterministic and idempotent.
//!
//! Channel display mapping (colors, intensity windows) happens only in
//! [`render_preview`]; the composited pixel data is never touched by it.

use crate::core::error::{Component, TileFailure, TileError};
use crate::core::types::{
    ChannelPlane, Color, DisplayRange, ImageStack, MontageSpec, Plane, Tile,
};
use crate::geometry::tiling::TileIndex;
use image::{Luma, Rgba, RgbaImage};
use std::collections::HashMap;

/// One stitched composite: all tiles of a region at one z index.
#[derive(Debug, Clone)]
pub struct MontageCanvas {
    /// 0-based region index.
    pub region: usize,
    /// z-plane index (or the best-z label of the source extract).
    pub z: usize,
    /// Composited planes, one per extracted channel.
    pub channels: Vec<ChannelPlane>,
}

/// Stitches extracted tile stacks into region composites.
pub struct MontageAssembler<'a> {
    index: &'a TileIndex,
}

impl<'a> MontageAssembler<'a> {
    /// Create an assembler over a region's tile index.
    pub fn new(index: &'a TileIndex) -> Self {
        MontageAssembler { index }
    }

    /// Assemble one composite per z-plane from the given per-tile stacks.
    ///
    /// Tiles absent from `stacks` (e.g. failed earlier) are skipped; tiles
    /// whose extracted images disagree with the tile geometry are recorded as
    /// failures and skipped entirely. Remaining tiles are blitted in
    /// acquisition order, last writer wins.
    pub fn assemble(
        &self,
        stacks: &HashMap<Tile, Vec<ImageStack>>,
    ) -> (Vec<MontageCanvas>, Vec<TileFailure>) {
        let geometry = self.index.geometry();
        let order = self.index.acquisition_order();

        // Shape prepass: a tile with any malformed plane is dropped whole.
        let mut failures = Vec::new();
        let mut usable: Vec<&Tile> = Vec::new();
        'tiles: for tile in &order {
            let Some(tile_stacks) = stacks.get(tile) else {
                continue;
            };
            for stack in tile_stacks {
                for channel in &stack.channels {
                    if channel.plane.width() != geometry.tile_width
                        || channel.plane.height() != geometry.tile_height
                    {
                        failures.push(TileFailure {
                            component: Component::Montage,
                            tile: *tile,
                            error: TileError::ShapeMismatch {
                                tile: *tile,
                                context: format!("channel '{}' z {}", channel.name, stack.z),
                                expected_w: geometry.tile_width,
                                expected_h: geometry.tile_height,
                                actual_w: channel.plane.width(),
                                actual_h: channel.plane.height(),
                            },
                        });
                        continue 'tiles;
                    }
                }
            }
            usable.push(tile);
        }

        // Collect the z indexes and channel order present in the input.
        let mut z_planes: Vec<usize> = usable
            .iter()
            .filter_map(|t| stacks.get(t))
            .flatten()
            .map(|s| s.z)
            .collect();
        z_planes.sort_unstable();
        z_planes.dedup();

        let channel_names: Vec<String> = usable
            .first()
            .and_then(|t| stacks.get(t))
            .and_then(|s| s.first())
            .map(|s| s.channels.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default();

        let (canvas_w, canvas_h) = self.index.canvas_size();
        let mut canvases = Vec::with_capacity(z_planes.len());
        for &z in &z_planes {
            let mut channels: Vec<ChannelPlane> = channel_names
                .iter()
                .map(|name| ChannelPlane {
                    name: name.clone(),
                    plane: Plane::from_pixel(canvas_w, canvas_h, Luma([0u16])),
                })
                .collect();

            for tile in &usable {
                let Some(stack) = stacks
                    .get(tile)
                    .and_then(|s| s.iter().find(|stack| stack.z == z))
                else {
                    continue;
                };
                let (x0, y0) = self.index.placement(tile.row, tile.col);
                for (canvas_channel, tile_channel) in channels.iter_mut().zip(&stack.channels) {
                    blit(&mut canvas_channel.plane, &tile_channel.plane, x0, y0);
                }
            }

            canvases.push(MontageCanvas {
                region: self.index.region().region_index,
                z,
                channels,
            });
        }

        (canvases, failures)
    }
}

/// Copy `src` into `dst` with its origin at `(x0, y0)`, overwriting.
fn blit(dst: &mut Plane, src: &Plane, x0: u32, y0: u32) {
    for (x, y, pixel) in src.enumerate_pixels() {
        dst.put_pixel(x0 + x, y0 + y, *pixel);
    }
}

/// Render a composite to RGBA for display.
///
/// Applies the montage spec's per-channel display windows and colors
/// additively. Purely presentational: the canvas pixel data is read-only
/// here.
pub fn render_preview(canvas: &MontageCanvas, spec: &MontageSpec) -> RgbaImage {
    let (w, h) = canvas
        .channels
        .first()
        .map(|c| (c.plane.width(), c.plane.height()))
        .unwrap_or((0, 0));
    let mut out = RgbaImage::new(w, h);

    for channel in &canvas.channels {
        let color = spec
            .channel_colors
            .get(&channel.name)
            .copied()
            .unwrap_or(Color::WHITE);
        let range = spec
            .channel_ranges
            .get(&channel.name)
            .copied()
            .unwrap_or_default();
        let scaled = apply_display_range(&channel.plane, range);

        for (x, y, pixel) in scaled.enumerate_pixels() {
            let norm = f32::from(pixel.0[0]) / f32::from(u16::MAX);
            let dst = out.get_pixel_mut(x, y);
            let add = |acc: u8, c: u8| {
                (u16::from(acc) + (norm * f32::from(c)) as u16).min(255) as u8
            };
            *dst = Rgba([
                add(dst.0[0], color.r),
                add(dst.0[1], color.g),
                add(dst.0[2], color.b),
                255,
            ]);
        }
    }
    out
}

/// Scale one channel into its display window, mapping `[min, max]` onto the
/// full u16 range. [`render_preview`] windows every channel through this
/// before colorizing.
pub fn apply_display_range(plane: &Plane, range: DisplayRange) -> Plane {
    let span = f32::from(range.max.saturating_sub(range.min)).max(1.0);
    Plane::from_fn(plane.width(), plane.height(), |x, y| {
        let v = plane.get_pixel(x, y).0[0];
        let norm = (f32::from(v.saturating_sub(range.min)) / span).clamp(0.0, 1.0);
        Luma([(norm * f32::from(u16::MAX)) as u16])
    })
}
