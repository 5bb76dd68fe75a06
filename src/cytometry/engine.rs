//! Per-tile cytometry orchestration.
//!
//! For each z-plane the engine extracts the cytometer's segmentation stack,
//! segments it once, then quantifies every acquisition cycle's channels
//! against the resulting masks. One record is emitted per cell, z-plane, and
//! cycle; the cell adjacency graph is built once per z-plane and shared by
//! all of that plane's records.

use crate::core::config::FeatureConfig;
use crate::core::error::{PipelineResult, TileError};
use crate::core::types::{ExtractSpec, ImageStack, Tile, ZPolicy};
use crate::cytometry::{cellgraph, features, Cytometer, CytometryRecord, Segmentation};
use crate::engine::extract::ExtractionEngine;
use crate::geometry::channels::ChannelResolver;
use indexmap::IndexSet;

/// Runs segment/quantify for single tiles.
pub struct CytometryEngine<'a> {
    extraction: &'a ExtractionEngine<'a>,
    resolver: &'a ChannelResolver,
    cytometer: &'a dyn Cytometer,
    features: &'a FeatureConfig,
    num_z: usize,
}

impl<'a> CytometryEngine<'a> {
    /// Create an engine over the given collaborators.
    pub fn new(
        extraction: &'a ExtractionEngine<'a>,
        resolver: &'a ChannelResolver,
        cytometer: &'a dyn Cytometer,
        features: &'a FeatureConfig,
        num_z: usize,
    ) -> Self {
        CytometryEngine {
            extraction,
            resolver,
            cytometer,
            features,
            num_z,
        }
    }

    /// All cytometry records for one tile, across every z-plane and cycle.
    ///
    /// `tile_index` is the tile's 0-based acquisition index within its
    /// region, recorded in the output rows.
    pub fn tile_records(&self, tile: Tile, tile_index: usize) -> PipelineResult<Vec<CytometryRecord>> {
        let mut records = Vec::new();
        for z in 0..self.num_z {
            self.plane_records(tile, tile_index, z, &mut records)?;
        }
        Ok(records)
    }

    fn plane_records(
        &self,
        tile: Tile,
        tile_index: usize,
        z: usize,
        records: &mut Vec<CytometryRecord>,
    ) -> PipelineResult<()> {
        let seg_stack = self.fixed_stack(tile, z, "segmentation", self.segmentation_channels())?;
        let segmentation = self.cytometer.segment(&seg_stack)?;
        self.check_masks(tile, &segmentation, &seg_stack)?;

        let neighbors = if self.features.cell_graph {
            let centroids = features::centroids(&segmentation.cells);
            let graph = cellgraph::build_cell_graph(&centroids, self.features.neighbor_distance);
            Some(cellgraph::neighbor_map(&graph))
        } else {
            None
        };

        for cycle in 0..self.resolver.num_cycles() {
            let channels: IndexSet<String> = self
                .resolver
                .cycle_names(cycle)
                .map(str::to_string)
                .collect();
            let stack = self.fixed_stack(tile, z, "cytometry", channels)?;
            let cells = self.cytometer.quantify(&segmentation, &stack, self.features)?;
            for cell in cells {
                let neighbor_ids = neighbors
                    .as_ref()
                    .and_then(|map| map.get(&cell.cell_id).cloned())
                    .unwrap_or_default();
                records.push(CytometryRecord {
                    region: tile.region,
                    tile: tile_index,
                    z,
                    cycle,
                    cell_id: cell.cell_id,
                    x: cell.centroid.0,
                    y: cell.centroid.1,
                    morphology: cell.morphology,
                    cell_intensity: cell.cell_intensity,
                    nucleus_intensity: cell.nucleus_intensity,
                    neighbor_ids,
                });
            }
        }
        Ok(())
    }

    fn segmentation_channels(&self) -> IndexSet<String> {
        self.cytometer.segmentation_channels().into_iter().collect()
    }

    fn fixed_stack(
        &self,
        tile: Tile,
        z: usize,
        name: &str,
        channels: IndexSet<String>,
    ) -> PipelineResult<ImageStack> {
        let spec = ExtractSpec {
            name: name.to_string(),
            z: ZPolicy::Fixed(z),
            channels,
        };
        let mut stacks = self.extraction.extract(&spec, tile)?;
        Ok(stacks.remove(0))
    }

    fn check_masks(
        &self,
        tile: Tile,
        segmentation: &Segmentation,
        stack: &ImageStack,
    ) -> PipelineResult<()> {
        if segmentation.width() != stack.width() || segmentation.height() != stack.height() {
            return Err(TileError::Segmentation {
                tile,
                mask_w: segmentation.width(),
                mask_h: segmentation.height(),
                stack_w: stack.width(),
                stack_h: stack.height(),
            }
            .into());
        }
        Ok(())
    }
}
