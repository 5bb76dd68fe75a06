//! Per-cell segmentation and quantification.
//!
//! The [`Cytometer`] trait is the seam for pluggable segmentation models:
//! concrete variants are registered by name in a [`registry::CytometerRegistry`]
//! and selected by configuration. The engine wires segment → quantify per
//! tile, z-plane, and cycle, and attaches the cell adjacency graph.

pub mod builtin;
pub mod cellgraph;
pub mod engine;
pub mod features;
pub mod registry;

use crate::core::config::{FeatureConfig, Statistic};
use crate::core::error::PipelineResult;
use crate::core::types::{ImageStack, LabelMask};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use engine::CytometryEngine;
pub use features::Morphology;
pub use registry::{CytometerFactory, CytometerRegistry};

/// Per-channel intensity statistics for one cell.
pub type IntensityStats = IndexMap<String, IndexMap<Statistic, f64>>;

/// Label masks produced by a cytometer. Label 0 is background; nucleus
/// labels match the cell labels they belong to.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Whole-cell label mask.
    pub cells: LabelMask,
    /// Nucleus label mask.
    pub nuclei: LabelMask,
}

impl Segmentation {
    /// Mask width in pixels.
    pub fn width(&self) -> u32 {
        self.cells.width()
    }

    /// Mask height in pixels.
    pub fn height(&self) -> u32 {
        self.cells.height()
    }
}

/// Features quantified for one cell from one stack.
#[derive(Debug, Clone)]
pub struct CellFeatures {
    /// Segmentation label of the cell.
    pub cell_id: u32,
    /// Centroid in tile pixel coordinates.
    pub centroid: (f64, f64),
    /// Morphology features, when enabled.
    pub morphology: Option<Morphology>,
    /// Whole-cell intensity statistics per channel.
    pub cell_intensity: IntensityStats,
    /// Nucleus intensity statistics per channel.
    pub nucleus_intensity: IntensityStats,
}

/// One row of cytometric output: one cell, one tile, one z-plane, one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CytometryRecord {
    /// 0-based region index.
    pub region: usize,
    /// 0-based acquisition index of the tile within its region.
    pub tile: usize,
    /// z-plane index.
    pub z: usize,
    /// Cycle index.
    pub cycle: usize,
    /// Segmentation label of the cell.
    pub cell_id: u32,
    /// Centroid x in tile pixel coordinates.
    pub x: f64,
    /// Centroid y in tile pixel coordinates.
    pub y: f64,
    /// Morphology features, when enabled.
    pub morphology: Option<Morphology>,
    /// Whole-cell intensity statistics per channel.
    pub cell_intensity: IntensityStats,
    /// Nucleus intensity statistics per channel.
    pub nucleus_intensity: IntensityStats,
    /// Labels of spatially adjacent cells, when the cell graph is enabled.
    pub neighbor_ids: Vec<u32>,
}

/// A pluggable segmentation/quantification model.
///
/// Implementations must be cheap to share across worker threads; per-tile
/// state belongs in the call, not the struct.
pub trait Cytometer: Send + Sync {
    /// Registry identifier of this cytometer.
    fn name(&self) -> &str;

    /// Logical channel names the segmentation stack must contain.
    fn segmentation_channels(&self) -> Vec<String>;

    /// Segment a tile's stack into cell and nucleus label masks.
    fn segment(&self, stack: &ImageStack) -> PipelineResult<Segmentation>;

    /// Quantify per-cell features from a mask pair and an image stack.
    fn quantify(
        &self,
        segmentation: &Segmentation,
        stack: &ImageStack,
        features: &FeatureConfig,
    ) -> PipelineResult<Vec<CellFeatures>>;
}
