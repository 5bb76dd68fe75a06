//! Error types for cytomosaic.
//!
//! Uses thiserror for structured errors with context. The taxonomy separates
//! fatal configuration problems (caught before any tile is touched) from
//! tile-scoped failures that leave sibling tiles running, and carries enough
//! identifiers (component, region, tile) to locate every failure.

use crate::core::types::{AggregationMode, Tile};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top-level error type for the pipeline.
///
/// This enum encompasses all error categories and enables automatic
/// conversion between specific error types.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Fatal configuration problem.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Channel name could not be resolved.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Failure scoped to a single tile.
    #[error("Tile error: {0}")]
    Tile(#[from] TileError),

    /// Final-stage aggregation failure.
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Device pool failure.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decode/encode failure.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV table output failure.
    #[error("Table error: {0}")]
    Table(#[from] csv::Error),

    /// Anything without a structured variant.
    #[error("{0}")]
    Other(String),
}

/// Fatal configuration errors.
///
/// All of these abort a run before any tile processing begins.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigError {
    /// Overlap along one axis meets or exceeds the tile extent.
    #[error("{axis} overlap ({overlap}) must be smaller than the tile extent ({extent})")]
    DegenerateOverlap {
        /// Axis on which the overlap is degenerate.
        axis: Axis,
        /// Declared overlap in pixels.
        overlap: u32,
        /// Tile extent along the same axis in pixels.
        extent: u32,
    },

    /// A region with zero tiles along some axis.
    #[error("region {region} is empty ({width}x{height} tiles)")]
    EmptyRegion {
        /// 0-based region index.
        region: usize,
        /// Region width in tiles.
        width: u32,
        /// Region height in tiles.
        height: u32,
    },

    /// The flat channel name list disagrees with the cycle layout.
    #[error("expected {expected} channel names (num_cycles x channels per cycle) but found {actual}")]
    ChannelCountMismatch {
        /// `num_cycles * channels_per_cycle`.
        expected: usize,
        /// Number of names actually supplied.
        actual: usize,
    },

    /// Region indexes are 1-based; zero is not a valid entry.
    #[error("region index {0} must be a 1-based index > 0")]
    InvalidRegionIndex(usize),

    /// A tile index beyond the region's tile count.
    #[error("tile index {index} out of range for a region of {count} tiles")]
    TileIndexOutOfRange {
        /// Offending flat tile index.
        index: usize,
        /// Tiles in the region.
        count: usize,
    },

    /// A fixed z selection beyond the acquired planes.
    #[error("z-plane {z} out of range ({num_z} planes acquired)")]
    ZPlaneOutOfRange {
        /// Requested z index.
        z: usize,
        /// Planes acquired per tile.
        num_z: usize,
    },

    /// An index symlink pointing outside the per-cycle slot range.
    #[error("index symlink references physical slot {slot} but only {slots_per_cycle} slots exist per cycle")]
    SymlinkOutOfRange {
        /// Referenced physical slot.
        slot: usize,
        /// Slots available per cycle.
        slots_per_cycle: usize,
    },

    /// Cytometer type name not present in the registry.
    #[error("unknown cytometer type '{0}'")]
    UnknownCytometer(String),

    /// Cytometer params rejected by the named implementation.
    #[error("invalid cytometer parameters for '{name}': {reason}")]
    InvalidCytometerParams {
        /// Registry id of the cytometer.
        name: String,
        /// What the implementation objected to.
        reason: String,
    },

    /// A step naming an extract spec that was never declared.
    #[error("step references unknown extract spec '{0}'")]
    UnknownExtract(String),

    /// A step naming a montage spec that was never declared.
    #[error("step references unknown montage spec '{0}'")]
    UnknownMontage(String),

    /// A montage step ordered before the extract step it consumes.
    #[error("montage '{montage}' requires extract '{extract}' to run first")]
    MontageBeforeExtract {
        /// Name of the montage spec.
        montage: String,
        /// Name of the extract spec it depends on.
        extract: String,
    },

    /// Anything without a structured variant.
    #[error("{0}")]
    Other(String),
}

/// Axis label used by geometry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Horizontal (width / column) axis.
    X,
    /// Vertical (height / row) axis.
    Y,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
        }
    }
}

/// Channel resolution failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelError {
    /// Name unknown in every cycle, even after alias resolution.
    #[error("channel '{name}' not found after alias resolution (known channels: {known:?})")]
    UnknownChannel {
        /// The requested name.
        name: String,
        /// Names the resolver does know.
        known: Vec<String>,
    },

    /// Name exists but not in the requested cycle.
    #[error("channel '{name}' not found in cycle {cycle}")]
    UnknownChannelInCycle {
        /// The requested name.
        name: String,
        /// Cycle that was searched.
        cycle: usize,
    },
}

/// Tile-scoped failures.
///
/// These never abort a run: the offending tile is excluded from montage and
/// aggregation output while sibling tiles continue.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TileError {
    /// A provided plane disagrees with the declared tile geometry.
    #[error("tile {tile} ({context}): expected {expected_w}x{expected_h} pixels, got {actual_w}x{actual_h}")]
    ShapeMismatch {
        /// The affected tile.
        tile: Tile,
        /// Which plane was malformed (channel, z).
        context: String,
        /// Expected width in pixels.
        expected_w: u32,
        /// Expected height in pixels.
        expected_h: u32,
        /// Width actually provided.
        actual_w: u32,
        /// Height actually provided.
        actual_h: u32,
    },

    /// Segmentation produced a mask that does not cover the stack.
    #[error("tile {tile}: segmentation mask is {mask_w}x{mask_h} but the image stack is {stack_w}x{stack_h}")]
    Segmentation {
        /// The affected tile.
        tile: Tile,
        /// Mask width in pixels.
        mask_w: u32,
        /// Mask height in pixels.
        mask_h: u32,
        /// Stack width in pixels.
        stack_w: u32,
        /// Stack height in pixels.
        stack_h: u32,
    },

    /// Best-z selection requested but no scores were recorded.
    #[error("tile {tile}: no focus scores available for cycle {cycle}")]
    MissingFocus {
        /// The affected tile.
        tile: Tile,
        /// Cycle whose scores are missing.
        cycle: usize,
    },

    /// The device pool stayed empty through every acquisition attempt.
    #[error("tile {tile}: no compute device available after {attempts} acquisition attempts")]
    DeviceUnavailable {
        /// The affected tile.
        tile: Tile,
        /// Acquisition attempts made before giving up.
        attempts: u32,
    },
}

impl TileError {
    /// The tile this failure is scoped to.
    pub fn tile(&self) -> Tile {
        match self {
            TileError::ShapeMismatch { tile, .. }
            | TileError::Segmentation { tile, .. }
            | TileError::MissingFocus { tile, .. }
            | TileError::DeviceUnavailable { tile, .. } => *tile,
        }
    }
}

/// Final-stage aggregation failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregationError {
    /// No record survived the configured selection.
    #[error("no cytometry records matched the aggregation spec (mode: {mode:?})")]
    Empty {
        /// The selection mode that matched nothing.
        mode: AggregationMode,
    },
}

/// Device pool failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceError {
    /// Every acquisition attempt found the pool empty.
    #[error("no device available after {attempts} acquisition attempts")]
    Exhausted {
        /// Acquisition attempts made before giving up.
        attempts: u32,
    },
}

/// Pipeline component identifiers used in failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Per-tile z/channel extraction.
    Extraction,
    /// Region composite assembly.
    Montage,
    /// Segmentation and quantification.
    Cytometry,
    /// Record selection and table flattening.
    Aggregation,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Extraction => write!(f, "extraction"),
            Component::Montage => write!(f, "montage"),
            Component::Cytometry => write!(f, "cytometry"),
            Component::Aggregation => write!(f, "aggregation"),
        }
    }
}

/// A recorded per-tile failure.
///
/// Collected instead of propagated so that sibling tiles keep processing;
/// surfaced in the run output for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileFailure {
    /// Component in which the failure occurred.
    pub component: Component,
    /// The affected tile.
    pub tile: Tile,
    /// The underlying condition.
    pub error: TileError,
}

impl fmt::Display for TileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.component, self.error)
    }
}

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type alias for configuration loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type alias for tile-scoped operations.
pub type TileResult<T> = Result<T, TileError>;

impl PipelineError {
    /// Whether this error is scoped to a single tile.
    ///
    /// Tile-scoped errors are recorded as [`TileFailure`]s and excluded from
    /// montage/aggregation output; anything else aborts the run.
    pub fn is_tile_scoped(&self) -> bool {
        matches!(self, PipelineError::Tile(_))
    }

    /// Extract the tile-scoped error, if this is one.
    pub fn into_tile_error(self) -> Result<TileError, PipelineError> {
        match self {
            PipelineError::Tile(e) => Ok(e),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_scoped_classification() {
        let tile = Tile {
            region: 0,
            row: 1,
            col: 2,
        };
        let err = PipelineError::from(TileError::MissingFocus { tile, cycle: 0 });
        assert!(err.is_tile_scoped());

        let err = PipelineError::from(ConfigError::UnknownCytometer("nope".into()));
        assert!(!err.is_tile_scoped());
    }

    #[test]
    fn test_tile_error_carries_tile() {
        let tile = Tile {
            region: 1,
            row: 0,
            col: 3,
        };
        let err = TileError::Segmentation {
            tile,
            mask_w: 10,
            mask_h: 10,
            stack_w: 20,
            stack_h: 20,
        };
        assert_eq!(err.tile(), tile);
    }

    #[test]
    fn test_degenerate_overlap_message() {
        let err = ConfigError::DegenerateOverlap {
            axis: Axis::X,
            overlap: 1400,
            extent: 1344,
        };
        let msg = err.to_string();
        assert!(msg.contains("1400"));
        assert!(msg.contains("1344"));
    }
}
