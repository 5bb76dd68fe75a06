//! # Cytomosaic - Declarative Microscopy Pipelines
//!
//! Cytomosaic turns a multiplexed microscopy acquisition (cyclic staining,
//! tiled regions, z-stacks) into stitched region composites and a per-cell
//! statistics table, driven entirely by a declarative JSON configuration.
//!
//! ## Features
//!
//! - **Declarative runs**: acquisition geometry, extract/montage specs, and
//!   the ordered step list all live in one validated configuration
//! - **Snake-order tiling**: tile placement and acquisition order follow the
//!   instrument's serpentine traversal
//! - **Pluggable cytometers**: segmentation models register by name and are
//!   selected by configuration
//! - **Parallel tile processing**: tiles fan out across worker threads, with
//!   GPU device leasing when devices are configured
//! - **Partial failure tolerance**: a broken tile is reported and excluded
//!   while its siblings keep going
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cytomosaic::prelude::*;
//!
//! let config = ExperimentConfig::load(std::path::Path::new("experiment.json"))?;
//! let registry = CytometerRegistry::with_builtins();
//!
//! // Pixel data and focus scores come in through provider traits.
//! let images = my_image_provider();
//! let focus = my_focus_provider();
//!
//! let executor = PipelineExecutor::new(&config, &images, &focus, &registry);
//! let output = executor.run()?;
//!
//! if let Some(table) = &output.table {
//!     let mut sink = CsvTableSink::create("cells.csv")?;
//!     sink.write_table(table)?;
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: configuration, shared types, and error handling
//! - [`geometry`]: tile placement and channel name resolution
//! - [`providers`]: external collaborator traits (pixels, focus scores)
//! - [`engine`]: per-tile extraction and montage assembly
//! - [`cytometry`]: segmentation, feature quantification, cell graphs
//! - [`aggregate`]: record selection and tabular output
//! - [`execution`]: device leasing and step-list execution

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod core;
pub mod cytometry;
pub mod engine;
pub mod execution;
pub mod geometry;
pub mod providers;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use cytomosaic::prelude::*;
/// ```
pub mod prelude {
    // Configuration
    pub use crate::core::config::{
        AcquisitionConfig, CytometerConfig, ExperimentConfig, FeatureConfig, ProcessingConfig,
        Statistic, Step,
    };

    // Core types
    pub use crate::core::types::{
        AggregationMode, AggregationSpec, ChannelPlane, Color, DisplayRange, ExtractSpec,
        ImageStack, LabelMask, MontageSpec, Plane, Region, Tile, TileGeometry, ZPolicy,
    };

    // Errors
    pub use crate::core::error::{
        AggregationError, ChannelError, ConfigError, DeviceError, PipelineError, PipelineResult,
        TileError, TileFailure,
    };

    // Geometry
    pub use crate::geometry::channels::{ChannelAddress, ChannelResolver};
    pub use crate::geometry::tiling::{TileIndex, TilingMode};

    // Providers
    pub use crate::providers::{
        CachingImageProvider, FocusScoreProvider, ImageProvider, InMemoryFocusProvider,
        InMemoryImageProvider,
    };

    // Engines
    pub use crate::engine::extract::ExtractionEngine;
    pub use crate::engine::montage::{render_preview, MontageAssembler, MontageCanvas};

    // Cytometry
    pub use crate::cytometry::{
        Cytometer, CytometerRegistry, CytometryEngine, CytometryRecord, Morphology, Segmentation,
    };

    // Aggregation
    pub use crate::aggregate::{
        AggregationEngine, AggregationTable, CsvTableSink, TableSink, TableValue,
    };

    // Execution
    pub use crate::execution::{DevicePool, ExecutionStats, PipelineExecutor, RunOutput};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
