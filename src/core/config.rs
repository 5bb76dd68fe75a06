//! Experiment configuration.
//!
//! A whole run is declared in JSON: acquisition geometry, processing options,
//! named extract/montage specs, and the ordered step list. Loading performs
//! full validation up front so that every [`ConfigError`] surfaces before any
//! tile is processed.

use crate::core::error::{Axis, ConfigError, ConfigResult};
use crate::core::types::{AggregationSpec, ExtractSpec, MontageSpec, Region, TileGeometry, ZPolicy};
use crate::geometry::tiling::TilingMode;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;

/// Acquisition geometry and channel layout, as declared by the instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Tiles across per region.
    pub region_width: u32,
    /// Tiles down per region.
    pub region_height: u32,
    /// Tile width in pixels.
    pub tile_width: u32,
    /// Tile height in pixels.
    pub tile_height: u32,
    /// Horizontal tile overlap in pixels.
    pub overlap_x: u32,
    /// Vertical tile overlap in pixels.
    pub overlap_y: u32,
    /// Tile traversal order used during acquisition.
    #[serde(default)]
    pub tiling_mode: TilingMode,
    /// Number of staining/imaging cycles.
    pub num_cycles: usize,
    /// Number of z-planes per tile.
    pub num_z_planes: usize,
    /// Physical channel names acquired in every cycle, in slot order.
    pub per_cycle_channel_names: Vec<String>,
    /// Logical channel names across all cycles; length must equal
    /// `num_cycles * per_cycle_channel_names.len()`.
    pub channel_names: Vec<String>,
    /// Directional slot aliases: `{a: b}` makes the data stored at physical
    /// slot `a` readable under the logical name bound to slot `b`.
    #[serde(default)]
    pub index_symlinks: IndexMap<usize, usize>,
    /// 1-based region indexes to process; defaults to `[1]`.
    #[serde(default = "default_region_indexes")]
    pub region_indexes: Vec<usize>,
}

fn default_region_indexes() -> Vec<usize> {
    vec![1]
}

impl AcquisitionConfig {
    /// Physical channel slots per cycle.
    pub fn channels_per_cycle(&self) -> usize {
        self.per_cycle_channel_names.len()
    }

    /// Shared per-tile pixel geometry.
    pub fn tile_geometry(&self) -> TileGeometry {
        TileGeometry {
            tile_width: self.tile_width,
            tile_height: self.tile_height,
            overlap_x: self.overlap_x,
            overlap_y: self.overlap_y,
        }
    }

    /// Regions to process, converted from the declared 1-based indexes.
    pub fn regions(&self) -> Vec<Region> {
        self.region_indexes
            .iter()
            .map(|&i| Region {
                region_index: i - 1,
                width: self.region_width,
                height: self.region_height,
            })
            .collect()
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.region_width == 0 || self.region_height == 0 {
            return Err(ConfigError::EmptyRegion {
                region: self.region_indexes.first().map(|i| i - 1).unwrap_or(0),
                width: self.region_width,
                height: self.region_height,
            });
        }
        if self.overlap_x >= self.tile_width {
            return Err(ConfigError::DegenerateOverlap {
                axis: Axis::X,
                overlap: self.overlap_x,
                extent: self.tile_width,
            });
        }
        if self.overlap_y >= self.tile_height {
            return Err(ConfigError::DegenerateOverlap {
                axis: Axis::Y,
                overlap: self.overlap_y,
                extent: self.tile_height,
            });
        }
        for &idx in &self.region_indexes {
            if idx == 0 {
                return Err(ConfigError::InvalidRegionIndex(idx));
            }
        }
        let expected = self.num_cycles * self.channels_per_cycle();
        if self.channel_names.len() != expected {
            return Err(ConfigError::ChannelCountMismatch {
                expected,
                actual: self.channel_names.len(),
            });
        }
        for (&a, &b) in &self.index_symlinks {
            let slots = self.channels_per_cycle();
            if a >= slots {
                return Err(ConfigError::SymlinkOutOfRange {
                    slot: a,
                    slots_per_cycle: slots,
                });
            }
            if b >= slots {
                return Err(ConfigError::SymlinkOutOfRange {
                    slot: b,
                    slots_per_cycle: slots,
                });
            }
        }
        Ok(())
    }
}

/// Per-cell statistic identifiers for intensity features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    /// Arithmetic mean.
    Mean,
    /// Sum of intensities.
    Sum,
    /// Population variance.
    Var,
    /// Minimum intensity.
    Min,
    /// Maximum intensity.
    Max,
    /// Median intensity.
    Median,
}

impl Statistic {
    /// Column-name suffix for the flattened output table.
    pub fn suffix(&self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Sum => "sum",
            Statistic::Var => "var",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Median => "median",
        }
    }
}

/// Accepts either an explicit statistic list or a bare boolean:
/// `true` means the default (`[mean]`), `false` disables the target entirely.
fn stat_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Statistic>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<Statistic>),
        Flag(bool),
    }
    Ok(match Repr::deserialize(deserializer)? {
        Repr::List(list) => list,
        Repr::Flag(true) => vec![Statistic::Mean],
        Repr::Flag(false) => Vec::new(),
    })
}

fn default_cell_intensity() -> Vec<Statistic> {
    vec![Statistic::Mean]
}

fn default_true() -> bool {
    true
}

fn default_neighbor_distance() -> f64 {
    40.0
}

/// Which per-cell features the cytometer computes.
///
/// A statistic absent from a list is simply omitted from the record, never
/// defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Statistics computed over the whole-cell mask, per channel.
    #[serde(default = "default_cell_intensity", deserialize_with = "stat_list")]
    pub cell_intensity: Vec<Statistic>,
    /// Statistics computed over the nucleus mask, per channel.
    #[serde(default, deserialize_with = "stat_list")]
    pub nucleus_intensity: Vec<Statistic>,
    /// Whether to compute morphology features (area, perimeter, ...).
    #[serde(default = "default_true")]
    pub morphology: bool,
    /// Whether to build the cell adjacency graph.
    #[serde(default = "default_true")]
    pub cell_graph: bool,
    /// Centroid distance (pixels) under which two cells are neighbors.
    #[serde(default = "default_neighbor_distance")]
    pub neighbor_distance: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            cell_intensity: default_cell_intensity(),
            nucleus_intensity: Vec::new(),
            morphology: true,
            cell_graph: true,
            neighbor_distance: default_neighbor_distance(),
        }
    }
}

/// Cytometer selection: a registered type identifier plus its constructor
/// parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CytometerConfig {
    /// Registry identifier, e.g. `"threshold"` or `"spheroid"`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Constructor arguments forwarded to the registered factory.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Feature toggles and statistic lists.
    #[serde(default)]
    pub features: FeatureConfig,
}

impl Default for CytometerConfig {
    fn default() -> Self {
        CytometerConfig {
            type_name: "threshold".to_string(),
            params: serde_json::Value::Null,
            features: FeatureConfig::default(),
        }
    }
}

fn default_decon_iterations() -> usize {
    25
}

fn default_decon_scale() -> f32 {
    0.5
}

/// Deconvolution parameters, forwarded to the external processing provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeconvolutionConfig {
    /// Iteration count; `0` disables deconvolution.
    #[serde(default = "default_decon_iterations")]
    pub iterations: usize,
    /// Scale factor applied to deconvolved intensities.
    #[serde(default = "default_decon_scale")]
    pub scale_factor: f32,
}

impl Default for DeconvolutionConfig {
    fn default() -> Self {
        DeconvolutionConfig {
            iterations: default_decon_iterations(),
            scale_factor: default_decon_scale(),
        }
    }
}

/// Processing options: device list, focus reference, cytometer selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// 0-based GPU device identifiers available to the run.
    pub gpus: Vec<u32>,
    /// 0-based cycle whose focus scores label extracted best-z stacks.
    pub best_focus_cycle: usize,
    /// 0-based physical slot used by the external focus scorer.
    pub best_focus_channel: usize,
    /// Deconvolution parameters for the processing provider.
    pub deconvolution: DeconvolutionConfig,
    /// Cytometer selection and feature configuration.
    pub cytometer: CytometerConfig,
}

/// One entry of the ordered operator/analysis step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Materialize an extract spec for every tile.
    Extract {
        /// Extract spec name.
        name: String,
    },
    /// Stitch a previously extracted spec into per-region composites.
    Montage {
        /// Montage spec name.
        name: String,
    },
    /// Run cytometry over all tiles and emit the aggregated table.
    AggregateCytometryStatistics {
        /// Aggregation policy.
        #[serde(flatten)]
        spec: AggregationSpec,
    },
}

/// The full declarative experiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Acquisition geometry and channel layout.
    pub acquisition: AcquisitionConfig,
    /// Processing options.
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Named extract specs.
    #[serde(default)]
    pub extracts: Vec<ExtractSpec>,
    /// Named montage specs.
    #[serde(default)]
    pub montages: Vec<MontageSpec>,
    /// Ordered step list, executed sequentially.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl ExperimentConfig {
    /// Parse a configuration from a JSON string and validate it.
    pub fn from_json(json: &str) -> Result<Self, crate::core::error::PipelineError> {
        let config: ExperimentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn load(path: &Path) -> Result<Self, crate::core::error::PipelineError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Look up an extract spec by name.
    pub fn extract(&self, name: &str) -> ConfigResult<&ExtractSpec> {
        self.extracts
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ConfigError::UnknownExtract(name.to_string()))
    }

    /// Look up a montage spec by name.
    pub fn montage(&self, name: &str) -> ConfigResult<&MontageSpec> {
        self.montages
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ConfigError::UnknownMontage(name.to_string()))
    }

    /// Validate the whole configuration.
    ///
    /// Checks geometry invariants, channel counts, symlink ranges, extract
    /// z-planes, and step ordering (a montage must be preceded by the extract
    /// it stitches).
    pub fn validate(&self) -> ConfigResult<()> {
        self.acquisition.validate()?;

        for extract in &self.extracts {
            if let ZPolicy::Fixed(z) = extract.z {
                if z >= self.acquisition.num_z_planes {
                    return Err(ConfigError::ZPlaneOutOfRange {
                        z,
                        num_z: self.acquisition.num_z_planes,
                    });
                }
            }
        }

        for montage in &self.montages {
            self.extract(&montage.extract_name)?;
        }

        let mut extracted: Vec<&str> = Vec::new();
        for step in &self.steps {
            match step {
                Step::Extract { name } => {
                    self.extract(name)?;
                    extracted.push(name);
                }
                Step::Montage { name } => {
                    let montage = self.montage(name)?;
                    if !extracted.iter().any(|e| *e == montage.extract_name) {
                        return Err(ConfigError::MontageBeforeExtract {
                            montage: name.clone(),
                            extract: montage.extract_name.clone(),
                        });
                    }
                }
                Step::AggregateCytometryStatistics { .. } => {}
            }
        }
        Ok(())
    }
}
