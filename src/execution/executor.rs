//! Step-list interpretation.
//!
//! The executor walks the configured step list in order: extract steps fan
//! out over tiles in parallel and park their stacks in an in-memory artifact
//! store, montage steps stitch previously extracted stacks per region, and
//! the aggregation step runs cytometry over every tile before flattening the
//! surviving records into the output table. Tile-scoped failures are
//! collected and reported; anything else aborts the run.

use crate::aggregate::{AggregationEngine, AggregationTable};
use crate::core::config::{ExperimentConfig, Step};
use crate::core::error::{Component, DeviceError, PipelineResult, TileError, TileFailure};
use crate::core::types::{AggregationSpec, ImageStack, Tile};
use crate::cytometry::{CytometerRegistry, CytometryEngine, CytometryRecord};
use crate::engine::extract::ExtractionEngine;
use crate::engine::montage::{MontageAssembler, MontageCanvas};
use crate::execution::devices::DevicePool;
use crate::geometry::channels::ChannelResolver;
use crate::geometry::tiling::TileIndex;
use crate::providers::{FocusScoreProvider, ImageProvider};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Counters describing one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Steps interpreted.
    pub steps_run: usize,
    /// Stacks materialized by extract steps.
    pub stacks_extracted: usize,
    /// Composites produced by montage steps.
    pub montage_canvases: usize,
    /// Cytometry records produced before aggregation.
    pub cytometry_records: usize,
    /// Rows in the final table.
    pub table_rows: usize,
    /// Tile-scoped failures across all steps.
    pub tiles_failed: usize,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
}

/// Everything a run produces.
#[derive(Debug)]
pub struct RunOutput {
    /// Unique identifier of this run.
    pub run_id: Uuid,
    /// Stitched composites, keyed by montage spec name.
    pub montages: IndexMap<String, Vec<MontageCanvas>>,
    /// Aggregated cytometry table, when the step list includes one.
    pub table: Option<AggregationTable>,
    /// Tile-scoped failures collected along the way.
    pub failures: Vec<TileFailure>,
    /// Run counters.
    pub stats: ExecutionStats,
}

/// Interprets a validated experiment configuration.
pub struct PipelineExecutor<'a> {
    config: &'a ExperimentConfig,
    images: &'a dyn ImageProvider,
    focus: &'a dyn FocusScoreProvider,
    registry: &'a CytometerRegistry,
}

impl<'a> PipelineExecutor<'a> {
    /// Create an executor over the given collaborators.
    pub fn new(
        config: &'a ExperimentConfig,
        images: &'a dyn ImageProvider,
        focus: &'a dyn FocusScoreProvider,
        registry: &'a CytometerRegistry,
    ) -> Self {
        PipelineExecutor {
            config,
            images,
            focus,
            registry,
        }
    }

    /// Execute the configured step list.
    pub fn run(&self) -> PipelineResult<RunOutput> {
        self.config.validate()?;
        let started = std::time::Instant::now();
        let run_id = Uuid::new_v4();
        let acquisition = &self.config.acquisition;
        let processing = &self.config.processing;

        let resolver = ChannelResolver::new(acquisition)?;
        let extraction = ExtractionEngine::new(
            &resolver,
            self.images,
            self.focus,
            acquisition.tile_geometry(),
            acquisition.num_z_planes,
            processing.best_focus_cycle,
        );
        let indexes: Vec<TileIndex> = acquisition
            .regions()
            .into_iter()
            .map(|region| {
                TileIndex::new(region, acquisition.tile_geometry(), acquisition.tiling_mode)
            })
            .collect::<Result<_, _>>()?;
        let devices = if processing.gpus.is_empty() {
            None
        } else {
            Some(DevicePool::new(processing.gpus.iter().copied()))
        };

        log::info!(
            "run {}: {} steps over {} region(s)",
            run_id,
            self.config.steps.len(),
            indexes.len()
        );

        let mut store: HashMap<String, HashMap<Tile, Vec<ImageStack>>> = HashMap::new();
        let mut montages: IndexMap<String, Vec<MontageCanvas>> = IndexMap::new();
        let mut table = None;
        let mut failures = Vec::new();
        let mut stats = ExecutionStats::default();

        for step in &self.config.steps {
            match step {
                Step::Extract { name } => {
                    log::info!("extract '{}'", name);
                    let stacks =
                        self.run_extract(name, &extraction, &indexes, &mut stats, &mut failures)?;
                    store.insert(name.clone(), stacks);
                }
                Step::Montage { name } => {
                    log::info!("montage '{}'", name);
                    let canvases =
                        self.run_montage(name, &store, &indexes, &mut stats, &mut failures)?;
                    montages.insert(name.clone(), canvases);
                }
                Step::AggregateCytometryStatistics { spec } => {
                    log::info!("aggregate cytometry statistics ({:?})", spec.mode);
                    table = Some(self.run_aggregation(
                        spec,
                        &resolver,
                        &extraction,
                        &indexes,
                        devices.as_ref(),
                        &mut stats,
                        &mut failures,
                    )?);
                }
            }
            stats.steps_run += 1;
        }

        stats.tiles_failed = failures.len();
        stats.duration_ms = started.elapsed().as_millis() as u64;
        for failure in &failures {
            log::warn!("tile failure: {}", failure);
        }
        log::info!(
            "run {} finished: {} stacks, {} canvases, {} table rows, {} tile failure(s)",
            run_id,
            stats.stacks_extracted,
            stats.montage_canvases,
            stats.table_rows,
            stats.tiles_failed
        );

        Ok(RunOutput {
            run_id,
            montages,
            table,
            failures,
            stats,
        })
    }

    fn run_extract(
        &self,
        name: &str,
        extraction: &ExtractionEngine<'_>,
        indexes: &[TileIndex],
        stats: &mut ExecutionStats,
        failures: &mut Vec<TileFailure>,
    ) -> PipelineResult<HashMap<Tile, Vec<ImageStack>>> {
        let spec = self.config.extract(name)?;
        let mut per_tile = HashMap::new();
        for index in indexes {
            let results: Vec<(Tile, PipelineResult<Vec<ImageStack>>)> = index
                .acquisition_order()
                .into_par_iter()
                .map(|tile| (tile, extraction.extract(spec, tile)))
                .collect();
            for (tile, result) in results {
                match result {
                    Ok(stacks) => {
                        stats.stacks_extracted += stacks.len();
                        per_tile.insert(tile, stacks);
                    }
                    Err(err) => match err.into_tile_error() {
                        Ok(error) => failures.push(TileFailure {
                            component: Component::Extraction,
                            tile,
                            error,
                        }),
                        Err(fatal) => return Err(fatal),
                    },
                }
            }
        }
        Ok(per_tile)
    }

    fn run_montage(
        &self,
        name: &str,
        store: &HashMap<String, HashMap<Tile, Vec<ImageStack>>>,
        indexes: &[TileIndex],
        stats: &mut ExecutionStats,
        failures: &mut Vec<TileFailure>,
    ) -> PipelineResult<Vec<MontageCanvas>> {
        let spec = self.config.montage(name)?;
        let stacks = store.get(&spec.extract_name).ok_or_else(|| {
            crate::core::error::ConfigError::MontageBeforeExtract {
                montage: name.to_string(),
                extract: spec.extract_name.clone(),
            }
        })?;

        let mut canvases = Vec::new();
        for index in indexes {
            let assembler = MontageAssembler::new(index);
            let (region_canvases, region_failures) = assembler.assemble(stacks);
            canvases.extend(region_canvases);
            failures.extend(region_failures);
        }
        stats.montage_canvases += canvases.len();
        Ok(canvases)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_aggregation(
        &self,
        spec: &AggregationSpec,
        resolver: &ChannelResolver,
        extraction: &ExtractionEngine<'_>,
        indexes: &[TileIndex],
        devices: Option<&DevicePool>,
        stats: &mut ExecutionStats,
        failures: &mut Vec<TileFailure>,
    ) -> PipelineResult<AggregationTable> {
        let cytometer_config = &self.config.processing.cytometer;
        let cytometer = self.registry.create(cytometer_config)?;
        let engine = CytometryEngine::new(
            extraction,
            resolver,
            cytometer.as_ref(),
            &cytometer_config.features,
            self.config.acquisition.num_z_planes,
        );

        let mut records = Vec::new();
        for index in indexes {
            let results: Vec<(Tile, PipelineResult<Vec<CytometryRecord>>)> = index
                .acquisition_order()
                .into_par_iter()
                .enumerate()
                .map(|(tile_index, tile)| {
                    let result = (|| {
                        // A starved device pool fails this tile, not the run.
                        let _lease = match devices {
                            Some(pool) => Some(pool.acquire().map_err(|err| match err {
                                DeviceError::Exhausted { attempts } => {
                                    TileError::DeviceUnavailable { tile, attempts }
                                }
                            })?),
                            None => None,
                        };
                        engine.tile_records(tile, tile_index)
                    })();
                    (tile, result)
                })
                .collect();
            for (tile, result) in results {
                match result {
                    Ok(tile_records) => records.extend(tile_records),
                    Err(err) => match err.into_tile_error() {
                        Ok(error) => failures.push(TileFailure {
                            component: Component::Cytometry,
                            tile,
                            error,
                        }),
                        Err(fatal) => return Err(fatal),
                    },
                }
            }
        }
        stats.cytometry_records = records.len();

        // Best-focus lookup for the best-z-plane selection; tile/cycles
        // without focus scores stay absent and their records are dropped.
        let mut best_z = HashMap::new();
        for index in indexes {
            for (tile_index, tile) in index.acquisition_order().into_iter().enumerate() {
                for cycle in 0..self.config.acquisition.num_cycles {
                    if let Ok(z) = extraction.best_z(tile, cycle) {
                        best_z.insert((tile.region, tile_index, cycle), z);
                    }
                }
            }
        }

        let table = AggregationEngine::new(spec.clone()).aggregate(records, &best_z)?;
        stats.table_rows = table.len();
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{AggregationError, PipelineError, TileError};
    use crate::core::types::Plane;
    use crate::providers::{InMemoryFocusProvider, InMemoryImageProvider};
    use image::Luma;

    const W: u32 = 16;
    const H: u32 = 12;
    const NUM_Z: usize = 2;

    const CONFIG: &str = r#"{
        "acquisition": {
            "region_width": 2,
            "region_height": 1,
            "tile_width": 16,
            "tile_height": 12,
            "overlap_x": 4,
            "overlap_y": 0,
            "num_cycles": 1,
            "num_z_planes": 2,
            "per_cycle_channel_names": ["CH1", "CH2"],
            "channel_names": ["DAPI", "CD4"],
            "region_indexes": [1]
        },
        "processing": {
            "gpus": [0],
            "cytometer": {
                "type": "threshold",
                "params": {"nuclei_channel": "DAPI", "min_area": 4}
            }
        },
        "extracts": [
            {"name": "primary", "z": "best", "channels": ["DAPI", "CD4"]}
        ],
        "montages": [
            {"name": "overview", "extract_name": "primary"}
        ],
        "steps": [
            {"op": "extract", "name": "primary"},
            {"op": "montage", "name": "overview"},
            {"op": "aggregate_cytometry_statistics", "mode": "best_z_plane"}
        ]
    }"#;

    fn nuclei_plane() -> Plane {
        // One 3x3 blob against a dark background.
        let mut plane = Plane::from_pixel(W, H, Luma([100u16]));
        for y in 2..5 {
            for x in 2..5 {
                plane.put_pixel(x, y, Luma([40_000]));
            }
        }
        plane
    }

    fn tile(col: u32) -> Tile {
        Tile {
            region: 0,
            row: 0,
            col,
        }
    }

    fn providers() -> (InMemoryImageProvider, InMemoryFocusProvider) {
        let mut images = InMemoryImageProvider::new();
        let mut focus = InMemoryFocusProvider::new();
        for col in 0..2 {
            for z in 0..NUM_Z {
                images.insert_acquired(tile(col), 0, 0, z, nuclei_plane());
                images.insert_acquired(tile(col), 0, 1, z, Plane::from_pixel(W, H, Luma([500u16])));
            }
            focus.insert(tile(col), 0, vec![0.1, 0.8]);
        }
        (images, focus)
    }

    #[test]
    fn test_full_run() {
        let config = ExperimentConfig::from_json(CONFIG).unwrap();
        let (images, focus) = providers();
        let registry = CytometerRegistry::with_builtins();
        let executor = PipelineExecutor::new(&config, &images, &focus, &registry);

        let output = executor.run().unwrap();
        assert!(format!("{:?}", output).contains("run_id"));
        assert!(output.failures.is_empty());
        assert_eq!(output.stats.steps_run, 3);
        // z: best yields one stack per tile
        assert_eq!(output.stats.stacks_extracted, 2);

        let canvases = &output.montages["overview"];
        assert_eq!(canvases.len(), 1);
        let plane = &canvases[0].channels[0].plane;
        // 2*16 - 1*4 = 28 wide
        assert_eq!((plane.width(), plane.height()), (28, 12));

        let table = output.table.as_ref().unwrap();
        // best z is 1; one cell per tile, one cycle
        assert_eq!(table.len(), 2);
        let z_col = table.column_index("z").unwrap();
        for row in &table.rows {
            assert_eq!(row[z_col], crate::aggregate::TableValue::Int(1));
        }
    }

    #[test]
    fn test_failed_tile_excluded_but_run_continues() {
        let config = ExperimentConfig::from_json(CONFIG).unwrap();
        let (images, _) = providers();
        // Only the first tile has focus scores: z-best extraction fails on
        // the second.
        let mut focus = InMemoryFocusProvider::new();
        focus.insert(tile(0), 0, vec![0.1, 0.8]);
        let registry = CytometerRegistry::with_builtins();
        let executor = PipelineExecutor::new(&config, &images, &focus, &registry);

        let output = executor.run().unwrap();
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].component, Component::Extraction);
        assert_eq!(output.failures[0].tile, tile(1));
        assert!(matches!(
            output.failures[0].error,
            TileError::MissingFocus { .. }
        ));

        // The surviving tile still reaches the montage and the table.
        let canvases = &output.montages["overview"];
        assert_eq!(canvases.len(), 1);
        let table = output.table.as_ref().unwrap();
        let tile_col = table.column_index("tile").unwrap();
        for row in &table.rows {
            assert_eq!(row[tile_col], crate::aggregate::TableValue::Int(0));
        }
    }

    #[test]
    fn test_empty_aggregation_aborts() {
        let config = ExperimentConfig::from_json(CONFIG).unwrap();
        let (images, _) = providers();
        // No focus scores anywhere: extraction fails per tile, and the
        // best-z filter drops every cytometry record.
        let focus = InMemoryFocusProvider::new();
        let registry = CytometerRegistry::with_builtins();
        let executor = PipelineExecutor::new(&config, &images, &focus, &registry);

        let err = executor.run().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Aggregation(AggregationError::Empty { .. })
        ));
    }

    #[test]
    fn test_unknown_cytometer_is_fatal() {
        let mut config = ExperimentConfig::from_json(CONFIG).unwrap();
        config.processing.cytometer.type_name = "nonexistent".into();
        let (images, focus) = providers();
        let registry = CytometerRegistry::with_builtins();
        let executor = PipelineExecutor::new(&config, &images, &focus, &registry);

        let err = executor.run().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_steps_execute_in_declared_order() {
        let mut config = ExperimentConfig::from_json(CONFIG).unwrap();
        // Swap the montage ahead of its extract; validation rejects the list.
        config.steps.swap(0, 1);
        let (images, focus) = providers();
        let registry = CytometerRegistry::with_builtins();
        let executor = PipelineExecutor::new(&config, &images, &focus, &registry);

        let err = executor.run().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(crate::core::error::ConfigError::MontageBeforeExtract { .. })
        ));
    }
}
