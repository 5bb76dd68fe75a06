//! Cytomosaic CLI - Declarative Microscopy Pipelines
//!
//! This is a demonstration CLI for the Cytomosaic library. It validates
//! experiment configurations and can execute a run against synthetic pixel
//! data, since real acquisitions come in through the provider traits.

use anyhow::{bail, Context, Result};
use cytomosaic::prelude::*;
use image::Luma;
use std::path::{Path, PathBuf};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        return;
    }

    let result = match args[1].as_str() {
        "validate" => {
            if args.len() < 3 {
                eprintln!("Error: Please specify a configuration file");
                return;
            }
            validate(Path::new(&args[2]))
        }
        "cytometers" => {
            list_cytometers();
            Ok(())
        }
        "run" => {
            if args.len() < 3 {
                eprintln!("Error: Please specify a configuration file");
                eprintln!(
                    "Usage: {} run <config.json> [--table <path>] [--preview <dir>]",
                    args[0]
                );
                return;
            }
            run(&args[2..])
        }
        "help" | "--help" | "-h" => {
            print_usage(&args[0]);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage(&args[0]);
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn print_usage(program: &str) {
    println!("Cytomosaic - Declarative Microscopy Pipelines v{}", cytomosaic::VERSION);
    println!();
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  validate <config>  Validate an experiment configuration");
    println!("  cytometers         List registered cytometer types");
    println!("  run <config> [options]  Execute a run on synthetic pixel data");
    println!("  help               Show this help message");
    println!();
    println!("Run options:");
    println!("  --table <path>     Write the aggregated cell table as CSV");
    println!("  --preview <dir>    Write montage previews as PNG files");
}

fn validate(path: &Path) -> Result<()> {
    let config = ExperimentConfig::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let regions = config.acquisition.regions();
    let tiles: usize = regions.iter().map(|r| r.tile_count()).sum();
    println!("Configuration OK");
    println!("  regions: {}", regions.len());
    println!("  tiles: {}", tiles);
    println!(
        "  cycles: {}, z-planes: {}",
        config.acquisition.num_cycles, config.acquisition.num_z_planes
    );
    println!("  extracts: {}", config.extracts.len());
    println!("  montages: {}", config.montages.len());
    println!("  steps: {}", config.steps.len());
    Ok(())
}

fn list_cytometers() {
    let registry = CytometerRegistry::with_builtins();
    println!("Registered cytometers ({} total):", registry.len());
    for name in registry.names() {
        println!("  - {}", name);
    }
}

fn run(args: &[String]) -> Result<()> {
    let config_path = PathBuf::from(&args[0]);
    let mut table_path: Option<PathBuf> = None;
    let mut preview_dir: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--table" => {
                i += 1;
                table_path = Some(PathBuf::from(
                    args.get(i).context("--table requires a path")?,
                ));
            }
            "--preview" => {
                i += 1;
                preview_dir = Some(PathBuf::from(
                    args.get(i).context("--preview requires a directory")?,
                ));
            }
            other => bail!("unknown option: {}", other),
        }
        i += 1;
    }

    let config = ExperimentConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let (images, focus) = synthetic_providers(&config)?;
    let registry = CytometerRegistry::with_builtins();

    let executor = PipelineExecutor::new(&config, &images, &focus, &registry);
    let output = executor.run().context("run failed")?;

    println!("Run {} complete", output.run_id);
    println!("  stacks extracted: {}", output.stats.stacks_extracted);
    println!("  montage canvases: {}", output.stats.montage_canvases);
    println!("  table rows: {}", output.stats.table_rows);
    if !output.failures.is_empty() {
        println!("  tile failures:");
        for failure in &output.failures {
            println!("    {}", failure);
        }
    }

    if let (Some(path), Some(table)) = (table_path, output.table.as_ref()) {
        let mut sink = CsvTableSink::create(&path)?;
        sink.write_table(table)?;
        println!("Wrote {}", path.display());
    }

    if let Some(dir) = preview_dir {
        std::fs::create_dir_all(&dir)?;
        for (name, canvases) in &output.montages {
            let spec = config.montage(name)?;
            for canvas in canvases {
                let preview = render_preview(canvas, spec);
                let path = dir.join(format!("{}_r{}_z{}.png", name, canvas.region, canvas.z));
                preview.save(&path)?;
                println!("Wrote {}", path.display());
            }
        }
    }

    Ok(())
}

/// Build deterministic synthetic providers matching the config's geometry:
/// a dark background with a grid of bright nuclei per tile, and focus scores
/// peaking at the middle z-plane.
fn synthetic_providers(
    config: &ExperimentConfig,
) -> Result<(InMemoryImageProvider, InMemoryFocusProvider)> {
    let acq = &config.acquisition;
    let mut images = InMemoryImageProvider::new();
    let mut focus = InMemoryFocusProvider::new();

    let mid = acq.num_z_planes / 2;
    for region in acq.regions() {
        for row in 0..region.height {
            for col in 0..region.width {
                let tile = Tile {
                    region: region.region_index,
                    row,
                    col,
                };
                for cycle in 0..acq.num_cycles {
                    for slot in 0..acq.channels_per_cycle() {
                        for z in 0..acq.num_z_planes {
                            images.insert_acquired(
                                tile,
                                cycle,
                                slot,
                                z,
                                synthetic_plane(acq.tile_width, acq.tile_height, slot, z),
                            );
                        }
                    }
                    let scores: Vec<f32> = (0..acq.num_z_planes)
                        .map(|z| 1.0 - (z as f32 - mid as f32).abs() / acq.num_z_planes as f32)
                        .collect();
                    focus.insert(tile, cycle, scores);
                }
            }
        }
    }
    Ok((images, focus))
}

fn synthetic_plane(width: u32, height: u32, slot: usize, z: usize) -> Plane {
    // Bright 5x5 spots every 32 pixels; sharpest at low z for slot 0.
    let peak = 40_000u16.saturating_sub((z as u16) * 2_000);
    Plane::from_fn(width, height, |x, y| {
        let near_spot = (x % 32) < 5 && (y % 32) < 5;
        if near_spot {
            Luma([peak.saturating_add(slot as u16 * 100)])
        } else {
            Luma([200 + slot as u16 * 10])
        }
    })
}
