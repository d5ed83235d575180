//! wsi-pyramid - Inspect and index multi-file Whole Slide Images.
//!
//! This binary opens a slide, reports its structure, and writes restart
//! marker hint files for tiled JPEG slides.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsi_pyramid::{
    config::{CheckConfig, Cli, Command, IndexConfig},
    format::save_hints,
    RegionRequest, RegionService, Slide,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Check(config) => run_check(config).await,
        Command::Index(config) => run_index(config),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "wsi_pyramid=debug"
    } else {
        "wsi_pyramid=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// =============================================================================
// Check Command
// =============================================================================

#[derive(Debug, Serialize)]
struct LevelSummary {
    level: usize,
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    downsample: f64,
}

#[derive(Debug, Serialize)]
struct ProbeSummary {
    level: usize,
    width: u32,
    height: u32,
    opaque_pixels: usize,
    elapsed_ms: u64,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SlideSummary {
    path: String,
    format: &'static str,
    vendor: &'static str,
    comment: Option<String>,
    levels: Vec<LevelSummary>,
    associated_images: Vec<String>,
    properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    probes: Vec<ProbeSummary>,
}

async fn summarize(config: &CheckConfig, service: &RegionService) -> SlideSummary {
    let slide = service.slide();
    let levels = (0..slide.level_count())
        .filter_map(|level| {
            let info = slide.level_info(level)?;
            Some(LevelSummary {
                level,
                width: info.width,
                height: info.height,
                tile_width: info.tile_width,
                tile_height: info.tile_height,
                downsample: info.downsample,
            })
        })
        .collect();

    let mut probes = Vec::new();
    if config.probe {
        for level in 0..slide.level_count() {
            probes.push(probe_level(service, level, config.probe_size).await);
        }
    }

    SlideSummary {
        path: config.path.display().to_string(),
        format: slide.format().name(),
        vendor: slide.format().vendor(),
        comment: slide.comment().map(String::from),
        levels,
        associated_images: slide.associated_image_names(),
        properties: slide.properties().clone(),
        probes,
    }
}

/// Read a square region around the center of a level.
async fn probe_level(service: &RegionService, level: usize, size: u32) -> ProbeSummary {
    let slide = service.slide();
    let (width, height) = slide.level_dimensions(level).unwrap_or((0, 0));
    let downsample = slide.level_downsample(level).unwrap_or(1.0);
    let w = size.min(width).max(1);
    let h = size.min(height).max(1);

    // Center of the level, in level-0 coordinates
    let x = ((width - w.min(width)) as f64 / 2.0 * downsample) as i64;
    let y = ((height - h.min(height)) as f64 / 2.0 * downsample) as i64;

    let started = Instant::now();
    let result = service
        .get_region(RegionRequest::new(x, y, level, w, h))
        .await;

    let (opaque_pixels, error) = match result {
        Ok(region) => (region.pixels.iter().filter(|&&p| p >> 24 == 0xFF).count(), None),
        Err(e) => (0, Some(e.to_string())),
    };
    ProbeSummary {
        level,
        width: w,
        height: h,
        opaque_pixels,
        elapsed_ms: started.elapsed().as_millis() as u64,
        error,
    }
}

async fn run_check(config: CheckConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let options = match config.slide_options() {
        Ok(options) => options,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let started = Instant::now();
    let slide = match Slide::open(&config.path, &options) {
        Ok(slide) => slide,
        Err(e) => {
            if config.json {
                let json = serde_json::json!({
                    "path": config.path.display().to_string(),
                    "error": e.to_string(),
                });
                println!("{}", json);
            } else {
                println!("✗ {}: {}", config.path.display(), e);
            }
            return ExitCode::FAILURE;
        }
    };
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Slide opened");

    let service = RegionService::new(Arc::new(slide));
    let summary = summarize(&config, &service).await;
    let probe_failed = summary.probes.iter().any(|p| p.error.is_some());

    if config.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Could not serialize summary: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_report(&summary);
    }

    if probe_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_report(summary: &SlideSummary) {
    println!("Slide Check");
    println!("═════════════════════════════════");
    println!();
    println!("✓ Path: {}", summary.path);
    println!("✓ Format: {} ({})", summary.format, summary.vendor);
    if let Some(ref comment) = summary.comment {
        println!("  Comment: {}", comment);
    }
    println!();

    println!("Levels:");
    println!("─────────────────");
    for level in &summary.levels {
        println!(
            "  {:>2}: {}x{} px, {}x{} tiles, downsample {:.3}",
            level.level,
            level.width,
            level.height,
            level.tile_width,
            level.tile_height,
            level.downsample
        );
    }

    if !summary.associated_images.is_empty() {
        println!();
        println!("Associated images:");
        println!("─────────────────");
        for name in &summary.associated_images {
            println!("  {}", name);
        }
    }

    println!();
    println!("Properties:");
    println!("─────────────────");
    for (key, value) in &summary.properties {
        println!("  {} = {}", key, value);
    }

    if !summary.probes.is_empty() {
        println!();
        println!("Probes:");
        println!("─────────────────");
        for probe in &summary.probes {
            match probe.error {
                None => println!(
                    "  ✓ level {}: {}x{} read in {} ms",
                    probe.level, probe.width, probe.height, probe.elapsed_ms
                ),
                Some(ref e) => println!("  ✗ level {}: {}", probe.level, e),
            }
        }
    }

    println!();
    println!("═════════════════════════════════");
    if summary.probes.iter().all(|p| p.error.is_none()) {
        println!("✓ All checks passed!");
    } else {
        println!("✗ Some levels could not be read");
    }
}

// =============================================================================
// Index Command
// =============================================================================

fn run_index(config: IndexConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let slide = match Slide::open(&config.path, &config.slide_options()) {
        Ok(slide) => slide,
        Err(e) => {
            println!("✗ {}: {}", config.path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let Some(tiled) = slide.as_tiled_jpeg() else {
        println!("✗ {} is not a tiled JPEG slide", config.path.display());
        return ExitCode::FAILURE;
    };

    print!("Indexing {} JPEG file(s)... ", tiled.source_count());
    let started = Instant::now();
    tiled.wait_for_index();
    println!("done in {} ms", started.elapsed().as_millis());

    if !tiled.is_index_complete() {
        println!("✗ Some restart markers could not be found");
        return ExitCode::FAILURE;
    }

    match tiled.verify_offsets() {
        Ok(bad) if bad.is_empty() => println!("✓ All offsets verified"),
        Ok(bad) => {
            for (source, unit) in &bad {
                println!("✗ source {} unit {}: not preceded by a restart marker", source, unit);
            }
            return ExitCode::FAILURE;
        }
        Err(e) => {
            println!("✗ Verification failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = save_hints(&config.output, &tiled.export_offsets()) {
        println!("✗ {}", e);
        return ExitCode::FAILURE;
    }
    println!("✓ Wrote {}", config.output.display());

    ExitCode::SUCCESS
}
