//! Command-line configuration for the `wsi-pyramid` tool.
//!
//! This module provides the CLI definition:
//! - Subcommands via clap derive
//! - Environment variables with `WSI_` prefix
//! - Validation before any slide is opened
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use wsi_pyramid::config::{Cli, Command};
//!
//! match Cli::parse().into_command() {
//!     Command::Check(config) => println!("checking {}", config.path.display()),
//!     Command::Index(config) => println!("indexing {}", config.path.display()),
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `WSI_CACHE_SIZE` - Tile cache budget, e.g. `64MB` (default: 64MB)
//! - `WSI_PROBE_SIZE` - Edge of the probe region in pixels (default: 256)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::slide::SlideOptions;

// =============================================================================
// Default Values
// =============================================================================

/// Default tile cache budget.
pub const DEFAULT_CACHE_SIZE: &str = "64MB";

/// Default edge length of the probe region.
pub const DEFAULT_PROBE_SIZE: u32 = 256;

// =============================================================================
// CLI Arguments
// =============================================================================

/// wsi-pyramid - Inspect and index multi-file Whole Slide Images.
///
/// Opens tiled JPEG (.vms) and DICOM WSI slides, reports their pyramid, and
/// precomputes restart-marker offsets for tiled JPEG slides.
#[derive(Parser, Debug, Clone)]
#[command(name = "wsi-pyramid")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Open a slide and print its levels, properties and associated images.
    Check(CheckConfig),

    /// Index every restart marker of a tiled JPEG slide and write a hint file.
    Index(IndexConfig),
}

#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    /// Slide file (.vms key file or any file of a DICOM series).
    pub path: PathBuf,

    /// Tile cache budget (e.g. 512KB, 64MB, 1GB).
    #[arg(long, default_value = DEFAULT_CACHE_SIZE, env = "WSI_CACHE_SIZE")]
    pub cache_size: String,

    /// Print a JSON summary instead of the text report.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Read a region at the center of every level.
    #[arg(long, default_value_t = false)]
    pub probe: bool,

    /// Edge of the probe region in pixels.
    #[arg(long, default_value_t = DEFAULT_PROBE_SIZE, env = "WSI_PROBE_SIZE")]
    pub probe_size: u32,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CheckConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if !self.path.is_file() {
            return Err(format!("{} is not a file", self.path.display()));
        }

        let cache_bytes = parse_size(&self.cache_size)?;
        if cache_bytes == 0 {
            return Err("cache_size must be greater than 0".to_string());
        }

        if self.probe && (self.probe_size == 0 || self.probe_size > 4096) {
            return Err("probe_size must be between 1 and 4096".to_string());
        }

        Ok(())
    }

    /// Slide options for this run. Call `validate()` first.
    pub fn slide_options(&self) -> Result<SlideOptions, String> {
        Ok(SlideOptions::default().with_cache_capacity(parse_size(&self.cache_size)?))
    }
}

#[derive(Args, Debug, Clone)]
pub struct IndexConfig {
    /// Tiled JPEG key file (.vms).
    pub path: PathBuf,

    /// Where to write the hint file.
    #[arg(short, long, env = "WSI_HINT_OUTPUT")]
    pub output: PathBuf,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl IndexConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if !self.path.is_file() {
            return Err(format!("{} is not a file", self.path.display()));
        }

        let is_key_file = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("vms"));
        if !is_key_file {
            return Err("index only applies to tiled JPEG (.vms) slides".to_string());
        }

        if self.output.as_os_str().is_empty() {
            return Err("output path is required".to_string());
        }
        if self.output == self.path {
            return Err("output would overwrite the key file".to_string());
        }

        Ok(())
    }

    /// Slide options for indexing: no cache needed beyond the minimum.
    pub fn slide_options(&self) -> SlideOptions {
        SlideOptions::default().with_cache_capacity(0)
    }
}

/// Parse a byte size such as `64MB`, `512kb`, `1GB` or `1048576`.
pub fn parse_size(value: &str) -> Result<usize, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let number: usize = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", value))?;
    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit '{}'", other)),
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", value))
}

// =============================================================================
// Tests
// =============================================================================
