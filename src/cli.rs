use clap::Parser;
use std::path::PathBuf;

use crate::entities::LoadStrategy;

// Build version with engine info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Engine: headless (built-in)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Headless orchestration run: create many animation instances, drive them
/// with a simulated host clock and report pool/cache/memory statistics.
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Animation JSON files; instances cycle through them (synthetic payload if none)
    #[arg(value_name = "FILE")]
    pub payloads: Vec<PathBuf>,

    /// Number of instances to create
    #[arg(short = 'n', long = "instances", value_name = "N", default_value_t = 60)]
    pub instances: usize,

    /// Number of host frames to simulate
    #[arg(long = "frames", value_name = "N", default_value_t = 300)]
    pub frames: u32,

    /// Simulated host frame rate
    #[arg(long = "fps", value_name = "FPS", default_value_t = 60.0)]
    pub fps: f64,

    /// Instances laid out inside the viewport; the rest sit below the fold
    #[arg(long = "visible", value_name = "N", default_value_t = 12)]
    pub visible: usize,

    /// Load strategy for created instances
    #[arg(long = "strategy", value_name = "eager|lazy|intersection", default_value = "intersection", value_parser = parse_strategy)]
    pub strategy: LoadStrategy,

    /// Override pool capacity from settings
    #[arg(long = "pool-size", value_name = "N")]
    pub pool_size: Option<usize>,

    /// Override memory limit (MB) from settings
    #[arg(long = "memory-limit", value_name = "MB")]
    pub memory_limit_mb: Option<f64>,

    /// Parse payloads inline instead of on worker threads
    #[arg(long = "no-workers")]
    pub no_workers: bool,

    /// Write the effective settings back to the config directory
    #[arg(long = "save-settings")]
    pub save_settings: bool,

    /// Enable debug logging to file (default: orchestra.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

fn parse_strategy(value: &str) -> Result<LoadStrategy, String> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| format!("unknown load strategy '{}'", value))
}
