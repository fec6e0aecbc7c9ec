//! CLI argument parsing for waitcause

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::AnalysisConfig;

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table (default)
    Text,
    /// JSON for machine parsing
    Json,
}

/// Which passes to replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Main pass only
    Single,
    /// Wait-state detection without delay analysis
    Basic,
    /// Wait states plus delay attribution
    Full,
}

#[derive(Parser, Debug)]
#[command(name = "waitcause")]
#[command(version)]
#[command(
    about = "Replay-based wait-state detection and delay attribution for parallel traces",
    long_about = None
)]
pub struct Cli {
    /// Trace bundle (JSON definitions plus per-location events)
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Analysis configuration (TOML)
    #[arg(short = 'C', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the passes implied by the configuration
    #[arg(short = 'm', long = "mode", value_enum)]
    pub mode: Option<Mode>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Write the report to FILE instead of stdout
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Apply `--mode` on top of a loaded configuration
    pub fn apply_mode(&self, config: AnalysisConfig) -> AnalysisConfig {
        let base = match self.mode {
            None => return config,
            Some(Mode::Single) => AnalysisConfig::single(),
            Some(Mode::Basic) => AnalysisConfig::basic(),
            Some(Mode::Full) => AnalysisConfig {
                critical_path: config.critical_path,
                ..AnalysisConfig::default()
            },
        };
        AnalysisConfig {
            pending_pool_capacity: config.pending_pool_capacity,
            progress_barrier: config.progress_barrier,
            recv_poll_interval_ms: config.recv_poll_interval_ms,
            ..base
        }
    }
}
