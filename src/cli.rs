use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "fleetscan")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_TIME"), ")"))]
#[command(about = "Fleet inventory scanner with snapshot change detection", long_about = None)]
pub struct Cli {
    /// Configuration file (default: $FLEETSCAN_CONFIG, then fleetscan.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan every configured host once, diff against the last snapshot and save
    Scan {
        /// Do not write the snapshot to the store
        #[arg(long)]
        no_save: bool,

        /// Scan only this host (repeatable); the result is compared but not saved
        #[arg(long = "host", value_name = "NAME")]
        hosts: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Show interfaces, containers and warnings
        #[arg(short, long)]
        verbose: bool,
    },

    /// Compare two stored snapshots
    Changes {
        /// Snapshot file to treat as current (default: latest)
        #[arg(long)]
        current: Option<PathBuf>,

        /// Snapshot file to compare against (default: the copy saved before current)
        #[arg(long)]
        previous: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Load and validate the configuration, then print it
    Validate,

    /// Run scan cycles repeatedly until Ctrl+C
    Watch {
        /// Seconds between cycles
        #[arg(short, long, default_value_t = 3600, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Show interfaces, containers and warnings
        #[arg(short, long)]
        verbose: bool,
    },
}
