mod cli;
mod config;
mod diff;
mod output;
mod pipeline;
mod scan;
mod store;
mod utils;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use output::ConsoleSink;
use pipeline::{CycleSink, Pipeline};
use scan::ScanSession;
use store::SnapshotStore;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.logging.level);

    match cli.command {
        Commands::Validate => {
            output::display_config(&config);
            eprintln!("Configuration OK ({} hosts)", config.hosts.len());
            Ok(())
        }

        Commands::Changes { current, previous, format } => {
            let store = SnapshotStore::new(&config.storage.dir);
            let cmp = pipeline::compare_stored(&store, current.as_deref(), previous.as_deref())?;
            output::display_comparison(&cmp, format)?;
            Ok(())
        }

        Commands::Scan { no_save, hosts, format, verbose } => {
            let session = ScanSession::new();
            install_abort_handler(&session)?;
            let mut pipeline = Pipeline::new(&config).only_hosts(&hosts)?;
            if no_save {
                pipeline = pipeline.without_saving();
            }
            let sinks: Vec<Box<dyn CycleSink>> = vec![Box::new(ConsoleSink { format, verbose })];

            let report = runtime()?.block_on(pipeline.run_cycle(&session, &sinks))?;
            eprintln!("{}", output::cycle_outcome(&report));
            if let Some(path) = &report.saved_to {
                eprintln!("Snapshot saved: {}", path.display());
            }
            Ok(())
        }

        Commands::Watch { interval, format, verbose } => {
            let session = ScanSession::new();
            install_abort_handler(&session)?;
            let pipeline = Pipeline::new(&config);
            let sinks: Vec<Box<dyn CycleSink>> = vec![Box::new(ConsoleSink { format, verbose })];

            info!(interval_secs = interval, hosts = config.hosts.len(), "watching fleet");
            let cycles = runtime()?.block_on(pipeline.watch(&session, &sinks, Duration::from_secs(interval)))?;
            eprintln!("Stopped after {} cycles", cycles);
            Ok(())
        }
    }
}

/// Logs go to stderr so `--format json` on stdout stays parseable. `RUST_LOG` wins over the config level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

/// First Ctrl+C cancels the scan and keeps partial results; the second exits.
fn install_abort_handler(session: &ScanSession) -> anyhow::Result<()> {
    let session = session.clone();
    let pressed = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if pressed.swap(true, Ordering::SeqCst) {
            eprintln!("\nCtrl+C received again, exiting...");
            std::process::exit(130);
        }
        let p = session.progress();
        eprintln!(
            "\nCtrl+C received, stopping scan at {}/{} hosts (press again to exit)...",
            p.hosts_finished, p.hosts_total
        );
        session.cancel();
    })
    .context("installing Ctrl+C handler")
}
