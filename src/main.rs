use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

use multilos::coverage::{CancelToken, LogProgress, MultiLosEngine, ScanPoint};
use multilos::io::{load_config_from_json, write_points_csv};
use multilos::terrain::ElevationStore;

/// Classify a map view by whether any viewpoint can see each point.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON scan configuration.
    #[arg(short, long)]
    config: PathBuf,

    /// CSV output file; stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Evaluate columns on all cores, overriding the configuration.
    #[arg(long)]
    parallel: bool,
}

fn main() -> Result<()> {
    setup_logging()?;
    let args = Args::parse();

    let config = load_config_from_json(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    let viewpoints = config.viewpoints()?;
    info!("Scanning for {} view points at {} m", viewpoints.len(), config.altitude_m);

    let store = ElevationStore::new(config.sources(), config.handle_budget);
    let terrain = store.level(config.elevation_level);
    let progress = LogProgress::new();
    let engine = MultiLosEngine::new(&terrain).with_progress(&progress);
    let request = config.scan_request();
    let cancel = CancelToken::new();

    let points: Vec<ScanPoint> = if args.parallel || config.parallel {
        engine.scan_parallel(&viewpoints, &request, &cancel)?.points
    } else {
        engine.scan(&viewpoints, &request, &cancel)?.collect()
    };

    let stats = store.stats();
    info!(
        tiles_opened = stats.tiles_opened,
        missing_cells = stats.missing_cells,
        columns_loaded = stats.columns_loaded,
        read_failures = stats.read_failures,
        handle_evictions = stats.handle_evictions,
        "Elevation store usage"
    );

    let writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {path:?}"))?,
        )),
        None => Box::new(io::stdout().lock()),
    };
    let rows = write_points_csv(writer, points, &viewpoints, &config.render_style())
        .context("Failed to write scan output")?;
    info!("Wrote {rows} rows");

    Ok(())
}

fn setup_logging() -> Result<()> {
    let filters = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("info".parse()?)
        .from_env_lossy();
    let filter_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(filters);
    tracing_subscriber::registry().with(filter_layer).init();
    Ok(())
}
