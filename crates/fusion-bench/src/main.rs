//! Fusion command-line driver
//!
//! ## Usage
//!
//! ```bash
//! fusion-bench --config run.toml
//! fusion-bench --config run.toml --method dawe --max-steps 200
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fusion_bench::{BenchConfig, Method};

#[derive(Parser, Debug)]
#[command(name = "fusion-bench")]
#[command(author = "Daemoniorum LLC")]
#[command(version)]
#[command(about = "Test-time adaptive model merging", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured algorithm
    #[arg(long, value_enum)]
    method: Option<Method>,

    /// Override the number of adaptation steps
    #[arg(long)]
    max_steps: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = BenchConfig::load(&args.config)?;
    if let Some(method) = args.method {
        config.method = method;
    }
    if let Some(max_steps) = args.max_steps {
        config.adaptation.max_steps = max_steps;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate()?;

    // Initialize logging
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Configuration: {}", args.config.display());
    info!("  Method:       {:?}", config.method);
    info!("  Merge mode:   {:?}", config.adaptation.merge_mode);
    info!("  Max steps:    {}", config.adaptation.max_steps);
    info!("  Batch size:   {}", config.adaptation.batch_size);
    info!("  Log dir:      {}", config.adaptation.log_dir.display());

    let summary = fusion_bench::run(&config)?;

    match summary.final_loss {
        Some(loss) => info!(
            "Done: {} steps, final loss {:.6}, {:.1}s",
            summary.stats.steps, loss, summary.stats.elapsed_secs
        ),
        None => info!("Done: no adaptation steps"),
    }
    if let Some(path) = &summary.output {
        info!("Adapted model: {}", path.display());
    }

    Ok(())
}
