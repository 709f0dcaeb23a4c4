//! refstream - Worker Pool and Cross-Reference Cache for Streaming Imports
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use refstream::config::{CliArgs, PipelineConfig};
use refstream::pipeline::{ImportPipeline, SyntheticConfig, SyntheticSource};
use refstream::progress::{print_header, print_summary, ProgressReporter};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // Validate and create config
    let config = PipelineConfig::from_args(args).context("Invalid configuration")?;

    let cache_location = config
        .cache
        .cache_dir
        .as_ref()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| "temporary directory".to_string());

    if config.show_progress {
        print_header(
            config.units,
            config.pool.core_pool_size,
            config.pool.maximum_pool_size,
            &cache_location,
        );
    }

    let pipeline = ImportPipeline::new(config.clone());

    // Setup signal handler for graceful shutdown
    let shutdown_flag = pipeline.shutdown_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        shutdown_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    // Create progress reporter
    let progress = if config.show_progress {
        Some(ProgressReporter::new())
    } else {
        None
    };

    if let Some(ref p) = progress {
        p.set_status("Preparing cache tables...");
    }

    let source = SyntheticSource::new(SyntheticConfig::new(config.units, config.seed));

    // Run the import
    let result = pipeline
        .run(source, |snapshot| {
            if let Some(ref p) = progress {
                p.update(snapshot);
            }
        })
        .context("Import failed")?;

    // Finish progress
    if let Some(ref p) = progress {
        if result.completed {
            p.finish("Import completed");
        } else {
            p.finish("Import interrupted");
        }
    }

    if config.show_summary {
        print_summary(&result);
    }

    if !result.completed {
        info!("Import was interrupted before completion");
    }

    if result.failed > 0 {
        info!(failed = result.failed, "Import completed with failures");
    }

    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default = if verbose {
        "refstream=debug,warn"
    } else {
        "refstream=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
