mod cli;
mod config;
mod error;
mod fetch;
mod logging;
mod palette;
mod pipeline;
mod state_machine;
mod ui;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use cli::{Cli, Command};
use config::HuepipeConfig;
use fetch::Fetcher;
use pipeline::{ImageStages, Pipeline};
use ui::RunProgress;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Settings of one `run` invocation after CLI overrides.
struct RunArgs {
    source: PathBuf,
    output: PathBuf,
    json: bool,
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HuepipeConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => HuepipeConfig::load().context("Failed to load huepipe.toml")?,
    };
    logging::init(if cli.verbose { "debug" } else { config.log_level.as_str() });
    debug!(?config, "Loaded configuration");

    match cli.command {
        Command::Run {
            source,
            output,
            download_workers,
            summarize_workers,
            cleanup_workers,
            timeout_secs,
            json,
        } => {
            if let Some(count) = download_workers {
                config.workers.download = count;
            }
            if let Some(count) = summarize_workers {
                config.workers.summarize = count;
            }
            if let Some(count) = cleanup_workers {
                config.workers.cleanup = count;
            }
            if let Some(secs) = timeout_secs {
                config.fetch_timeout_secs = secs;
            }
            let args = RunArgs {
                source,
                output,
                json,
                verbose: cli.verbose,
            };
            run(&config, args).await
        }
        Command::Inspect { image } => inspect(&image).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: &HuepipeConfig, args: RunArgs) -> Result<()> {
    let source = tokio::fs::File::open(&args.source)
        .await
        .with_context(|| format!("Failed to open source {}", args.source.display()))?;
    let output = tokio::fs::File::create(&args.output)
        .await
        .with_context(|| format!("Failed to create output {}", args.output.display()))?;
    let fetcher = Fetcher::new(config.fetch_timeout()).context("Failed to build HTTP client")?;

    let pipeline = Pipeline::builder(config.workers)
        .failure_buffer(config.failure_buffer)
        .with_source(source)
        .with_output(output)
        .with_stages(ImageStages::new(fetcher))
        .build()?;

    let progress = RunProgress::start(&args.source, args.verbose || args.json);
    let tracker = pipeline.tracker();
    let mut handle = tokio::spawn(pipeline.run());
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);

    let report = loop {
        tokio::select! {
            joined = &mut handle => break joined??,
            _ = ticker.tick() => progress.update(&tracker.progress()),
        }
    };

    if args.json {
        progress.print_report(&report);
    } else {
        progress.finish(&report);
    }
    Ok(())
}

async fn inspect(image: &Path) -> Result<()> {
    let path = image.to_path_buf();
    let summary = tokio::task::spawn_blocking(move || palette::summarize_file(&path))
        .await?
        .with_context(|| format!("Failed to summarize {}", image.display()))?;
    ui::print_summary(image, &summary);
    Ok(())
}
