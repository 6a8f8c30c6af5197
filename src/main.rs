// Command-line entry point: translate the text on one page image

use page_translator::{
    blocks_to_json, core::Config, utils::Metrics, CancelSignal, PipelineOrchestrator,
};

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Translate the text on one page image
#[derive(Debug, PartialEq, Parser)]
#[command(name = "page_translator", version, about)]
struct CliArgs {
    /// Page image to translate
    input: PathBuf,

    /// Output image (default: <input>_translated.<ext> next to the input)
    output: Option<PathBuf>,

    /// Target language, overriding TARGET_LANG
    target_lang: Option<String>,

    /// Write the run report as JSON
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Write the translated blocks as interchange JSON
    #[arg(long, value_name = "PATH")]
    blocks: Option<PathBuf>,
}

/// `page.png` -> `page_translated.jpg` next to the input
fn default_output_path(input: &Path, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "page".to_string());
    input.with_file_name(format!("{}_translated.{}", stem, extension))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration
    let config = Config::new().context("Failed to load configuration")?;

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "page_translator={}",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let metrics = Metrics::new();
    let orchestrator = PipelineOrchestrator::from_config(&config, Some(metrics.clone()))?;

    let image_bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;

    let cancel = CancelSignal::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping before the next stage");
                cancel.cancel();
            }
        });
    }

    let target_lang = args
        .target_lang
        .clone()
        .unwrap_or_else(|| config.output.target_lang.clone());

    info!(
        "Translating {} ({} -> {})",
        args.input.display(),
        config.output.source_lang,
        target_lang
    );

    let output = orchestrator
        .run(&image_bytes, &config.output.source_lang, &target_lang, &cancel)
        .await?;

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input, output.format.extension()));
    tokio::fs::write(&output_path, &output.image_bytes)
        .await
        .with_context(|| format!("Failed to write {}", output_path.display()))?;
    info!(
        "✓ Wrote {}x{} image to {}",
        output.width,
        output.height,
        output_path.display()
    );

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&output.report)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!("✓ Wrote run report to {}", path.display());
    }

    if let Some(path) = &args.blocks {
        let json = blocks_to_json(&output.blocks)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write blocks {}", path.display()))?;
        info!("✓ Wrote {} blocks to {}", output.blocks.len(), path.display());
    }

    debug!("Metrics:\n{}", metrics.to_prometheus());
    Ok(())
}
