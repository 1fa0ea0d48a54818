use std::{path::Path, sync::Arc};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use rayon::ThreadPoolBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

use neuroseg::{
    config::{AnalyzeArgs, BatchArgs, Command, ServeArgs},
    server, BatchAnalyzer, Config, ModelHandle,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    match &config.command {
        Command::Serve(args) => serve(&config, args),
        Command::Analyze(args) => analyze(&config, args),
        Command::Batch(args) => batch(&config, args),
    }
}

fn load_model(config: &Config) -> ModelHandle<neuroseg::Model> {
    ModelHandle::load(&config.model_path, config.device_id)
}

fn serve(config: &Config, args: &ServeArgs) -> Result<()> {
    let handle = load_model(config);
    ensure!(
        handle.is_available(),
        "Application launch failed because the model {} could not be loaded",
        config.model_path.display()
    );

    tokio::runtime::Runtime::new()
        .context("Failed to start async runtime")?
        .block_on(server::serve(
            Arc::new(handle),
            args.report_path.clone(),
            args.socket_addr(),
        ))?;
    Ok(())
}

fn analyze(config: &Config, args: &AnalyzeArgs) -> Result<()> {
    let bundle = neuroseg::analyze_image(
        Arc::new(load_model(config)),
        &args.image,
        &args.output_dir,
        &args.report_path(),
    )
    .with_context(|| format!("Failed to analyze {}", args.image.display()))?;

    println!("Prediction: {}", bundle.prediction);
    println!("Confidence: {}", bundle.confidence);
    println!("Tumor Area: {}", bundle.tumor_area);
    println!("Report:     {}", bundle.report_path.display());
    Ok(())
}

fn batch(config: &Config, args: &BatchArgs) -> Result<()> {
    ensure!(
        Path::new(&args.input_dir).exists(),
        "Input directory does not exist"
    );

    let model = load_model(config).into_inner()?;
    ThreadPoolBuilder::new()
        .num_threads(args.num_threads)
        .build_global()?;

    let entries = BatchAnalyzer::new(model, &args.input_dir, &args.output_dir).process_directory()?;
    let detected = entries
        .iter()
        .filter(|e| e.summary.prediction == neuroseg::Prediction::TumorDetected)
        .count();
    info!(
        total = entries.len(),
        detected,
        output_dir = %args.output_dir.display(),
        "batch complete"
    );
    Ok(())
}
