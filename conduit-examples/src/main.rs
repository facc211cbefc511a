//! Conduit Example: Pipeline Patterns
//!
//! This example wires the building blocks of conduit into small pipelines: a chain of
//! arithmetic stages, a fan-in of two labeled generators, a tee, a fan-out over named workers,
//! and an infinite generator stopped by a deadline.

use clap::Parser;
use conduit::pipeline::Pipeline;
use conduit_config::shared::PipelineConfig;
use conduit_config::{Environment, load_config};
use conduit_telemetry::tracing::init_tracing;
use futures::StreamExt;
use futures::future::join_all;
use std::error::Error;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of elements emitted by each finite generator.
    #[arg(long, default_value = "20")]
    count: u64,

    /// Number of fan-out workers, overriding the configuration.
    #[arg(long)]
    workers: Option<usize>,

    /// Capacity of every pipeline edge, overriding the configuration.
    #[arg(long)]
    capacity: Option<usize>,

    /// Deadline after which the infinite generator is cancelled, in milliseconds.
    #[arg(long, default_value = "100")]
    timeout_ms: u64,

    /// Load the pipeline configuration from the `configuration` directory.
    #[arg(long)]
    from_config: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Set development environment for pretty logging, before any runtime thread exists.
    Environment::Dev.set();

    // Initialize tracing.
    let _log_flusher = init_tracing("conduit-example")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(main_impl())
}

async fn main_impl() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut config = if args.from_config {
        load_config::<PipelineConfig>()?
    } else {
        PipelineConfig::default()
    };
    if let Some(workers) = args.workers {
        config.fan_out.workers = workers;
    }
    if let Some(capacity) = args.capacity {
        config.stream.capacity = capacity;
    }

    info!(
        count = args.count,
        capacity = config.stream.capacity,
        workers = config.fan_out.workers,
        "starting conduit example"
    );

    run_arithmetic_chain(&config, args.count).await?;
    run_labeled_fan_in(&config, args.count).await?;
    run_tee(&config, args.count).await?;
    run_named_workers(&config).await?;
    run_until_deadline(&config, Duration::from_millis(args.timeout_ms)).await?;

    info!("conduit example complete");
    Ok(())
}

/// Doubles, increments and doubles again every generated number.
async fn run_arithmetic_chain(config: &PipelineConfig, count: u64) -> Result<(), Box<dyn Error>> {
    let mut pipeline = Pipeline::new(config.clone())?;

    let numbers = pipeline.generate(1..=count);
    let doubled = pipeline.map(numbers, |x| x * 2);
    let incremented = pipeline.map(doubled, |x| x + 1);
    let result = pipeline.map(incremented, |x| x * 2);

    let values: Vec<u64> = result.collect().await;
    info!(?values, "arithmetic chain finished");

    pipeline.wait().await?;
    Ok(())
}

/// Merges two generators emitting labeled values.
async fn run_labeled_fan_in(config: &PipelineConfig, count: u64) -> Result<(), Box<dyn Error>> {
    let mut pipeline = Pipeline::new(config.clone())?;

    let a = pipeline.generate((0..count).map(|i| format!("a{i}")));
    let b = pipeline.generate((0..count).map(|i| format!("b{i}")));
    let merged = pipeline.fan_in(vec![a, b]);

    let values: Vec<String> = merged.collect().await;
    info!(received = values.len(), ?values, "fan-in finished");

    pipeline.wait().await?;
    Ok(())
}

/// Duplicates one generator into three outputs read concurrently.
async fn run_tee(config: &PipelineConfig, count: u64) -> Result<(), Box<dyn Error>> {
    let mut pipeline = Pipeline::new(config.clone())?;

    let numbers = pipeline.generate(0..count);
    let outputs = pipeline.tee(numbers, 3)?;

    let copies = join_all(outputs.into_iter().map(|output| output.collect::<Vec<_>>())).await;
    for (output, copy) in copies.iter().enumerate() {
        info!(output, received = copy.len(), "tee output drained");
    }

    pipeline.wait().await?;
    Ok(())
}

/// Sanitizes and title-cases names, then hands them to a group of workers.
async fn run_named_workers(config: &PipelineConfig) -> Result<(), Box<dyn Error>> {
    let mut pipeline = Pipeline::new(config.clone())?;

    let names = pipeline.generate(["ada", "grace", "al", "barbara", "ken", "edsger", "dennis"]);
    let sanitized = pipeline.filter(names, |name| name.len() > 3);
    let titled = pipeline.map(sanitized, title_case);

    pipeline.fan_out(titled, |worker, name| async move {
        info!(worker, %name, "worker processed record");
    })?;

    pipeline.wait().await?;
    Ok(())
}

/// Runs an infinite generator until the deadline cancels the pipeline.
async fn run_until_deadline(
    config: &PipelineConfig,
    deadline: Duration,
) -> Result<(), Box<dyn Error>> {
    let mut pipeline = Pipeline::new(config.clone())?;
    pipeline.cancel_after(deadline);

    let mut counter = 0u64;
    let numbers = pipeline.generate_with(move || {
        counter += 1;
        Some(counter)
    });
    let doubled = pipeline.map(numbers, |x| x * 2);

    let received = doubled.fold(0u64, |received, _| async move { received + 1 }).await;
    info!(
        received,
        deadline_ms = deadline.as_millis() as u64,
        "infinite generator stopped by the deadline"
    );

    pipeline.wait().await?;
    Ok(())
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
