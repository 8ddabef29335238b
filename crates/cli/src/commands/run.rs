//! `run` command implementation.

use anyhow::{Context, Result};
use contracts::PipelineBlueprint;
use std::time::Duration;
use tracing::info;

use super::{load_blueprint, revalidate};
use crate::cli::RunArgs;
use crate::pipeline::{Pipeline, PipelineConfig, RunTarget};

/// Execute the `run` command
pub async fn run_pipeline(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.config.display(), "Loading configuration");

    let mut blueprint = load_blueprint(&args.config)?;

    if let Some(ref path) = args.source {
        info!(path = %path.display(), "Overriding event log path from CLI");
        blueprint.source.path = path.clone();
    }
    if let Some(ref url) = args.external_url {
        info!(url = %url, "Overriding external sink endpoint from CLI");
        blueprint.sinks.external.url = Some(url.clone());
        blueprint.sinks.external.enabled = true;
    }
    revalidate(&blueprint)?;

    info!(
        source = %blueprint.source.path.display(),
        state_dir = %blueprint.state.dir.display(),
        sinks = ?blueprint.sinks.enabled(),
        "Configuration loaded"
    );

    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&blueprint);
        return Ok(());
    }

    let pipeline = Pipeline::new(PipelineConfig {
        blueprint,
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
        metrics_port: (args.metrics_port > 0).then_some(args.metrics_port),
    });

    info!("Starting pipeline...");
    let stats = pipeline
        .run(RunTarget::Live)
        .await
        .context("Pipeline execution failed")?;

    info!(
        events = stats.report.events_observed,
        checkpoint = ?stats.report.checkpoint,
        duration_secs = stats.duration.as_secs_f64(),
        "Pipeline stopped"
    );
    stats.print_summary();
    Ok(())
}

/// Print configuration summary for dry-run mode
fn print_config_summary(blueprint: &PipelineBlueprint) {
    println!("\n=== Configuration Summary ===\n");
    println!("Source:");
    println!("  Log: {} ({:?})", blueprint.source.path.display(), blueprint.source.kind);
    println!("  Partition by: {:?}", blueprint.source.partition_by);
    println!("\nReference: {:?}", blueprint.reference.kind);
    if let Some(ref path) = blueprint.reference.path {
        println!("  Path: {}", path.display());
    }
    println!("  Refresh every {}s", blueprint.reference.refresh_interval_secs);
    println!("\nState dir: {}", blueprint.state.dir.display());
    println!(
        "\nDispatch: max_in_flight={} checkpoint_interval={}ms grace={}s",
        blueprint.dispatch.max_in_flight,
        blueprint.dispatch.checkpoint_interval_ms,
        blueprint.dispatch.shutdown_grace_secs
    );

    let enabled = blueprint.sinks.enabled();
    println!("\nSinks ({}):", enabled.len());
    for kind in enabled {
        let delivery = blueprint.sinks.delivery(kind);
        println!(
            "  - {} (concurrency {}, max attempts {})",
            kind, delivery.concurrency, delivery.retry.max_attempts
        );
    }
    println!();
}
