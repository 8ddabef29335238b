//! `backfill` command implementation.

use anyhow::{Context, Result};
use dispatcher::BackfillRange;
use tracing::info;

use super::{load_blueprint, revalidate};
use crate::cli::BackfillArgs;
use crate::error::CliError;
use crate::pipeline::{Pipeline, PipelineConfig, RunTarget};

/// Execute the `backfill` command
pub async fn run_backfill(args: &BackfillArgs) -> Result<()> {
    let range = BackfillRange::new(args.start, args.end).map_err(CliError::Config)?;
    let mut blueprint = load_blueprint(&args.config)?;

    if let Some(concurrency) = args.concurrency {
        info!(concurrency, "Overriding backfill concurrency from CLI");
        blueprint.backfill.concurrency = concurrency;
    }
    revalidate(&blueprint)?;

    info!(
        start = %range.start,
        end = %range.end,
        namespace = %range.namespace(),
        concurrency = blueprint.backfill.concurrency,
        "Backfill configured"
    );

    let pipeline = Pipeline::new(PipelineConfig {
        blueprint,
        timeout: None,
        metrics_port: (args.metrics_port > 0).then_some(args.metrics_port),
    });
    let stats = pipeline
        .run(RunTarget::Backfill(range))
        .await
        .context("Backfill failed")?;

    stats.print_summary();
    if stats.report.abandoned > 0 {
        println!(
            "Backfill interrupted with {} events in flight; rerun the same range to resume.",
            stats.report.abandoned
        );
    }
    Ok(())
}
