//! `replay-dead-letters` command implementation.

use anyhow::{Context, Result};
use dispatcher::{DispatcherBuilder, PipelineState};
use tracing::{info, warn};

use super::load_blueprint;
use crate::cli::ReplayArgs;
use crate::error::CliError;

/// Execute the `replay-dead-letters` command
pub async fn run_replay(args: &ReplayArgs) -> Result<()> {
    let mut blueprint = load_blueprint(&args.config)?;
    if let Some(ref url) = args.external_url {
        info!(url = %url, "Overriding external sink endpoint from CLI");
        blueprint.sinks.external.url = Some(url.clone());
    }

    let state = PipelineState::open(&blueprint.state).map_err(|e| CliError::open("state directory", e))?;
    let pending = state.dead_letters.list_for_sink(args.sink).len();
    if pending == 0 {
        println!("No dead letters pending for sink '{}'", args.sink);
        return Ok(());
    }
    info!(sink = %args.sink, pending, "Replaying dead letters");

    let report = DispatcherBuilder::new(blueprint.sinks.clone(), state)
        .replay_dead_letters(args.sink)
        .await
        .map_err(CliError::from)
        .context("Dead-letter replay failed")?;

    println!(
        "Replayed {} of {} dead letter(s) for sink '{}'; {} still pending",
        report.replayed, report.attempted, args.sink, report.failed
    );
    if report.failed > 0 {
        warn!(failed = report.failed, "Some dead letters could not be replayed");
    }
    Ok(())
}
