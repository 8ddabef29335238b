//! `inspect` command implementation.
//!
//! Reads the state directory only; safe to run next to a live pipeline.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use contracts::{Checkpoint, EnrichedEvent, EventId, SinkKind};
use dispatcher::{DeadLetter, HealthReport, LedgerSummary, OperatorSurface, PipelineState};
use serde::Serialize;
use tracing::info;

use super::load_blueprint;
use crate::cli::InspectArgs;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct InspectReport {
    state_dir: String,
    checkpoints: Vec<Checkpoint>,
    ledger: LedgerSummary,
    dead_letters: Vec<DeadLetterView>,
    health: HealthReport,
}

#[derive(Debug, Serialize)]
struct DeadLetterView {
    event_id: EventId,
    sink: SinkKind,
    attempts: u32,
    last_error: String,
    dead_lettered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<EnrichedEvent>,
}

impl DeadLetterView {
    fn new(letter: DeadLetter, with_payload: bool) -> Self {
        Self {
            event_id: letter.event_id,
            sink: letter.sink,
            attempts: letter.attempts,
            last_error: letter.last_error,
            dead_lettered_at: letter.dead_lettered_at,
            payload: with_payload.then_some(letter.payload),
        }
    }
}

/// Execute the `inspect` command
pub fn run_inspect(args: &InspectArgs) -> Result<()> {
    let blueprint = load_blueprint(&args.config)?;
    info!(state_dir = %blueprint.state.dir.display(), "Inspecting pipeline state");

    let state = PipelineState::open(&blueprint.state).map_err(|e| CliError::open("state directory", e))?;
    let surface = OperatorSurface::from_state(&state);
    let report = build_report(
        &surface,
        blueprint.state.dir.display().to_string(),
        args.sink,
        args.payloads,
    )?;

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize state report")?;
        println!("{}", json);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn build_report(
    surface: &OperatorSurface,
    state_dir: String,
    sink: Option<SinkKind>,
    payloads: bool,
) -> Result<InspectReport> {
    let checkpoints = surface
        .checkpoints()
        .map_err(|e| CliError::open("checkpoints", e))?;

    Ok(InspectReport {
        state_dir,
        checkpoints,
        ledger: surface.ledger_summary(),
        dead_letters: surface
            .dead_letters(sink)
            .into_iter()
            .map(|letter| DeadLetterView::new(letter, payloads))
            .collect(),
        health: surface.health(),
    })
}

fn print_report(report: &InspectReport) {
    println!("\n=== Pipeline State: {} ===\n", report.state_dir);

    println!("Health: {:?}", report.health.status);
    for component in &report.health.components {
        println!(
            "  {:<16} {:<10} {}",
            component.component,
            format!("{:?}", component.status).to_lowercase(),
            component.detail
        );
    }
    println!();

    println!("Checkpoints:");
    if report.checkpoints.is_empty() {
        println!("  (none)");
    }
    for checkpoint in &report.checkpoints {
        let offset = checkpoint
            .offset
            .map_or_else(|| "-".to_string(), |o| o.to_string());
        println!(
            "  {:<48} offset={:<10} updated={}",
            checkpoint.namespace,
            offset,
            checkpoint.updated_at.to_rfc3339()
        );
    }

    let ledger = &report.ledger;
    println!("\nLedger:");
    println!(
        "  events={} pending={} delivered={} dead_lettered={}",
        ledger.events, ledger.pending, ledger.delivered, ledger.dead_lettered
    );

    println!("\nDead letters ({}):", report.dead_letters.len());
    for letter in &report.dead_letters {
        println!(
            "  event {} -> {} after {} attempt(s): {}",
            letter.event_id, letter.sink, letter.attempts, letter.last_error
        );
        if let Some(ref payload) = letter.payload {
            match serde_json::to_string(payload) {
                Ok(json) => println!("    {}", json),
                Err(e) => println!("    <unprintable payload: {e}>"),
            }
        }
    }
    println!();
}
