//! `generate` command implementation.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use contracts::{ContentMetadata, EventLog, EventType, ReferenceSource};
use enrichment::JsonFileReferenceSource;
use ingestion::{EventGenerator, GeneratorConfig, JsonlEventLog};
use tracing::info;

use crate::cli::GenerateArgs;
use crate::error::CliError;

/// Execute the `generate` command
pub async fn run_generate(args: &GenerateArgs) -> Result<()> {
    let log = JsonlEventLog::open(&args.output)
        .await
        .map_err(|e| CliError::open("event log", e))?;
    let existing = log.len().await?;

    let config = GeneratorConfig {
        seed: args.seed,
        content_count: args.content_count,
        user_count: args.user_count,
        // Event ids continue after whatever the log already holds
        first_event_id: existing + 1,
        ..GeneratorConfig::default()
    };
    let mut generator = match load_catalog(&args.catalog).await? {
        Some(catalog) => {
            info!(path = %args.catalog.display(), entries = catalog.len(), "Using existing catalog");
            EventGenerator::with_catalog(config, catalog)
        }
        None => {
            let generator = EventGenerator::new(config);
            write_catalog(&args.catalog, generator.catalog()).await?;
            info!(
                path = %args.catalog.display(),
                entries = generator.catalog().len(),
                "Wrote synthetic catalog"
            );
            generator
        }
    };

    let spacing = Duration::milliseconds(args.spacing_ms as i64);
    let start = args
        .start
        .unwrap_or_else(|| Utc::now() - spacing * args.count.saturating_sub(1) as i32);

    let mut by_type: HashMap<EventType, usize> = HashMap::new();
    for event in generator.generate(args.count, start, spacing) {
        *by_type.entry(event.event_type).or_default() += 1;
        log.append(event).await?;
    }

    info!(
        output = %args.output.display(),
        appended = args.count,
        first_offset = existing,
        "Events generated"
    );
    println!(
        "Appended {} event(s) to {} (offsets {}..{})",
        args.count,
        args.output.display(),
        existing,
        existing + args.count as u64
    );
    for event_type in EventType::ALL {
        let count = by_type.get(&event_type).copied().unwrap_or(0);
        println!("  {:<8} {}", event_type.as_str(), count);
    }
    Ok(())
}

async fn load_catalog(path: &Path) -> Result<Option<Vec<ContentMetadata>>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    let catalog = JsonFileReferenceSource::new(path)
        .fetch_all()
        .await
        .map_err(|e| CliError::open("content catalog", e))?;
    Ok(Some(catalog))
}

async fn write_catalog(path: &Path, catalog: &[ContentMetadata]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(CliError::from)?;
    }
    let json = serde_json::to_string_pretty(catalog).context("Failed to serialize catalog")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write catalog to {}", path.display()))
}
