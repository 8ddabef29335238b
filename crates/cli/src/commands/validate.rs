//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{PipelineBlueprint, ReferenceKind, SinkKind, SourceKind, WarehouseTableKind};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    source: String,
    state_dir: String,
    partition_by: String,
    sinks: Vec<SinkKind>,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(blueprint) => {
            let warnings = collect_warnings(&blueprint);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: (!warnings.is_empty()).then_some(warnings),
                summary: Some(ConfigSummary {
                    version: format!("{:?}", blueprint.version),
                    source: blueprint.source.path.display().to_string(),
                    state_dir: blueprint.state.dir.display().to_string(),
                    partition_by: format!("{:?}", blueprint.source.partition_by),
                    sinks: blueprint.sinks.enabled(),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(blueprint: &PipelineBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();

    if blueprint.source.kind == SourceKind::Memory {
        warnings.push("source.kind = memory: the live log starts empty and is lost on exit".to_string());
    }
    if blueprint.reference.kind == ReferenceKind::Static {
        warnings.push("reference.kind = static: events are enriched with empty content metadata".to_string());
    }
    if !blueprint.state.fsync {
        warnings.push("state.fsync is off: a host crash can lose the last ledger writes".to_string());
    }
    if blueprint.sinks.warehouse.enabled && blueprint.sinks.warehouse.table == WarehouseTableKind::Memory {
        warnings.push("sinks.warehouse.table = memory: warehouse rows are not persisted".to_string());
    }
    if blueprint.backfill.concurrency > blueprint.dispatch.max_in_flight {
        warnings.push(format!(
            "backfill.concurrency ({}) exceeds dispatch.max_in_flight ({})",
            blueprint.backfill.concurrency, blueprint.dispatch.max_in_flight
        ));
    }
    if blueprint.dispatch.shutdown_grace_secs == 0 {
        warnings.push("dispatch.shutdown_grace_secs = 0: in-flight events are abandoned on every stop".to_string());
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Source: {}", summary.source);
            println!("  State dir: {}", summary.state_dir);
            println!("  Partition by: {}", summary.partition_by);
            println!("  Sinks: {:?}", summary.sinks);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_tables_and_static_reference_warn() {
        let mut blueprint = PipelineBlueprint::default();
        blueprint.reference.kind = ReferenceKind::Static;
        blueprint.sinks.warehouse.table = WarehouseTableKind::Memory;

        let warnings = collect_warnings(&blueprint);
        assert!(warnings.iter().any(|w| w.starts_with("reference.kind")));
        assert!(warnings.iter().any(|w| w.starts_with("sinks.warehouse.table")));
    }

    #[test]
    fn missing_file_is_invalid() {
        let result = validate_config(&ValidateArgs {
            config: "/nonexistent/pipeline.toml".into(),
            json: false,
        });
        assert!(!result.valid);
        assert!(result.summary.is_none());
    }

    #[test]
    fn valid_file_reports_enabled_sinks() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[reference]\npath = \"./content.json\"\n\n[sinks.warehouse]\nenabled = false").unwrap();

        let result = validate_config(&ValidateArgs {
            config: file.path().to_path_buf(),
            json: true,
        });
        assert!(result.valid, "{:?}", result.error);
        assert_eq!(result.summary.unwrap().sinks, vec![SinkKind::Cache]);
    }
}
