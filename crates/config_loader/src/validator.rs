//! Config validation
//!
//! Field ranges come from the `validator` derive rules on the blueprint;
//! the cross-field rules live here:
//! - at least one sink enabled
//! - retry base delay <= max delay, breaker min_calls <= window_size
//! - aggregation window covers at least one bucket
//! - external sink has an http(s) URL when enabled
//! - file-backed source / reference data have a path

use contracts::{
    CircuitBreakerConfig, ContractError, PipelineBlueprint, ReferenceKind, RetryConfig, SinkKind,
    SourceKind,
};
use validator::Validate;

/// Validate a PipelineBlueprint
///
/// Returns the first error encountered, or Ok(()).
pub fn validate(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    validate_ranges(blueprint)?;
    validate_sources(blueprint)?;
    validate_enabled_sinks(blueprint)?;
    validate_delivery_settings(blueprint)?;
    validate_aggregation_window(blueprint)?;
    validate_external_sink(blueprint)?;
    Ok(())
}

/// Derive-based field ranges
fn validate_ranges(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    blueprint
        .validate()
        .map_err(|e| ContractError::config_validation("blueprint", e.to_string()))
}

fn validate_sources(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    if blueprint.source.kind == SourceKind::Jsonl && blueprint.source.path.as_os_str().is_empty()
    {
        return Err(ContractError::config_validation(
            "source.path",
            "a jsonl source requires a path",
        ));
    }

    if blueprint.reference.kind == ReferenceKind::JsonFile && blueprint.reference.path.is_none() {
        return Err(ContractError::config_validation(
            "reference.path",
            "a json_file reference source requires a path",
        ));
    }
    Ok(())
}

fn validate_enabled_sinks(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    if blueprint.sinks.enabled().is_empty() {
        return Err(ContractError::config_validation(
            "sinks",
            "at least one sink must be enabled",
        ));
    }
    Ok(())
}

fn validate_delivery_settings(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    for kind in SinkKind::ALL {
        let delivery = blueprint.sinks.delivery(kind);
        validate_retry(kind, &delivery.retry)?;
        validate_breaker(kind, &delivery.circuit_breaker)?;
    }
    Ok(())
}

fn validate_retry(kind: SinkKind, retry: &RetryConfig) -> Result<(), ContractError> {
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(ContractError::config_validation(
            format!("sinks.{kind}.retry"),
            format!(
                "base_delay_ms ({}) must be <= max_delay_ms ({})",
                retry.base_delay_ms, retry.max_delay_ms
            ),
        ));
    }
    Ok(())
}

fn validate_breaker(kind: SinkKind, breaker: &CircuitBreakerConfig) -> Result<(), ContractError> {
    if breaker.min_calls > breaker.window_size {
        return Err(ContractError::config_validation(
            format!("sinks.{kind}.circuit_breaker"),
            format!(
                "min_calls ({}) must be <= window_size ({})",
                breaker.min_calls, breaker.window_size
            ),
        ));
    }
    Ok(())
}

fn validate_aggregation_window(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let cache = &blueprint.sinks.cache;
    if cache.window_minutes * 60 < cache.bucket_secs {
        return Err(ContractError::config_validation(
            "sinks.cache.window_minutes",
            format!(
                "window ({} min) must cover at least one bucket ({} s)",
                cache.window_minutes, cache.bucket_secs
            ),
        ));
    }
    Ok(())
}

fn validate_external_sink(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let external = &blueprint.sinks.external;
    if !external.enabled {
        return Ok(());
    }

    let url = external.url.as_deref().unwrap_or_default();
    if url.is_empty() {
        return Err(ContractError::config_validation(
            "sinks.external.url",
            "url is required when the external sink is enabled",
        ));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ContractError::config_validation(
            "sinks.external.url",
            format!("'{url}' is not an http(s) URL"),
        ));
    }
    Ok(())
}
