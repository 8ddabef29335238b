//! # Integration Tests
//!
//! Cross-crate end-to-end scenarios, no external services required.
//!
//! Covers:
//! - Crash and restart without duplicate deliveries
//! - Fault injection under load
//! - Per-key ordering of live runs
//! - Circuit breaker fail-fast and half-open trial call
//! - Idempotent delivery to a mock HTTP endpoint

#[cfg(test)]
mod support;

#[cfg(test)]
mod breaker;
#[cfg(test)]
mod crash_restart;
#[cfg(test)]
mod fault_injection;
#[cfg(test)]
mod idempotence;
#[cfg(test)]
mod ordering;

#[cfg(test)]
mod contract_tests {
    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{PipelineBlueprint, SinkKind};

    #[test]
    fn test_default_blueprint_round_trips_through_toml() {
        let mut blueprint = PipelineBlueprint::default();
        blueprint.reference.path = Some("./data/content.json".into());

        let toml = ConfigLoader::to_toml(&blueprint).unwrap();
        let loaded = ConfigLoader::load_from_str(&toml, ConfigFormat::Toml).unwrap();

        assert_eq!(loaded.sinks.enabled(), vec![SinkKind::Cache, SinkKind::Warehouse]);
        assert_eq!(loaded.state.dir, blueprint.state.dir);
        assert_eq!(
            loaded.sinks.external.retry.max_attempts,
            blueprint.sinks.external.retry.max_attempts
        );
    }
}
