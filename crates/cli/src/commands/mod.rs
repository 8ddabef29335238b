//! Command implementations.

mod backfill;
mod generate;
mod inspect;
mod replay;
mod run;
mod validate;

pub use backfill::run_backfill;
pub use generate::run_generate;
pub use inspect::run_inspect;
pub use replay::run_replay;
pub use run::run_pipeline;
pub use validate::run_validate;

use config_loader::ConfigLoader;
use contracts::PipelineBlueprint;
use tracing::info;

use crate::cli::ConfigArgs;
use crate::error::{CliError, Result};

/// Load the configuration file and apply the shared overrides
fn load_blueprint(args: &ConfigArgs) -> Result<PipelineBlueprint> {
    if !args.config.exists() {
        return Err(CliError::config_not_found(args.config.display().to_string()));
    }

    let mut blueprint = ConfigLoader::load_from_path(&args.config).map_err(CliError::Config)?;
    if let Some(dir) = &args.state_dir {
        info!(state_dir = %dir.display(), "Overriding state directory from CLI");
        blueprint.state.dir = dir.clone();
    }
    Ok(blueprint)
}

/// Re-run validation after CLI overrides touched the blueprint
fn revalidate(blueprint: &PipelineBlueprint) -> Result<()> {
    ConfigLoader::validate(blueprint).map_err(CliError::Config)
}
