//! Validate command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::debug;

use crate::plan::Plan;

/// Run the validate command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    let plan = Plan::build(&config)?;

    for resource in plan.resources() {
        debug!("{} <- [{}]", resource.name, resource.depends_on.join(", "));
    }

    println!(
        "[OK] {:?} is valid: {} resources, {} services",
        config_path,
        plan.resources().len(),
        config.services.len()
    );
    Ok(())
}
