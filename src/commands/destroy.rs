//! Destroy command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use crate::cmd_abstraction::RealCommandExecutor;
use crate::lock::LockGuard;
use crate::remote::apply::Applier;
use crate::remote::ssh::SshTransport;
use crate::state::ApplyState;

/// Run the destroy command
pub async fn run(config_path: &Path, state_override: Option<&Path>, yes: bool) -> Result<()> {
    let config = super::load_config(config_path)?;
    let state_file = super::state_path(&config, state_override);

    let _lock = LockGuard::acquire(&LockGuard::path_for(&state_file))?;
    let state = ApplyState::load(&state_file)?;

    if state.resources.is_empty() {
        println!("[OK] Nothing recorded in {:?}", state_file);
        return Ok(());
    }

    if !yes {
        println!("Would delete, in this order:");
        for (name, _) in state.reverse_order() {
            println!("  - {}", name);
        }
        anyhow::bail!("Refusing to destroy without --yes");
    }

    warn!(
        "Destroying {} resources on {}",
        state.resources.len(),
        config.connection.destination()
    );
    let transport = SshTransport::new(config.connection.clone(), RealCommandExecutor::new());
    let mut applier = Applier::new(&transport, &config.connection, state, &state_file);
    let summary = applier.destroy().await?;

    info!("State file {:?} is now empty", state_file);
    println!("[OK] {}", summary);
    Ok(())
}
