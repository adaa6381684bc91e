//! Plan command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::plan::Plan;
use crate::remote::apply::{pending_changes, Change, PendingAction};
use crate::state::ApplyState;

fn marker(action: PendingAction) -> char {
    match action {
        PendingAction::Create => '+',
        PendingAction::Update => '~',
        PendingAction::Replace => '!',
        PendingAction::Delete => '-',
        PendingAction::Unchanged => ' ',
    }
}

/// One line per change, unchanged resources left out.
pub fn format_changes(changes: &[Change]) -> Vec<String> {
    changes
        .iter()
        .filter(|c| c.action != PendingAction::Unchanged)
        .map(|c| format!("  {} {} ({})", marker(c.action), c.name, c.action))
        .collect()
}

/// Run the plan command
pub async fn run(config_path: &Path, state_override: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let state_file = super::state_path(&config, state_override);
    let plan = Plan::build(&config)?;
    let state = ApplyState::load(&state_file)?;

    info!(
        "{} resources for {}",
        plan.resources().len(),
        config.connection.destination()
    );

    let changes = pending_changes(plan.resources(), &state, &config.connection);
    let lines = format_changes(&changes);
    if lines.is_empty() {
        println!("[OK] Host is up to date");
        return Ok(());
    }

    println!("Changes:");
    for line in &lines {
        println!("{}", line);
    }
    println!();
    println!("{} change(s). Run 'hostward apply' to converge.", lines.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(name: &str, action: PendingAction) -> Change {
        Change {
            name: name.to_string(),
            action,
        }
    }

    #[test]
    fn test_format_changes_skips_unchanged() {
        let lines = format_changes(&[
            change("ipset/BLOCK", PendingAction::Unchanged),
            change("chain/filter/DOCKER-USER/ipv4", PendingAction::Update),
            change("service/web/docker-up", PendingAction::Replace),
            change("rule/old/ipv4", PendingAction::Delete),
        ]);
        assert_eq!(
            lines,
            vec![
                "  ~ chain/filter/DOCKER-USER/ipv4 (update)",
                "  ! service/web/docker-up (replace)",
                "  - rule/old/ipv4 (delete)",
            ]
        );
    }

    #[test]
    fn test_format_changes_empty() {
        assert!(format_changes(&[change("x", PendingAction::Unchanged)]).is_empty());
    }
}
