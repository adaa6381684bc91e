//! Apply command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::cmd_abstraction::RealCommandExecutor;
use crate::lock::LockGuard;
use crate::plan::Plan;
use crate::remote::apply::{pending_changes, Applier, PendingAction};
use crate::remote::ssh::SshTransport;
use crate::remote::{Connection, Resource};
use crate::state::ApplyState;

/// Scripts `apply` would run, grouped per resource.
pub fn dry_run_report(resources: &[Resource], state: &ApplyState, connection: &Connection) -> String {
    let mut out = String::new();
    for change in pending_changes(resources, state, connection) {
        let resource = resources.iter().find(|r| r.name == change.name);
        let recorded_delete = state.get(&change.name).and_then(|r| r.delete.as_deref());
        let steps: Vec<String> = match (change.action, resource) {
            (PendingAction::Unchanged, _) => continue,
            (PendingAction::Create, Some(r)) => vec![r.create.describe()],
            (PendingAction::Update, Some(r)) => {
                vec![r.update.as_ref().unwrap_or(&r.create).describe()]
            }
            (PendingAction::Replace, Some(r)) => recorded_delete
                .map(str::to_string)
                .into_iter()
                .chain(std::iter::once(r.create.describe()))
                .collect(),
            (PendingAction::Delete, _) => recorded_delete.map(str::to_string).into_iter().collect(),
            (_, None) => continue,
        };
        out.push_str(&format!("# {} ({})\n", change.name, change.action));
        for step in steps {
            out.push_str(&step);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// Run the apply command
pub async fn run(config_path: &Path, state_override: Option<&Path>, dry_run: bool) -> Result<()> {
    let config = super::load_config(config_path)?;
    let state_file = super::state_path(&config, state_override);
    let plan = Plan::build(&config)?;

    let _lock = LockGuard::acquire(&LockGuard::path_for(&state_file))?;
    let state = ApplyState::load(&state_file)?;

    if dry_run {
        let report = dry_run_report(plan.resources(), &state, &config.connection);
        if report.is_empty() {
            println!("[OK] Host is up to date");
        } else {
            print!("{}", report);
            println!("[DRY-RUN] No changes applied");
        }
        return Ok(());
    }

    info!("Applying to {}...", config.connection.destination());
    let transport = SshTransport::new(config.connection.clone(), RealCommandExecutor::new());
    let mut applier = Applier::new(&transport, &config.connection, state, &state_file);
    let summary = applier.apply(plan.resources()).await?;

    println!("[OK] {}", summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::test_connection;
    use crate::state::ResourceRecord;
    use chrono::Utc;

    fn record(resource: &Resource, order: usize) -> ResourceRecord {
        ResourceRecord {
            order,
            input_fingerprint: resource.input_fingerprint(&test_connection()),
            trigger_fingerprint: resource.trigger_fingerprint(),
            delete: resource.delete.clone(),
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_dry_run_lists_create_and_delete() {
        let conn = test_connection();
        let kept = Resource::script("ipset/BLOCK", "ipset create BLOCK hash:ip");
        let gone = Resource::script("rule/old/ipv4", "iptables -A INPUT -j ACCEPT")
            .with_delete("iptables -D INPUT -j ACCEPT");

        let mut state = ApplyState::default();
        state.record("rule/old/ipv4", record(&gone, 0));

        let report = dry_run_report(&[kept], &state, &conn);
        assert!(report.contains("# ipset/BLOCK (create)\nipset create BLOCK hash:ip\n"));
        assert!(report.contains("# rule/old/ipv4 (delete)\niptables -D INPUT -j ACCEPT\n"));
    }

    #[test]
    fn test_dry_run_replace_runs_recorded_delete_first() {
        let conn = test_connection();
        let old = Resource::script("service/web/rotate", "rotate v1")
            .with_delete("undo v1")
            .with_triggers(vec!["bundle:aaa".into()]);
        let new = Resource::script("service/web/rotate", "rotate v2")
            .with_delete("undo v2")
            .with_triggers(vec!["bundle:bbb".into()]);

        let mut state = ApplyState::default();
        state.record("service/web/rotate", record(&old, 0));

        let report = dry_run_report(&[new], &state, &conn);
        assert_eq!(report, "# service/web/rotate (replace)\nundo v1\nrotate v2\n\n");
    }

    #[test]
    fn test_dry_run_empty_when_unchanged() {
        let conn = test_connection();
        let resource = Resource::script("firewall/precreate", "iptables -N X");
        let mut state = ApplyState::default();
        state.record("firewall/precreate", record(&resource, 0));
        assert!(dry_run_report(&[resource], &state, &conn).is_empty());
    }
}
