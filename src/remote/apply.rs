//! Converge the remote host to an ordered list of resources.
//!
//! Each resource is compared with its record from the last successful apply:
//!
//! - no record: create
//! - trigger fingerprint changed: run the recorded delete, then create
//! - input fingerprint changed: update, or create again when there is no update action
//! - otherwise: nothing to do
//!
//! Records whose resource disappeared are deleted last, newest first. The state file is
//! written after every successful step so an interrupted run resumes where it stopped.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use super::copy::SudoCopy;
use super::{run_checked, Action, Connection, Resource, Transport};
use crate::state::{ApplyState, ResourceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Create,
    Update,
    Replace,
    Delete,
    Unchanged,
}

impl fmt::Display for PendingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            PendingAction::Create => "create",
            PendingAction::Update => "update",
            PendingAction::Replace => "replace",
            PendingAction::Delete => "delete",
            PendingAction::Unchanged => "unchanged",
        };
        f.write_str(word)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    pub action: PendingAction,
}

fn classify(resource: &Resource, state: &ApplyState, connection: &Connection) -> PendingAction {
    match state.get(&resource.name) {
        None => PendingAction::Create,
        Some(record) if record.trigger_fingerprint != resource.trigger_fingerprint() => {
            PendingAction::Replace
        }
        Some(record) if record.input_fingerprint != resource.input_fingerprint(connection) => {
            PendingAction::Update
        }
        Some(_) => PendingAction::Unchanged,
    }
}

/// Names of recorded resources absent from `resources`, newest first.
fn removed<'s>(resources: &[Resource], state: &'s ApplyState) -> Vec<(&'s String, &'s ResourceRecord)> {
    let desired: BTreeSet<&str> = resources.iter().map(|r| r.name.as_str()).collect();
    state
        .reverse_order()
        .into_iter()
        .filter(|(name, _)| !desired.contains(name.as_str()))
        .collect()
}

/// What `apply` would do, in execution order.
pub fn pending_changes(
    resources: &[Resource],
    state: &ApplyState,
    connection: &Connection,
) -> Vec<Change> {
    let mut changes: Vec<Change> = resources
        .iter()
        .map(|r| Change {
            name: r.name.clone(),
            action: classify(r, state, connection),
        })
        .collect();
    changes.extend(removed(resources, state).into_iter().map(|(name, _)| Change {
        name: name.clone(),
        action: PendingAction::Delete,
    }));
    changes
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ApplySummary {
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} replaced, {} deleted, {} unchanged",
            self.created, self.updated, self.replaced, self.deleted, self.unchanged
        )
    }
}

pub struct Applier<'a, T: Transport + ?Sized> {
    transport: &'a T,
    connection: &'a Connection,
    state: ApplyState,
    state_path: PathBuf,
}

impl<'a, T: Transport + ?Sized> Applier<'a, T> {
    pub fn new(
        transport: &'a T,
        connection: &'a Connection,
        state: ApplyState,
        state_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            connection,
            state,
            state_path: state_path.into(),
        }
    }

    pub fn state(&self) -> &ApplyState {
        &self.state
    }

    fn save(&mut self) -> Result<()> {
        self.state.host = Some(self.connection.destination());
        self.state.save(&self.state_path)
    }

    fn check_host(&self) {
        if let Some(host) = &self.state.host {
            if *host != self.connection.destination() && !self.state.resources.is_empty() {
                tracing::warn!(
                    "State file was last applied to {}, now targeting {}",
                    host,
                    self.connection.destination()
                );
            }
        }
    }

    async fn run_action(&self, resource: &str, action: &Action) -> Result<()> {
        match action {
            Action::Script(script) => {
                run_checked(self.transport, resource, &self.connection.privileged(script)).await?;
            }
            Action::Upload(upload) => {
                SudoCopy::new(self.connection, upload, resource)
                    .run(self.transport)
                    .await?;
            }
        }
        Ok(())
    }

    async fn run_delete(&self, resource: &str, delete: Option<&String>) -> Result<()> {
        if let Some(script) = delete {
            run_checked(self.transport, resource, &self.connection.privileged(script)).await?;
        }
        Ok(())
    }

    fn record(&mut self, order: usize, resource: &Resource) -> Result<()> {
        self.state.record(
            resource.name.clone(),
            ResourceRecord {
                order,
                input_fingerprint: resource.input_fingerprint(self.connection),
                trigger_fingerprint: resource.trigger_fingerprint(),
                delete: resource.delete.clone(),
                applied_at: Utc::now(),
            },
        );
        self.save()
    }

    pub async fn apply(&mut self, resources: &[Resource]) -> Result<ApplySummary> {
        self.check_host();
        let mut summary = ApplySummary::default();

        for (order, resource) in resources.iter().enumerate() {
            let action = classify(resource, &self.state, self.connection);
            match action {
                PendingAction::Unchanged => {
                    summary.unchanged += 1;
                    let moved = self
                        .state
                        .resources
                        .get_mut(&resource.name)
                        .filter(|r| r.order != order)
                        .map(|r| r.order = order)
                        .is_some();
                    if moved {
                        self.save()?;
                    }
                    continue;
                }
                PendingAction::Create => {
                    tracing::info!("Creating {}", resource.name);
                    self.run_action(&resource.name, &resource.create).await?;
                    summary.created += 1;
                }
                PendingAction::Replace => {
                    tracing::info!("Replacing {}", resource.name);
                    let previous = self.state.get(&resource.name).and_then(|r| r.delete.clone());
                    self.run_delete(&resource.name, previous.as_ref()).await?;
                    self.state.forget(&resource.name);
                    self.save()?;
                    self.run_action(&resource.name, &resource.create).await?;
                    summary.replaced += 1;
                }
                PendingAction::Update => {
                    tracing::info!("Updating {}", resource.name);
                    let step = resource.update.as_ref().unwrap_or(&resource.create);
                    self.run_action(&resource.name, step).await?;
                    summary.updated += 1;
                }
                PendingAction::Delete => unreachable!("classify never yields Delete"),
            }
            self.record(order, resource)?;
        }

        let stale: Vec<(String, Option<String>)> = removed(resources, &self.state)
            .into_iter()
            .map(|(name, record)| (name.clone(), record.delete.clone()))
            .collect();
        for (name, delete) in stale {
            tracing::info!("Deleting {}", name);
            self.run_delete(&name, delete.as_ref()).await?;
            self.state.forget(&name);
            self.save()?;
            summary.deleted += 1;
        }

        Ok(summary)
    }

    /// Delete every recorded resource, newest first.
    pub async fn destroy(&mut self) -> Result<ApplySummary> {
        self.apply(&[]).await
    }
}
