//! Resource ids and dependency categories for one provisioning run.
//!
//! A category collects resources that others may depend on as a group (every firewall
//! resource, for example). Once a category has been claimed its member list is frozen:
//! a later registration would silently be missing from the claimer's dependencies.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ProvisionError;

#[derive(Debug, Default)]
struct Category {
    members: Vec<String>,
    claimed_by: Option<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    ids: BTreeSet<String>,
    categories: BTreeMap<String, Category>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_id(&mut self, id: &str) -> Result<()> {
        if !self.ids.insert(id.to_string()) {
            return Err(ProvisionError::DuplicateId(id.to_string()).into());
        }
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn add_to_category(&mut self, category: &str, id: &str) -> Result<()> {
        let entry = self.categories.entry(category.to_string()).or_default();
        if let Some(claimed_by) = &entry.claimed_by {
            return Err(ProvisionError::LateCategoryRegistration {
                category: category.to_string(),
                id: id.to_string(),
                claimed_by: claimed_by.clone(),
            }
            .into());
        }
        entry.members.push(id.to_string());
        Ok(())
    }

    /// Members of `category`, freezing it. The first claimer is reported on late registrations.
    pub fn claim(&mut self, category: &str, claimer: &str) -> Result<Vec<String>> {
        match self.categories.get_mut(category) {
            Some(entry) if !entry.members.is_empty() => {
                if entry.claimed_by.is_none() {
                    entry.claimed_by = Some(claimer.to_string());
                }
                Ok(entry.members.clone())
            }
            _ => Err(ProvisionError::UnknownCategory(category.to_string()).into()),
        }
    }
}
