//! Fingerprints of the last successful apply, one record per resource.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const DEFAULT_STATE_FILE: &str = "/var/lib/hostward/state.json";

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Position in the dependency order when last applied; destroy walks it backwards.
    pub order: usize,
    pub input_fingerprint: String,
    pub trigger_fingerprint: String,
    /// Script to run when the resource disappears from the manifest
    pub delete: Option<String>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyState {
    pub version: u32,
    pub host: Option<String>,
    pub resources: BTreeMap<String, ResourceRecord>,
}

impl Default for ApplyState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            host: None,
            resources: BTreeMap::new(),
        }
    }
}

impl ApplyState {
    /// Load state; a missing file is an empty state.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {:?}", path))?;
        let state: ApplyState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {:?}", path))?;
        if state.version != STATE_VERSION {
            anyhow::bail!(
                "State file {:?} has version {}, expected {}",
                path,
                state.version,
                STATE_VERSION
            );
        }
        Ok(state)
    }

    /// Write atomically through a temp file in the same directory.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let parent = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {:?}", parent))?;

        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        let mut temp_file =
            NamedTempFile::new_in(parent).context("Failed to create temporary state file")?;
        temp_file
            .write_all(content.as_bytes())
            .context("Failed to write state")?;
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist state file: {:?}", path))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    pub fn record(&mut self, name: impl Into<String>, record: ResourceRecord) {
        self.resources.insert(name.into(), record);
    }

    pub fn forget(&mut self, name: &str) -> Option<ResourceRecord> {
        self.resources.remove(name)
    }

    /// Recorded resources, last applied first.
    pub fn reverse_order(&self) -> Vec<(&String, &ResourceRecord)> {
        let mut records: Vec<_> = self.resources.iter().collect();
        records.sort_by(|a, b| b.1.order.cmp(&a.1.order).then_with(|| a.0.cmp(b.0)));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(order: usize) -> ResourceRecord {
        ResourceRecord {
            order,
            input_fingerprint: format!("in-{}", order),
            trigger_fingerprint: "t".into(),
            delete: Some(format!("delete {}", order)),
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let state = ApplyState::load(dir.path().join("state.json")).unwrap();
        assert!(state.resources.is_empty());
        assert_eq!(state.version, STATE_VERSION);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut state = ApplyState::default();
        state.record("chain/filter/INPUT/ipv4", record(0));
        state.save(&path).unwrap();

        let loaded = ApplyState::load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"version": 99, "host": null, "resources": {}}"#).unwrap();
        assert!(ApplyState::load(&path).is_err());
    }

    #[test]
    fn test_reverse_order() {
        let mut state = ApplyState::default();
        state.record("a", record(0));
        state.record("c", record(2));
        state.record("b", record(1));
        let names: Vec<&str> = state.reverse_order().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_forget() {
        let mut state = ApplyState::default();
        state.record("a", record(0));
        assert!(state.forget("a").is_some());
        assert!(state.get("a").is_none());
    }
}
