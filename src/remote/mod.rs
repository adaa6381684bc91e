//! Remote host access: connection descriptor, resources, transports and apply.
//!
//! A [`Resource`] is the unit the applier converges: a create action, an optional
//! update action, an optional delete script and a list of replace triggers. Both the
//! action inputs and the triggers are reduced to SHA-256 fingerprints that are compared
//! against the last successful apply.

pub mod apply;
pub mod copy;
pub mod ssh;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[cfg(test)]
use mockall::automock;

use crate::cmd_abstraction::CommandOutput;
use crate::error::ProvisionError;
use crate::shell::{as_bash, as_sudo};

fn default_port() -> u16 {
    22
}

fn default_tmp_dir() -> String {
    "/tmp".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Connection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    /// Absolute home directory of `user`; service trees live under `<home_dir>/docker`
    pub home_dir: String,
    /// User-writable staging area for two-phase copies
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: String,
    /// Run scripts through `sudo`
    #[serde(default = "default_true")]
    pub sudo: bool,
    /// Extra `-o` options for ssh and scp
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_options: Vec<String>,
}

impl Connection {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.host.chars().any(|c| c.is_whitespace() || c == '@') {
            anyhow::bail!(ProvisionError::Config(format!(
                "Invalid connection host '{}'",
                self.host
            )));
        }
        if self.user.is_empty() || self.user.chars().any(|c| c.is_whitespace() || c == '@') {
            anyhow::bail!(ProvisionError::Config(format!(
                "Invalid connection user '{}'",
                self.user
            )));
        }
        for (field, path) in [("home_dir", &self.home_dir), ("tmp_dir", &self.tmp_dir)] {
            if !path.starts_with('/') {
                anyhow::bail!(ProvisionError::Config(format!(
                    "connection.{} must be an absolute path: {}",
                    field, path
                )));
            }
        }
        Ok(())
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// The part of the connection that identifies the target host in fingerprints.
    pub fn descriptor(&self) -> serde_json::Value {
        serde_json::json!({
            "host": self.host,
            "port": self.port,
            "user": self.user,
        })
    }

    /// Wrap a script for execution with the configured privileges.
    pub fn privileged(&self, script: &str) -> String {
        if self.sudo {
            as_sudo(script)
        } else {
            as_bash(script)
        }
    }
}

/// Local archive extracted into a remote directory through the two-phase copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub archive: PathBuf,
    /// SHA-256 of the archive contents
    pub digest: String,
    pub destination: String,
    /// Runs privileged right after extraction, e.g. `chmod`/`setfacl`
    pub after_extract: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Script(String),
    Upload(Upload),
}

impl Action {
    fn fingerprint_value(&self) -> serde_json::Value {
        match self {
            Action::Script(script) => serde_json::json!({ "script": script }),
            Action::Upload(upload) => serde_json::json!({
                "upload": {
                    "digest": upload.digest,
                    "destination": upload.destination,
                    "after_extract": upload.after_extract,
                }
            }),
        }
    }

    /// Human readable form for `render` and dry runs.
    pub fn describe(&self) -> String {
        match self {
            Action::Script(script) => script.clone(),
            Action::Upload(upload) => {
                let mut text = format!(
                    "# upload {} (sha256 {}) and extract into {}",
                    upload.archive.display(),
                    upload.digest,
                    upload.destination
                );
                if let Some(after) = &upload.after_extract {
                    text.push('\n');
                    text.push_str(after);
                }
                text
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub create: Action,
    pub update: Option<Action>,
    pub delete: Option<String>,
    /// Values whose change forces delete-then-create
    pub triggers: Vec<String>,
    pub depends_on: Vec<String>,
}

impl Resource {
    pub fn new(name: impl Into<String>, create: Action) -> Self {
        Self {
            name: name.into(),
            create,
            update: None,
            delete: None,
            triggers: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn script(name: impl Into<String>, create: impl Into<String>) -> Self {
        Self::new(name, Action::Script(create.into()))
    }

    pub fn with_update(mut self, update: Action) -> Self {
        self.update = Some(update);
        self
    }

    pub fn with_delete(mut self, delete: impl Into<String>) -> Self {
        self.delete = Some(delete.into());
        self
    }

    pub fn with_triggers(mut self, triggers: Vec<String>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }

    pub fn input_fingerprint(&self, connection: &Connection) -> String {
        fingerprint(&serde_json::json!({
            "connection": connection.descriptor(),
            "create": self.create.fingerprint_value(),
            "update": self.update.as_ref().map(Action::fingerprint_value),
            "delete": self.delete,
        }))
    }

    pub fn trigger_fingerprint(&self) -> String {
        fingerprint(&serde_json::json!(self.triggers))
    }
}

/// SHA-256 hex of the compact JSON text. Object keys serialize sorted, so equal values
/// always hash the same.
pub fn fingerprint(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Executes scripts on, and ships files to, one remote host.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a script through the remote shell. Non-zero exit is reported in the output.
    async fn run_script(&self, script: &str) -> Result<CommandOutput>;

    /// Copy a local file to an absolute remote path writable by the connection user.
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;
}

/// Run a script and turn a non-zero exit into [`ProvisionError::RemoteExecution`].
pub async fn run_checked<T: Transport + ?Sized>(
    transport: &T,
    resource: &str,
    script: &str,
) -> Result<String> {
    tracing::debug!("{}: {}", resource, script);
    let output = transport.run_script(script).await?;
    if !output.success {
        return Err(ProvisionError::RemoteExecution {
            resource: resource.to_string(),
            command: script.to_string(),
            code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
        .into());
    }
    Ok(output.stdout)
}

#[cfg(test)]
pub(crate) fn test_connection() -> Connection {
    Connection {
        host: "203.0.113.10".into(),
        port: 22,
        user: "deploy".into(),
        private_key: None,
        home_dir: "/home/deploy".into(),
        tmp_dir: "/tmp".into(),
        sudo: true,
        ssh_options: Vec::new(),
    }
}
