//! OpenSSH transport: scripts go to `bash -s` on stdin, files go through `scp`.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use super::{Connection, Transport};
use crate::cmd_abstraction::{CommandExecutor, CommandOutput};
use crate::error::ProvisionError;

pub struct SshTransport<E: CommandExecutor> {
    connection: Connection,
    executor: E,
}

impl<E: CommandExecutor> SshTransport<E> {
    pub fn new(connection: Connection, executor: E) -> Self {
        Self {
            connection,
            executor,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Options shared by ssh and scp; only the port flag differs in case.
    fn common_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![port_flag.to_string(), self.connection.port.to_string()];
        if let Some(key) = &self.connection.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
        for option in &self.connection.ssh_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }

    pub fn script_args(&self) -> Vec<String> {
        let mut args = self.common_args("-p");
        args.push(self.connection.destination());
        args.push("bash".to_string());
        args.push("-s".to_string());
        args
    }

    pub fn upload_args(&self, local: &Path, remote: &str) -> Vec<String> {
        let mut args = self.common_args("-P");
        args.push("-q".to_string());
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.connection.destination(), remote));
        args
    }
}

#[async_trait]
impl<E: CommandExecutor> Transport for SshTransport<E> {
    async fn run_script(&self, script: &str) -> Result<CommandOutput> {
        let body = format!("set -euo pipefail\n{}\n", script);
        self.executor
            .execute_with_stdin("ssh", &self.script_args(), &body)
            .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        tracing::debug!("scp {} -> {}:{}", local.display(), self.connection.host, remote);
        let output = self
            .executor
            .execute("scp", &self.upload_args(local, remote))
            .await?;
        if !output.success {
            return Err(ProvisionError::Transfer {
                local: local.display().to_string(),
                remote: remote.to_string(),
                reason: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}
