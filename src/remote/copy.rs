//! Two-phase copy into directories the connection user cannot write.
//!
//! The archive is first uploaded into a per-resource staging directory under
//! `tmp_dir`, then extracted into place with elevated privileges. The staging
//! directory is removed afterwards whether or not the move succeeded.

use anyhow::Result;

use super::{run_checked, Connection, Transport, Upload};
use crate::shell::{and_all, as_bash, delete_dir_elements, quote};

const ARCHIVE_NAME: &str = "bundle.tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    StageUpload,
    PrivilegedMove,
    Cleanup,
    Done,
}

pub struct SudoCopy<'a> {
    connection: &'a Connection,
    upload: &'a Upload,
    resource: &'a str,
    stage_dir: String,
    phase: Phase,
}

fn slug(resource: &str) -> String {
    resource
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

impl<'a> SudoCopy<'a> {
    pub fn new(connection: &'a Connection, upload: &'a Upload, resource: &'a str) -> Self {
        let stage_dir = format!(
            "{}/hostward-{}",
            connection.tmp_dir.trim_end_matches('/'),
            slug(resource)
        );
        Self {
            connection,
            upload,
            resource,
            stage_dir,
            phase: Phase::StageUpload,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stage_dir(&self) -> &str {
        &self.stage_dir
    }

    pub fn staged_archive(&self) -> String {
        format!("{}/{}", self.stage_dir, ARCHIVE_NAME)
    }

    /// Runs as the connection user.
    pub fn stage_script(&self) -> String {
        as_bash(&and_all([
            format!("mkdir -p {}", quote(&self.stage_dir)),
            format!("chmod 700 {}", quote(&self.stage_dir)),
            delete_dir_elements(&self.stage_dir, &[]),
        ]))
    }

    pub fn move_script(&self) -> String {
        let mut steps = vec![
            format!("mkdir -p {}", quote(&self.upload.destination)),
            format!(
                "tar -xzf {} -C {} --no-same-owner",
                quote(&self.staged_archive()),
                quote(&self.upload.destination)
            ),
        ];
        if let Some(after) = &self.upload.after_extract {
            steps.push(after.clone());
        }
        self.connection.privileged(&and_all(steps))
    }

    pub fn cleanup_script(&self) -> String {
        self.connection
            .privileged(&format!("rm -rf -- {}", quote(&self.stage_dir)))
    }

    pub async fn run<T: Transport + ?Sized>(mut self, transport: &T) -> Result<()> {
        let transferred = self.transfer(transport).await;

        self.phase = Phase::Cleanup;
        let cleaned = run_checked(transport, self.resource, &self.cleanup_script()).await;
        self.phase = Phase::Done;

        transferred?;
        cleaned.map(|_| ())
    }

    async fn transfer<T: Transport + ?Sized>(&mut self, transport: &T) -> Result<()> {
        run_checked(transport, self.resource, &self.stage_script()).await?;
        transport
            .upload(&self.upload.archive, &self.staged_archive())
            .await?;

        self.phase = Phase::PrivilegedMove;
        run_checked(transport, self.resource, &self.move_script()).await?;
        Ok(())
    }
}

impl Drop for SudoCopy<'_> {
    fn drop(&mut self) {
        if self.phase != Phase::Done {
            tracing::warn!(
                "Copy for {} interrupted during {:?}; staging directory {} may remain",
                self.resource,
                self.phase,
                self.stage_dir
            );
        }
    }
}
