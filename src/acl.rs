//! Strict filesystem ACLs applied with `setfacl`.
//!
//! A [`StrictAcl`] grants exactly the listed users and groups access to a path and
//! closes it to everyone else. Directories also receive default ACL entries so newly
//! created files inherit them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::shell::quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclKind {
    User,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclPermission {
    Read,
    Write,
    Execute,
    /// Execute on directories only (`X`)
    ExecuteOnlyOnDir,
}

impl AclPermission {
    fn as_char(self) -> char {
        match self {
            Self::Read => 'r',
            Self::Write => 'w',
            Self::Execute => 'x',
            Self::ExecuteOnlyOnDir => 'X',
        }
    }
}

pub const READ_WRITE: &[AclPermission] = &[
    AclPermission::Read,
    AclPermission::Write,
    AclPermission::ExecuteOnlyOnDir,
];

pub const READ_ONLY: &[AclPermission] = &[AclPermission::ExecuteOnlyOnDir, AclPermission::Read];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub kind: AclKind,
    pub id: u32,
    pub permissions: Vec<AclPermission>,
}

impl AclEntry {
    pub fn user(id: u32, permissions: &[AclPermission]) -> Self {
        Self {
            kind: AclKind::User,
            id,
            permissions: permissions.to_vec(),
        }
    }

    pub fn group(id: u32, permissions: &[AclPermission]) -> Self {
        Self {
            kind: AclKind::Group,
            id,
            permissions: permissions.to_vec(),
        }
    }

    fn render(&self) -> String {
        let prefix = match self.kind {
            AclKind::User => 'u',
            AclKind::Group => 'g',
        };
        let perms: String = self.permissions.iter().map(|p| p.as_char()).collect();
        format!("{}:{}:{}", prefix, self.id, perms)
    }
}

/// Owning group and everyone else get no access.
const CLOSED_TO_OTHERS: &str = "o::---,g::---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrictAcl {
    path: String,
    entries: Vec<AclEntry>,
    is_dir: bool,
}

impl StrictAcl {
    /// Build an ACL for `path`. Entries repeating an earlier kind and id are dropped.
    pub fn new(path: impl Into<String>, entries: Vec<AclEntry>, is_dir: bool) -> Self {
        let mut seen = HashSet::new();
        let entries = entries
            .into_iter()
            .filter(|e| seen.insert((e.kind, e.id)))
            .collect();
        Self {
            path: path.into(),
            entries,
            is_dir,
        }
    }

    pub fn entries(&self) -> &[AclEntry] {
        &self.entries
    }

    fn entry_list(&self) -> String {
        self.entries
            .iter()
            .map(AclEntry::render)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn with_default(&self, args: String) -> String {
        if self.is_dir {
            format!("setfacl {args} && setfacl -d {args}")
        } else {
            format!("setfacl {args}")
        }
    }

    /// Add the entries without touching any other ACL already on the path.
    pub fn insert_command(&self) -> String {
        self.with_default(format!(
            "-R -m {},{} {}",
            self.entry_list(),
            CLOSED_TO_OTHERS,
            quote(&self.path)
        ))
    }

    /// Replace every ACL on the path with exactly these entries.
    pub fn set_command(&self) -> String {
        self.with_default(format!(
            "-R --set='u::rwX,{},{}' {}",
            CLOSED_TO_OTHERS,
            self.entry_list(),
            quote(&self.path)
        ))
    }

    pub fn remove_command(&self) -> String {
        format!("setfacl -b -k -R {}", quote(&self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_acl(is_dir: bool) -> StrictAcl {
        StrictAcl::new(
            "/home/deploy/docker/web/mnt/data",
            vec![
                AclEntry::user(101000, READ_WRITE),
                AclEntry::group(101000, READ_WRITE),
            ],
            is_dir,
        )
    }

    #[test]
    fn test_insert_command_directory() {
        assert_eq!(
            web_acl(true).insert_command(),
            "setfacl -R -m u:101000:rwX,g:101000:rwX,o::---,g::--- /home/deploy/docker/web/mnt/data \
             && setfacl -d -R -m u:101000:rwX,g:101000:rwX,o::---,g::--- /home/deploy/docker/web/mnt/data"
        );
    }

    #[test]
    fn test_insert_command_file_has_no_default_acl() {
        let cmd = web_acl(false).insert_command();
        assert!(!cmd.contains("setfacl -d"));
    }

    #[test]
    fn test_set_command() {
        let cmd = web_acl(true).set_command();
        assert!(cmd.starts_with(
            "setfacl -R --set='u::rwX,o::---,g::---,u:101000:rwX,g:101000:rwX' /home/deploy/docker/web/mnt/data"
        ));
    }

    #[test]
    fn test_remove_command() {
        assert_eq!(
            web_acl(true).remove_command(),
            "setfacl -b -k -R /home/deploy/docker/web/mnt/data"
        );
    }

    #[test]
    fn test_duplicate_entries_dropped() {
        let acl = StrictAcl::new(
            "/x",
            vec![
                AclEntry::user(1000, READ_ONLY),
                AclEntry::user(1000, READ_WRITE),
                AclEntry::group(1000, READ_ONLY),
            ],
            true,
        );
        assert_eq!(acl.entries().len(), 2);
        assert_eq!(acl.entries()[0].permissions, READ_ONLY.to_vec());
    }
}
