//! Deterministic `.tar.gz` bundles for upload.
//!
//! Entries are written in path order with zeroed owners and timestamps, so the same
//! inputs always produce byte-identical archives and therefore the same digest.

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tar::{EntryType, Header};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const EXEC_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Dir,
    File { data: Vec<u8>, mode: u32 },
}

/// A written archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub path: PathBuf,
    /// SHA-256 of the archive bytes
    pub digest: String,
}

#[derive(Debug, Default)]
pub struct BundleBuilder {
    entries: BTreeMap<String, Entry>,
}

fn check_archive_path(path: &str) -> Result<()> {
    // split keeps empty segments, so "/abs" and "a//b" are caught here too
    if path
        .split('/')
        .any(|segment| matches!(segment, "" | "." | ".."))
    {
        bail!("Invalid bundle path '{}'", path);
    }
    Ok(())
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_parents(&mut self, path: &str) {
        let mut prefix = String::new();
        let parts: Vec<&str> = path.split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            self.entries.entry(prefix.clone()).or_insert(Entry::Dir);
        }
    }

    pub fn add_bytes(&mut self, path: &str, data: impl Into<Vec<u8>>, mode: u32) -> Result<()> {
        check_archive_path(path)?;
        self.add_parents(path);
        self.entries.insert(
            path.to_string(),
            Entry::File {
                data: data.into(),
                mode,
            },
        );
        Ok(())
    }

    pub fn add_dir(&mut self, path: &str) -> Result<()> {
        check_archive_path(path)?;
        self.add_parents(path);
        self.entries.insert(path.to_string(), Entry::Dir);
        Ok(())
    }

    /// Add a local file or directory tree under `prefix`. Symlinks are skipped.
    pub fn add_path(&mut self, prefix: &str, local: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(local)
            .with_context(|| format!("Failed to read {:?}", local))?;
        if meta.file_type().is_symlink() {
            tracing::warn!("Skipping symlink {:?}", local);
            return Ok(());
        }
        if meta.is_dir() {
            self.add_dir(prefix)?;
            let mut children: Vec<_> = fs::read_dir(local)
                .with_context(|| format!("Failed to list {:?}", local))?
                .collect::<std::io::Result<Vec<_>>>()?;
            children.sort_by_key(|e| e.file_name());
            for child in children {
                let name = child.file_name();
                let name = name
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("Non UTF-8 file name in {:?}", local))?;
                self.add_path(&format!("{}/{}", prefix, name), &child.path())?;
            }
            Ok(())
        } else {
            let data = fs::read(local).with_context(|| format!("Failed to read {:?}", local))?;
            let mode = if meta.permissions().mode() & 0o111 != 0 {
                EXEC_MODE
            } else {
                FILE_MODE
            };
            self.add_bytes(prefix, data, mode)
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.entries.get(path), Some(Entry::Dir))
    }

    /// Regular files, relative to the archive root.
    pub fn files(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e, Entry::File { .. }))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Files under `prefix`, relative to it.
    pub fn files_under(&self, prefix: &str) -> Vec<String> {
        let lead = format!("{}/", prefix);
        self.files()
            .into_iter()
            .filter_map(|p| p.strip_prefix(&lead).map(String::from))
            .collect()
    }

    /// Content digest of every entry at or under `prefix`; independent of compression.
    pub fn digest_of(&self, prefix: &str) -> String {
        let lead = format!("{}/", prefix);
        let mut hasher = Sha256::new();
        for (path, entry) in &self.entries {
            if path != prefix && !path.starts_with(&lead) {
                continue;
            }
            hasher.update(path.as_bytes());
            hasher.update([0]);
            match entry {
                Entry::Dir => hasher.update(b"d"),
                Entry::File { data, mode } => {
                    hasher.update(format!("f{:o}:{}", mode, data.len()).as_bytes());
                    hasher.update([0]);
                    hasher.update(data);
                }
            }
            hasher.update([0]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Write the archive to `out` with mode 0600.
    pub fn write(&self, out: &Path) -> Result<Bundle> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(out)
            .with_context(|| format!("Failed to create bundle {:?}", out))?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        for (path, entry) in &self.entries {
            let mut header = Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            match entry {
                Entry::Dir => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_mode(DIR_MODE);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append_data(&mut header, path, std::io::empty())?;
                }
                Entry::File { data, mode } => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_mode(*mode);
                    header.set_size(data.len() as u64);
                    header.set_cksum();
                    builder.append_data(&mut header, path, data.as_slice())?;
                }
            }
        }

        let mut encoder = builder.into_inner().context("Failed to finish tar stream")?;
        encoder.flush()?;
        encoder.finish().context("Failed to finish gzip stream")?;

        let bytes = fs::read(out).with_context(|| format!("Failed to read back {:?}", out))?;
        Ok(Bundle {
            path: out.to_path_buf(),
            digest: format!("{:x}", Sha256::digest(&bytes)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn sample_tree(dir: &Path) {
        fs::create_dir_all(dir.join("ctx/src")).unwrap();
        fs::write(dir.join("ctx/Dockerfile"), "FROM scratch\n").unwrap();
        fs::write(dir.join("ctx/src/main.sh"), "echo hi\n").unwrap();
        fs::set_permissions(dir.join("ctx/src/main.sh"), fs::Permissions::from_mode(0o755))
            .unwrap();
    }

    #[test]
    fn test_invalid_paths_rejected() {
        let mut builder = BundleBuilder::new();
        assert!(builder.add_bytes("/abs", "x", FILE_MODE).is_err());
        assert!(builder.add_bytes("../up", "x", FILE_MODE).is_err());
        assert!(builder.add_bytes("", "x", FILE_MODE).is_err());
        assert!(builder.add_bytes("a/./b", "x", FILE_MODE).is_err());
        assert!(builder.add_bytes("a//b", "x", FILE_MODE).is_err());
        assert!(builder.files().is_empty());
    }

    #[test]
    fn test_files_and_parents() {
        let dir = TempDir::new().unwrap();
        sample_tree(dir.path());
        let mut builder = BundleBuilder::new();
        builder.add_bytes("compose.yml", "name: web\n", FILE_MODE).unwrap();
        builder.add_path("build", &dir.path().join("ctx")).unwrap();

        assert_eq!(
            builder.files(),
            vec!["build/Dockerfile", "build/src/main.sh", "compose.yml"]
        );
        assert_eq!(builder.files_under("build"), vec!["Dockerfile", "src/main.sh"]);
        assert!(builder.is_dir("build/src"));
    }

    #[test]
    fn test_identical_inputs_identical_digest() {
        let dir = TempDir::new().unwrap();
        sample_tree(dir.path());

        let build = |out: &str| {
            let mut builder = BundleBuilder::new();
            builder.add_bytes("compose.yml", "name: web\n", FILE_MODE).unwrap();
            builder.add_path("build", &dir.path().join("ctx")).unwrap();
            builder.write(&dir.path().join(out)).unwrap()
        };
        let a = build("a.tar.gz");
        let b = build("b.tar.gz");
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);
    }

    #[test]
    fn test_digest_of_prefix_ignores_siblings() {
        let mut a = BundleBuilder::new();
        a.add_bytes("build/Dockerfile", "FROM scratch", FILE_MODE).unwrap();
        a.add_bytes("compose.yml", "v1", FILE_MODE).unwrap();
        let mut b = BundleBuilder::new();
        b.add_bytes("build/Dockerfile", "FROM scratch", FILE_MODE).unwrap();
        b.add_bytes("compose.yml", "v2", FILE_MODE).unwrap();
        assert_eq!(a.digest_of("build"), b.digest_of("build"));
        assert_ne!(a.digest_of("compose.yml"), b.digest_of("compose.yml"));
    }

    #[test]
    fn test_archive_contents_and_modes() {
        let dir = TempDir::new().unwrap();
        sample_tree(dir.path());
        let mut builder = BundleBuilder::new();
        builder.add_path("build", &dir.path().join("ctx")).unwrap();
        builder.add_bytes("db_password", "hunter2", 0o600).unwrap();
        let bundle = builder.write(&dir.path().join("out.tar.gz")).unwrap();

        let archive_mode = fs::metadata(&bundle.path).unwrap().permissions().mode();
        assert_eq!(archive_mode & 0o777, 0o600);

        let file = fs::File::open(&bundle.path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mode = entry.header().mode().unwrap();
            assert_eq!(entry.header().mtime().unwrap(), 0);
            seen.push((path.trim_end_matches('/').to_string(), mode));
        }
        assert!(seen.contains(&("build".to_string(), 0o755)));
        assert!(seen.contains(&("build/src/main.sh".to_string(), 0o755)));
        assert!(seen.contains(&("build/Dockerfile".to_string(), 0o644)));
        assert!(seen.contains(&("db_password".to_string(), 0o600)));
    }
}
