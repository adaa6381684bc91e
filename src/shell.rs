//! Shell string builders shared by every generated remote script.
//!
//! Everything here is pure string composition. Scripts are executed by bash on the
//! remote host under `set -euo pipefail`.

use anyhow::{bail, Result};

/// Sentinel echoed when an existence probe fails.
pub const NOT_SET: &str = "notset";

/// Quote a word for bash.
///
/// Words made only of characters that are never special to the shell are returned as-is
/// so the generated scripts stay readable.
pub fn quote(word: &str) -> String {
    let is_plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:,=@%+".contains(c));
    if is_plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\"'\"'"))
    }
}

/// Run `cmd` as root through `sudo bash -c`.
pub fn as_sudo(cmd: &str) -> String {
    format!("sudo {}", as_bash(cmd))
}

/// Run `cmd` through `bash -c` with strict error handling.
pub fn as_bash(cmd: &str) -> String {
    format!(
        "bash -c 'set -euo pipefail; {}'",
        cmd.replace('\'', "'\"'\"'")
    )
}

/// Join commands with `&&`, dropping empty fragments.
pub fn and_all<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .filter(|p| !p.as_ref().trim().is_empty())
        .map(|p| p.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Existence probe followed by a branch on the result.
///
/// The probe's stdout is captured; a failing probe yields [`NOT_SET`]. Output equal to
/// the sentinel selects the absent branch, anything else the present branch. A probe
/// whose own stdout could be the literal sentinel cannot be told apart from absence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeThenAct {
    probe: String,
    present: Option<String>,
    absent: Option<String>,
}

impl ProbeThenAct {
    pub fn new(probe: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
            present: None,
            absent: None,
        }
    }

    pub fn when_present(mut self, script: impl Into<String>) -> Self {
        self.present = Some(script.into());
        self
    }

    pub fn when_absent(mut self, script: impl Into<String>) -> Self {
        self.absent = Some(script.into());
        self
    }

    fn capture(&self) -> String {
        format!(
            "\"$({} 2> /dev/null || echo '{}')\"",
            self.probe, NOT_SET
        )
    }

    pub fn render(&self) -> String {
        let probe = self.capture();
        match (&self.present, &self.absent) {
            (Some(present), Some(absent)) => format!(
                "if [ {} == \"{}\" ]; then {}; else {}; fi",
                probe, NOT_SET, absent, present
            ),
            (None, Some(absent)) => {
                format!("if [ {} == \"{}\" ]; then {}; fi", probe, NOT_SET, absent)
            }
            (Some(present), None) => {
                format!("if [ {} != \"{}\" ]; then {}; fi", probe, NOT_SET, present)
            }
            (None, None) => "true".to_string(),
        }
    }
}

/// Remove every entry inside `dir` except the names in `keep`. A missing dir is a no-op.
pub fn delete_dir_elements(dir: &str, keep: &[&str]) -> String {
    let dir = quote(dir);
    let excludes: String = keep
        .iter()
        .map(|k| format!(" ! -name {}", quote(k)))
        .collect();
    format!(
        "if [ -d {dir} ]; then find {dir} -mindepth 1 -maxdepth 1{excludes} -exec rm -rf -- {{}} +; fi"
    )
}

/// Move everything in `src` into `dst` (replacing `dst` contents), skipping `exclude`.
pub fn move_dir_elements(src: &str, dst: &str, exclude: &[&str]) -> String {
    let excludes: String = exclude
        .iter()
        .map(|e| format!(" --exclude={}", quote(e)))
        .collect();
    let src_q = quote(src);
    format!(
        "mkdir -p {dst} && if [ -d {src_q} ] && [ -n \"$(ls -A {src_q})\" ]; then rsync -a --delete-after --remove-source-files{excludes} {src_slash} {dst}; fi",
        dst = quote(dst),
        src_slash = quote(&format!("{}/", src.trim_end_matches('/'))),
    )
}

/// Delete every regular file under `dir` whose relative path is not in `files`.
pub fn only_files_in_dir(dir: &str, files: &[String]) -> Result<String> {
    if !dir.starts_with('/') {
        bail!("only_files_in_dir requires an absolute path: {}", dir);
    }
    let dir_q = quote(dir);
    let keep: String = files.iter().map(|f| format!(" {}", quote(f))).collect();
    Ok(format!(
        "mkdir -p {dir_q} && LC_ALL=C comm -23 <(find {dir_q} -type f -printf '%P\\n' | LC_ALL=C sort) <(printf '%s\\n'{keep} | LC_ALL=C sort) | xargs -r -d '\\n' -I '{{}}' rm -f -- {dir_q}/'{{}}'"
    ))
}

pub fn delete_dir_if_exists(dir: &str) -> String {
    let dir = quote(dir);
    format!("if [ -d {dir} ]; then rm -rf -- {dir}; fi")
}
