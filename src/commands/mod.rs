//! CLI command implementations.

pub mod apply;
pub mod destroy;
pub mod init;
pub mod plan;
pub mod render;
pub mod validate;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Load and validate the manifest.
pub(crate) fn load_config(config_path: &Path) -> Result<Config> {
    Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))
}

/// `--state` wins over `state_file` from the manifest.
pub(crate) fn state_path(config: &Config, state_override: Option<&Path>) -> PathBuf {
    state_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.state_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_override_wins() {
        let mut config = Config::from_yaml(
            "connection: {host: 203.0.113.10, user: deploy, home_dir: /home/deploy}\n",
        )
        .unwrap();
        config.state_file = Some(PathBuf::from("/srv/state.json"));
        assert_eq!(state_path(&config, None), PathBuf::from("/srv/state.json"));
        assert_eq!(
            state_path(&config, Some(Path::new("/tmp/other.json"))),
            PathBuf::from("/tmp/other.json")
        );
    }
}
