//! Manifest loading and validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::compose::types::ComposeServiceConfig;
use crate::compose::DEFAULT_SECRETS_ROOT;
use crate::error::ProvisionError;
use crate::firewall::chain::{ChainSpec, PrecreateChain, RuleCommandSpec};
use crate::firewall::ipset::IpSetConfig;
use crate::network::{Network, NetworkConfig};
use crate::remote::Connection;
use crate::validation::validate_chain_name;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostward/hostward.yaml";

/// Secure string type that zeroizes memory on drop
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn default_secrets_root() -> String {
    DEFAULT_SECRETS_ROOT.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirewallConfig {
    /// Install iptables, ipset and their persistence packages first
    pub install_packages: bool,
    /// Run `netfilter-persistent save` after any firewall change
    pub persist: bool,
    pub precreate_chains: Vec<PrecreateChain>,
    pub ipsets: Vec<IpSetConfig>,
    pub chains: Vec<ChainSpec>,
    pub rules: Vec<RuleCommandSpec>,
}

impl FirewallConfig {
    pub fn is_empty(&self) -> bool {
        self.precreate_chains.is_empty()
            && self.ipsets.is_empty()
            && self.chains.is_empty()
            && self.rules.is_empty()
    }
}

/// One remote host and everything provisioned on it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub connection: Connection,
    /// Defaults to `/var/lib/hostward/state.json`
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Root of the per-service secrets directories on the host
    #[serde(default = "default_secrets_root")]
    pub secrets_root: String,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub services: Vec<ComposeServiceConfig>,
}

fn check_unique<'a>(kind: &str, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            anyhow::bail!(ProvisionError::Config(format!(
                "Duplicate {} name '{}'",
                kind, name
            )));
        }
    }
    Ok(())
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        let base = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(base);
        config.validate()?;

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Make build contexts, mount sources and the state file relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if let Some(state) = self.state_file.as_mut() {
            resolve(base, state);
        }
        for service in &mut self.services {
            if let Some(build) = service.service.build.as_mut() {
                resolve(base, &mut build.context);
            }
            for mount in &mut service.mounts {
                resolve(base, &mut mount.source);
            }
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(crate::state::DEFAULT_STATE_FILE))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;

        if !self.secrets_root.starts_with('/') || self.secrets_root.trim_end_matches('/').is_empty()
        {
            anyhow::bail!(ProvisionError::Config(format!(
                "secrets_root must be an absolute directory below /: {}",
                self.secrets_root
            )));
        }

        let fw = &self.firewall;
        for chain in &fw.precreate_chains {
            validate_chain_name(&chain.name)?;
        }
        // chains are scoped to their table: nat/PREROUTING and mangle/PREROUTING are distinct
        let chain_ids: Vec<String> = fw
            .chains
            .iter()
            .map(|c| format!("{}/{}", c.table, c.name))
            .collect();
        check_unique("chain", chain_ids.iter().map(String::as_str))?;
        check_unique("ipset", fw.ipsets.iter().map(|s| s.name.as_str()))?;
        check_unique("rule", fw.rules.iter().map(|r| r.name.as_str()))?;
        for rule in &fw.rules {
            crate::validation::validate_identifier("rule", &rule.name)?;
            validate_chain_name(&rule.chain)?;
        }

        check_unique("network", self.networks.iter().map(|n| n.name.as_str()))?;
        for network in &self.networks {
            Network::from_config(network)?;
        }

        check_unique("service", self.services.iter().map(|s| s.name.as_str()))?;
        for service in &self.services {
            crate::compose::spec::validate(service)?;
        }

        Ok(())
    }

    /// Commented default manifest
    pub fn generate_default_yaml() -> String {
        include_str!("../templates/hostward.yaml").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const MINIMAL: &str = "
connection:
  host: 203.0.113.10
  user: deploy
  home_dir: /home/deploy
";

    fn with(extra: &str) -> Config {
        Config::from_yaml(&format!("{}{}", MINIMAL, extra)).unwrap()
    }

    #[test]
    fn test_secret_string_debug_redacted() {
        let secret = SecretString::from("hunter2");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(secret.as_str(), "hunter2");
        assert!(!secret.is_empty());
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = with("");
        assert_eq!(config.secrets_root, DEFAULT_SECRETS_ROOT);
        assert!(config.firewall.is_empty());
        assert!(!config.firewall.persist);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(Config::from_yaml(&format!("{}backend: nftables\n", MINIMAL)).is_err());
    }

    #[test]
    fn test_default_template_is_valid() {
        let config = Config::from_yaml(&Config::generate_default_yaml()).unwrap();
        config.validate().unwrap();
        assert!(!config.services.is_empty());
        assert!(!config.firewall.chains.is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = with(
            "firewall:\n  ipsets:\n    - {name: BLOCK, type: 'hash:ip'}\n    - {name: BLOCK, type: 'hash:net'}\n",
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate ipset name 'BLOCK'"));
    }

    #[test]
    fn test_same_chain_name_in_two_tables() {
        let config = with(
            "firewall:\n  chains:\n    - {name: PREROUTING, table: nat, already_created: true}\n    - {name: PREROUTING, table: mangle, already_created: true}\n",
        );
        config.validate().unwrap();

        let config = with(
            "firewall:\n  chains:\n    - {name: PREROUTING, table: nat}\n    - {name: PREROUTING, table: nat}\n",
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate chain name 'nat/PREROUTING'"));
    }

    #[test]
    fn test_invalid_host_rejected() {
        let mut config = with("");
        config.connection.host = "deploy@host".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_network_rejected() {
        let config = with("networks:\n  - {name: lan, cidr: 10.0.0.0/33}\n");
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::NetworkClaim { .. })
        ));
    }

    #[test]
    fn test_relative_secrets_root_rejected() {
        let config = with("secrets_root: secrets\n");
        assert!(config.validate().is_err());

        let mut config = with("state_file: state.json\n");
        config.resolve_paths(Path::new("/srv/infra"));
        assert_eq!(config.state_path(), PathBuf::from("/srv/infra/state.json"));
    }

    #[test]
    fn test_load_resolves_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostward.yaml");
        fs::write(
            &path,
            format!(
                "{}services:
  - name: web
    deploy_type: replace
    userns_remap: {{start: 100000, length: 65536}}
    service:
      user: ROOT_USER
      healthcheck: NO_SHELL
      build: {{context: ./app}}
    mounts:
      - {{name: conf, source: conf, on_container: /etc/app}}
",
                MINIMAL
            ),
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let service = &config.services[0];
        assert_eq!(
            service.service.build.as_ref().unwrap().context,
            dir.path().join("./app")
        );
        assert_eq!(service.mounts[0].source, dir.path().join("conf"));
        assert_eq!(
            config.state_path(),
            PathBuf::from(crate::state::DEFAULT_STATE_FILE)
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/hostward.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
