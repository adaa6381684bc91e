//! Manifest types for one compose service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::SecretString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployType {
    /// Stop the running container, then start the new one. Has downtime.
    Replace,
    /// Start the new generation next to the old one through the reverse proxy.
    BlueGreen,
    /// Upload and build only; containers are started by hand.
    Manual,
}

/// Numeric identity of a container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserIds {
    pub uid: u32,
    pub gid: u32,
}

const ROOT_MARKER: &str = "ROOT_USER";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawUser {
    Marker(String),
    Ids(UserIds),
}

/// Container user: explicit root or a numeric pair. Usernames are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawUser", into = "String")]
pub enum ServiceUser {
    Root,
    Ids(UserIds),
}

impl TryFrom<RawUser> for ServiceUser {
    type Error = String;

    fn try_from(raw: RawUser) -> Result<Self, Self::Error> {
        match raw {
            RawUser::Ids(ids) => Ok(ServiceUser::Ids(ids)),
            RawUser::Marker(marker) if marker == ROOT_MARKER => Ok(ServiceUser::Root),
            RawUser::Marker(other) => Err(format!(
                "user '{}' is not accepted: use {{uid, gid}} or {}",
                other, ROOT_MARKER
            )),
        }
    }
}

impl From<ServiceUser> for String {
    fn from(user: ServiceUser) -> Self {
        user.compose_value()
    }
}

impl ServiceUser {
    pub fn ids(self) -> UserIds {
        match self {
            ServiceUser::Root => UserIds { uid: 0, gid: 0 },
            ServiceUser::Ids(ids) => ids,
        }
    }

    /// `uid:gid` as written into the compose file.
    pub fn compose_value(self) -> String {
        let ids = self.ids();
        format!("{}:{}", ids.uid, ids.gid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Retries {
    Count(u32),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthTest {
    Shell(String),
    Exec(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Healthcheck {
    pub test: HealthTest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<Retries>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_interval: Option<String>,
}

const NO_SHELL: &str = "NO_SHELL";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawHealth {
    Marker(String),
    Check(Healthcheck),
}

/// Mandatory health check. `NO_SHELL` brings the service up without waiting.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawHealth")]
pub enum HealthcheckConfig {
    NoShell,
    Check(Healthcheck),
}

impl TryFrom<RawHealth> for HealthcheckConfig {
    type Error = String;

    fn try_from(raw: RawHealth) -> Result<Self, Self::Error> {
        match raw {
            RawHealth::Check(check) => Ok(HealthcheckConfig::Check(check)),
            RawHealth::Marker(marker) if marker == NO_SHELL => Ok(HealthcheckConfig::NoShell),
            RawHealth::Marker(other) => Err(format!(
                "healthcheck must be a mapping or {}, got '{}'",
                NO_SHELL, other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Local directory uploaded as the build context
    pub context: PathBuf,
    /// Remaining compose `build:` keys, passed through
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceNetworks {
    List(Vec<String>),
    Map(Map<String, Value>),
}

impl ServiceNetworks {
    pub fn names(&self) -> Vec<String> {
        match self {
            ServiceNetworks::List(names) => names.clone(),
            ServiceNetworks::Map(map) => map.keys().cloned().collect(),
        }
    }

    pub fn add(&mut self, network: &str) {
        match self {
            ServiceNetworks::List(names) => {
                if !names.iter().any(|n| n == network) {
                    names.push(network.to_string());
                }
            }
            ServiceNetworks::Map(map) => {
                map.entry(network.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Labels {
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl Default for Labels {
    fn default() -> Self {
        Labels::List(Vec::new())
    }
}

impl Labels {
    pub fn push(&mut self, label: &str) {
        match self {
            Labels::List(list) => list.push(label.to_string()),
            Labels::Map(map) => {
                let (key, value) = label.split_once('=').unwrap_or((label, ""));
                map.insert(key.to_string(), value.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PidsLimit {
    Count(i64),
    Text(String),
}

impl PidsLimit {
    pub fn as_text(&self) -> String {
        match self {
            PidsLimit::Count(n) => n.to_string(),
            PidsLimit::Text(s) => s.clone(),
        }
    }
}

/// The compose service body. Keys not modelled here are passed through untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceSpec {
    pub user: ServiceUser,
    pub healthcheck: HealthcheckConfig,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build: Option<BuildConfig>,
    /// Short-form volume strings only
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub ports: Vec<Value>,
    #[serde(default)]
    pub networks: Option<ServiceNetworks>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub depends_on: Option<DependsOn>,
    #[serde(default)]
    pub pids_limit: Option<PidsLimit>,
    #[serde(default)]
    pub deploy: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    /// Folder or file name under `mnt/`
    pub name: String,
    /// Local file or directory uploaded as the mount content
    pub source: PathBuf,
    pub on_container: String,
    #[serde(default)]
    pub read_write: bool,
    /// In-container identities granted access during a uid change
    #[serde(default)]
    pub additional_users: Vec<UserIds>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretConfig {
    pub name: String,
    #[serde(default)]
    pub value: Option<SecretString>,
    /// Read the value from this environment variable on the operator machine
    #[serde(default)]
    pub value_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocketProxyConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Only GET and HEAD are proxied
    pub readonly: bool,
    /// Subnet of the internal proxy network; must be unique on the host
    pub network_cidr: String,
    /// API sections to grant (1) or revoke (0)
    #[serde(default)]
    pub apis: BTreeMap<String, u8>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TlsSetting {
    Enabled(bool),
    Options(Map<String, Value>),
}

impl Default for TlsSetting {
    fn default() -> Self {
        TlsSetting::Enabled(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlueGreenPort {
    /// Container port traffic is routed to
    pub local: u16,
    /// Entrypoint from the proxy's static configuration
    pub entrypoint: String,
    /// Router rule expression, e.g. ``Host(`app.example.org`)``
    pub rule: String,
    /// Proxy load-balancer health check (`path`, `interval`, `headers`, ...)
    pub health_check: Map<String, Value>,
    #[serde(default)]
    pub tls: TlsSetting,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlueGreenConfig {
    /// Docker network shared with the reverse proxy
    pub network_name: String,
    pub ports: Vec<BlueGreenPort>,
}

/// User namespace remap configured for the docker daemon. `length: 0` disables range checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsernsRemap {
    pub start: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComposeServiceConfig {
    /// Unique on the host; names the remote directory and the compose project
    pub name: String,
    pub deploy_type: DeployType,
    pub userns_remap: UsernsRemap,
    pub service: ServiceSpec,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub secrets: Vec<SecretConfig>,
    /// In-container uids allowed to read secrets; defaults to the service user
    #[serde(default)]
    pub secret_user_ids: Option<Vec<u32>>,
    /// Top-level compose networks
    #[serde(default)]
    pub networks: Map<String, Value>,
    #[serde(default)]
    pub blue_green: Option<BlueGreenConfig>,
    #[serde(default)]
    pub docker_socket: Option<SocketProxyConfig>,
    /// Bump to force a fresh upload and rollout
    #[serde(default)]
    pub reupload_id: Option<u64>,
    /// Start only after every firewall resource has been applied
    #[serde(default)]
    pub after_firewall: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_forms() {
        let root: ServiceUser = serde_yaml::from_str("ROOT_USER").unwrap();
        assert_eq!(root, ServiceUser::Root);
        assert_eq!(root.compose_value(), "0:0");

        let ids: ServiceUser = serde_yaml::from_str("{uid: 1000, gid: 1001}").unwrap();
        assert_eq!(ids.compose_value(), "1000:1001");

        assert!(serde_yaml::from_str::<ServiceUser>("root").is_err());
        assert!(serde_yaml::from_str::<ServiceUser>("nobody").is_err());
    }

    #[test]
    fn test_healthcheck_forms() {
        let no_shell: HealthcheckConfig = serde_yaml::from_str("NO_SHELL").unwrap();
        assert_eq!(no_shell, HealthcheckConfig::NoShell);

        let check: HealthcheckConfig = serde_yaml::from_str(
            "test: [CMD, curl, -f, http://localhost]\nretries: \"5\"\ninterval: 10s\n",
        )
        .unwrap();
        match check {
            HealthcheckConfig::Check(hc) => {
                assert_eq!(hc.retries, Some(Retries::Text("5".into())));
                assert!(matches!(hc.test, HealthTest::Exec(ref v) if v.len() == 4));
            }
            HealthcheckConfig::NoShell => panic!("expected a check"),
        }

        assert!(serde_yaml::from_str::<HealthcheckConfig>("none").is_err());
    }

    #[test]
    fn test_service_spec_passes_unknown_keys_through() {
        let spec: ServiceSpec = serde_yaml::from_str(
            "user: ROOT_USER\nhealthcheck: NO_SHELL\nimage: nginx:1.27\nenvironment:\n  A: b\nrestart: always\n",
        )
        .unwrap();
        assert_eq!(spec.image.as_deref(), Some("nginx:1.27"));
        assert!(spec.extra.contains_key("environment"));
        assert!(spec.extra.contains_key("restart"));
        assert!(!spec.extra.contains_key("image"));
    }

    #[test]
    fn test_labels_push() {
        let mut list = Labels::default();
        list.push("a=b");
        assert_eq!(list, Labels::List(vec!["a=b".into()]));

        let mut map = Labels::Map(BTreeMap::new());
        map.push("traefik.http.routers.x.rule=Host(`a=b`)");
        match map {
            Labels::Map(m) => assert_eq!(m["traefik.http.routers.x.rule"], "Host(`a=b`)"),
            Labels::List(_) => panic!("expected map"),
        }
    }

    #[test]
    fn test_deploy_type_names() {
        let t: DeployType = serde_yaml::from_str("blue-green").unwrap();
        assert_eq!(t, DeployType::BlueGreen);
        assert!(serde_yaml::from_str::<DeployType>("rolling").is_err());
    }
}
