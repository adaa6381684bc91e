//! Validation of a service description and the compose document built from it.

use anyhow::Result;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

use super::types::{
    BlueGreenConfig, ComposeServiceConfig, DependsOn, DeployType, HealthcheckConfig, Labels,
    ServiceNetworks, SocketProxyConfig, TlsSetting,
};
use super::{
    ServiceLayout, BLUE_GREEN_NETWORK, DEFAULT_PIDS_LIMIT, MOUNT_FOLDER, SOCKET_PROXY_DEFAULT_NAME,
    SOCKET_PROXY_IMAGE, SOCKET_PROXY_NETWORK,
};
use crate::error::ProvisionError;
use crate::validation::{validate_identifier, validate_ip_or_cidr};

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Service keys this crate manages itself.
const RESERVED_KEYS: &[&str] = &["container_name", "secrets"];

fn invalid(config: &ComposeServiceConfig, reason: impl Into<String>) -> anyhow::Error {
    ProvisionError::invalid_service(&config.name, reason).into()
}

/// Structural checks that do not need the document.
pub fn validate(config: &ComposeServiceConfig) -> Result<()> {
    validate_identifier("service", &config.name)?;
    let spec = &config.service;

    match (config.deploy_type, &config.blue_green) {
        (DeployType::BlueGreen, None) => {
            return Err(invalid(config, "blue_green is required for deploy_type blue-green"))
        }
        (DeployType::BlueGreen, Some(_)) if !spec.ports.is_empty() => {
            return Err(invalid(
                config,
                format!(
                    "ports cannot be published for blue-green deploys since two generations run at once: {}",
                    Value::Array(spec.ports.clone())
                ),
            ))
        }
        (DeployType::Replace | DeployType::Manual, Some(_)) => {
            return Err(invalid(
                config,
                "blue_green settings are only valid for deploy_type blue-green",
            ))
        }
        _ => {}
    }

    if spec.image.is_none() && spec.build.is_none() {
        return Err(invalid(config, "service needs an image or a build"));
    }
    for key in RESERVED_KEYS {
        if spec.extra.contains_key(*key) {
            return Err(invalid(config, format!("service.{} is managed by hostward", key)));
        }
    }

    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for mount in &config.mounts {
        validate_identifier("mount", &mount.name)?;
        if !seen.insert(mount.name.as_str()) {
            duplicates.insert(mount.name.as_str());
        }
    }
    if !duplicates.is_empty() {
        return Err(invalid(
            config,
            format!(
                "duplicate mount names: {}",
                duplicates.into_iter().collect::<Vec<_>>().join(", ")
            ),
        ));
    }

    let mut secret_names = BTreeSet::new();
    for secret in &config.secrets {
        validate_identifier("secret", &secret.name)?;
        if !secret_names.insert(secret.name.as_str()) {
            return Err(invalid(config, format!("duplicate secret name: {}", secret.name)));
        }
        if secret.value.is_some() == secret.value_env.is_some() {
            return Err(invalid(
                config,
                format!("secret {} needs exactly one of value or value_env", secret.name),
            ));
        }
    }

    if let Some(socket) = &config.docker_socket {
        validate_ip_or_cidr(&socket.network_cidr)?;
        if let Some(name) = &socket.name {
            validate_identifier("socket proxy", name)?;
        }
    }

    Ok(())
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flatten nested maps into `prefix.key=value` labels.
fn dotted(prefix: &str, map: &Map<String, Value>, out: &mut Vec<String>) {
    for (key, value) in map {
        let path = format!("{}.{}", prefix, key);
        match value {
            Value::Object(inner) => dotted(&path, inner, out),
            Value::Array(items) => out.push(format!(
                "{}={}",
                path,
                items.iter().map(text).collect::<Vec<_>>().join(",")
            )),
            other => out.push(format!("{}={}", path, text(other))),
        }
    }
}

/// Reverse proxy labels routing each declared port to the service.
pub fn blue_green_labels(service: &str, blue_green: &BlueGreenConfig) -> Vec<String> {
    let mut labels = vec![
        "traefik.enable=true".to_string(),
        format!("traefik.docker.network={}", blue_green.network_name),
    ];
    for port in &blue_green.ports {
        let route = format!("bluegreen{}{}", service, port.entrypoint);
        let router = format!("traefik.http.routers.{}", route);
        let balancer = format!("traefik.http.services.{}.loadbalancer", route);
        let retry = format!("{}-retry", route);

        match &port.tls {
            TlsSetting::Enabled(false) => {}
            TlsSetting::Enabled(true) => labels.push(format!("{}.tls=true", router)),
            TlsSetting::Options(options) => {
                labels.push(format!("{}.tls=true", router));
                dotted(&format!("{}.tls", router), options, &mut labels);
            }
        }
        labels.push(format!("{}.entrypoints={}", router, port.entrypoint));
        labels.push(format!("{}.rule={}", router, port.rule));
        labels.push(format!("{}.service={}", router, route));
        labels.push(format!("traefik.http.middlewares.{}.retry.attempts=5", retry));
        labels.push(format!(
            "traefik.http.middlewares.{}.retry.initialinterval=200ms",
            retry
        ));
        labels.push(format!("{}.middlewares={}", router, retry));
        labels.push(format!("{}.server.port={}", balancer, port.local));
        dotted(&format!("{}.healthCheck", balancer), &port.health_check, &mut labels);
    }
    labels
}

fn socket_proxy(socket: &SocketProxyConfig) -> (String, Value, Value) {
    let name = socket
        .name
        .clone()
        .unwrap_or_else(|| SOCKET_PROXY_DEFAULT_NAME.to_string());

    let mut environment = Map::new();
    for (key, value) in &socket.env {
        environment.insert(key.clone(), Value::String(value.clone()));
    }
    for (api, enabled) in &socket.apis {
        environment.insert(api.clone(), json!(enabled));
    }
    environment.insert("POST".into(), json!(if socket.readonly { 0 } else { 1 }));

    let access = if socket.readonly { "ro" } else { "rw" };
    let service = json!({
        "environment": environment,
        // the proxy needs the real host root to reach the socket
        "userns_mode": "host",
        "image": SOCKET_PROXY_IMAGE,
        "networks": [SOCKET_PROXY_NETWORK],
        "volumes": [format!("{}:{}:{}", DOCKER_SOCKET, DOCKER_SOCKET, access)],
    });
    let network = json!({
        "internal": true,
        "driver": "bridge",
        "ipam": { "config": [{ "subnet": socket.network_cidr }] },
    });
    (name, service, network)
}

fn mount_rel_path(name: &str) -> String {
    format!("./{}/{}", MOUNT_FOLDER, name)
}

fn started() -> Value {
    json!({ "restart": false, "condition": "service_started", "required": true })
}

fn pids_limit(config: &ComposeServiceConfig) -> Result<Value> {
    let spec = &config.service;
    let inner = spec
        .deploy
        .as_ref()
        .and_then(|d| d.pointer("/resources/limits/pids"));
    match (&spec.pids_limit, inner) {
        (Some(top), Some(inner)) if top.as_text() != text(inner) => Err(invalid(
            config,
            format!(
                "pids_limit and deploy.resources.limits.pids must match when both are set (pids_limit: {}, limits.pids: {})",
                top.as_text(),
                text(inner)
            ),
        )),
        (Some(top), _) => Ok(serde_json::to_value(top)?),
        (None, Some(inner)) => Ok(inner.clone()),
        (None, None) => {
            tracing::warn!(
                "{} does not set pids_limit, defaulting to {}",
                config.name,
                DEFAULT_PIDS_LIMIT
            );
            Ok(json!(DEFAULT_PIDS_LIMIT))
        }
    }
}

/// The full compose file for one service, plus its host-side sidecars and networks.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeDocument {
    value: Value,
}

impl ComposeDocument {
    pub fn build(config: &ComposeServiceConfig, layout: &ServiceLayout) -> Result<Self> {
        validate(config)?;
        let spec = &config.service;
        let blue_green = config.deploy_type == DeployType::BlueGreen;

        let mut services = Map::new();
        let mut declared = config.networks.clone();

        let mut depends_on = match &spec.depends_on {
            None => Map::new(),
            Some(DependsOn::List(names)) => names.iter().map(|n| (n.clone(), started())).collect(),
            Some(DependsOn::Map(map)) => map.clone(),
        };

        let sidecar = config.docker_socket.as_ref().map(socket_proxy);

        let mut networks: Option<ServiceNetworks> = spec.networks.clone().or_else(|| {
            (blue_green || sidecar.is_some()).then(|| ServiceNetworks::List(Vec::new()))
        });

        if let Some((name, service, network)) = sidecar {
            depends_on.insert(name.clone(), started());
            services.insert(name, service);
            declared.insert(SOCKET_PROXY_NETWORK.to_string(), network);
            if let Some(n) = networks.as_mut() {
                n.add(SOCKET_PROXY_NETWORK);
            }
        }

        let mut labels = spec.labels.clone();
        if let Some(bg) = config.blue_green.as_ref().filter(|_| blue_green) {
            for label in blue_green_labels(&config.name, bg) {
                labels.push(&label);
            }
            declared.insert(
                BLUE_GREEN_NETWORK.to_string(),
                json!({ "name": bg.network_name, "external": true }),
            );
        }

        if let Some(n) = networks.as_mut() {
            for name in n.names() {
                if !declared.contains_key(&name) {
                    return Err(invalid(
                        config,
                        format!("network {} is used but not declared in networks", name),
                    ));
                }
            }
            if blue_green {
                n.add(BLUE_GREEN_NETWORK);
            }
        }

        let mut top_volumes = Map::new();
        for volume in &spec.volumes {
            let on_host = volume.split(':').next().unwrap_or_default();
            if on_host == DOCKER_SOCKET {
                return Err(invalid(
                    config,
                    "do not mount the docker socket, use docker_socket instead",
                ));
            }
            if !on_host.contains('/') {
                top_volumes.insert(on_host.to_string(), json!({}));
            } else if !on_host.starts_with('/')
                && !config.mounts.iter().any(|m| on_host == mount_rel_path(&m.name))
            {
                return Err(invalid(
                    config,
                    format!(
                        "relative volume {} must match a declared mount ./{}/<name>",
                        volume, MOUNT_FOLDER
                    ),
                ));
            }
        }

        let mut volumes: Vec<String> = Vec::new();
        let mapped = config.mounts.iter().map(|m| {
            format!(
                "{}:{}:{}",
                mount_rel_path(&m.name),
                m.on_container,
                if m.read_write { "rw" } else { "ro" }
            )
        });
        for volume in spec.volumes.iter().cloned().chain(mapped) {
            if !volumes.contains(&volume) {
                volumes.push(volume);
            }
        }

        let mut body = spec.extra.clone();
        if let Some(image) = &spec.image {
            body.insert("image".into(), json!(image));
        }
        if let Some(deploy) = &spec.deploy {
            body.insert("deploy".into(), deploy.clone());
        }
        if !spec.ports.is_empty() {
            body.insert("ports".into(), Value::Array(spec.ports.clone()));
        }
        if let HealthcheckConfig::Check(check) = &spec.healthcheck {
            body.insert("healthcheck".into(), serde_json::to_value(check)?);
        }
        if let Some(build) = &spec.build {
            let mut build_value = build.options.clone();
            build_value.insert("context".into(), json!(layout.build_dir()));
            body.insert("build".into(), Value::Object(build_value));
        }
        let has_labels = match &labels {
            Labels::List(list) => !list.is_empty(),
            Labels::Map(map) => !map.is_empty(),
        };
        if has_labels {
            body.insert("labels".into(), serde_json::to_value(&labels)?);
        }
        if !config.secrets.is_empty() {
            body.insert(
                "secrets".into(),
                json!(config.secrets.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()),
            );
        }
        if let Some(n) = &networks {
            body.insert("networks".into(), serde_json::to_value(n)?);
        }
        if !volumes.is_empty() {
            body.insert("volumes".into(), json!(volumes));
        }
        body.insert("pids_limit".into(), pids_limit(config)?);
        body.insert("user".into(), json!(spec.user.compose_value()));
        if !depends_on.is_empty() {
            body.insert("depends_on".into(), Value::Object(depends_on));
        }
        services.insert(config.name.clone(), Value::Object(body));

        let mut document = Map::new();
        document.insert("name".into(), json!(config.name));
        document.insert("services".into(), Value::Object(services));
        if !top_volumes.is_empty() {
            document.insert("volumes".into(), Value::Object(top_volumes));
        }
        if !config.secrets.is_empty() {
            let secrets: Map<String, Value> = config
                .secrets
                .iter()
                .map(|s| {
                    (
                        s.name.clone(),
                        json!({ "file": format!("{}/{}", layout.secrets_dir(), s.name) }),
                    )
                })
                .collect();
            document.insert("secrets".into(), Value::Object(secrets));
        }
        if !declared.is_empty() {
            document.insert("networks".into(), Value::Object(declared));
        }

        Ok(Self {
            value: Value::Object(document),
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.value)?)
    }
}
