//! Error types for hostward.
//!
//! Validation errors are raised while the resource graph is being built, before any
//! remote command is issued. Remote errors carry the failing script and captured output.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Port match on {flag} requires a protocol match (rule: {rule})")]
    PortWithoutProtocol { flag: String, rule: String },

    #[error("Conntrack rewrite conflict: {flag} appears more than once in conntrack module args: {args}")]
    ConntrackConflict { flag: String, args: String },

    #[error("Invalid ipset {set}: {reason}")]
    InvalidSet { set: String, reason: String },

    #[error("Invalid service {service}: {reason}")]
    InvalidService { service: String, reason: String },

    #[error("{kind} id {id} exceeds the user namespace range {start}:{length}")]
    NamespaceRange {
        kind: &'static str,
        id: u32,
        start: u32,
        length: u32,
    },

    #[error("Duplicate resource id: {0}")]
    DuplicateId(String),

    #[error("Cannot register {id} into category {category}: the category was already claimed by {claimed_by}")]
    LateCategoryRegistration {
        category: String,
        id: String,
        claimed_by: String,
    },

    #[error("Dependency category {0} has no registered resources")]
    UnknownCategory(String),

    #[error("Network {network}: {reason}")]
    NetworkClaim { network: String, reason: String },

    #[error("Resource {resource} depends on unknown resource {dependency}")]
    UnknownDependency { resource: String, dependency: String },

    #[error("Dependency cycle detected involving {0}")]
    DependencyCycle(String),

    #[error("Remote command for {resource} failed (exit code {code:?})\ncommand: {command}\nstdout: {stdout}\nstderr: {stderr}")]
    RemoteExecution {
        resource: String,
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Transfer of {local} to {remote} failed: {reason}")]
    Transfer {
        local: String,
        remote: String,
        reason: String,
    },
}

impl ProvisionError {
    pub fn invalid_rule(reason: impl Into<String>) -> Self {
        Self::InvalidRule(reason.into())
    }

    pub fn invalid_set(set: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSet {
            set: set.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_service(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidService {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn network_claim(network: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NetworkClaim {
            network: network.into(),
            reason: reason.into(),
        }
    }

    /// True for errors raised before anything touched the remote host.
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::RemoteExecution { .. } | Self::Transfer { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_execution_message_includes_command_and_stderr() {
        let err = ProvisionError::RemoteExecution {
            resource: "web-docker-up".to_string(),
            command: "docker compose up".to_string(),
            code: Some(33),
            stdout: "container logs".to_string(),
            stderr: "unhealthy".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("web-docker-up"));
        assert!(msg.contains("docker compose up"));
        assert!(msg.contains("Some(33)"));
        assert!(msg.contains("unhealthy"));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_validation_classification() {
        assert!(ProvisionError::invalid_rule("bad").is_validation());
        assert!(ProvisionError::DuplicateId("x".into()).is_validation());
        let transfer = ProvisionError::Transfer {
            local: "a".into(),
            remote: "b".into(),
            reason: "c".into(),
        };
        assert!(!transfer.is_validation());
    }
}
