//! Docker compose services: manifest types, document building and rollout.
//!
//! Remote layout for a service `web` with home `/home/deploy`:
//!
//! ```text
//! /home/deploy/docker/web/compose.yml
//! /home/deploy/docker/web/build/...
//! /home/deploy/docker/web/mnt/<mount>/...
//! /home/deploy/docker/web.prev/        previous generation
//! <secrets_root>/web/<secret>          mode 0600
//! ```

pub mod bundle;
pub mod health;
pub mod identity;
pub mod rollout;
pub mod spec;
pub mod types;

pub use rollout::{service_resources, ServiceContext};
pub use spec::ComposeDocument;
pub use types::{ComposeServiceConfig, DeployType};

pub const COMPOSE_FILE: &str = "compose.yml";
pub const BUILD_FOLDER: &str = "build";
pub const MOUNT_FOLDER: &str = "mnt";
/// Compose-local name of the network shared with the reverse proxy
pub const BLUE_GREEN_NETWORK: &str = "blueGreenGateway";
pub const SOCKET_PROXY_NETWORK: &str = "socketProxy";
pub const SOCKET_PROXY_DEFAULT_NAME: &str = "dockersocketproxy";
pub const SOCKET_PROXY_IMAGE: &str = "tecnativa/docker-socket-proxy";
pub const DEFAULT_PIDS_LIMIT: i64 = 200;
pub const DEFAULT_SECRETS_ROOT: &str = "/var/hostward/.secrets";

/// Remote paths of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLayout {
    dir: String,
    secrets_dir: String,
}

impl ServiceLayout {
    pub fn new(home_dir: &str, secrets_root: &str, service: &str) -> Self {
        Self {
            dir: format!("{}/docker/{}", home_dir.trim_end_matches('/'), service),
            secrets_dir: format!("{}/{}", secrets_root.trim_end_matches('/'), service),
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn prev_dir(&self) -> String {
        format!("{}.prev", self.dir)
    }

    pub fn compose_file(&self) -> String {
        format!("{}/{}", self.dir, COMPOSE_FILE)
    }

    pub fn build_dir(&self) -> String {
        format!("{}/{}", self.dir, BUILD_FOLDER)
    }

    pub fn mount_dir(&self, mount: &str) -> String {
        format!("{}/{}/{}", self.dir, MOUNT_FOLDER, mount)
    }

    pub fn secrets_dir(&self) -> &str {
        &self.secrets_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = ServiceLayout::new("/home/deploy/", "/var/hostward/.secrets", "web");
        assert_eq!(layout.dir(), "/home/deploy/docker/web");
        assert_eq!(layout.prev_dir(), "/home/deploy/docker/web.prev");
        assert_eq!(layout.compose_file(), "/home/deploy/docker/web/compose.yml");
        assert_eq!(layout.build_dir(), "/home/deploy/docker/web/build");
        assert_eq!(layout.mount_dir("conf"), "/home/deploy/docker/web/mnt/conf");
        assert_eq!(layout.secrets_dir(), "/var/hostward/.secrets/web");
    }
}
