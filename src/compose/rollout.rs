//! Remote scripts and resources that deploy one compose service.
//!
//! Every service expands to the same chain of resources:
//!
//! ```text
//! rotate -> upload -> [mount-acls] -> docker-up -> cleanup -> teardown
//!        -> [secrets] ---------------^
//! ```
//!
//! `teardown` does nothing on create; its delete script removes the service entirely,
//! so it runs when the service leaves the manifest.

use anyhow::Result;
use std::env;
use std::path::Path;
use tracing::debug;

use super::bundle::{Bundle, BundleBuilder};
use super::health::max_wait_seconds;
use super::identity::{host_ids, host_uid};
use super::spec::ComposeDocument;
use super::types::{ComposeServiceConfig, DeployType, SecretConfig};
use super::{ServiceLayout, BUILD_FOLDER, COMPOSE_FILE, MOUNT_FOLDER};
use crate::acl::{AclEntry, StrictAcl, READ_ONLY, READ_WRITE};
use crate::config::SecretString;
use crate::error::ProvisionError;
use crate::remote::{fingerprint, Action, Connection, Resource, Upload};
use crate::shell::{
    and_all, delete_dir_elements, delete_dir_if_exists, move_dir_elements, only_files_in_dir,
    quote,
};

/// Exit status of a failed rollout, after the service logs were printed.
pub const ROLLOUT_FAILED_EXIT: i32 = 33;

/// Everything a service needs from the surrounding plan.
#[derive(Debug, Clone)]
pub struct ServiceContext<'a> {
    pub connection: &'a Connection,
    pub secrets_root: &'a str,
    /// Local scratch directory receiving the bundles
    pub workdir: &'a Path,
    /// Resources `docker-up` waits for when the service sets `after_firewall`
    pub firewall: Vec<String>,
}

pub fn resource_name(service: &str, step: &str) -> String {
    format!("service/{}/{}", service, step)
}

fn compose(layout: &ServiceLayout, args: &str) -> String {
    format!("docker compose -f {} {}", quote(&layout.compose_file()), args)
}

/// Retire the current generation to `.prev`, keeping `mnt/` in place.
pub fn rotate_script(layout: &ServiceLayout) -> String {
    let prev = layout.prev_dir();
    and_all([
        format!("mkdir -p {}", quote(layout.dir())),
        delete_dir_elements(&prev, &[]),
        move_dir_elements(layout.dir(), &prev, &[MOUNT_FOLDER]),
        delete_dir_elements(layout.dir(), &[MOUNT_FOLDER]),
    ])
}

/// Bring the service up according to its deploy type.
pub fn up_script(config: &ComposeServiceConfig, layout: &ServiceLayout) -> Result<String> {
    let service = quote(&config.name);
    let prepare = if config.service.build.is_some() {
        compose(layout, &format!("build {}", service))
    } else {
        compose(layout, &format!("pull {}", service))
    };
    let wait = max_wait_seconds(&config.service.healthcheck, &config.name)?;
    let on_failure = format!(
        "{{ {} || true; exit {}; }}",
        compose(layout, &format!("logs {}", service)),
        ROLLOUT_FAILED_EXIT
    );

    let script = match config.deploy_type {
        DeployType::Manual => and_all([compose(layout, "config --quiet"), prepare]),
        DeployType::Replace => {
            let wait_args = wait
                .map(|s| format!(" --wait --wait-timeout {}", s))
                .unwrap_or_default();
            format!(
                "{{ {}; }} || {}",
                and_all([
                    prepare,
                    compose(layout, &format!("stop {}", service)),
                    compose(layout, &format!("up -d{} {}", wait_args, service)),
                ]),
                on_failure
            )
        }
        DeployType::BlueGreen => {
            let timeout = wait
                .map(|s| format!(" --timeout {}", s))
                .unwrap_or_default();
            // `up` afterwards settles the replica count if the helper left it doubled
            format!(
                "{{ {}; }} || {}",
                and_all([
                    prepare,
                    format!(
                        "docker rollout -f {}{} {}",
                        quote(&layout.compose_file()),
                        timeout,
                        service
                    ),
                    compose(layout, &format!("up -d {}", service)),
                ]),
                on_failure
            )
        }
    };
    Ok(script)
}

/// ACLs granted to a service's mounts: `(insert, set)`.
///
/// Inserted ACLs include the transitional `additional_users`; the set ACLs applied
/// after a successful rollout only keep the service user.
pub fn mount_acls(
    config: &ComposeServiceConfig,
    layout: &ServiceLayout,
    bundle: &BundleBuilder,
) -> Result<(Vec<StrictAcl>, Vec<StrictAcl>)> {
    let service = host_ids(config.service.user.ids(), config.userns_remap)?;
    let mut inserts = Vec::new();
    let mut sets = Vec::new();
    for mount in &config.mounts {
        let permissions = if mount.read_write { READ_WRITE } else { READ_ONLY };
        let current = vec![
            AclEntry::user(service.uid, permissions),
            AclEntry::group(service.gid, permissions),
        ];
        let mut transitional = current.clone();
        for extra in &mount.additional_users {
            let ids = host_ids(*extra, config.userns_remap)?;
            transitional.push(AclEntry::user(ids.uid, permissions));
            transitional.push(AclEntry::group(ids.gid, permissions));
        }
        let is_dir = bundle.is_dir(&format!("{}/{}", MOUNT_FOLDER, mount.name));
        let path = layout.mount_dir(&mount.name);
        inserts.push(StrictAcl::new(path.clone(), transitional, is_dir));
        sets.push(StrictAcl::new(path, current, is_dir));
    }
    Ok((inserts, sets))
}

/// Read access to the secrets directory for every secret user.
pub fn secret_acl(config: &ComposeServiceConfig, layout: &ServiceLayout) -> Result<StrictAcl> {
    let uids = config
        .secret_user_ids
        .clone()
        .unwrap_or_else(|| vec![config.service.user.ids().uid]);
    let entries = uids
        .into_iter()
        .map(|uid| Ok(AclEntry::user(host_uid(uid, config.userns_remap)?, READ_ONLY)))
        .collect::<Result<Vec<_>>>()?;
    Ok(StrictAcl::new(layout.secrets_dir(), entries, true))
}

/// Stop and remove the service, its images and volumes, then its directories.
pub fn teardown_script(config: &ComposeServiceConfig, layout: &ServiceLayout) -> String {
    let file = quote(&layout.compose_file());
    let mut parts = vec![format!(
        "if [ -f {file} ]; then docker compose -f {file} down --rmi all -v; fi"
    )];
    let mut acl_paths: Vec<String> = config
        .mounts
        .iter()
        .map(|m| layout.mount_dir(&m.name))
        .collect();
    if !config.secrets.is_empty() {
        acl_paths.push(layout.secrets_dir().to_string());
    }
    for path in acl_paths {
        let remove = StrictAcl::new(path.clone(), Vec::new(), false).remove_command();
        parts.push(format!("if [ -e {} ]; then {}; fi", quote(&path), remove));
    }
    parts.push(delete_dir_if_exists(layout.dir()));
    parts.push(delete_dir_if_exists(&layout.prev_dir()));
    parts.push(delete_dir_if_exists(layout.secrets_dir()));
    and_all(parts)
}

fn secret_value(service: &str, secret: &SecretConfig) -> Result<SecretString> {
    if let Some(value) = &secret.value {
        return Ok(value.clone());
    }
    let name = secret.value_env.as_deref().unwrap_or_default();
    env::var(name).map(SecretString::new).map_err(|_| {
        ProvisionError::invalid_service(
            service,
            format!(
                "environment variable {} for secret {} is not set",
                name, secret.name
            ),
        )
        .into()
    })
}

fn write_secrets(config: &ComposeServiceConfig, workdir: &Path) -> Result<Option<Bundle>> {
    if config.secrets.is_empty() {
        return Ok(None);
    }
    let mut builder = BundleBuilder::new();
    for secret in &config.secrets {
        let value = secret_value(&config.name, secret)?;
        builder.add_bytes(&secret.name, value.as_str().as_bytes(), 0o600)?;
    }
    let bundle = builder.write(&workdir.join(format!("{}-secrets.tar.gz", config.name)))?;
    Ok(Some(bundle))
}

fn service_bundle(
    config: &ComposeServiceConfig,
    document: &ComposeDocument,
) -> Result<BundleBuilder> {
    let mut builder = BundleBuilder::new();
    builder.add_bytes(COMPOSE_FILE, document.to_yaml()?, 0o644)?;
    if let Some(build) = &config.service.build {
        builder.add_path(BUILD_FOLDER, &build.context)?;
    }
    for mount in &config.mounts {
        builder.add_path(&format!("{}/{}", MOUNT_FOLDER, mount.name), &mount.source)?;
    }
    Ok(builder)
}

/// Build every resource of one service, writing its bundles into `ctx.workdir`.
pub fn service_resources(
    config: &ComposeServiceConfig,
    ctx: &ServiceContext<'_>,
) -> Result<Vec<Resource>> {
    let layout = ServiceLayout::new(&ctx.connection.home_dir, ctx.secrets_root, &config.name);
    let document = ComposeDocument::build(config, &layout)?;
    let builder = service_bundle(config, &document)?;
    let bundle = builder.write(&ctx.workdir.join(format!("{}.tar.gz", config.name)))?;
    let secrets = write_secrets(config, ctx.workdir)?;
    debug!("Bundled {} ({})", config.name, bundle.digest);

    let name = |step: &str| resource_name(&config.name, step);
    let reupload = format!(
        "reupload:{}",
        config
            .reupload_id
            .map(|id| id.to_string())
            .unwrap_or_default()
    );
    let bundle_trigger = format!("bundle:{}", bundle.digest);
    let secrets_trigger = format!(
        "secrets:{}",
        secrets.as_ref().map(|b| b.digest.as_str()).unwrap_or_default()
    );

    let mut resources = Vec::new();

    resources.push(
        Resource::script(name("rotate"), rotate_script(&layout))
            .with_triggers(vec![bundle_trigger.clone(), reupload.clone()]),
    );

    resources.push(
        Resource::new(
            name("upload"),
            Action::Upload(Upload {
                archive: bundle.path.clone(),
                digest: bundle.digest.clone(),
                destination: layout.dir().to_string(),
                after_extract: None,
            }),
        )
        .with_triggers(vec![reupload.clone()])
        .depends_on([name("rotate")]),
    );

    let mut up_deps = vec![name("upload")];

    let secret_acl = if let Some(secrets) = &secrets {
        let acl = secret_acl(config, &layout)?;
        let dir = quote(layout.secrets_dir());
        let after_extract = and_all([
            format!("chmod 700 {}", dir),
            format!("find {} -type f -exec chmod 600 {{}} +", dir),
            acl.insert_command(),
        ]);
        resources.push(
            Resource::new(
                name("secrets"),
                Action::Upload(Upload {
                    archive: secrets.path.clone(),
                    digest: secrets.digest.clone(),
                    destination: layout.secrets_dir().to_string(),
                    after_extract: Some(after_extract),
                }),
            )
            .with_triggers(vec![secrets_trigger.clone(), reupload.clone()])
            .depends_on([name("rotate")]),
        );
        up_deps.push(name("secrets"));
        Some(acl)
    } else {
        None
    };

    let (mount_inserts, mount_sets) = mount_acls(config, &layout, &builder)?;
    if !mount_inserts.is_empty() {
        resources.push(
            Resource::script(
                name("mount-acls"),
                and_all(mount_inserts.iter().map(StrictAcl::insert_command)),
            )
            .with_triggers(vec![bundle_trigger.clone()])
            .depends_on([name("upload")]),
        );
        up_deps.push(name("mount-acls"));
    }

    if config.after_firewall {
        up_deps.extend(ctx.firewall.iter().cloned());
    }
    resources.push(
        Resource::script(name("docker-up"), up_script(config, &layout)?)
            .with_triggers(vec![
                format!("compose:{}", fingerprint(document.value())),
                format!("build:{}", builder.digest_of(BUILD_FOLDER)),
                reupload.clone(),
                secrets_trigger.clone(),
            ])
            .depends_on(up_deps),
    );

    let mut cleanup = Vec::new();
    if secrets.is_some() {
        let names: Vec<String> = config.secrets.iter().map(|s| s.name.clone()).collect();
        cleanup.push(only_files_in_dir(layout.secrets_dir(), &names)?);
    }
    if config.service.build.is_some() {
        cleanup.push(only_files_in_dir(
            &layout.build_dir(),
            &builder.files_under(BUILD_FOLDER),
        )?);
    }
    for mount in config.mounts.iter().filter(|m| !m.read_write) {
        let prefix = format!("{}/{}", MOUNT_FOLDER, mount.name);
        if builder.is_dir(&prefix) {
            cleanup.push(only_files_in_dir(
                &layout.mount_dir(&mount.name),
                &builder.files_under(&prefix),
            )?);
        }
    }
    cleanup.extend(mount_sets.iter().map(StrictAcl::set_command));
    if let Some(acl) = &secret_acl {
        cleanup.push(acl.set_command());
    }
    let cleanup = if cleanup.is_empty() {
        "true".to_string()
    } else {
        and_all(cleanup)
    };
    let mut cleanup_deps = vec![name("docker-up")];
    if secrets.is_some() {
        cleanup_deps.push(name("secrets"));
    }
    resources.push(
        Resource::script(name("cleanup"), cleanup)
            .with_triggers(vec![bundle_trigger, secrets_trigger])
            .depends_on(cleanup_deps),
    );

    resources.push(
        Resource::script(name("teardown"), "true")
            .with_delete(teardown_script(config, &layout))
            .depends_on([name("cleanup")]),
    );

    Ok(resources)
}
