//! # hostward - declarative host provisioning over SSH
//!
//! One YAML manifest describes a remote Linux host: its iptables/ip6tables chains,
//! ipsets and foreign-chain rules, and the docker compose services that run on it.
//! hostward turns the manifest into an ordered list of resources, each a shell script
//! (or an archive upload) with an optional delete script, and converges the host by
//! comparing fingerprints with the state of the last successful apply.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CLI (clap)                                                 │
//! │    └── plan, apply, destroy, validate, render, init         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! │    └── connection, firewall, networks, services             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Plan (petgraph)                                            │
//! │    ├── firewall: precreate, ipset swap, chains, rules, save │
//! │    └── compose: rotate, upload, secrets, acls, up, cleanup  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Remote (ssh/scp via CommandExecutor)                       │
//! │    ├── two-phase sudo copy                                  │
//! │    └── Applier: create / update / replace / delete          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  State (serde_json, fs2 lock)                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use hostward::config::Config;
//! use hostward::plan::Plan;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/hostward/hostward.yaml")?;
//!     let plan = Plan::build(&config)?;
//!     for resource in plan.resources() {
//!         println!("{}", resource.name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`acl`] - setfacl argument rendering
//! - [`cli`] - Command-line interface definitions
//! - [`commands`] - CLI command implementations
//! - [`compose`] - Compose documents and rollout steps
//! - [`config`] - Manifest parsing and validation
//! - [`firewall`] - iptables, ipset and persistence scripts
//! - [`network`] - Non-overlapping address claims
//! - [`plan`] - Manifest to ordered resources
//! - [`registry`] - Unique resource ids and dependency categories
//! - [`remote`] - SSH transport, uploads and the applier
//! - [`shell`] - Quoting and small script helpers
//! - [`state`] - Fingerprints of the last apply

pub mod acl;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod compose;
pub mod config;
pub mod error;
pub mod firewall;
pub mod lock;
pub mod network;
pub mod plan;
pub mod registry;
pub mod remote;
pub mod shell;
pub mod state;
pub mod validation;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use error::ProvisionError;
