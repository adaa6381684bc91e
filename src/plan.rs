//! Manifest to ordered resource list.
//!
//! Resources are named by kind and parameters:
//!
//! | name | what |
//! |---|---|
//! | `firewall/install` | package installation |
//! | `firewall/precreate` | chains created in both families up front |
//! | `ipset/<name>` | set swap |
//! | `chain/<table>/<name>/<family>` | chain reconciliation |
//! | `rule/<name>/<family>` | one rule in a foreign chain |
//! | `firewall/save` | `netfilter-persistent save` |
//! | `service/<name>/<step>` | compose rollout steps |
//!
//! Every firewall resource joins the `firewall` category, which services claim with
//! `after_firewall`. The final order is topological and otherwise keeps declaration order.

use anyhow::Result;
use ipnet::IpNet;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use tempfile::TempDir;
use tracing::debug;

use crate::compose::rollout::{resource_name, service_resources, ServiceContext};
use crate::config::Config;
use crate::error::ProvisionError;
use crate::firewall::chain::{
    delete_script, precreate_delete_script, precreate_script, rule_command, rule_command_undo,
    ChainPlan,
};
use crate::firewall::rule::Rule;
use crate::firewall::{persist, swap, IpFamily, IpSet, Table};
use crate::network::Network;
use crate::registry::Registry;
use crate::remote::Resource;

pub const FIREWALL_CATEGORY: &str = "firewall";

pub fn chain_resource_name(table: Table, chain: &str, family: IpFamily) -> String {
    format!("chain/{}/{}/{}", table, chain, family)
}

/// Every `match_set` must name a declared set with one flag per set dimension.
fn check_set_matches(sets: &HashMap<String, IpSet>, owner: &str, rules: &[Rule]) -> Result<()> {
    for set_match in rules.iter().filter_map(|r| r.match_set.as_ref()) {
        let set = sets.get(&set_match.name).ok_or_else(|| {
            ProvisionError::invalid_rule(format!(
                "{} matches ipset {} which is not declared in firewall.ipsets",
                owner, set_match.name
            ))
        })?;
        set.match_args(&set_match.flags, set_match.negate)?;
    }
    Ok(())
}

/// Ordered resources plus the scratch directory holding their bundles.
#[derive(Debug)]
pub struct Plan {
    resources: Vec<Resource>,
    workdir: TempDir,
}

struct Builder<'a> {
    config: &'a Config,
    registry: Registry,
    resources: Vec<Resource>,
}

impl<'a> Builder<'a> {
    fn push(&mut self, resource: Resource, categories: &[&str]) -> Result<()> {
        self.registry.register_id(&resource.name)?;
        for category in categories {
            self.registry.add_to_category(category, &resource.name)?;
        }
        debug!("Planned {}", resource.name);
        self.resources.push(resource);
        Ok(())
    }

    fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.resources
            .iter()
            .filter(|r| r.name.starts_with(prefix))
            .map(|r| r.name.clone())
            .collect()
    }

    fn firewall(&mut self) -> Result<()> {
        let config = self.config;
        let fw = &config.firewall;
        let firewall = &[FIREWALL_CATEGORY];
        let mut base_deps = Vec::new();

        if fw.install_packages {
            self.push(
                Resource::script("firewall/install", persist::install_script()),
                firewall,
            )?;
            base_deps.push("firewall/install".to_string());
        }

        if !fw.precreate_chains.is_empty() {
            self.push(
                Resource::script("firewall/precreate", precreate_script(&fw.precreate_chains)?)
                    .with_delete(precreate_delete_script(&fw.precreate_chains))
                    .depends_on(base_deps.clone()),
                firewall,
            )?;
            base_deps.push("firewall/precreate".to_string());
        }

        let mut sets = HashMap::new();
        for set_config in &fw.ipsets {
            let set = IpSet::from_config(set_config)?;
            // a type change cannot be swapped in, so it replaces the set
            self.push(
                Resource::script(format!("ipset/{}", set.name()), swap::apply_script(&set))
                    .with_delete(swap::destroy_script(&set))
                    .with_triggers(vec![format!("type:{}", set.set_type())])
                    .depends_on(base_deps.clone()),
                firewall,
            )?;
            sets.insert(set.name().to_string(), set);
        }
        let set_deps = self.names_with_prefix("ipset/");

        for spec in &fw.chains {
            for family in IpFamily::ALL {
                let name = chain_resource_name(spec.table, &spec.name, family);
                check_set_matches(&sets, &name, &spec.rules(family)?)?;
                let plan = ChainPlan::build(spec, family)?;
                let deps = spec
                    .depends_on
                    .iter()
                    .map(|dep| chain_resource_name(spec.table, dep, family));
                self.push(
                    Resource::script(name, plan.script())
                        .with_delete(delete_script(spec, family)?)
                        .with_triggers(vec![
                            format!("table:{}", spec.table),
                            format!("already_created:{}", spec.already_created),
                        ])
                        .depends_on(base_deps.clone())
                        .depends_on(set_deps.clone())
                        .depends_on(deps),
                    firewall,
                )?;
            }
        }

        for spec in &fw.rules {
            for family in spec.family.families() {
                let name = format!("rule/{}/{}", spec.name, family);
                check_set_matches(&sets, &name, std::slice::from_ref(&spec.rule))?;
                let mut resource = Resource::script(name, rule_command(spec, family)?);
                if let Some(undo) = rule_command_undo(spec, family)? {
                    resource = resource.with_delete(undo);
                }
                let chain_deps = self.names_with_prefix("chain/").into_iter().filter(|name| {
                    name.ends_with(&format!("/{}", family))
                });
                let resource = resource
                    .depends_on(base_deps.clone())
                    .depends_on(set_deps.clone())
                    .depends_on(chain_deps);
                self.push(resource, firewall)?;
            }
        }

        if fw.persist && !self.resources.is_empty() {
            let connection = &config.connection;
            let members: Vec<&Resource> = self.resources.iter().collect();
            let triggers = members
                .iter()
                .map(|r| format!("{}:{}", r.name, r.input_fingerprint(connection)))
                .collect();
            let deps: Vec<String> = members.iter().map(|r| r.name.clone()).collect();
            self.push(
                Resource::script("firewall/save", persist::save_script())
                    .with_triggers(triggers)
                    .depends_on(deps),
                firewall,
            )?;
        }
        Ok(())
    }

    /// A service's socket proxy subnet is claimed in the declared network containing it.
    fn claim_service_networks(&self) -> Result<()> {
        let mut networks = self
            .config
            .networks
            .iter()
            .map(Network::from_config)
            .collect::<Result<Vec<_>>>()?;
        for service in &self.config.services {
            let Some(socket) = &service.docker_socket else {
                continue;
            };
            let cidr: IpNet = socket.network_cidr.parse().map_err(|_| {
                ProvisionError::invalid_service(
                    &service.name,
                    format!("docker_socket.network_cidr {} is not a CIDR", socket.network_cidr),
                )
            })?;
            let owner = resource_name(&service.name, "socket-proxy");
            match networks.iter_mut().find(|n| n.contains(&cidr.trunc())) {
                Some(network) => network.claim_cidr(cidr, &owner)?,
                None => debug!("{} is outside every declared network", cidr),
            }
        }
        Ok(())
    }

    fn services(&mut self, workdir: &Path) -> Result<()> {
        let config = self.config;
        for service in &config.services {
            let firewall = if service.after_firewall {
                self.registry
                    .claim(FIREWALL_CATEGORY, &resource_name(&service.name, "docker-up"))?
            } else {
                Vec::new()
            };
            let ctx = ServiceContext {
                connection: &config.connection,
                secrets_root: &config.secrets_root,
                workdir,
                firewall,
            };
            for resource in service_resources(service, &ctx)? {
                self.push(resource, &[])?;
            }
        }
        Ok(())
    }
}

/// Topological order that otherwise preserves the input order.
pub fn order(resources: Vec<Resource>) -> Result<Vec<Resource>> {
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<NodeIndex> = (0..resources.len()).map(|i| graph.add_node(i)).collect();
    let index: HashMap<&str, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name.as_str(), i))
        .collect();

    for (i, resource) in resources.iter().enumerate() {
        for dep in &resource.depends_on {
            let Some(&j) = index.get(dep.as_str()) else {
                return Err(ProvisionError::UnknownDependency {
                    resource: resource.name.clone(),
                    dependency: dep.clone(),
                }
                .into());
            };
            graph.add_edge(nodes[j], nodes[i], ());
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        let name = resources[graph[cycle.node_id()]].name.clone();
        return Err(ProvisionError::DependencyCycle(name).into());
    }

    let mut pending: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut sorted = Vec::with_capacity(resources.len());
    while let Some(Reverse(i)) = ready.pop() {
        sorted.push(i);
        for next in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
            let j = graph[next];
            pending[j] -= 1;
            if pending[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    let mut slots: Vec<Option<Resource>> = resources.into_iter().map(Some).collect();
    Ok(sorted
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

impl Plan {
    pub fn build(config: &Config) -> Result<Self> {
        let workdir = tempfile::Builder::new().prefix("hostward-").tempdir()?;
        let mut builder = Builder {
            config,
            registry: Registry::new(),
            resources: Vec::new(),
        };
        builder.claim_service_networks()?;
        builder.firewall()?;
        builder.services(workdir.path())?;

        Ok(Self {
            resources: order(builder.resources)?,
            workdir,
        })
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}
