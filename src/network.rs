//! Address bookkeeping for declared LAN/VLAN ranges.
//!
//! Claims are append-only for a run. Two claims may never overlap, whether they are
//! single addresses or sub-ranges.

use anyhow::Result;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::ProvisionError;
use crate::validation::validate_ip_or_cidr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimConfig {
    /// Who holds the claim, for error messages
    pub name: String,
    /// Address or CIDR
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub claims: Vec<ClaimConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Claim {
    range: IpNet,
    owner: String,
}

#[derive(Debug, Clone)]
pub struct Network {
    name: String,
    cidr: IpNet,
    claims: Vec<Claim>,
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

impl Network {
    pub fn new(name: impl Into<String>, cidr: &str) -> Result<Self> {
        let name = name.into();
        let cidr: IpNet = cidr.parse().map_err(|_| {
            ProvisionError::network_claim(&name, format!("invalid CIDR {}", cidr))
        })?;
        Ok(Self {
            name,
            cidr: cidr.trunc(),
            claims: Vec::new(),
        })
    }

    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let mut network = Self::new(config.name.clone(), &config.cidr)?;
        for claim in &config.claims {
            network.claim(&claim.address, &claim.name)?;
        }
        Ok(network)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cidr(&self) -> IpNet {
        self.cidr
    }

    pub fn start_ip(&self) -> IpAddr {
        self.cidr.network()
    }

    pub fn end_ip(&self) -> IpAddr {
        self.cidr.broadcast()
    }

    pub fn contains(&self, range: &IpNet) -> bool {
        self.cidr.contains(range)
    }

    /// Claim an address or CIDR, dispatching on the presence of a prefix.
    pub fn claim(&mut self, address: &str, owner: &str) -> Result<()> {
        let range = validate_ip_or_cidr(address)
            .map_err(|e| ProvisionError::network_claim(&self.name, e.to_string()))?;
        self.claim_range(range, owner)
    }

    pub fn claim_ip(&mut self, ip: IpAddr, owner: &str) -> Result<()> {
        self.claim_range(IpNet::from(ip), owner)
    }

    pub fn claim_cidr(&mut self, cidr: IpNet, owner: &str) -> Result<()> {
        self.claim_range(cidr.trunc(), owner)
    }

    fn claim_range(&mut self, range: IpNet, owner: &str) -> Result<()> {
        if !self.cidr.contains(&range) {
            return Err(ProvisionError::network_claim(
                &self.name,
                format!("{} (claimed by {}) is outside of {}", range, owner, self.cidr),
            )
            .into());
        }
        if let Some(existing) = self.claims.iter().find(|c| overlaps(&c.range, &range)) {
            return Err(ProvisionError::network_claim(
                &self.name,
                format!(
                    "{} (claimed by {}) overlaps {} already claimed by {}",
                    range, owner, existing.range, existing.owner
                ),
            )
            .into());
        }
        self.claims.push(Claim {
            range,
            owner: owner.to_string(),
        });
        Ok(())
    }

    pub fn claimed(&self) -> impl Iterator<Item = (&IpNet, &str)> {
        self.claims.iter().map(|c| (&c.range, c.owner.as_str()))
    }
}
