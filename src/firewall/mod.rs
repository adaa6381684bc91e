//! iptables/ip6tables and ipset script generation.
//!
//! Nothing in here talks to a host. Every function turns declarative firewall state
//! into shell text that the remote layer executes.

pub mod chain;
pub mod conntrack;
pub mod ipset;
pub mod persist;
pub mod predefined;
pub mod rule;
pub mod swap;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use chain::{ChainOp, ChainPlan, ChainSpec};
pub use ipset::{IpSet, SetType};
pub use rule::{PortSpec, Protocol, Rule};

/// Address family. Each family gets its own, fully independent command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub const ALL: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];

    pub fn binary(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    #[default]
    Filter,
    Nat,
    Mangle,
    Raw,
    Security,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
            Self::Mangle => "mangle",
            Self::Raw => "raw",
            Self::Security => "security",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `iptables -t <table> -w` for the given family. `-w` waits for the xtables lock.
pub fn base_command(family: IpFamily, table: Table) -> String {
    format!("{} -t {} -w", family.binary(), table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_command() {
        assert_eq!(base_command(IpFamily::V4, Table::Filter), "iptables -t filter -w");
        assert_eq!(base_command(IpFamily::V6, Table::Nat), "ip6tables -t nat -w");
    }

    #[test]
    fn test_table_deserialize() {
        let table: Table = serde_yaml::from_str("mangle").unwrap();
        assert_eq!(table, Table::Mangle);
        assert_eq!(Table::default(), Table::Filter);
    }
}
