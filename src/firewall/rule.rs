//! Structured iptables rules and their canonical rulespec text.
//!
//! A [`Rule`] serializes fields in a fixed order regardless of how it was declared:
//!
//! ```text
//! source, destination, in-interface, out-interface, fragment,
//! protocol, sport, dport, match modules, jump/goto, set-counters
//! ```
//!
//! Positive and negated (`! --flag`) forms of a field are emitted together, so the
//! protocol flag always lands directly before the first port flag.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ipset::{match_set_args, SetFlag};
use super::IpFamily;
use crate::error::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Udplite,
    Icmp,
    Icmpv6,
    Esp,
    Ah,
    Sctp,
    Mh,
    All,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Udplite => "udplite",
            Self::Icmp => "icmp",
            Self::Icmpv6 => "icmpv6",
            Self::Esp => "esp",
            Self::Ah => "ah",
            Self::Sctp => "sctp",
            Self::Mh => "mh",
            Self::All => "all",
        }
    }

    /// Whether `--sport`/`--dport` are understood for this protocol.
    pub fn supports_ports(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp | Self::Udplite | Self::Sctp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single port or an inclusive `[low, high]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

impl PortSpec {
    fn validate(&self) -> Result<()> {
        if let Self::Range(low, high) = self {
            if low > high {
                return Err(ProvisionError::invalid_rule(format!(
                    "port range {}:{} has low > high",
                    low, high
                ))
                .into());
            }
        }
        Ok(())
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(p) => write!(f, "{}", p),
            Self::Range(low, high) => write!(f, "{}:{}", low, high),
        }
    }
}

/// Match predicates. Used both for the positive set and the negated (`not`) set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Matches {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    /// IPv4 only: match second and further fragments
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fragment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ports: Option<PortSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_ports: Option<PortSpec>,
}

impl Matches {
    fn has_ports(&self) -> bool {
        self.source_ports.is_some() || self.destination_ports.is_some()
    }
}

/// Reference to a declared ipset, rendered through the `set` match module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetMatch {
    pub name: String,
    pub flags: Vec<SetFlag>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

/// The widest set types (`hash:ip,port,ip` and friends) have three dimensions.
const MAX_SET_DIMENSIONS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Rule {
    #[serde(rename = "match", skip_serializing_if = "is_empty_matches")]
    pub matches: Matches,
    #[serde(skip_serializing_if = "is_empty_matches")]
    pub not: Matches,
    /// `--match <name> <args>` extensions, emitted in name order
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub matching_module: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_set: Option<SetMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jump: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_counters: Option<Counters>,
}

fn is_empty_matches(m: &Matches) -> bool {
    *m == Matches::default()
}

impl Rule {
    pub fn jump(target: impl Into<String>) -> Self {
        Self {
            jump: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn with_module(mut self, name: impl Into<String>, args: impl Into<String>) -> Self {
        self.matching_module.insert(name.into(), args.into());
        self
    }

    fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    /// Reject rules iptables would refuse at apply time.
    pub fn validate(&self, family: IpFamily) -> Result<()> {
        let (pos, neg) = (&self.matches, &self.not);

        let pairs = [
            ("source", pos.source.is_some(), neg.source.is_some()),
            ("destination", pos.destination.is_some(), neg.destination.is_some()),
            ("in_interface", pos.in_interface.is_some(), neg.in_interface.is_some()),
            ("out_interface", pos.out_interface.is_some(), neg.out_interface.is_some()),
            ("fragment", pos.fragment, neg.fragment),
            ("protocol", pos.protocol.is_some(), neg.protocol.is_some()),
            ("source_ports", pos.source_ports.is_some(), neg.source_ports.is_some()),
            (
                "destination_ports",
                pos.destination_ports.is_some(),
                neg.destination_ports.is_some(),
            ),
        ];
        for (field, positive, negated) in pairs {
            if positive && negated {
                return Err(ProvisionError::invalid_rule(format!(
                    "{} is set both positively and negated: {}",
                    field,
                    self.describe()
                ))
                .into());
            }
        }

        if pos.has_ports() || neg.has_ports() {
            if pos.protocol.is_none() && neg.protocol.is_none() {
                let flag = if pos.source_ports.is_some() || neg.source_ports.is_some() {
                    "--sport"
                } else {
                    "--dport"
                };
                return Err(ProvisionError::PortWithoutProtocol {
                    flag: flag.to_string(),
                    rule: self.describe(),
                }
                .into());
            }
            if let Some(protocol) = pos.protocol {
                if !protocol.supports_ports() {
                    return Err(ProvisionError::invalid_rule(format!(
                        "protocol {} does not support port matches: {}",
                        protocol,
                        self.describe()
                    ))
                    .into());
                }
            }
        }

        for port in [
            &pos.source_ports,
            &pos.destination_ports,
            &neg.source_ports,
            &neg.destination_ports,
        ]
        .into_iter()
        .flatten()
        {
            port.validate()?;
        }

        if family == IpFamily::V6 && (pos.fragment || neg.fragment) {
            return Err(ProvisionError::invalid_rule(format!(
                "--fragment is IPv4 only: {}",
                self.describe()
            ))
            .into());
        }

        if self.jump.is_some() && self.goto.is_some() {
            return Err(ProvisionError::invalid_rule(format!(
                "jump and goto are mutually exclusive: {}",
                self.describe()
            ))
            .into());
        }

        if let Some(set) = &self.match_set {
            if set.flags.is_empty() || set.flags.len() > MAX_SET_DIMENSIONS {
                return Err(ProvisionError::invalid_rule(format!(
                    "match_set {} needs between 1 and {} src/dst flags: {}",
                    set.name,
                    MAX_SET_DIMENSIONS,
                    self.describe()
                ))
                .into());
            }
        }

        if self.match_set.is_some() && self.matching_module.contains_key("set") {
            return Err(ProvisionError::invalid_rule(format!(
                "match_set and an explicit set module cannot be combined: {}",
                self.describe()
            ))
            .into());
        }

        for name in self.matching_module.keys() {
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(ProvisionError::invalid_rule(format!(
                    "invalid match module name {:?}",
                    name
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Render the rulespec fragment that follows `-I <chain> <pos>`.
    pub fn to_rulespec(&self, family: IpFamily) -> Result<String> {
        self.validate(family)?;

        let mut parts: Vec<String> = Vec::new();
        let mut emit = |negated: bool, flag: &str, value: Option<String>| {
            let prefix = if negated { "! " } else { "" };
            match value {
                Some(v) => parts.push(format!("{}{} {}", prefix, flag, v)),
                None => parts.push(format!("{}{}", prefix, flag)),
            }
        };

        for (negated, m) in [(false, &self.matches), (true, &self.not)] {
            if let Some(v) = &m.source {
                emit(negated, "--source", Some(v.clone()));
            }
        }
        for (negated, m) in [(false, &self.matches), (true, &self.not)] {
            if let Some(v) = &m.destination {
                emit(negated, "--destination", Some(v.clone()));
            }
        }
        for (negated, m) in [(false, &self.matches), (true, &self.not)] {
            if let Some(v) = &m.in_interface {
                emit(negated, "--in-interface", Some(v.clone()));
            }
        }
        for (negated, m) in [(false, &self.matches), (true, &self.not)] {
            if let Some(v) = &m.out_interface {
                emit(negated, "--out-interface", Some(v.clone()));
            }
        }
        for (negated, m) in [(false, &self.matches), (true, &self.not)] {
            if m.fragment {
                emit(negated, "--fragment", None);
            }
        }
        for (negated, m) in [(false, &self.matches), (true, &self.not)] {
            if let Some(p) = m.protocol {
                emit(negated, "--protocol", Some(p.to_string()));
            }
        }
        for (negated, m) in [(false, &self.matches), (true, &self.not)] {
            if let Some(p) = m.source_ports {
                emit(negated, "--sport", Some(p.to_string()));
            }
        }
        for (negated, m) in [(false, &self.matches), (true, &self.not)] {
            if let Some(p) = m.destination_ports {
                emit(negated, "--dport", Some(p.to_string()));
            }
        }

        let mut modules = self.matching_module.clone();
        if let Some(set) = &self.match_set {
            modules.insert(
                "set".to_string(),
                match_set_args(&set.name, &set.flags, set.negate),
            );
        }
        for (name, args) in &modules {
            let args = args.trim();
            if args.is_empty() {
                parts.push(format!("--match {}", name));
            } else {
                parts.push(format!("--match {} {}", name, args));
            }
        }

        if let Some(target) = &self.jump {
            parts.push(format!("--jump {}", target));
        }
        if let Some(target) = &self.goto {
            parts.push(format!("--goto {}", target));
        }
        if let Some(c) = &self.set_counters {
            parts.push(format!("--set-counters {} {}", c.packets, c.bytes));
        }

        Ok(parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_dport(port: u16, target: &str) -> Rule {
        Rule {
            matches: Matches {
                protocol: Some(Protocol::Tcp),
                destination_ports: Some(PortSpec::Single(port)),
                ..Matches::default()
            },
            ..Rule::jump(target)
        }
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    #[test]
    fn test_simple_drop() {
        let rule = Rule {
            matches: Matches {
                source: Some("1.2.3.0/24".into()),
                ..Matches::default()
            },
            ..Rule::jump("DROP")
        };
        assert_eq!(
            rule.to_rulespec(IpFamily::V4).unwrap(),
            "--source 1.2.3.0/24 --jump DROP"
        );
    }

    #[test]
    fn test_protocol_precedes_port() {
        assert_eq!(
            tcp_dport(22, "ACCEPT").to_rulespec(IpFamily::V4).unwrap(),
            "--protocol tcp --dport 22 --jump ACCEPT"
        );
    }

    #[test]
    fn test_yaml_field_order_does_not_matter() {
        let rule: Rule = serde_yaml::from_str(
            "match:\n  destination_ports: [8000, 8080]\n  in_interface: eth0\n  protocol: udp\njump: ACCEPT\n",
        )
        .unwrap();
        assert_eq!(
            rule.to_rulespec(IpFamily::V4).unwrap(),
            "--in-interface eth0 --protocol udp --dport 8000:8080 --jump ACCEPT"
        );
    }

    #[test]
    fn test_negated_fields() {
        let rule = Rule {
            matches: Matches {
                protocol: Some(Protocol::Tcp),
                ..Matches::default()
            },
            not: Matches {
                source: Some("10.0.0.0/8".into()),
                destination_ports: Some(PortSpec::Single(443)),
                ..Matches::default()
            },
            ..Rule::jump("REJECT")
        };
        assert_eq!(
            rule.to_rulespec(IpFamily::V4).unwrap(),
            "! --source 10.0.0.0/8 --protocol tcp ! --dport 443 --jump REJECT"
        );
    }

    #[test]
    fn test_match_modules_and_counters() {
        let rule = Rule {
            set_counters: Some(Counters { packets: 0, bytes: 0 }),
            ..Rule::jump("ACCEPT")
        }
        .with_module("conntrack", "--ctstate ESTABLISHED,RELATED")
        .with_module("comment", "--comment \"keep\"");
        assert_eq!(
            rule.to_rulespec(IpFamily::V6).unwrap(),
            "--match comment --comment \"keep\" --match conntrack --ctstate ESTABLISHED,RELATED --jump ACCEPT --set-counters 0 0"
        );
    }

    #[test]
    fn test_match_set_rendered_as_module() {
        let rule: Rule = serde_yaml::from_str(
            "match_set:\n  name: BLOCK\n  flags: [src]\njump: DROP\n",
        )
        .unwrap();
        assert_eq!(
            rule.to_rulespec(IpFamily::V4).unwrap(),
            "--match set --match-set BLOCK src --jump DROP"
        );

        let clash = rule.with_module("set", "--match-set OTHER dst");
        assert!(clash.validate(IpFamily::V4).is_err());
    }

    #[test]
    fn test_match_set_flag_count_bounded() {
        let empty: Rule = serde_yaml::from_str(
            "match_set: {name: PORTS, flags: []}\njump: DROP\n",
        )
        .unwrap();
        let err = empty.to_rulespec(IpFamily::V4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::InvalidRule(reason)) if reason.contains("match_set PORTS")
        ));

        let wide: Rule = serde_yaml::from_str(
            "match_set: {name: PORTS, flags: [src, dst, src, dst]}\njump: DROP\n",
        )
        .unwrap();
        assert!(wide.validate(IpFamily::V4).is_err());
    }

    #[test]
    fn test_fragment_and_goto() {
        let rule = Rule {
            matches: Matches {
                fragment: true,
                ..Matches::default()
            },
            goto: Some("FRAGS".into()),
            ..Rule::default()
        };
        assert_eq!(
            rule.to_rulespec(IpFamily::V4).unwrap(),
            "--fragment --goto FRAGS"
        );
        assert!(rule.to_rulespec(IpFamily::V6).is_err());
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_port_without_protocol_rejected() {
        let rule = Rule {
            matches: Matches {
                destination_ports: Some(PortSpec::Single(22)),
                ..Matches::default()
            },
            ..Rule::jump("ACCEPT")
        };
        let err = rule.to_rulespec(IpFamily::V4).unwrap_err();
        match err.downcast_ref::<ProvisionError>() {
            Some(ProvisionError::PortWithoutProtocol { flag, .. }) => assert_eq!(flag, "--dport"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_negated_port_without_protocol_rejected() {
        let rule = Rule {
            not: Matches {
                source_ports: Some(PortSpec::Single(53)),
                ..Matches::default()
            },
            ..Rule::jump("DROP")
        };
        assert!(rule.to_rulespec(IpFamily::V4).is_err());
    }

    #[test]
    fn test_port_on_icmp_rejected() {
        let rule = Rule {
            matches: Matches {
                protocol: Some(Protocol::Icmp),
                destination_ports: Some(PortSpec::Single(1)),
                ..Matches::default()
            },
            ..Rule::jump("DROP")
        };
        assert!(rule.validate(IpFamily::V4).is_err());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let rule = Rule {
            matches: Matches {
                protocol: Some(Protocol::Tcp),
                destination_ports: Some(PortSpec::Range(90, 80)),
                ..Matches::default()
            },
            ..Rule::jump("DROP")
        };
        assert!(rule.validate(IpFamily::V4).is_err());
    }

    #[test]
    fn test_positive_and_negated_same_field_rejected() {
        let rule = Rule {
            matches: Matches {
                source: Some("1.1.1.1".into()),
                ..Matches::default()
            },
            not: Matches {
                source: Some("2.2.2.2".into()),
                ..Matches::default()
            },
            ..Rule::jump("DROP")
        };
        assert!(rule.validate(IpFamily::V4).is_err());
    }

    #[test]
    fn test_jump_and_goto_rejected() {
        let rule = Rule {
            goto: Some("B".into()),
            ..Rule::jump("A")
        };
        assert!(rule.validate(IpFamily::V4).is_err());
    }

    #[test]
    fn test_unknown_yaml_field_rejected() {
        let parsed: std::result::Result<Rule, _> =
            serde_yaml::from_str("match:\n  destinaton_ports: 22\njump: ACCEPT\n");
        assert!(parsed.is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn port_strategy() -> impl Strategy<Value = PortSpec> {
        prop_oneof![
            any::<u16>().prop_map(PortSpec::Single),
            (0u16..30000, 0u16..30000).prop_map(|(a, b)| PortSpec::Range(a, a + b)),
        ]
    }

    fn rule_strategy() -> impl Strategy<Value = Rule> {
        (
            prop::option::of(port_strategy()),
            prop::option::of(port_strategy()),
            any::<bool>(),
            any::<bool>(),
            prop::option::of("[a-z]{2,6}[0-9]"),
            prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp), Just(Protocol::Sctp)],
        )
            .prop_filter("at least one port", |(s, d, ..)| s.is_some() || d.is_some())
            .prop_map(|(sport, dport, negate_proto, negate_ports, iface, proto)| {
                let mut rule = Rule::jump("ACCEPT");
                rule.matches.in_interface = iface;
                let proto_side = if negate_proto { &mut rule.not } else { &mut rule.matches };
                proto_side.protocol = Some(proto);
                let port_side = if negate_ports { &mut rule.not } else { &mut rule.matches };
                port_side.source_ports = sport;
                port_side.destination_ports = dport;
                rule
            })
    }

    proptest! {
        /// The protocol flag is always directly followed by the first port flag
        #[test]
        fn prop_protocol_immediately_precedes_port(rule in rule_strategy()) {
            let spec = rule.to_rulespec(IpFamily::V4).unwrap();
            let tokens: Vec<&str> = spec.split_whitespace().collect();
            let proto_idx = tokens.iter().position(|t| *t == "--protocol").unwrap();
            let port_idx = tokens
                .iter()
                .position(|t| *t == "--sport" || *t == "--dport")
                .unwrap();
            let expected = if tokens[proto_idx + 2] == "!" { proto_idx + 3 } else { proto_idx + 2 };
            prop_assert_eq!(port_idx, expected);
        }
    }
}
