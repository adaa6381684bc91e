//! Canned rule lists.

use serde::{Deserialize, Serialize};

use super::rule::{Matches, PortSpec, Protocol, Rule};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExceptionPort {
    pub protocols: Vec<Protocol>,
    pub port: u16,
}

/// Allow only connections initiated from this host on `interface`, plus inbound
/// connections to the exception ports (SSH for example).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnlyEgress {
    pub interface: String,
    #[serde(default)]
    pub exception_ports: Vec<ExceptionPort>,
}

impl OnlyEgress {
    pub fn rules(&self) -> Vec<Rule> {
        let on_interface = || Matches {
            in_interface: Some(self.interface.clone()),
            ..Matches::default()
        };

        let mut rules: Vec<Rule> = self
            .exception_ports
            .iter()
            .flat_map(|exception| {
                exception.protocols.iter().map(move |protocol| (*protocol, exception.port))
            })
            .map(|(protocol, port)| Rule {
                matches: Matches {
                    protocol: Some(protocol),
                    destination_ports: Some(PortSpec::Single(port)),
                    ..on_interface()
                },
                ..Rule::jump("ACCEPT")
            })
            .collect();

        rules.push(
            Rule {
                matches: on_interface(),
                ..Rule::jump("ACCEPT")
            }
            .with_module("conntrack", "--ctstate ESTABLISHED,RELATED"),
        );
        rules.push(Rule {
            matches: on_interface(),
            ..Rule::jump("DROP")
        });
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::IpFamily;

    #[test]
    fn test_only_egress_order() {
        let preset = OnlyEgress {
            interface: "eth0".into(),
            exception_ports: vec![ExceptionPort {
                protocols: vec![Protocol::Tcp, Protocol::Udp],
                port: 22,
            }],
        };
        let specs: Vec<String> = preset
            .rules()
            .iter()
            .map(|r| r.to_rulespec(IpFamily::V4).unwrap())
            .collect();
        assert_eq!(
            specs,
            vec![
                "--in-interface eth0 --protocol tcp --dport 22 --jump ACCEPT",
                "--in-interface eth0 --protocol udp --dport 22 --jump ACCEPT",
                "--in-interface eth0 --match conntrack --ctstate ESTABLISHED,RELATED --jump ACCEPT",
                "--in-interface eth0 --jump DROP",
            ]
        );
    }

    #[test]
    fn test_only_egress_from_yaml() {
        let preset: OnlyEgress = serde_yaml::from_str(
            "interface: ens3\nexception_ports:\n  - protocols: [tcp]\n    port: 2222\n",
        )
        .unwrap();
        assert_eq!(preset.rules().len(), 3);
    }
}
