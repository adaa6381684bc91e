//! Chain reconciliation by insert-then-trim.
//!
//! For a desired rule list `R` of length `M`, the generated script:
//!
//! 1. creates the chain when a list probe reports it missing,
//! 2. inserts `R[i]` at position `i + 1` for every `i`, in order,
//! 3. counts the live rules and deletes position `M + 1` until only `M` remain.
//!
//! After step 2 the first `M` positions hold `R` in order and every rule that was in
//! the chain before sits behind them, so step 3 drains exactly the old generation.
//! No existing rule text is ever read or diffed.
//!
//! The count in step 3 is taken when the script runs. Another writer touching the
//! same chain between steps 2 and 3 is not supported.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::predefined::OnlyEgress;
use super::rule::Rule;
use super::{base_command, conntrack, IpFamily, Table};
use crate::error::ProvisionError;
use crate::shell::{and_all, ProbeThenAct};
use crate::validation::validate_chain_name;

/// A declared rule or a canned rule list expanded in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleItem {
    Predefined(PredefinedRules),
    Rule(Rule),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredefinedRules {
    pub only_egress: OnlyEgress,
}

pub fn expand_rules(items: &[RuleItem]) -> Vec<Rule> {
    items
        .iter()
        .flat_map(|item| match item {
            RuleItem::Rule(rule) => vec![rule.clone()],
            RuleItem::Predefined(p) => p.only_egress.rules(),
        })
        .collect()
}

/// One chain in one table, with independent rule lists per family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSpec {
    pub name: String,
    #[serde(default)]
    pub table: Table,
    /// Chain owned by the kernel or another tool (e.g. `DOCKER-USER`): flushed on
    /// delete instead of destroyed
    #[serde(default)]
    pub already_created: bool,
    /// Rewrite destination matches into conntrack original-destination matches
    #[serde(default)]
    pub conntrack_rewrite: bool,
    #[serde(default)]
    pub rules_v4: Vec<RuleItem>,
    #[serde(default)]
    pub rules_v6: Vec<RuleItem>,
    /// Other chains (by name) that must be reconciled first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ChainSpec {
    pub fn rules(&self, family: IpFamily) -> Result<Vec<Rule>> {
        let items = match family {
            IpFamily::V4 => &self.rules_v4,
            IpFamily::V6 => &self.rules_v6,
        };
        let rules = expand_rules(items);
        if self.conntrack_rewrite {
            rules
                .iter()
                .map(conntrack::rewrite_original_destination)
                .collect()
        } else {
            Ok(rules)
        }
    }
}

/// One step of a chain reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOp {
    /// `-I <chain> <position> <rulespec>` (1-indexed)
    Insert { position: usize, rulespec: String },
    /// Delete `position` repeatedly until the chain holds `position - 1` rules
    TrimFrom { position: usize },
}

/// The reconciliation of one chain for one family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPlan {
    family: IpFamily,
    table: Table,
    name: String,
    ops: Vec<ChainOp>,
}

impl ChainPlan {
    pub fn build(spec: &ChainSpec, family: IpFamily) -> Result<Self> {
        if spec.name.is_empty() {
            return Err(ProvisionError::invalid_rule("chain name must not be empty").into());
        }
        validate_chain_name(&spec.name)?;

        let rules = spec.rules(family)?;
        let mut ops = Vec::with_capacity(rules.len() + 1);
        for (idx, rule) in rules.iter().enumerate() {
            ops.push(ChainOp::Insert {
                position: idx + 1,
                rulespec: rule.to_rulespec(family)?,
            });
        }
        ops.push(ChainOp::TrimFrom {
            position: rules.len() + 1,
        });

        Ok(Self {
            family,
            table: spec.table,
            name: spec.name.clone(),
            ops,
        })
    }

    pub fn ops(&self) -> &[ChainOp] {
        &self.ops
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    fn base(&self) -> String {
        base_command(self.family, self.table)
    }

    /// `-N` guarded by a `-L` probe.
    pub fn create_script(&self) -> String {
        create_chain_script(self.family, self.table, &self.name)
    }

    /// Inserts then trim.
    pub fn replace_script(&self) -> String {
        let base = self.base();
        let name = &self.name;
        let steps = self.ops.iter().map(|op| match op {
            ChainOp::Insert { position, rulespec } => {
                if rulespec.is_empty() {
                    format!("{base} -I {name} {position}")
                } else {
                    format!("{base} -I {name} {position} {rulespec}")
                }
            }
            ChainOp::TrimFrom { position } => format!(
                "for i in $(seq {position} $({base} -n -L {name} --line-numbers | tail -n +3 | wc -l)); do {base} -D {name} {position}; done"
            ),
        });
        and_all(steps)
    }

    /// Full create/update script: ensure the chain exists, then replace its rules.
    pub fn script(&self) -> String {
        and_all([self.create_script(), self.replace_script()])
    }
}

pub fn create_chain_script(family: IpFamily, table: Table, name: &str) -> String {
    let base = base_command(family, table);
    ProbeThenAct::new(format!("{base} -n -L {name}"))
        .when_absent(format!("{base} -N {name}"))
        .render()
}

/// Flush (`already_created`) or flush and destroy.
pub fn delete_script(spec: &ChainSpec, family: IpFamily) -> Result<String> {
    if spec.name.is_empty() {
        return Err(ProvisionError::invalid_rule("chain name must not be empty").into());
    }
    let base = base_command(family, spec.table);
    let name = &spec.name;
    let script = if spec.already_created {
        format!("{base} -F {name}")
    } else {
        ProbeThenAct::new(format!("{base} -n -L {name}"))
            .when_present(format!("{base} -F {name} && {base} -X {name}"))
            .render()
    };
    Ok(script)
}

// =============================================================================
// Chain pre-creation
// =============================================================================

/// Chains created up front in both families so chains may jump to each other
/// regardless of reconciliation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrecreateChain {
    pub name: String,
    #[serde(default)]
    pub table: Table,
}

pub fn precreate_script(chains: &[PrecreateChain]) -> Result<String> {
    let mut steps = Vec::new();
    for chain in chains {
        validate_chain_name(&chain.name)?;
        for family in IpFamily::ALL {
            steps.push(create_chain_script(family, chain.table, &chain.name));
        }
    }
    Ok(and_all(steps))
}

pub fn precreate_delete_script(chains: &[PrecreateChain]) -> String {
    let steps = chains.iter().flat_map(|chain| {
        IpFamily::ALL.into_iter().map(move |family| {
            let base = base_command(family, chain.table);
            ProbeThenAct::new(format!("{base} -n -L {}", chain.name))
                .when_present(format!("{base} -X {}", chain.name))
                .render()
        })
    });
    and_all(steps)
}

// =============================================================================
// Single-rule commands
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOperation {
    #[default]
    Insert,
    Append,
    Delete,
}

impl RuleOperation {
    fn flag(self) -> &'static str {
        match self {
            Self::Insert => "-I",
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilySelector {
    V4,
    V6,
    #[default]
    Both,
}

impl FamilySelector {
    pub fn families(self) -> Vec<IpFamily> {
        match self {
            Self::V4 => vec![IpFamily::V4],
            Self::V6 => vec![IpFamily::V6],
            Self::Both => IpFamily::ALL.to_vec(),
        }
    }
}

/// One rule added to (or removed from) a chain this tool does not own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleCommandSpec {
    /// Resource name
    pub name: String,
    pub chain: String,
    #[serde(default)]
    pub table: Table,
    #[serde(default)]
    pub family: FamilySelector,
    #[serde(default)]
    pub operation: RuleOperation,
    /// Insert position (1-indexed) for `insert`
    #[serde(default)]
    pub position: Option<usize>,
    /// Skip insert/append when an identical rule is already present
    #[serde(default)]
    pub only_if_missing: bool,
    pub rule: Rule,
}

fn check_probe(base: &str, chain: &str, rulespec: &str) -> String {
    format!("{base} -C {chain} {rulespec}")
}

pub fn rule_command(spec: &RuleCommandSpec, family: IpFamily) -> Result<String> {
    validate_chain_name(&spec.chain)?;
    let base = base_command(family, spec.table);
    let rulespec = spec.rule.to_rulespec(family)?;
    let position = match (spec.operation, spec.position) {
        (RuleOperation::Insert, Some(p)) => format!(" {}", p),
        _ => String::new(),
    };
    let command = format!(
        "{base} {} {}{position} {rulespec}",
        spec.operation.flag(),
        spec.chain
    );
    let probe = ProbeThenAct::new(check_probe(&base, &spec.chain, &rulespec));
    let script = match spec.operation {
        RuleOperation::Delete => probe.when_present(command).render(),
        _ if spec.only_if_missing => probe.when_absent(command).render(),
        _ => command,
    };
    Ok(script)
}

/// Undo an insert/append when the resource goes away. Delete rules have no undo.
pub fn rule_command_undo(spec: &RuleCommandSpec, family: IpFamily) -> Result<Option<String>> {
    if spec.operation == RuleOperation::Delete {
        return Ok(None);
    }
    let base = base_command(family, spec.table);
    let rulespec = spec.rule.to_rulespec(family)?;
    Ok(Some(
        ProbeThenAct::new(check_probe(&base, &spec.chain, &rulespec))
            .when_present(format!("{base} -D {} {rulespec}", spec.chain))
            .render(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::rule::{Matches, PortSpec, Protocol};

    fn drop_net() -> Rule {
        Rule {
            matches: Matches {
                source: Some("1.2.3.0/24".into()),
                ..Matches::default()
            },
            ..Rule::jump("DROP")
        }
    }

    fn accept_ssh() -> Rule {
        Rule {
            matches: Matches {
                protocol: Some(Protocol::Tcp),
                destination_ports: Some(PortSpec::Single(22)),
                ..Matches::default()
            },
            ..Rule::jump("ACCEPT")
        }
    }

    fn input_chain(rules: Vec<Rule>) -> ChainSpec {
        ChainSpec {
            name: "INPUT".into(),
            table: Table::Filter,
            already_created: true,
            conntrack_rewrite: false,
            rules_v4: rules.into_iter().map(RuleItem::Rule).collect(),
            rules_v6: vec![],
            depends_on: vec![],
        }
    }

    /// Symbolic chain: applies the ops against an in-memory rule list.
    fn simulate(plan: &ChainPlan, live: &mut Vec<String>) -> usize {
        let mut deleted = 0;
        for op in plan.ops() {
            match op {
                ChainOp::Insert { position, rulespec } => live.insert(position - 1, rulespec.clone()),
                ChainOp::TrimFrom { position } => {
                    while live.len() >= *position {
                        live.remove(position - 1);
                        deleted += 1;
                    }
                }
            }
        }
        deleted
    }

    // =========================================================================
    // Plan construction
    // =========================================================================

    #[test]
    fn test_ops_insert_in_order_then_trim() {
        let plan = ChainPlan::build(&input_chain(vec![drop_net(), accept_ssh()]), IpFamily::V4).unwrap();
        assert_eq!(
            plan.ops(),
            &[
                ChainOp::Insert {
                    position: 1,
                    rulespec: "--source 1.2.3.0/24 --jump DROP".into()
                },
                ChainOp::Insert {
                    position: 2,
                    rulespec: "--protocol tcp --dport 22 --jump ACCEPT".into()
                },
                ChainOp::TrimFrom { position: 3 },
            ]
        );
    }

    #[test]
    fn test_replace_script_text() {
        let plan = ChainPlan::build(&input_chain(vec![drop_net(), accept_ssh()]), IpFamily::V4).unwrap();
        assert_eq!(
            plan.replace_script(),
            "iptables -t filter -w -I INPUT 1 --source 1.2.3.0/24 --jump DROP \
             && iptables -t filter -w -I INPUT 2 --protocol tcp --dport 22 --jump ACCEPT \
             && for i in $(seq 3 $(iptables -t filter -w -n -L INPUT --line-numbers | tail -n +3 | wc -l)); \
             do iptables -t filter -w -D INPUT 3; done"
        );
    }

    #[test]
    fn test_empty_rule_list_only_trims() {
        let plan = ChainPlan::build(&input_chain(vec![]), IpFamily::V6).unwrap();
        let script = plan.replace_script();
        assert!(script.starts_with("for i in $(seq 1 $(ip6tables -t filter -w -n -L INPUT"));
        assert!(!script.contains("&&"));
    }

    #[test]
    fn test_create_script_probes_first() {
        let plan = ChainPlan::build(&input_chain(vec![]), IpFamily::V4).unwrap();
        assert_eq!(
            plan.create_script(),
            "if [ \"$(iptables -t filter -w -n -L INPUT 2> /dev/null || echo 'notset')\" == \"notset\" ]; then iptables -t filter -w -N INPUT; fi"
        );
        assert!(plan.script().starts_with("if [ "));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut chain = input_chain(vec![]);
        chain.name.clear();
        assert!(ChainPlan::build(&chain, IpFamily::V4).is_err());
        assert!(delete_script(&chain, IpFamily::V4).is_err());
    }

    #[test]
    fn test_invalid_rule_fails_whole_plan() {
        let mut bad = accept_ssh();
        bad.matches.protocol = None;
        assert!(ChainPlan::build(&input_chain(vec![drop_net(), bad]), IpFamily::V4).is_err());
    }

    #[test]
    fn test_conntrack_rewrite_applied() {
        let mut chain = input_chain(vec![accept_ssh()]);
        chain.name = "DOCKER-USER".into();
        chain.conntrack_rewrite = true;
        let plan = ChainPlan::build(&chain, IpFamily::V4).unwrap();
        assert!(plan.replace_script().contains("--match conntrack --ctorigdstport 22"));
    }

    // =========================================================================
    // Simulated chain
    // =========================================================================

    #[test]
    fn test_example_scenario_three_to_two() {
        let plan = ChainPlan::build(&input_chain(vec![drop_net(), accept_ssh()]), IpFamily::V4).unwrap();
        let mut live = vec![
            "--protocol tcp --dport 80 --jump ACCEPT".to_string(),
            "--protocol tcp --dport 443 --jump ACCEPT".to_string(),
            "--protocol tcp --dport 22 --jump ACCEPT".to_string(),
        ];
        let deleted = simulate(&plan, &mut live);
        assert_eq!(deleted, 3);
        assert_eq!(
            live,
            vec![
                "--source 1.2.3.0/24 --jump DROP".to_string(),
                "--protocol tcp --dport 22 --jump ACCEPT".to_string(),
            ]
        );
    }

    #[test]
    fn test_reapply_converges() {
        let plan = ChainPlan::build(&input_chain(vec![drop_net(), accept_ssh()]), IpFamily::V4).unwrap();
        let mut live = Vec::new();
        assert_eq!(simulate(&plan, &mut live), 0);
        let first = live.clone();
        simulate(&plan, &mut live);
        assert_eq!(live, first);
    }

    // =========================================================================
    // Delete and pre-create
    // =========================================================================

    #[test]
    fn test_delete_already_created_flushes() {
        let chain = input_chain(vec![]);
        assert_eq!(
            delete_script(&chain, IpFamily::V4).unwrap(),
            "iptables -t filter -w -F INPUT"
        );
    }

    #[test]
    fn test_delete_owned_chain_destroys() {
        let mut chain = input_chain(vec![]);
        chain.name = "HOSTWARD-IN".into();
        chain.already_created = false;
        let script = delete_script(&chain, IpFamily::V6).unwrap();
        assert!(script.contains("ip6tables -t filter -w -F HOSTWARD-IN && ip6tables -t filter -w -X HOSTWARD-IN"));
        assert!(script.contains("!= \"notset\""));
    }

    #[test]
    fn test_precreate_both_families() {
        let chains = vec![PrecreateChain {
            name: "HOSTWARD-FWD".into(),
            table: Table::Filter,
        }];
        let script = precreate_script(&chains).unwrap();
        assert!(script.contains("iptables -t filter -w -N HOSTWARD-FWD"));
        assert!(script.contains("ip6tables -t filter -w -N HOSTWARD-FWD"));
        let delete = precreate_delete_script(&chains);
        assert!(delete.contains("iptables -t filter -w -X HOSTWARD-FWD"));
        assert!(delete.contains("ip6tables -t filter -w -X HOSTWARD-FWD"));
    }

    // =========================================================================
    // Single-rule commands
    // =========================================================================

    fn jump_spec(operation: RuleOperation, only_if_missing: bool) -> RuleCommandSpec {
        RuleCommandSpec {
            name: "forward-to-hostward".into(),
            chain: "FORWARD".into(),
            table: Table::Filter,
            family: FamilySelector::Both,
            operation,
            position: Some(1),
            only_if_missing,
            rule: Rule::jump("HOSTWARD-FWD"),
        }
    }

    #[test]
    fn test_rule_command_plain_insert() {
        let cmd = rule_command(&jump_spec(RuleOperation::Insert, false), IpFamily::V4).unwrap();
        assert_eq!(cmd, "iptables -t filter -w -I FORWARD 1 --jump HOSTWARD-FWD");
    }

    #[test]
    fn test_rule_command_only_if_missing() {
        let cmd = rule_command(&jump_spec(RuleOperation::Append, true), IpFamily::V4).unwrap();
        assert_eq!(
            cmd,
            "if [ \"$(iptables -t filter -w -C FORWARD --jump HOSTWARD-FWD 2> /dev/null || echo 'notset')\" == \"notset\" ]; then iptables -t filter -w -A FORWARD --jump HOSTWARD-FWD; fi"
        );
    }

    #[test]
    fn test_rule_command_delete_guarded() {
        let cmd = rule_command(&jump_spec(RuleOperation::Delete, false), IpFamily::V6).unwrap();
        assert!(cmd.contains("!= \"notset\" ]; then ip6tables -t filter -w -D FORWARD --jump HOSTWARD-FWD; fi"));
        assert!(rule_command_undo(&jump_spec(RuleOperation::Delete, false), IpFamily::V6)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rule_command_undo_for_insert() {
        let undo = rule_command_undo(&jump_spec(RuleOperation::Insert, false), IpFamily::V4)
            .unwrap()
            .unwrap();
        assert!(undo.contains("iptables -t filter -w -D FORWARD --jump HOSTWARD-FWD"));
    }
}
