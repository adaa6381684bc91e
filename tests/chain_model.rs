//! Chain reconciliation against a simulated iptables chain.
//!
//! The simulated chain only knows `-I <pos>` and `-D <pos>`, which is all the
//! reconciliation emits. Whatever the chain held before, the result must be exactly
//! the declared rules, and the declared prefix must be in place after every insert.

use hostward::firewall::chain::{ChainOp, ChainPlan, ChainSpec, RuleItem};
use hostward::firewall::{IpFamily, Rule, Table};
use proptest::prelude::*;

fn apply(chain: &mut Vec<String>, op: &ChainOp) {
    match op {
        ChainOp::Insert { position, rulespec } => chain.insert(position - 1, rulespec.clone()),
        ChainOp::TrimFrom { position } => {
            while chain.len() >= *position {
                chain.remove(position - 1);
            }
        }
    }
}

fn spec(targets: &[String]) -> ChainSpec {
    ChainSpec {
        name: "HOSTWARD-TEST".into(),
        table: Table::Filter,
        already_created: false,
        conntrack_rewrite: false,
        rules_v4: targets.iter().map(|t| RuleItem::Rule(Rule::jump(t.clone()))).collect(),
        rules_v6: Vec::new(),
        depends_on: Vec::new(),
    }
}

proptest! {
    #[test]
    fn test_reconciled_chain_matches_declaration(
        existing in prop::collection::vec("--jump [A-Z]{1,6}", 0..12),
        targets in prop::collection::vec("[A-Z]{1,6}", 0..12),
    ) {
        let plan = ChainPlan::build(&spec(&targets), IpFamily::V4).unwrap();
        let expected: Vec<String> = targets.iter().map(|t| format!("--jump {}", t)).collect();

        let mut chain = existing.clone();
        let mut inserted = 0;
        for op in plan.ops() {
            apply(&mut chain, op);
            if matches!(op, ChainOp::Insert { .. }) {
                inserted += 1;
                prop_assert_eq!(&chain[..inserted], &expected[..inserted]);
                prop_assert_eq!(chain.len(), existing.len() + inserted);
            }
        }
        prop_assert_eq!(chain, expected);
    }

    #[test]
    fn test_reconciliation_is_idempotent(
        targets in prop::collection::vec("[A-Z]{1,6}", 0..12),
    ) {
        let plan = ChainPlan::build(&spec(&targets), IpFamily::V4).unwrap();
        let mut chain = Vec::new();
        for op in plan.ops() {
            apply(&mut chain, op);
        }
        let first = chain.clone();
        for op in plan.ops() {
            apply(&mut chain, op);
        }
        prop_assert_eq!(chain, first);
    }
}

#[test]
fn test_empty_declaration_flushes_chain() {
    let plan = ChainPlan::build(&spec(&[]), IpFamily::V4).unwrap();
    assert_eq!(plan.ops(), &[ChainOp::TrimFrom { position: 1 }]);

    let mut chain = vec!["--jump DROP".to_string(), "--jump ACCEPT".to_string()];
    for op in plan.ops() {
        apply(&mut chain, op);
    }
    assert!(chain.is_empty());
}

#[test]
fn test_families_are_independent() {
    let mut spec = spec(&["ACCEPT".to_string()]);
    spec.rules_v6 = vec![
        RuleItem::Rule(Rule::jump("DROP")),
        RuleItem::Rule(Rule::jump("RETURN")),
    ];
    let v4 = ChainPlan::build(&spec, IpFamily::V4).unwrap();
    let v6 = ChainPlan::build(&spec, IpFamily::V6).unwrap();
    assert_eq!(v4.ops().len(), 2);
    assert_eq!(v6.ops().len(), 3);
    assert!(v6.script().contains("ip6tables -t filter -w -N HOSTWARD-TEST"));
    assert!(!v6.script().contains("iptables "));
}
