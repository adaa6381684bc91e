//! Rewrite destination matches into conntrack "original destination" matches.
//!
//! Chains that see traffic after DNAT (`DOCKER-USER` for example) observe the
//! translated address and port. Filtering on what the client actually dialed needs
//! `--ctorigdst` / `--ctorigdstport` from the conntrack module instead.

use anyhow::Result;

use super::rule::Rule;
use crate::error::ProvisionError;

const CONNTRACK: &str = "conntrack";
const CT_ORIG_DST: &str = "--ctorigdst";
const CT_ORIG_DST_PORT: &str = "--ctorigdstport";

/// Append `flag value` (negated when requested) to the rule's conntrack module args.
fn append_conntrack(rule: &mut Rule, flag: &str, value: String, negated: bool) -> Result<()> {
    let addition = if negated {
        format!("! {} {}", flag, value)
    } else {
        format!("{} {}", flag, value)
    };
    let args = match rule.matching_module.get(CONNTRACK) {
        Some(existing) if !existing.trim().is_empty() => format!("{} {}", existing.trim(), addition),
        _ => addition,
    };

    let occurrences = args.split_whitespace().filter(|t| *t == flag).count();
    if occurrences > 1 {
        return Err(ProvisionError::ConntrackConflict {
            flag: flag.to_string(),
            args,
        }
        .into());
    }

    rule.matching_module.insert(CONNTRACK.to_string(), args);
    Ok(())
}

/// Move `destination_ports` (positive or negated) to `--ctorigdstport`.
pub fn rewrite_destination_ports(rule: &Rule) -> Result<Rule> {
    let mut out = rule.clone();
    if let Some(port) = out.matches.destination_ports.take() {
        append_conntrack(&mut out, CT_ORIG_DST_PORT, port.to_string(), false)?;
    }
    if let Some(port) = out.not.destination_ports.take() {
        append_conntrack(&mut out, CT_ORIG_DST_PORT, port.to_string(), true)?;
    }
    Ok(out)
}

/// Move `destination` (positive or negated) to `--ctorigdst`.
pub fn rewrite_destination(rule: &Rule) -> Result<Rule> {
    let mut out = rule.clone();
    if let Some(dst) = out.matches.destination.take() {
        append_conntrack(&mut out, CT_ORIG_DST, dst, false)?;
    }
    if let Some(dst) = out.not.destination.take() {
        append_conntrack(&mut out, CT_ORIG_DST, dst, true)?;
    }
    Ok(out)
}

/// Address rewrite followed by the port rewrite.
pub fn rewrite_original_destination(rule: &Rule) -> Result<Rule> {
    rewrite_destination_ports(&rewrite_destination(rule)?)
}
