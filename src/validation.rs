//! Name, address and duration validation shared by the manifest loader.

use anyhow::{bail, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::ProvisionError;

/// iptables refuses chain names longer than this.
pub const MAX_CHAIN_NAME: usize = 28;

/// ipset names are limited to 31 characters; the shadow copy appends `-NEW`.
pub const MAX_SET_NAME: usize = 31 - 4;

/// Linux `IFNAMSIZ` minus the trailing NUL.
pub const MAX_INTERFACE_NAME: usize = 15;

/// Validate an IP address string and return the parsed IpAddr.
///
/// # Examples
/// ```
/// use hostward::validation::validate_ip;
/// assert!(validate_ip("192.168.1.1").is_ok());
/// assert!(validate_ip("::1").is_ok());
/// assert!(validate_ip("invalid").is_err());
/// ```
pub fn validate_ip(ip_str: &str) -> Result<IpAddr> {
    ip_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid IP address: {}", ip_str))
}

/// Validate an IP address or CIDR string. A bare address becomes a /32 or /128.
///
/// # Examples
/// ```
/// use hostward::validation::validate_ip_or_cidr;
/// assert_eq!(validate_ip_or_cidr("10.0.0.1").unwrap().prefix_len(), 32);
/// assert!(validate_ip_or_cidr("192.168.0.0/24").is_ok());
/// assert!(validate_ip_or_cidr("192.168.0.0/33").is_err());
/// ```
pub fn validate_ip_or_cidr(ip_str: &str) -> Result<IpNet> {
    if ip_str.contains('/') {
        ip_str
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid CIDR: {}", ip_str))
    } else {
        Ok(IpNet::from(validate_ip(ip_str)?))
    }
}

fn check_name(kind: &str, name: &str, max: usize, extra: &str) -> Result<()> {
    if name.is_empty() {
        bail!(ProvisionError::Config(format!("{} name cannot be empty", kind)));
    }
    if name.len() > max {
        bail!(ProvisionError::Config(format!(
            "{} name '{}' is longer than {} characters",
            kind, name, max
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || extra.contains(*c)))
    {
        bail!(ProvisionError::Config(format!(
            "{} name '{}' contains invalid character {:?}",
            kind, name, bad
        )));
    }
    Ok(())
}

pub fn validate_chain_name(name: &str) -> Result<()> {
    check_name("chain", name, MAX_CHAIN_NAME, "")
}

pub fn validate_set_name(name: &str) -> Result<()> {
    check_name("ipset", name, MAX_SET_NAME, "")
}

pub fn validate_interface_name(name: &str) -> Result<()> {
    check_name("interface", name, MAX_INTERFACE_NAME, ".")
}

/// Service and network names end up in paths, compose project names and resource ids.
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    check_name(kind, name, 63, ".")?;
    if name.starts_with('.') || name.starts_with('-') {
        bail!(ProvisionError::Config(format!(
            "{} name '{}' must start with a letter, digit or underscore",
            kind, name
        )));
    }
    Ok(())
}

/// Parse a Go style duration such as `30s`, `1m30s`, `500ms` or `2h`.
///
/// # Examples
/// ```
/// use hostward::validation::parse_duration;
/// use std::time::Duration;
/// assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert!(parse_duration("ten").is_err());
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("Duration cannot be empty");
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| anyhow::anyhow!("Duration '{}' is missing a unit", s))?;
        if digits == 0 {
            bail!("Invalid duration '{}'", s);
        }
        let number = &rest[..digits];
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let nanos_per_unit: u64 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => bail!("Unknown unit '{}' in duration '{}'", unit, s),
        };
        total += match number.parse::<u64>() {
            Ok(whole) => Duration::from_nanos(whole.saturating_mul(nanos_per_unit)),
            Err(_) => {
                let fractional: f64 = number
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid number in duration '{}'", s))?;
                Duration::from_nanos((fractional * nanos_per_unit as f64).round() as u64)
            }
        };
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Addresses
    // =========================================================================

    #[test]
    fn test_validate_ip_v4_and_v6() {
        assert!(validate_ip("192.168.1.1").unwrap().is_ipv4());
        assert!(validate_ip("2001:db8::1").unwrap().is_ipv6());
    }

    #[test]
    fn test_validate_ip_invalid() {
        let err = validate_ip("not-an-ip").unwrap_err();
        assert!(err.to_string().contains("Invalid IP"));
        assert!(validate_ip("").is_err());
    }

    #[test]
    fn test_validate_cidr() {
        let net = validate_ip_or_cidr("10.10.0.0/16").unwrap();
        assert_eq!(net.prefix_len(), 16);
        assert_eq!(validate_ip_or_cidr("::1").unwrap().prefix_len(), 128);
        assert!(validate_ip_or_cidr("10.0.0.0/").is_err());
    }

    // =========================================================================
    // Names
    // =========================================================================

    #[test]
    fn test_chain_name_limits() {
        assert!(validate_chain_name("DOCKER-USER").is_ok());
        assert!(validate_chain_name(&"A".repeat(28)).is_ok());
        assert!(validate_chain_name(&"A".repeat(29)).is_err());
        assert!(validate_chain_name("").is_err());
        assert!(validate_chain_name("HAS SPACE").is_err());
        assert!(validate_chain_name("semi;colon").is_err());
    }

    #[test]
    fn test_set_name_leaves_room_for_shadow() {
        assert!(validate_set_name(&"s".repeat(27)).is_ok());
        assert!(validate_set_name(&"s".repeat(28)).is_err());
    }

    #[test]
    fn test_interface_name() {
        assert!(validate_interface_name("eth0.100").is_ok());
        assert!(validate_interface_name("averyveryverylongname").is_err());
    }

    #[test]
    fn test_identifier() {
        assert!(validate_identifier("service", "web_app-2").is_ok());
        assert!(validate_identifier("service", "-web").is_err());
        assert!(validate_identifier("service", "web/app").is_err());
    }

    // =========================================================================
    // Durations
    // =========================================================================

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_compound() {
        assert_eq!(parse_duration("1h2m3s").unwrap(), Duration::from_secs(3723));
        assert_eq!(parse_duration("1s500ms").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("3d").is_err());
    }
}
