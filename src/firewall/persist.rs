//! Persisting firewall state across reboots.

/// Packages providing `iptables`, `ipset` and their boot-time restore units.
pub const PACKAGES: &[&str] = &[
    "ipset",
    "iptables",
    "ipset-persistent",
    "iptables-persistent",
];

pub fn install_script() -> String {
    format!(
        "export DEBIAN_FRONTEND=noninteractive && apt-get update && apt-get install -y {}",
        PACKAGES.join(" ")
    )
}

/// Save the live rules and sets so they are restored at boot.
pub fn save_script() -> String {
    "netfilter-persistent save".to_string()
}
