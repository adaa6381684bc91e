//! ipset types, creation options and typed entries.
//!
//! Each set type accepts a fixed entry shape. [`EntryValue`] has one variant per set
//! type so the shape is checked once, when an entry is built from configuration, and
//! rendering is an exhaustive match with no fallthrough.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProvisionError;
use crate::shell::quote;
use crate::validation::validate_set_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SetType {
    BitmapIp,
    BitmapIpMac,
    BitmapPort,
    HashIp,
    HashMac,
    HashIpMac,
    HashNet,
    HashNetNet,
    HashIpPort,
    HashNetPort,
    HashIpPortIp,
    HashIpPortNet,
    HashIpMark,
    HashNetPortNet,
    HashNetIface,
    ListSet,
}

impl SetType {
    pub const ALL: [SetType; 16] = [
        SetType::BitmapIp,
        SetType::BitmapIpMac,
        SetType::BitmapPort,
        SetType::HashIp,
        SetType::HashMac,
        SetType::HashIpMac,
        SetType::HashNet,
        SetType::HashNetNet,
        SetType::HashIpPort,
        SetType::HashNetPort,
        SetType::HashIpPortIp,
        SetType::HashIpPortNet,
        SetType::HashIpMark,
        SetType::HashNetPortNet,
        SetType::HashNetIface,
        SetType::ListSet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BitmapIp => "bitmap:ip",
            Self::BitmapIpMac => "bitmap:ip,mac",
            Self::BitmapPort => "bitmap:port",
            Self::HashIp => "hash:ip",
            Self::HashMac => "hash:mac",
            Self::HashIpMac => "hash:ip,mac",
            Self::HashNet => "hash:net",
            Self::HashNetNet => "hash:net,net",
            Self::HashIpPort => "hash:ip,port",
            Self::HashNetPort => "hash:net,port",
            Self::HashIpPortIp => "hash:ip,port,ip",
            Self::HashIpPortNet => "hash:ip,port,net",
            Self::HashIpMark => "hash:ip,mark",
            Self::HashNetPortNet => "hash:net,port,net",
            Self::HashNetIface => "hash:net,iface",
            Self::ListSet => "list:set",
        }
    }

    /// Number of comma separated dimensions after the method, e.g. 2 for `hash:ip,port`.
    pub fn num_components(self) -> usize {
        self.as_str()
            .split_once(':')
            .map(|(_, dims)| dims.split(',').count())
            .unwrap_or(1)
    }

    fn is_bitmap(self) -> bool {
        matches!(self, Self::BitmapIp | Self::BitmapIpMac | Self::BitmapPort)
    }

    /// Types whose entries may carry `nomatch`.
    fn has_net(self) -> bool {
        matches!(
            self,
            Self::HashNet
                | Self::HashNetNet
                | Self::HashNetPort
                | Self::HashIpPortNet
                | Self::HashNetPortNet
                | Self::HashNetIface
        )
    }

    fn support(self) -> CreateSupport {
        let hash = CreateSupport {
            family: true,
            hash: true,
            ..CreateSupport::default()
        };
        match self {
            Self::BitmapIp => CreateSupport {
                range: true,
                netmask: true,
                ..CreateSupport::default()
            },
            Self::BitmapIpMac | Self::BitmapPort => CreateSupport {
                range: true,
                ..CreateSupport::default()
            },
            Self::HashIp => CreateSupport {
                netmask: true,
                bitmask: true,
                ..hash
            },
            Self::HashMac => CreateSupport {
                hash: true,
                ..CreateSupport::default()
            },
            Self::HashIpMark => CreateSupport {
                markmask: true,
                ..hash
            },
            Self::HashNetNet => CreateSupport {
                bitmask: true,
                ..hash
            },
            Self::HashIpMac
            | Self::HashNet
            | Self::HashIpPort
            | Self::HashNetPort
            | Self::HashIpPortIp
            | Self::HashIpPortNet
            | Self::HashNetPortNet
            | Self::HashNetIface => hash,
            Self::ListSet => CreateSupport {
                size: true,
                ..CreateSupport::default()
            },
        }
    }
}

impl fmt::Display for SetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SetType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown ipset type: {}", s))
    }
}

impl TryFrom<String> for SetType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SetType> for String {
    fn from(value: SetType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CreateSupport {
    family: bool,
    range: bool,
    netmask: bool,
    bitmask: bool,
    markmask: bool,
    hash: bool,
    size: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetFamily {
    Inet,
    Inet6,
}

/// `ipset create` options. Which ones apply depends on the set type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CreateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<SetFamily>,
    /// Required for bitmap types: `fromip-toip`, `ip/cidr` or `fromport-toport`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitmask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markmask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashsize: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxelem: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucketsize: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub counters: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub comment: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skbinfo: bool,
}

impl CreateOptions {
    fn validate(&self, set: &str, set_type: SetType) -> Result<()> {
        let support = set_type.support();
        let reject = |option: &str| -> Result<()> {
            Err(ProvisionError::invalid_set(
                set,
                format!("{} does not accept the {} create option", set_type, option),
            )
            .into())
        };

        if self.family.is_some() && !support.family {
            return reject("family");
        }
        if self.range.is_some() && !support.range {
            return reject("range");
        }
        if self.netmask.is_some() && !support.netmask {
            return reject("netmask");
        }
        if self.bitmask.is_some() && !support.bitmask {
            return reject("bitmask");
        }
        if self.netmask.is_some() && self.bitmask.is_some() {
            return Err(ProvisionError::invalid_set(set, "netmask and bitmask are mutually exclusive").into());
        }
        if self.markmask.is_some() && !support.markmask {
            return reject("markmask");
        }
        if !support.hash {
            if self.hashsize.is_some() {
                return reject("hashsize");
            }
            if self.maxelem.is_some() {
                return reject("maxelem");
            }
            if self.bucketsize.is_some() {
                return reject("bucketsize");
            }
        }
        if self.size.is_some() && !support.size {
            return reject("size");
        }
        if set_type.is_bitmap() && self.range.is_none() {
            return Err(ProvisionError::invalid_set(
                set,
                format!("{} requires the range create option", set_type),
            )
            .into());
        }
        for token in [&self.range, &self.bitmask, &self.markmask].into_iter().flatten() {
            validate_token(set, token)?;
        }
        Ok(())
    }

    fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(family) = self.family {
            flags.push(format!(
                "family {}",
                match family {
                    SetFamily::Inet => "inet",
                    SetFamily::Inet6 => "inet6",
                }
            ));
        }
        let valued: [(&str, Option<String>); 9] = [
            ("range", self.range.clone()),
            ("netmask", self.netmask.map(|v| v.to_string())),
            ("bitmask", self.bitmask.clone()),
            ("markmask", self.markmask.clone()),
            ("hashsize", self.hashsize.map(|v| v.to_string())),
            ("maxelem", self.maxelem.map(|v| v.to_string())),
            ("bucketsize", self.bucketsize.map(|v| v.to_string())),
            ("size", self.size.map(|v| v.to_string())),
            ("timeout", self.timeout.map(|v| v.to_string())),
        ];
        for (name, value) in valued {
            if let Some(value) = value {
                flags.push(format!("{} {}", name, value));
            }
        }
        for (name, enabled) in [
            ("counters", self.counters),
            ("comment", self.comment),
            ("skbinfo", self.skbinfo),
        ] {
            if enabled {
                flags.push(name.to_string());
            }
        }
        flags
    }
}

/// Per-entry options for `ipset add`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EntryOptions {
    pub timeout: Option<u32>,
    pub packets: Option<u64>,
    pub bytes: Option<u64>,
    pub comment: Option<String>,
    pub skbmark: Option<String>,
    pub skbprio: Option<String>,
    pub skbqueue: Option<u16>,
    pub nomatch: bool,
}

impl EntryOptions {
    fn validate(&self, set: &str, set_type: SetType, create: &CreateOptions) -> Result<()> {
        let missing = |option: &str, needs: &str| -> Result<()> {
            Err(ProvisionError::invalid_set(
                set,
                format!("entry option {} requires the set to be created with {}", option, needs),
            )
            .into())
        };
        if self.timeout.is_some() && create.timeout.is_none() {
            return missing("timeout", "timeout");
        }
        if (self.packets.is_some() || self.bytes.is_some()) && !create.counters {
            return missing("packets/bytes", "counters");
        }
        if self.comment.is_some() && !create.comment {
            return missing("comment", "comment");
        }
        if (self.skbmark.is_some() || self.skbprio.is_some() || self.skbqueue.is_some())
            && !create.skbinfo
        {
            return missing("skbmark/skbprio/skbqueue", "skbinfo");
        }
        if self.nomatch && !set_type.has_net() {
            return Err(ProvisionError::invalid_set(
                set,
                format!("{} entries do not accept nomatch", set_type),
            )
            .into());
        }
        for token in [&self.skbmark, &self.skbprio].into_iter().flatten() {
            validate_token(set, token)?;
        }
        Ok(())
    }

    fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(v) = self.timeout {
            flags.push(format!("timeout {}", v));
        }
        if let Some(v) = self.packets {
            flags.push(format!("packets {}", v));
        }
        if let Some(v) = self.bytes {
            flags.push(format!("bytes {}", v));
        }
        if let Some(v) = &self.comment {
            flags.push(format!("comment {}", quote(v)));
        }
        if let Some(v) = &self.skbmark {
            flags.push(format!("skbmark {}", v));
        }
        if let Some(v) = &self.skbprio {
            flags.push(format!("skbprio {}", v));
        }
        if let Some(v) = self.skbqueue {
            flags.push(format!("skbqueue {}", v));
        }
        if self.nomatch {
            flags.push("nomatch".to_string());
        }
        flags
    }
}

/// Set elements are spliced into shell text unquoted, so restrict them to characters
/// that can appear in addresses, ports, marks and interface names.
fn validate_token(set: &str, token: &str) -> Result<()> {
    let ok = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ":._/-".contains(c));
    if ok {
        Ok(())
    } else {
        Err(ProvisionError::invalid_set(set, format!("invalid element component {:?}", token)).into())
    }
}

/// Port component, optionally prefixed by protocol (`tcp:80`, `udp:1000-2000`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortEntry {
    pub protocol: Option<String>,
    pub port: String,
}

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.protocol {
            Some(p) => write!(f, "{}:{}", p, self.port),
            None => f.write_str(&self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ListPosition {
    Before(String),
    After(String),
}

/// The element of an entry, shaped by the set type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EntryValue {
    BitmapIp { ip: String },
    BitmapIpMac { ip: String, mac: Option<String> },
    BitmapPort { port: PortEntry },
    HashIp { ip: String },
    HashMac { mac: String },
    HashIpMac { ip: String, mac: String },
    HashNet { netaddr: String },
    HashNetNet { netaddr: String, netaddr2: String },
    HashIpPort { ip: String, port: PortEntry },
    HashNetPort { netaddr: String, port: PortEntry },
    HashIpPortIp { ip: String, port: PortEntry, second_ip: String },
    HashIpPortNet { ip: String, port: PortEntry, netaddr: String },
    HashIpMark { ip: String, mark: String },
    HashNetPortNet { netaddr: String, port: PortEntry, netaddr2: String },
    HashNetIface { netaddr: String, iface: String, physdev: bool },
    ListSet { setname: String, position: Option<ListPosition> },
}

impl EntryValue {
    pub fn set_type(&self) -> SetType {
        match self {
            Self::BitmapIp { .. } => SetType::BitmapIp,
            Self::BitmapIpMac { .. } => SetType::BitmapIpMac,
            Self::BitmapPort { .. } => SetType::BitmapPort,
            Self::HashIp { .. } => SetType::HashIp,
            Self::HashMac { .. } => SetType::HashMac,
            Self::HashIpMac { .. } => SetType::HashIpMac,
            Self::HashNet { .. } => SetType::HashNet,
            Self::HashNetNet { .. } => SetType::HashNetNet,
            Self::HashIpPort { .. } => SetType::HashIpPort,
            Self::HashNetPort { .. } => SetType::HashNetPort,
            Self::HashIpPortIp { .. } => SetType::HashIpPortIp,
            Self::HashIpPortNet { .. } => SetType::HashIpPortNet,
            Self::HashIpMark { .. } => SetType::HashIpMark,
            Self::HashNetPortNet { .. } => SetType::HashNetPortNet,
            Self::HashNetIface { .. } => SetType::HashNetIface,
            Self::ListSet { .. } => SetType::ListSet,
        }
    }

    /// The element as passed to `ipset add`.
    pub fn render(&self) -> String {
        match self {
            Self::BitmapIp { ip } | Self::HashIp { ip } => ip.clone(),
            Self::BitmapIpMac { ip, mac } => match mac {
                Some(mac) => format!("{},{}", ip, mac),
                None => ip.clone(),
            },
            Self::BitmapPort { port } => port.to_string(),
            Self::HashMac { mac } => mac.clone(),
            Self::HashIpMac { ip, mac } => format!("{},{}", ip, mac),
            Self::HashNet { netaddr } => netaddr.clone(),
            Self::HashNetNet { netaddr, netaddr2 } => format!("{},{}", netaddr, netaddr2),
            Self::HashIpPort { ip, port } => format!("{},{}", ip, port),
            Self::HashNetPort { netaddr, port } => format!("{},{}", netaddr, port),
            Self::HashIpPortIp { ip, port, second_ip } => format!("{},{},{}", ip, port, second_ip),
            Self::HashIpPortNet { ip, port, netaddr } => format!("{},{},{}", ip, port, netaddr),
            Self::HashIpMark { ip, mark } => format!("{},{}", ip, mark),
            Self::HashNetPortNet {
                netaddr,
                port,
                netaddr2,
            } => format!("{},{},{}", netaddr, port, netaddr2),
            Self::HashNetIface {
                netaddr,
                iface,
                physdev,
            } => {
                if *physdev {
                    format!("{},physdev:{}", netaddr, iface)
                } else {
                    format!("{},{}", netaddr, iface)
                }
            }
            Self::ListSet { setname, position } => match position {
                Some(ListPosition::Before(other)) => format!("{} before {}", setname, other),
                Some(ListPosition::After(other)) => format!("{} after {}", setname, other),
                None => setname.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub value: EntryValue,
    pub options: EntryOptions,
}

impl Entry {
    pub fn new(value: EntryValue) -> Self {
        Self {
            value,
            options: EntryOptions::default(),
        }
    }

    fn render(&self) -> String {
        let mut parts = vec![self.value.render()];
        parts.extend(self.options.flags());
        parts.join(" ")
    }
}

// =============================================================================
// Configuration form
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// An entry as written in the manifest: either the bare element for single-component
/// types, or a mapping of named components plus entry options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryConfig {
    Short(String),
    Full(EntryFields),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EntryFields {
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub protocol: Option<String>,
    pub port: Option<PortValue>,
    pub netaddr: Option<String>,
    pub netaddr2: Option<String>,
    pub second_ip: Option<String>,
    pub mark: Option<String>,
    pub iface: Option<String>,
    pub physdev: bool,
    pub setname: Option<String>,
    pub before: Option<String>,
    pub after: Option<String>,

    pub timeout: Option<u32>,
    pub packets: Option<u64>,
    pub bytes: Option<u64>,
    pub comment: Option<String>,
    pub skbmark: Option<String>,
    pub skbprio: Option<String>,
    pub skbqueue: Option<u16>,
    pub nomatch: bool,
}

impl EntryFields {
    fn provided(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let checks = [
            ("ip", self.ip.is_some()),
            ("mac", self.mac.is_some()),
            ("protocol", self.protocol.is_some()),
            ("port", self.port.is_some()),
            ("netaddr", self.netaddr.is_some()),
            ("netaddr2", self.netaddr2.is_some()),
            ("second_ip", self.second_ip.is_some()),
            ("mark", self.mark.is_some()),
            ("iface", self.iface.is_some()),
            ("physdev", self.physdev),
            ("setname", self.setname.is_some()),
            ("before", self.before.is_some()),
            ("after", self.after.is_some()),
        ];
        for (name, set) in checks {
            if set {
                names.push(name);
            }
        }
        names
    }

    fn options(&self) -> EntryOptions {
        EntryOptions {
            timeout: self.timeout,
            packets: self.packets,
            bytes: self.bytes,
            comment: self.comment.clone(),
            skbmark: self.skbmark.clone(),
            skbprio: self.skbprio.clone(),
            skbqueue: self.skbqueue,
            nomatch: self.nomatch,
        }
    }
}

fn allowed_fields(set_type: SetType) -> &'static [&'static str] {
    match set_type {
        SetType::BitmapIp | SetType::HashIp => &["ip"],
        SetType::BitmapIpMac | SetType::HashIpMac => &["ip", "mac"],
        SetType::BitmapPort => &["protocol", "port"],
        SetType::HashMac => &["mac"],
        SetType::HashNet => &["netaddr"],
        SetType::HashNetNet => &["netaddr", "netaddr2"],
        SetType::HashIpPort => &["ip", "protocol", "port"],
        SetType::HashNetPort => &["netaddr", "protocol", "port"],
        SetType::HashIpPortIp => &["ip", "protocol", "port", "second_ip"],
        SetType::HashIpPortNet => &["ip", "protocol", "port", "netaddr"],
        SetType::HashIpMark => &["ip", "mark"],
        SetType::HashNetPortNet => &["netaddr", "protocol", "port", "netaddr2"],
        SetType::HashNetIface => &["netaddr", "iface", "physdev"],
        SetType::ListSet => &["setname", "before", "after"],
    }
}

impl EntryConfig {
    /// Build a typed entry for a set of `set_type`.
    pub fn to_entry(&self, set: &str, set_type: SetType) -> Result<Entry> {
        let fields = match self {
            EntryConfig::Full(fields) => fields.clone(),
            EntryConfig::Short(value) => {
                let mut fields = EntryFields::default();
                match set_type {
                    SetType::BitmapIp | SetType::HashIp => fields.ip = Some(value.clone()),
                    SetType::HashMac => fields.mac = Some(value.clone()),
                    SetType::HashNet => fields.netaddr = Some(value.clone()),
                    SetType::BitmapPort => fields.port = Some(PortValue::Text(value.clone())),
                    SetType::ListSet => fields.setname = Some(value.clone()),
                    other => {
                        return Err(ProvisionError::invalid_set(
                            set,
                            format!(
                                "{} entries need a mapping of components, got {:?}",
                                other, value
                            ),
                        )
                        .into())
                    }
                }
                fields
            }
        };

        let allowed = allowed_fields(set_type);
        if let Some(extra) = fields.provided().into_iter().find(|f| !allowed.contains(f)) {
            return Err(ProvisionError::invalid_set(
                set,
                format!("{} entries do not have a {} component", set_type, extra),
            )
            .into());
        }

        let need = |value: &Option<String>, name: &str| -> Result<String> {
            let value = value.clone().ok_or_else(|| {
                ProvisionError::invalid_set(
                    set,
                    format!("{} entries require the {} component", set_type, name),
                )
            })?;
            validate_token(set, &value)?;
            Ok(value)
        };
        let port = || -> Result<PortEntry> {
            let port = fields.port.as_ref().ok_or_else(|| {
                ProvisionError::invalid_set(set, format!("{} entries require a port", set_type))
            })?;
            let port = port.to_string();
            validate_token(set, &port)?;
            if let Some(protocol) = &fields.protocol {
                validate_token(set, protocol)?;
            }
            Ok(PortEntry {
                protocol: fields.protocol.clone(),
                port,
            })
        };

        let value = match set_type {
            SetType::BitmapIp => EntryValue::BitmapIp {
                ip: need(&fields.ip, "ip")?,
            },
            SetType::BitmapIpMac => EntryValue::BitmapIpMac {
                ip: need(&fields.ip, "ip")?,
                mac: match &fields.mac {
                    Some(_) => Some(need(&fields.mac, "mac")?),
                    None => None,
                },
            },
            SetType::BitmapPort => EntryValue::BitmapPort { port: port()? },
            SetType::HashIp => EntryValue::HashIp {
                ip: need(&fields.ip, "ip")?,
            },
            SetType::HashMac => EntryValue::HashMac {
                mac: need(&fields.mac, "mac")?,
            },
            SetType::HashIpMac => EntryValue::HashIpMac {
                ip: need(&fields.ip, "ip")?,
                mac: need(&fields.mac, "mac")?,
            },
            SetType::HashNet => EntryValue::HashNet {
                netaddr: need(&fields.netaddr, "netaddr")?,
            },
            SetType::HashNetNet => EntryValue::HashNetNet {
                netaddr: need(&fields.netaddr, "netaddr")?,
                netaddr2: need(&fields.netaddr2, "netaddr2")?,
            },
            SetType::HashIpPort => EntryValue::HashIpPort {
                ip: need(&fields.ip, "ip")?,
                port: port()?,
            },
            SetType::HashNetPort => EntryValue::HashNetPort {
                netaddr: need(&fields.netaddr, "netaddr")?,
                port: port()?,
            },
            SetType::HashIpPortIp => EntryValue::HashIpPortIp {
                ip: need(&fields.ip, "ip")?,
                port: port()?,
                second_ip: need(&fields.second_ip, "second_ip")?,
            },
            SetType::HashIpPortNet => EntryValue::HashIpPortNet {
                ip: need(&fields.ip, "ip")?,
                port: port()?,
                netaddr: need(&fields.netaddr, "netaddr")?,
            },
            SetType::HashIpMark => EntryValue::HashIpMark {
                ip: need(&fields.ip, "ip")?,
                mark: need(&fields.mark, "mark")?,
            },
            SetType::HashNetPortNet => EntryValue::HashNetPortNet {
                netaddr: need(&fields.netaddr, "netaddr")?,
                port: port()?,
                netaddr2: need(&fields.netaddr2, "netaddr2")?,
            },
            SetType::HashNetIface => EntryValue::HashNetIface {
                netaddr: need(&fields.netaddr, "netaddr")?,
                iface: need(&fields.iface, "iface")?,
                physdev: fields.physdev,
            },
            SetType::ListSet => {
                let position = match (&fields.before, &fields.after) {
                    (Some(_), Some(_)) => {
                        return Err(ProvisionError::invalid_set(
                            set,
                            "list:set entries take before or after, not both",
                        )
                        .into())
                    }
                    (Some(_), None) => Some(ListPosition::Before(need(&fields.before, "before")?)),
                    (None, Some(_)) => Some(ListPosition::After(need(&fields.after, "after")?)),
                    (None, None) => None,
                };
                EntryValue::ListSet {
                    setname: need(&fields.setname, "setname")?,
                    position,
                }
            }
        };

        Ok(Entry {
            value,
            options: fields.options(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpSetConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub set_type: SetType,
    #[serde(default)]
    pub create: CreateOptions,
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

// =============================================================================
// IpSet
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetFlag {
    Src,
    Dst,
}

impl SetFlag {
    fn as_str(self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Dst => "dst",
        }
    }
}

/// `--match-set NAME src,dst` (prefixed by `!` when negated).
pub fn match_set_args(name: &str, flags: &[SetFlag], negate: bool) -> String {
    let flags: Vec<&str> = flags.iter().map(|f| f.as_str()).collect();
    format!(
        "{}--match-set {} {}",
        if negate { "! " } else { "" },
        name,
        flags.join(",")
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSet {
    name: String,
    set_type: SetType,
    create: CreateOptions,
    entries: Vec<Entry>,
}

impl IpSet {
    pub fn new(name: impl Into<String>, set_type: SetType, create: CreateOptions) -> Result<Self> {
        let name = name.into();
        validate_set_name(&name)?;
        create.validate(&name, set_type)?;
        Ok(Self {
            name,
            set_type,
            create,
            entries: Vec::new(),
        })
    }

    pub fn from_config(config: &IpSetConfig) -> Result<Self> {
        let mut set = Self::new(config.name.clone(), config.set_type, config.create.clone())?;
        for entry in &config.entries {
            let entry = entry.to_entry(&config.name, config.set_type)?;
            set.add(entry)?;
        }
        Ok(set)
    }

    /// Append an entry. Its shape must belong to this set's type.
    pub fn add(&mut self, entry: Entry) -> Result<()> {
        if entry.value.set_type() != self.set_type {
            return Err(ProvisionError::invalid_set(
                &self.name,
                format!(
                    "cannot add a {} entry to a {} set",
                    entry.value.set_type(),
                    self.set_type
                ),
            )
            .into());
        }
        entry
            .options
            .validate(&self.name, self.set_type, &self.create)?;
        self.entries.push(entry);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_type(&self) -> SetType {
        self.set_type
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn num_components(&self) -> usize {
        self.set_type.num_components()
    }

    pub fn create_command(&self, postfix: &str) -> String {
        let mut parts = vec![format!("ipset create {}{} {}", self.name, postfix, self.set_type)];
        parts.extend(self.create.flags());
        parts.join(" ")
    }

    pub fn add_commands(&self, postfix: &str) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| format!("ipset add {}{} {}", self.name, postfix, entry.render()))
            .collect()
    }

    /// Arguments for the `set` match module. One flag per set dimension.
    pub fn match_args(&self, flags: &[SetFlag], negate: bool) -> Result<String> {
        if flags.len() != self.num_components() {
            return Err(ProvisionError::invalid_set(
                &self.name,
                format!(
                    "{} needs exactly {} src/dst flags, got {}",
                    self.set_type,
                    self.num_components(),
                    flags.len()
                ),
            )
            .into());
        }
        Ok(match_set_args(&self.name, flags, negate))
    }
}
