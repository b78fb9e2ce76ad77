//! Static host table.
//!
//! Keys are exact names, `*.example.com` (exactly one extra label) or
//! `+.example.com` (the domain itself and every subdomain). Values are
//! addresses or an alias domain that is looked up again.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;

use crate::config::schema::HostEntry;

/// Alias chains longer than this resolve to nothing.
const MAX_ALIAS_DEPTH: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostsError {
    #[error("host {host}: invalid address {value:?}")]
    InvalidAddress { host: String, value: String },
    #[error("host entry {0:?} is empty")]
    Empty(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostValue {
    Ips(Vec<IpAddr>),
    Alias(String),
}

#[derive(Debug, Clone, Default)]
pub struct Hosts {
    exact: HashMap<String, HostValue>,
    /// `*.suffix`
    single: HashMap<String, HostValue>,
    /// `+.suffix`
    deep: HashMap<String, HostValue>,
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl Hosts {
    pub fn build(entries: &HashMap<String, HostEntry>) -> Result<Self, HostsError> {
        let mut hosts = Hosts::default();
        for (key, entry) in entries {
            let key = normalize(key);
            if key.is_empty() {
                return Err(HostsError::Empty(key));
            }
            let value = match entry {
                HostEntry::One(v) => match v.parse::<IpAddr>() {
                    Ok(ip) => HostValue::Ips(vec![ip]),
                    Err(_) if !v.trim().is_empty() => HostValue::Alias(normalize(v)),
                    Err(_) => return Err(HostsError::Empty(key)),
                },
                HostEntry::Many(list) => {
                    if list.is_empty() {
                        return Err(HostsError::Empty(key));
                    }
                    let ips = list
                        .iter()
                        .map(|v| {
                            v.parse::<IpAddr>().map_err(|_| HostsError::InvalidAddress {
                                host: key.clone(),
                                value: v.clone(),
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    HostValue::Ips(ips)
                }
            };
            if let Some(suffix) = key.strip_prefix("*.") {
                hosts.single.insert(suffix.to_string(), value);
            } else if let Some(suffix) = key.strip_prefix("+.") {
                hosts.deep.insert(suffix.to_string(), value);
            } else {
                hosts.exact.insert(key, value);
            }
        }
        Ok(hosts)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.single.len() + self.deep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most specific entry for `domain`: exact, then `*.`, then the longest `+.` suffix.
    pub fn search(&self, domain: &str) -> Option<&HostValue> {
        let domain = normalize(domain);
        if let Some(v) = self.exact.get(&domain) {
            return Some(v);
        }
        if let Some((_, parent)) = domain.split_once('.') {
            if let Some(v) = self.single.get(parent) {
                return Some(v);
            }
        }
        let mut rest = domain.as_str();
        loop {
            if let Some(v) = self.deep.get(rest) {
                return Some(v);
            }
            match rest.split_once('.') {
                Some((_, parent)) => rest = parent,
                None => return None,
            }
        }
    }

    /// Addresses for `domain`, following aliases.
    pub fn resolve(&self, domain: &str) -> Vec<IpAddr> {
        let mut name = domain.to_string();
        for _ in 0..=MAX_ALIAS_DEPTH {
            match self.search(&name) {
                Some(HostValue::Ips(ips)) => return ips.clone(),
                Some(HostValue::Alias(alias)) => name = alias.clone(),
                None => return Vec::new(),
            }
        }
        Vec::new()
    }

    pub fn resolve_v4(&self, domain: &str) -> Vec<Ipv4Addr> {
        self.resolve(domain)
            .into_iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, HostEntry)]) -> Hosts {
        let map = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Hosts::build(&map).unwrap()
    }

    #[test]
    fn test_match_precedence() {
        let hosts = table(&[
            ("router.lan", HostEntry::One("192.168.1.1".into())),
            ("*.example.com", HostEntry::One("10.0.0.1".into())),
            ("+.example.com", HostEntry::One("10.0.0.2".into())),
            ("+.com", HostEntry::One("10.0.0.3".into())),
        ]);

        assert_eq!(hosts.resolve("Router.LAN."), vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(hosts.resolve_v4("www.example.com"), vec![Ipv4Addr::new(10, 0, 0, 1)]);
        assert_eq!(hosts.resolve_v4("example.com"), vec![Ipv4Addr::new(10, 0, 0, 2)]);
        assert_eq!(hosts.resolve_v4("a.b.example.com"), vec![Ipv4Addr::new(10, 0, 0, 2)]);
        assert_eq!(hosts.resolve_v4("other.com"), vec![Ipv4Addr::new(10, 0, 0, 3)]);
        assert!(hosts.resolve("example.org").is_empty());
    }

    #[test]
    fn test_alias_and_loops() {
        let hosts = table(&[
            ("alias.lan", HostEntry::One("router.lan".into())),
            ("router.lan", HostEntry::Many(vec!["192.168.1.1".into(), "fd00::1".into()])),
            ("a.loop", HostEntry::One("b.loop".into())),
            ("b.loop", HostEntry::One("a.loop".into())),
        ]);
        assert_eq!(hosts.resolve("alias.lan").len(), 2);
        assert_eq!(hosts.resolve_v4("alias.lan"), vec![Ipv4Addr::new(192, 168, 1, 1)]);
        assert!(hosts.resolve("a.loop").is_empty());
    }

    #[test]
    fn test_invalid_entries() {
        let mut map = HashMap::new();
        map.insert("bad.lan".to_string(), HostEntry::Many(vec!["nope".into()]));
        assert!(matches!(Hosts::build(&map), Err(HostsError::InvalidAddress { .. })));
    }
}
