//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (groups, rules and providers reference existing names)
//! - Validate addresses, port specs and the fake-IP range
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RawConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system
//! - Steps that tolerate failure at apply time (certificates, sniffer) are not checked here

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::adapter::{DIRECT, REJECT};
use crate::component::auth::AuthUser;
use crate::config::schema::{EnhancedMode, RawConfig};
use crate::dns::enhancer::FakeIpPool;
use crate::dns::hosts::{Hosts, HostsError};
use crate::provider::VehicleType;
use crate::rules::{Rule, RuleParseError, RuleType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate proxy name {0:?}")]
    DuplicateProxy(String),
    #[error("proxy {0:?} has a group type; declare it under proxy-groups")]
    GroupAsProxy(String),
    #[error("proxy group {0:?} does not have a group type")]
    NotAGroup(String),
    #[error("proxy group {group:?} references unknown proxy {proxy:?}")]
    UnknownGroupMember { group: String, proxy: String },
    #[error("proxy group {group:?} uses unknown provider {provider:?}")]
    UnknownGroupProvider { group: String, provider: String },
    #[error("proxy group {0:?} is empty")]
    EmptyGroup(String),
    #[error("{kind} provider {name:?}: {reason}")]
    InvalidProvider {
        kind: &'static str,
        name: String,
        reason: &'static str,
    },
    #[error("rule {index} ({set}): {source}")]
    InvalidRule {
        set: String,
        index: usize,
        #[source]
        source: RuleParseError,
    },
    #[error("rule {rule:?} references unknown {kind} {name:?}")]
    UnknownRuleReference {
        rule: String,
        kind: &'static str,
        name: String,
    },
    #[error("invalid hosts: {0}")]
    Hosts(#[from] HostsError),
    #[error("dns listen address {0:?} is not a valid address:port")]
    DnsListen(String),
    #[error("fake-ip range {0} is too small")]
    FakeIpRange(String),
    #[error("authentication entry {0:?} is not user:password")]
    Authentication(String),
    #[error("duplicate listener name {0:?}")]
    DuplicateListener(String),
    #[error("listener {0:?} must have a non-zero port")]
    ListenerPort(String),
    #[error("tunnel {address:?}: {reason}")]
    InvalidTunnel {
        address: String,
        reason: &'static str,
    },
    #[error("metrics-address {0:?} is not a valid address:port")]
    MetricsAddress(String),
}

/// Validate a raw configuration.
pub fn validate_config(config: &RawConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let proxy_names = validate_proxies(config, &mut errors);
    validate_providers(config, &mut errors);
    validate_groups(config, &proxy_names, &mut errors);
    validate_rules(config, &proxy_names, &mut errors);

    if let Err(e) = Hosts::build(&config.hosts) {
        errors.push(ValidationError::Hosts(e));
    }

    validate_dns(config, &mut errors);

    for entry in &config.authentication {
        if AuthUser::parse(entry).is_none() {
            errors.push(ValidationError::Authentication(entry.clone()));
        }
    }

    let mut listener_names = HashSet::new();
    for l in &config.listeners {
        if !listener_names.insert(l.name.as_str()) {
            errors.push(ValidationError::DuplicateListener(l.name.clone()));
        }
        if l.port == 0 {
            errors.push(ValidationError::ListenerPort(l.name.clone()));
        }
    }

    for t in &config.tunnels {
        let invalid = |reason| ValidationError::InvalidTunnel {
            address: t.address.clone(),
            reason,
        };
        if t.address.parse::<SocketAddr>().is_err() {
            errors.push(invalid("address is not a valid address:port"));
        }
        if t.target.is_empty() {
            errors.push(invalid("target is empty"));
        }
        if t.network.is_empty() || t.network.iter().any(|n| n != "tcp" && n != "udp") {
            errors.push(invalid("network must be tcp and/or udp"));
        }
    }

    if let Some(addr) = &config.general.metrics_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::MetricsAddress(addr.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Returns every name a group member or rule target may refer to.
fn validate_proxies<'a>(config: &'a RawConfig, errors: &mut Vec<ValidationError>) -> HashSet<&'a str> {
    let mut names: HashSet<&str> = HashSet::from([DIRECT, REJECT]);

    for p in &config.proxies {
        if p.kind.is_group() {
            errors.push(ValidationError::GroupAsProxy(p.name.clone()));
        }
        if !names.insert(p.name.as_str()) {
            errors.push(ValidationError::DuplicateProxy(p.name.clone()));
        }
    }
    for g in &config.proxy_groups {
        if !names.insert(g.name.as_str()) {
            errors.push(ValidationError::DuplicateProxy(g.name.clone()));
        }
    }
    names
}

fn validate_groups(
    config: &RawConfig,
    names: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    for g in &config.proxy_groups {
        if !g.kind.is_group() {
            errors.push(ValidationError::NotAGroup(g.name.clone()));
        }
        if g.proxies.is_empty() && g.use_providers.is_empty() {
            errors.push(ValidationError::EmptyGroup(g.name.clone()));
        }
        for member in &g.proxies {
            if !names.contains(member.as_str()) {
                errors.push(ValidationError::UnknownGroupMember {
                    group: g.name.clone(),
                    proxy: member.clone(),
                });
            }
        }
        for provider in &g.use_providers {
            if !config.proxy_providers.contains_key(provider) {
                errors.push(ValidationError::UnknownGroupProvider {
                    group: g.name.clone(),
                    provider: provider.clone(),
                });
            }
        }
    }
}

fn validate_providers(config: &RawConfig, errors: &mut Vec<ValidationError>) {
    for (name, p) in &config.proxy_providers {
        let invalid = |reason| ValidationError::InvalidProvider {
            kind: "proxy",
            name: name.clone(),
            reason,
        };
        match p.vehicle {
            VehicleType::File if p.path.is_none() => errors.push(invalid("file vehicle needs a path")),
            VehicleType::Http if p.url.is_none() => errors.push(invalid("http vehicle needs a url")),
            VehicleType::Compatible if p.proxies.is_empty() => {
                errors.push(invalid("compatible vehicle needs inline proxies"))
            }
            _ => {}
        }
    }

    for (name, p) in &config.rule_providers {
        let invalid = |reason| ValidationError::InvalidProvider {
            kind: "rule",
            name: name.clone(),
            reason,
        };
        match p.vehicle {
            VehicleType::File if p.path.is_none() => errors.push(invalid("file vehicle needs a path")),
            VehicleType::Http if p.url.is_none() => errors.push(invalid("http vehicle needs a url")),
            VehicleType::Compatible => errors.push(invalid("rule providers cannot be compatible")),
            _ => {}
        }
    }
}

fn validate_rules(config: &RawConfig, names: &HashSet<&str>, errors: &mut Vec<ValidationError>) {
    let sets = std::iter::once(("rules", &config.rules))
        .chain(config.sub_rules.iter().map(|(k, v)| (k.as_str(), v)));

    for (set, lines) in sets {
        for (index, line) in lines.iter().enumerate() {
            let rule = match Rule::parse(line) {
                Ok(rule) => rule,
                Err(source) => {
                    errors.push(ValidationError::InvalidRule {
                        set: set.to_string(),
                        index,
                        source,
                    });
                    continue;
                }
            };

            let unknown = |kind, name: &str| ValidationError::UnknownRuleReference {
                rule: line.clone(),
                kind,
                name: name.to_string(),
            };
            if rule.rule_type == RuleType::RuleSet
                && !config.rule_providers.contains_key(&rule.payload)
            {
                errors.push(unknown("rule provider", &rule.payload));
            }
            if rule.rule_type == RuleType::SubRule {
                if !config.sub_rules.contains_key(&rule.target) {
                    errors.push(unknown("sub-rule", &rule.target));
                }
            } else if !names.contains(rule.target.as_str()) {
                errors.push(unknown("proxy", &rule.target));
            }
        }
    }
}

fn validate_dns(config: &RawConfig, errors: &mut Vec<ValidationError>) {
    let dns = &config.dns;
    if !dns.enable {
        return;
    }
    if !dns.listen.is_empty() && dns.listen.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::DnsListen(dns.listen.clone()));
    }
    if dns.enhanced_mode == EnhancedMode::FakeIp && FakeIpPool::new(dns.fake_ip_range).is_err() {
        errors.push(ValidationError::FakeIpRange(dns.fake_ip_range.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> RawConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_valid_config() {
        let cfg = parse(
            r#"
            rules = ["DOMAIN,example.com,Auto", "RULE-SET,ads,REJECT", "SUB-RULE,udp,udp-rules", "MATCH,DIRECT"]

            [[proxies]]
            name = "NodeA"
            type = "ss"
            server = "1.2.3.4"
            port = 443

            [[proxy-groups]]
            name = "Auto"
            type = "select"
            proxies = ["NodeA", "DIRECT"]

            [rule-providers.ads]
            type = "file"
            path = "rules/ads.txt"

            [sub-rules]
            udp-rules = ["MATCH,REJECT"]
            "#,
        );
        assert_eq!(validate_config(&cfg), Ok(()));
    }

    #[test]
    fn test_collects_all_errors() {
        let cfg = parse(
            r#"
            rules = ["MATCH,Missing", "RULE-SET,nope,DIRECT"]
            authentication = ["nocolon"]

            [[proxies]]
            name = "DIRECT"
            type = "direct"

            [[proxy-groups]]
            name = "Auto"
            type = "select"
            proxies = ["Ghost"]

            [dns]
            enable = true
            listen = "localhost"
            enhanced-mode = "fake-ip"
            fake-ip-range = "198.18.0.0/31"
            "#,
        );
        let errors = validate_config(&cfg).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateProxy("DIRECT".into())));
        assert!(errors.contains(&ValidationError::UnknownGroupMember {
            group: "Auto".into(),
            proxy: "Ghost".into()
        }));
        assert!(errors.contains(&ValidationError::DnsListen("localhost".into())));
        assert!(errors.contains(&ValidationError::FakeIpRange("198.18.0.0/31".into())));
        assert!(errors.contains(&ValidationError::Authentication("nocolon".into())));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownRuleReference { kind: "rule provider", .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownRuleReference { kind: "proxy", .. })));
    }

    #[test]
    fn test_provider_vehicles() {
        let cfg = parse(
            r#"
            [proxy-providers.a]
            type = "http"

            [proxy-providers.b]
            type = "compatible"

            [rule-providers.c]
            type = "compatible"
            "#,
        );
        let errors = validate_config(&cfg).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_tunnels_and_listeners() {
        let cfg = parse(
            r#"
            [[tunnels]]
            network = ["tcp", "sctp"]
            address = "127.0.0.1:6553"
            target = "1.1.1.1:53"

            [[listeners]]
            name = "in"
            type = "mixed"
            port = 0
            "#,
        );
        let errors = validate_config(&cfg).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::ListenerPort("in".into()),
                ValidationError::InvalidTunnel {
                    address: "127.0.0.1:6553".into(),
                    reason: "network must be tcp and/or udp"
                },
            ]
        );
    }
}
