//! Resolver configuration.
//!
//! The resolution algorithm lives in the forwarding engine; this type holds
//! the nameserver sets it needs and picks the set for a domain.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::{CacheAlgorithm, DnsConfig, EnhancedMode, FallbackFilterConfig};
use crate::dns::hosts::Hosts;
use crate::provider::RuleProviderMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PolicyKey {
    Domain(String),
    /// `+.example.com`
    Suffix(String),
    /// `rule-set:<name>`, matched by the forwarding engine
    RuleSet(String),
    /// `geosite:<code>`, matched by the forwarding engine
    GeoSite(String),
}

impl PolicyKey {
    fn parse(key: &str) -> Self {
        let key = key.trim().to_ascii_lowercase();
        if let Some(name) = key.strip_prefix("rule-set:") {
            PolicyKey::RuleSet(name.to_string())
        } else if let Some(code) = key.strip_prefix("geosite:") {
            PolicyKey::GeoSite(code.to_string())
        } else if let Some(suffix) = key.strip_prefix("+.") {
            PolicyKey::Suffix(suffix.to_string())
        } else {
            PolicyKey::Domain(key)
        }
    }

    /// Exact names beat suffixes; longer suffixes beat shorter ones.
    fn specificity(&self) -> (u8, usize) {
        match self {
            PolicyKey::Domain(d) => (2, d.len()),
            PolicyKey::Suffix(s) => (1, s.len()),
            PolicyKey::RuleSet(_) | PolicyKey::GeoSite(_) => (0, 0),
        }
    }

    fn matches(&self, domain: &str) -> bool {
        match self {
            PolicyKey::Domain(d) => d == domain,
            PolicyKey::Suffix(s) => domain == s || domain.ends_with(&format!(".{s}")),
            PolicyKey::RuleSet(_) | PolicyKey::GeoSite(_) => false,
        }
    }
}

pub struct Resolver {
    main: Vec<String>,
    fallback: Vec<String>,
    default_nameserver: Vec<String>,
    proxy_server: Vec<String>,
    policy: Vec<(PolicyKey, Vec<String>)>,
    ipv6: bool,
    ipv6_timeout: Duration,
    enhanced_mode: EnhancedMode,
    fallback_filter: FallbackFilterConfig,
    cache_algorithm: CacheAlgorithm,
    hosts: Option<Arc<Hosts>>,
}

impl Resolver {
    pub fn new(
        cfg: &DnsConfig,
        hosts: Option<Arc<Hosts>>,
        rule_providers: &RuleProviderMap,
        general_ipv6: bool,
    ) -> Self {
        let mut policy: Vec<_> = cfg
            .nameserver_policy
            .iter()
            .map(|(k, v)| (PolicyKey::parse(k), v.clone()))
            .collect();
        policy.sort_by_key(|(k, _)| std::cmp::Reverse(k.specificity()));

        for (key, _) in &policy {
            if let PolicyKey::RuleSet(name) = key {
                if !rule_providers.contains_key(name) {
                    tracing::warn!(rule_set = %name, "[DNS] nameserver-policy references unknown rule provider");
                }
            }
        }

        Self {
            main: cfg.nameserver.clone(),
            fallback: cfg.fallback.clone(),
            default_nameserver: cfg.default_nameserver.clone(),
            proxy_server: cfg.proxy_server_nameserver.clone(),
            policy,
            ipv6: cfg.ipv6 && general_ipv6,
            ipv6_timeout: Duration::from_millis(cfg.ipv6_timeout),
            enhanced_mode: cfg.enhanced_mode,
            fallback_filter: cfg.fallback_filter.clone(),
            cache_algorithm: cfg.cache_algorithm,
            hosts: if cfg.use_hosts { hosts } else { None },
        }
    }

    /// Nameservers for `domain`: the first matching policy, else the main set.
    pub fn nameservers_for(&self, domain: &str) -> &[String] {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.policy
            .iter()
            .find(|(k, _)| k.matches(&domain))
            .map(|(_, ns)| ns.as_slice())
            .unwrap_or(self.main.as_slice())
    }

    /// Answers from the static host table, if enabled.
    pub fn resolve_local(&self, domain: &str) -> Vec<IpAddr> {
        self.hosts
            .as_ref()
            .map(|h| h.resolve(domain))
            .unwrap_or_default()
    }

    pub fn hosts(&self) -> Option<&Arc<Hosts>> {
        self.hosts.as_ref()
    }

    pub fn fallback(&self) -> &[String] {
        &self.fallback
    }

    pub fn default_nameserver(&self) -> &[String] {
        &self.default_nameserver
    }

    pub fn fallback_filter(&self) -> &FallbackFilterConfig {
        &self.fallback_filter
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6
    }

    pub fn ipv6_timeout(&self) -> Duration {
        self.ipv6_timeout
    }

    pub fn enhanced_mode(&self) -> EnhancedMode {
        self.enhanced_mode
    }

    pub fn cache_algorithm(&self) -> CacheAlgorithm {
        self.cache_algorithm
    }

    pub fn proxy_server_resolver(&self) -> ProxyServerHostResolver {
        ProxyServerHostResolver {
            nameservers: self.proxy_server.clone(),
            ipv6: self.ipv6,
        }
    }
}

/// Resolver used for proxy server hostnames, so they never resolve through a proxy.
#[derive(Debug, Clone)]
pub struct ProxyServerHostResolver {
    nameservers: Vec<String>,
    ipv6: bool,
}

impl ProxyServerHostResolver {
    /// Only valid when `proxy-server-nameserver` is configured.
    pub fn is_valid(&self) -> bool {
        !self.nameservers.is_empty()
    }

    pub fn nameservers(&self) -> &[String] {
        &self.nameservers
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg() -> DnsConfig {
        let mut c = DnsConfig {
            enable: true,
            ipv6: true,
            nameserver: vec!["223.5.5.5".into()],
            ..Default::default()
        };
        c.nameserver_policy
            .insert("+.google.com".into(), vec!["8.8.8.8".into()]);
        c.nameserver_policy
            .insert("www.google.com".into(), vec!["1.1.1.1".into()]);
        c
    }

    #[test]
    fn test_policy_selection() {
        let r = Resolver::new(&cfg(), None, &HashMap::new(), true);
        assert_eq!(r.nameservers_for("www.google.com."), ["1.1.1.1".to_string()]);
        assert_eq!(r.nameservers_for("mail.google.com"), ["8.8.8.8".to_string()]);
        assert_eq!(r.nameservers_for("example.com"), ["223.5.5.5".to_string()]);
    }

    #[test]
    fn test_ipv6_requires_both_flags() {
        assert!(!Resolver::new(&cfg(), None, &HashMap::new(), false).ipv6());
        assert!(Resolver::new(&cfg(), None, &HashMap::new(), true).ipv6());
    }

    #[test]
    fn test_proxy_server_resolver_validity() {
        let r = Resolver::new(&cfg(), None, &HashMap::new(), true);
        assert!(!r.proxy_server_resolver().is_valid());

        let mut c = cfg();
        c.proxy_server_nameserver = vec!["114.114.114.114".into()];
        let r = Resolver::new(&c, None, &HashMap::new(), true);
        assert!(r.proxy_server_resolver().is_valid());
    }
}
