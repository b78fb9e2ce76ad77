//! Immutable configuration generation handed to the executor.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{AdapterType, AutoGroup, Outbound, Proxy, ProxyMap, Selector};
use crate::component::auth::AuthUser;
use crate::config::loader::ConfigError;
use crate::config::schema::{
    DnsConfig, ExperimentalConfig, GeneralConfig, InboundListenerConfig, IpTablesConfig,
    NtpConfig, ProfileConfig, RawConfig, SnifferConfig, TlsConfig, TunnelConfig,
};
use crate::dns::hosts::Hosts;
use crate::provider::{
    CompatibleProvider, FetchedProxyProvider, FetchedRuleProvider, ProxyProvider,
    ProxyProviderMap, RuleProvider, RuleProviderMap, Vehicle, VehicleType,
};
use crate::rules::Rule;

/// One fully built configuration generation. Read-only to the executor.
#[derive(Clone)]
pub struct ConfigurationSnapshot {
    pub general: GeneralConfig,
    pub listeners: HashMap<String, InboundListenerConfig>,
    pub dns: DnsConfig,
    pub ntp: NtpConfig,
    pub tls: TlsConfig,
    pub iptables: IpTablesConfig,
    pub sniffer: SnifferConfig,
    pub profile: ProfileConfig,
    pub experimental: ExperimentalConfig,
    pub tunnels: Vec<TunnelConfig>,
    pub users: Vec<AuthUser>,
    pub hosts: Arc<Hosts>,
    /// Always contains `DIRECT` and `REJECT`.
    pub proxies: ProxyMap,
    pub providers: ProxyProviderMap,
    pub rules: Vec<Rule>,
    pub sub_rules: HashMap<String, Vec<Rule>>,
    pub rule_providers: RuleProviderMap,
}

impl ConfigurationSnapshot {
    /// Build a snapshot from a validated raw configuration.
    pub fn build(raw: RawConfig, home: &Path) -> Result<Self, ConfigError> {
        let hosts = Hosts::build(&raw.hosts).map_err(|e| ConfigError::Build(e.to_string()))?;

        let mut proxies: ProxyMap = HashMap::new();
        for p in [Outbound::direct(), Outbound::reject()] {
            proxies.insert(p.name().to_string(), Arc::new(p));
        }
        for p in &raw.proxies {
            proxies.insert(p.name.clone(), Arc::new(Outbound::from(p)));
        }
        for g in &raw.proxy_groups {
            let group: Arc<dyn Proxy> = match g.kind {
                AdapterType::Selector => Arc::new(Selector::new(g.name.clone(), g.proxies.clone())),
                kind => Arc::new(AutoGroup::new(g.name.clone(), kind, g.proxies.clone())),
            };
            proxies.insert(g.name.clone(), group);
        }

        let mut providers: ProxyProviderMap = HashMap::new();
        for (name, p) in &raw.proxy_providers {
            let provider: Arc<dyn ProxyProvider> = match p.vehicle {
                VehicleType::Compatible => Arc::new(CompatibleProvider::new(
                    name.clone(),
                    p.proxies
                        .iter()
                        .map(|o| Arc::new(Outbound::from(o)) as Arc<dyn Proxy>)
                        .collect(),
                    p.health_check.enable,
                    Duration::from_millis(p.health_check.timeout_ms),
                )),
                vehicle => Arc::new(FetchedProxyProvider::new(
                    name.clone(),
                    vehicle_for(vehicle, name, "proxies", p.path.as_deref(), p.url.as_deref(), home)?,
                )),
            };
            providers.insert(name.clone(), provider);
        }

        let mut rule_providers: RuleProviderMap = HashMap::new();
        for (name, p) in &raw.rule_providers {
            let vehicle = vehicle_for(p.vehicle, name, "rules", p.path.as_deref(), p.url.as_deref(), home)?;
            let provider: Arc<dyn RuleProvider> =
                Arc::new(FetchedRuleProvider::new(name.clone(), vehicle, p.behavior));
            rule_providers.insert(name.clone(), provider);
        }

        let rules = parse_rules(&raw.rules)?;
        let sub_rules = raw
            .sub_rules
            .iter()
            .map(|(name, lines)| Ok((name.clone(), parse_rules(lines)?)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        let listeners = raw
            .listeners
            .into_iter()
            .map(|l| (l.name.clone(), l))
            .collect();

        let users = raw
            .authentication
            .iter()
            .filter_map(|entry| AuthUser::parse(entry))
            .collect();

        Ok(Self {
            general: raw.general,
            listeners,
            dns: raw.dns,
            ntp: raw.ntp,
            tls: raw.tls,
            iptables: raw.iptables,
            sniffer: raw.sniffer,
            profile: raw.profile,
            experimental: raw.experimental,
            tunnels: raw.tunnels,
            users,
            hosts: Arc::new(hosts),
            proxies,
            providers,
            rules,
            sub_rules,
            rule_providers,
        })
    }
}

fn parse_rules(lines: &[String]) -> Result<Vec<Rule>, ConfigError> {
    lines
        .iter()
        .map(|line| Rule::parse(line).map_err(|e| ConfigError::Build(e.to_string())))
        .collect()
}

/// Payload source for a managed provider. Relative paths resolve against `home`.
fn vehicle_for(
    vehicle: VehicleType,
    name: &str,
    dir: &str,
    path: Option<&str>,
    url: Option<&str>,
    home: &Path,
) -> Result<Vehicle, ConfigError> {
    let path = match path {
        Some(p) => home.join(p),
        None => home.join(dir).join(name),
    };
    match (vehicle, url) {
        (VehicleType::File, _) => Ok(Vehicle::File { path }),
        (VehicleType::Http, Some(url)) => Ok(Vehicle::Http {
            url: url.to_string(),
            path,
        }),
        (VehicleType::Http, None) => Err(ConfigError::Build(format!(
            "provider {name}: http vehicle needs a url"
        ))),
        (VehicleType::Compatible, _) => Err(ConfigError::Build(format!(
            "provider {name}: compatible vehicle has no payload source"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_snapshot() {
        let raw: RawConfig = toml::from_str(
            r#"
            authentication = ["alice:secret"]
            rules = ["DOMAIN,example.com,Auto", "MATCH,DIRECT"]

            [hosts]
            "router.lan" = "192.168.1.1"

            [[proxies]]
            name = "NodeA"
            type = "trojan"
            server = "1.2.3.4"
            port = 443

            [[proxy-groups]]
            name = "Auto"
            type = "select"
            proxies = ["NodeA", "DIRECT"]

            [[proxy-groups]]
            name = "Fast"
            type = "url-test"
            proxies = ["NodeA"]

            [proxy-providers.inline]
            type = "compatible"
            proxies = [{ name = "NodeB", type = "direct" }]

            [rule-providers.ads]
            type = "file"
            path = "rules/ads.txt"
            behavior = "domain"
            "#,
        )
        .unwrap();

        let snapshot = ConfigurationSnapshot::build(raw, Path::new("/srv/hub")).unwrap();
        assert!(snapshot.proxies.contains_key("DIRECT"));
        assert!(snapshot.proxies.contains_key("REJECT"));
        assert!(snapshot.proxies["Auto"].as_selectable().is_some());
        assert!(snapshot.proxies["Fast"].as_selectable().is_none());
        assert_eq!(
            snapshot.providers["inline"].vehicle_type(),
            VehicleType::Compatible
        );
        assert_eq!(snapshot.rule_providers["ads"].vehicle_type(), VehicleType::File);
        assert_eq!(snapshot.rules.len(), 2);
        assert_eq!(snapshot.users[0].user, "alice");
        assert_eq!(snapshot.hosts.len(), 1);
    }

    #[test]
    fn test_vehicle_paths_resolve_against_home() {
        let home = Path::new("/srv/hub");
        let v = vehicle_for(VehicleType::File, "ads", "rules", Some("rules/ads.txt"), None, home).unwrap();
        assert_eq!(v.path(), Path::new("/srv/hub/rules/ads.txt"));

        let v = vehicle_for(VehicleType::Http, "remote", "proxies", None, Some("http://x/p"), home).unwrap();
        assert_eq!(v.path(), Path::new("/srv/hub/proxies/remote"));
    }
}
