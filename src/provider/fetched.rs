//! Managed providers backed by a file or HTTP vehicle.
//!
//! # Responsibilities
//! - Fetch the payload through the vehicle on `initial()`
//! - Parse and validate it, then swap in the new contents
//!
//! # Design Decisions
//! - A failed `initial()` leaves the previous contents untouched
//! - Proxy payloads are TOML (`[[proxies]]`), rule payloads are one entry per line

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;

use crate::adapter::{Outbound, Proxy};
use crate::config::schema::OutboundConfig;
use crate::provider::{
    Provider, ProviderError, ProviderType, ProxyProvider, RuleBehavior, RuleProvider, Vehicle,
    VehicleType,
};
use crate::rules::RuleType;

#[derive(Debug, Deserialize, Default)]
struct ProxyPayload {
    #[serde(default)]
    proxies: Vec<OutboundConfig>,
}

pub struct FetchedProxyProvider {
    name: String,
    vehicle: Vehicle,
    proxies: ArcSwap<Vec<Arc<dyn Proxy>>>,
}

impl FetchedProxyProvider {
    pub fn new(name: impl Into<String>, vehicle: Vehicle) -> Self {
        Self {
            name: name.into(),
            vehicle,
            proxies: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn parse(buf: &[u8]) -> Result<Vec<Arc<dyn Proxy>>, ProviderError> {
        let text = std::str::from_utf8(buf).map_err(|e| ProviderError::Parse(e.to_string()))?;
        let payload: ProxyPayload =
            toml::from_str(text).map_err(|e| ProviderError::Parse(e.to_string()))?;
        if payload.proxies.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(payload
            .proxies
            .iter()
            .map(|p| Arc::new(Outbound::from(p)) as Arc<dyn Proxy>)
            .collect())
    }
}

#[async_trait]
impl Provider for FetchedProxyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Proxy
    }

    fn vehicle_type(&self) -> VehicleType {
        self.vehicle.vehicle_type()
    }

    async fn initial(&self) -> Result<(), ProviderError> {
        let buf = self.vehicle.read().await?;
        let proxies = Self::parse(&buf)?;
        tracing::debug!(provider = %self.name, count = proxies.len(), "Proxy provider loaded");
        self.proxies.store(Arc::new(proxies));
        Ok(())
    }
}

impl ProxyProvider for FetchedProxyProvider {
    fn proxies(&self) -> Vec<Arc<dyn Proxy>> {
        self.proxies.load_full().to_vec()
    }
}

pub struct FetchedRuleProvider {
    name: String,
    vehicle: Vehicle,
    behavior: RuleBehavior,
    rules: ArcSwap<Vec<String>>,
}

impl FetchedRuleProvider {
    pub fn new(name: impl Into<String>, vehicle: Vehicle, behavior: RuleBehavior) -> Self {
        Self {
            name: name.into(),
            vehicle,
            behavior,
            rules: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn rules(&self) -> Arc<Vec<String>> {
        self.rules.load_full()
    }

    fn parse(&self, buf: &[u8]) -> Result<Vec<String>, ProviderError> {
        let text = std::str::from_utf8(buf).map_err(|e| ProviderError::Parse(e.to_string()))?;
        let mut out = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let ok = match self.behavior {
                RuleBehavior::Domain => !line.contains(char::is_whitespace),
                RuleBehavior::IpCidr => line.parse::<ipnet::IpNet>().is_ok(),
                RuleBehavior::Classical => line
                    .split(',')
                    .next()
                    .and_then(RuleType::parse)
                    .is_some_and(|t| t != RuleType::Match && t != RuleType::SubRule),
            };
            if !ok {
                return Err(ProviderError::Parse(format!(
                    "line {}: invalid {:?} entry {:?}",
                    idx + 1,
                    self.behavior,
                    line
                )));
            }
            out.push(line.to_string());
        }
        Ok(out)
    }
}

#[async_trait]
impl Provider for FetchedRuleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Rule
    }

    fn vehicle_type(&self) -> VehicleType {
        self.vehicle.vehicle_type()
    }

    async fn initial(&self) -> Result<(), ProviderError> {
        let buf = self.vehicle.read().await?;
        let rules = self.parse(&buf)?;
        tracing::debug!(provider = %self.name, count = rules.len(), "Rule provider loaded");
        self.rules.store(Arc::new(rules));
        Ok(())
    }
}

impl RuleProvider for FetchedRuleProvider {
    fn behavior(&self) -> RuleBehavior {
        self.behavior
    }

    fn count(&self) -> usize {
        self.rules.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn file(dir: &Path, name: &str, body: &str) -> Vehicle {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        Vehicle::File { path }
    }

    #[tokio::test]
    async fn test_proxy_provider_loads_payload() {
        let dir = tempfile::tempdir().unwrap();
        let v = file(
            dir.path(),
            "p.toml",
            r#"
            [[proxies]]
            name = "NodeA"
            type = "trojan"
            server = "1.2.3.4"
            port = 443
            "#,
        );
        let p = FetchedProxyProvider::new("remote", v);
        assert!(p.proxies().is_empty());
        p.initial().await.unwrap();

        let proxies = p.proxies();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].name(), "NodeA");
        assert_eq!(proxies[0].server().as_deref(), Some("1.2.3.4:443"));
    }

    #[tokio::test]
    async fn test_empty_proxy_payload_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = FetchedProxyProvider::new("remote", file(dir.path(), "p.toml", ""));
        assert!(matches!(p.initial().await, Err(ProviderError::Empty)));
    }

    #[tokio::test]
    async fn test_rule_provider_validates_by_behavior() {
        let dir = tempfile::tempdir().unwrap();
        let ok = FetchedRuleProvider::new(
            "lan",
            file(dir.path(), "lan.txt", "# lan\n10.0.0.0/8\n192.168.0.0/16\n"),
            RuleBehavior::IpCidr,
        );
        ok.initial().await.unwrap();
        assert_eq!(ok.count(), 2);

        let bad = FetchedRuleProvider::new(
            "bad",
            file(dir.path(), "bad.txt", "example.com\n"),
            RuleBehavior::IpCidr,
        );
        assert!(matches!(bad.initial().await, Err(ProviderError::Parse(_))));
        assert_eq!(bad.count(), 0);

        let classical = FetchedRuleProvider::new(
            "c",
            file(dir.path(), "c.txt", "DOMAIN-SUFFIX,example.com\nIP-CIDR,1.1.1.1/32,no-resolve\n"),
            RuleBehavior::Classical,
        );
        classical.initial().await.unwrap();
        assert_eq!(classical.rules().len(), 2);
    }
}
