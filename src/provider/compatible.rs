//! Compatible (inline) proxy provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::adapter::Proxy;
use crate::provider::healthcheck::HealthCheck;
use crate::provider::{Provider, ProviderError, ProviderType, ProxyProvider, VehicleType};

/// Proxies supplied with the configuration itself.
///
/// The executor never fetches these; `initial()` only runs the health check.
pub struct CompatibleProvider {
    name: String,
    proxies: Vec<Arc<dyn Proxy>>,
    health: HealthCheck,
}

impl CompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        proxies: Vec<Arc<dyn Proxy>>,
        health_check: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            proxies,
            health: HealthCheck::new(health_check, timeout),
        }
    }

    pub fn health(&self) -> &HealthCheck {
        &self.health
    }
}

#[async_trait]
impl Provider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Proxy
    }

    fn vehicle_type(&self) -> VehicleType {
        VehicleType::Compatible
    }

    async fn initial(&self) -> Result<(), ProviderError> {
        if self.proxies.is_empty() {
            return Err(ProviderError::Empty);
        }
        if !self.health.enabled() {
            return Ok(());
        }
        let alive = self.health.check(&self.proxies).await;
        tracing::debug!(provider = %self.name, alive, total = self.proxies.len(), "Compatible provider checked");
        if alive == 0 {
            return Err(ProviderError::Unreachable);
        }
        Ok(())
    }
}

impl ProxyProvider for CompatibleProvider {
    fn proxies(&self) -> Vec<Arc<dyn Proxy>> {
        self.proxies.clone()
    }
}
