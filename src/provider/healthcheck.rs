//! Provider health checking.
//!
//! # Responsibilities
//! - Probe every proxy of a provider once
//! - Record per-proxy reachability for reporting
//!
//! # Design Decisions
//! - A probe is a TCP connect to the proxy's server address, bounded by a timeout
//! - Proxies without a server address (DIRECT-like) count as alive

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::time;

use crate::adapter::Proxy;

pub struct HealthCheck {
    enabled: bool,
    timeout: Duration,
    alive: DashMap<String, bool>,
}

impl HealthCheck {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            enabled,
            timeout,
            alive: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Last recorded reachability of a proxy, if it was probed.
    pub fn is_alive(&self, name: &str) -> Option<bool> {
        self.alive.get(name).map(|r| *r.value())
    }

    /// Probe every proxy and return how many answered.
    pub async fn check(&self, proxies: &[Arc<dyn Proxy>]) -> usize {
        let mut alive = 0;
        for proxy in proxies {
            let ok = match proxy.server() {
                Some(addr) => self.probe(proxy.name(), &addr).await,
                None => true,
            };
            self.alive.insert(proxy.name().to_string(), ok);
            if ok {
                alive += 1;
            }
        }
        alive
    }

    async fn probe(&self, name: &str, addr: &str) -> bool {
        match time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(proxy = %name, addr = %addr, error = %e, "Health check failed: connection error");
                false
            }
            Err(_) => {
                tracing::warn!(proxy = %name, addr = %addr, "Health check failed: timeout");
                false
            }
        }
    }
}
