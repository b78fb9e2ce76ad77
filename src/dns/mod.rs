//! DNS stack.
//!
//! # Data Flow
//! ```text
//! DnsConfig + rule providers + hosts
//!     → resolver.rs (nameserver sets, policy)
//!     → enhancer.rs (fake-IP pool, host mapping; patched from the old instance)
//!     → server.rs (local server + UDP listening service)
//!     → DnsSlots (process-wide handles read by the forwarding engine)
//! ```
//!
//! # Design Decisions
//! - Disabling DNS clears every handle and drops the cache
//! - A rebuild never cold-starts fake-IP assignments while DNS stays enabled

pub mod enhancer;
pub mod hosts;
pub mod resolver;
pub mod server;

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::component::profile::CacheFile;
use crate::config::schema::DnsConfig;
use crate::provider::RuleProviderMap;

pub use enhancer::{Enhancer, FakeIpPool};
pub use hosts::Hosts;
pub use resolver::{ProxyServerHostResolver, Resolver};
pub use server::{DnsServer, DnsServerControl, LocalServer};

/// Current DNS handles.
#[derive(Default)]
pub struct DnsSlots {
    pub resolver: ArcSwapOption<Resolver>,
    pub host_mapper: ArcSwapOption<Enhancer>,
    pub local_server: ArcSwapOption<LocalServer>,
    pub proxy_server_resolver: ArcSwapOption<ProxyServerHostResolver>,
    /// Static host table, independent of whether DNS is enabled.
    pub hosts: ArcSwapOption<Hosts>,
}

impl DnsSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_hosts(&self, hosts: Arc<Hosts>) {
        self.hosts.store(Some(hosts));
    }

    /// Persist the fake-IP pool into the profile cache.
    pub fn store_fake_ip_state(&self, profile: &CacheFile) {
        let Some(mapper) = self.host_mapper.load_full() else {
            return;
        };
        if let Some(state) = mapper.store_state() {
            profile.set_fake_ip_state(Some(state));
        }
    }
}

/// Rebuild the DNS stack from `cfg` and install it.
pub fn update_dns(
    slots: &DnsSlots,
    server: &dyn DnsServerControl,
    profile: &CacheFile,
    cfg: &DnsConfig,
    rule_providers: &RuleProviderMap,
    general_ipv6: bool,
) {
    if !cfg.enable {
        slots.resolver.store(None);
        slots.host_mapper.store(None);
        slots.local_server.store(None);
        slots.proxy_server_resolver.store(None);
        server.recreate("", None);
        return;
    }

    let resolver = Arc::new(Resolver::new(
        cfg,
        slots.hosts.load_full(),
        rule_providers,
        general_ipv6,
    ));
    let proxy_resolver = resolver.proxy_server_resolver();

    let enhancer = match Enhancer::new(cfg.enhanced_mode, cfg.fake_ip_range, cfg.fake_ip_filter.clone())
    {
        Ok(e) => Arc::new(e),
        Err(e) => {
            // validation rejects such ranges; keep serving without fake-ip
            tracing::error!(error = %e, "[DNS] fake-ip pool unavailable");
            match Enhancer::new(Default::default(), cfg.fake_ip_range, Vec::new()) {
                Ok(e) => Arc::new(e),
                Err(_) => return,
            }
        }
    };

    match slots.host_mapper.load_full() {
        Some(old) => enhancer.patch_from(&old),
        None => {
            if profile.store_fake_ip() {
                if let Some(state) = profile.fake_ip_state() {
                    if enhancer.restore_state(&state) {
                        tracing::info!(mappings = state.mappings.len(), "[DNS] fake-ip pool restored");
                    }
                }
            }
        }
    }

    let local = Arc::new(LocalServer::new(resolver.clone(), enhancer.clone()));
    slots.resolver.store(Some(resolver));
    slots.host_mapper.store(Some(enhancer));
    slots.local_server.store(Some(local.clone()));

    if proxy_resolver.is_valid() {
        slots.proxy_server_resolver.store(Some(Arc::new(proxy_resolver)));
    }

    server.recreate(&cfg.listen, Some(local));
}
