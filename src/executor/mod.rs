//! Configuration application.
//!
//! # Data Flow
//! ```text
//! ConfigurationSnapshot
//!     → Executor::apply (serialized by the apply lock)
//!     → suspend tunnel → trust store, auth, proxies, rules, sniffer, hosts, general
//!     → NTP, DNS, listeners, iptables, tun, experimental, tunnels
//!     → inner loading → proxy providers → profile → rule providers
//!     → running → compatible providers → log level
//! ```
//!
//! # Design Decisions
//! - One apply pass at a time; a second caller waits for the lock
//! - Every step logs and continues on failure, except transparent-proxy rules,
//!   which return `ApplyError::Fatal` for the binary to exit on
//! - Provider phases are fan-out/fan-in barriers bounded by `CONCURRENT_LOAD_LIMIT`

pub mod registry;
pub mod runner;

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use ipnet::IpNet;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::adapter::ProxyMap;
use crate::component::auth::Authenticator;
use crate::component::ntp::NtpSettings;
use crate::component::sniffer::SnifferDispatcher;
use crate::config::schema::{
    ExperimentalConfig, GeneralConfig, NtpConfig, ProfileConfig, SnifferConfig, TlsConfig,
    TuicServer, TunConfig,
};
use crate::config::ConfigurationSnapshot;
use crate::dns;
use crate::listener::{recreate_plan, Ports};
use crate::observability::logging::LogLevel;
use crate::observability::metrics;
use crate::observability::tracing::{apply_span, new_apply_id};
use crate::provider::loader::{init_compatible, load_provider};
use crate::provider::{ProxyProviderMap, RuleProviderMap, VehicleType};
use crate::tproxy::{self, TProxyError};
use crate::tunnel::Mode;

pub use registry::SubsystemRegistry;
pub use runner::{run_bounded, CONCURRENT_LOAD_LIMIT};

/// Exit status for a failed transparent-proxy setup.
pub const FATAL_EXIT_CODE: i32 = 2;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("transparent proxy setup failed: {0}")]
    Fatal(#[from] TProxyError),
}

impl ApplyError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ApplyError::Fatal(_) => FATAL_EXIT_CODE,
        }
    }
}

/// Live state reported to controllers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct General {
    #[serde(flatten)]
    pub ports: Ports,
    pub tun: TunConfig,
    pub tuic_server: TuicServer,
    pub authentication: Vec<String>,
    pub skip_auth_prefixes: Vec<IpNet>,
    pub allow_lan: bool,
    pub bind_address: String,
    pub mode: Mode,
    pub log_level: LogLevel,
    pub ipv6: bool,
    pub geodata_loader: String,
    pub interface_name: String,
    pub sniffing: bool,
    pub tcp_concurrent: bool,
}

pub struct Executor {
    registry: SubsystemRegistry,
    lock: Mutex<()>,
    current: ArcSwapOption<ConfigurationSnapshot>,
}

impl Executor {
    pub fn new(registry: SubsystemRegistry) -> Self {
        Self {
            registry,
            lock: Mutex::new(()),
            current: ArcSwapOption::empty(),
        }
    }

    pub fn registry(&self) -> &SubsystemRegistry {
        &self.registry
    }

    /// Snapshot of the last completed apply pass.
    pub fn current(&self) -> Option<Arc<ConfigurationSnapshot>> {
        self.current.load_full()
    }

    /// Apply `cfg` to every subsystem. `force` rebinds the port-based listeners
    /// even when their configuration is unchanged.
    pub async fn apply(&self, cfg: &ConfigurationSnapshot, force: bool) -> Result<(), ApplyError> {
        let _guard = self.lock.lock().await;
        let start = Instant::now();

        self.apply_locked(cfg, force)
            .instrument(apply_span(new_apply_id(), force))
            .await?;

        metrics::record_apply(start.elapsed());
        Ok(())
    }

    async fn apply_locked(&self, cfg: &ConfigurationSnapshot, force: bool) -> Result<(), ApplyError> {
        let reg = &self.registry;
        reg.tunnel.on_suspend();

        self.update_tls(&cfg.tls);
        reg.auth.set_authenticator(Authenticator::new(&cfg.users));
        reg.tunnel
            .update_proxies(cfg.proxies.clone(), cfg.providers.clone());
        reg.tunnel.update_rules(
            cfg.rules.clone(),
            cfg.sub_rules.clone(),
            cfg.rule_providers.clone(),
        );
        self.update_sniffer(&cfg.sniffer);
        reg.dns.update_hosts(cfg.hosts.clone());
        self.update_general(&cfg.general);
        self.update_ntp(&cfg.ntp);
        dns::update_dns(
            &reg.dns,
            reg.dns_server.as_ref(),
            &reg.profile,
            &cfg.dns,
            &cfg.rule_providers,
            cfg.general.ipv6,
        );
        self.update_listeners(cfg, force).await;

        if let Err(e) = tproxy::update_iptables(
            reg.tproxy.as_ref(),
            &cfg.iptables,
            &cfg.general,
            &cfg.dns,
            &reg.dialer,
        )
        .await
        {
            tracing::error!(error = %e, "[IPTABLES] setting iptables failed");
            return Err(ApplyError::Fatal(e));
        }

        let inbound = &cfg.general.inbound;
        reg.listeners
            .recreate_tun(&inbound.tun, reg.tunnel.clone())
            .await;
        reg.listeners
            .recreate_redir_to_tun(&inbound.tun.redirect_to_tun)
            .await;
        update_experimental(&cfg.experimental);
        reg.listeners
            .patch_tunnels(&cfg.tunnels, reg.tunnel.clone())
            .await;

        reg.tunnel.on_inner_loading();
        reg.inner.install(reg.tunnel.clone());

        load_proxy_providers(&cfg.providers).await;
        self.update_profile(&cfg.profile, &cfg.proxies);
        load_rule_providers(&cfg.rule_providers).await;

        // previous generation becomes unreachable here
        drop(self.current.swap(Some(Arc::new(cfg.clone()))));

        reg.tunnel.on_running();
        init_compatible_providers(&cfg.providers).await;

        reg.logger.set_level(cfg.general.log_level);
        Ok(())
    }

    fn update_tls(&self, cfg: &TlsConfig) {
        let trust = &self.registry.trust;
        trust.reset();
        for pem in &cfg.custom_certificates {
            if let Err(e) = trust.add_certificate(pem) {
                tracing::warn!(error = %e, "Failed to add custom certificate");
            }
        }
    }

    fn update_sniffer(&self, cfg: &SnifferConfig) {
        let dispatcher = if cfg.enable {
            match SnifferDispatcher::new(cfg) {
                Ok(d) => {
                    tracing::info!("Sniffer is loaded and working");
                    Some(Arc::new(d))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "initial sniffer failed");
                    None
                }
            }
        } else {
            Some(Arc::new(SnifferDispatcher::closed()))
        };
        self.registry.tunnel.update_sniffer(dispatcher);
    }

    fn update_general(&self, general: &GeneralConfig) {
        let tunnel = &self.registry.tunnel;
        let dialer = &self.registry.dialer;

        tunnel.set_mode(general.mode);
        tunnel.set_find_process_mode(general.find_process_mode);

        dialer.set_ipv6(general.ipv6);
        if general.tcp_concurrent {
            tracing::info!("Use tcp concurrent");
        }
        dialer.set_tcp_concurrent(general.tcp_concurrent);
        dialer.set_inbound_tfo(general.inbound.inbound_tfo);
        dialer.set_inbound_mptcp(general.inbound.inbound_mptcp);
        dialer.set_unified_delay(general.unified_delay);
        dialer.set_interface(&general.interface_name);

        dialer.set_routing_mark(general.routing_mark);
        if general.routing_mark > 0 {
            tracing::info!("Use routing mark: {:#x}", general.routing_mark);
        }

        dialer.flush_interface_cache();
        dialer.set_geodata_loader(&general.geodata_loader);
    }

    fn update_ntp(&self, cfg: &NtpConfig) {
        let ntp = &self.registry.ntp;
        if !cfg.enable {
            ntp.stop();
            return;
        }
        ntp.recreate(NtpSettings {
            server: cfg.server.clone(),
            port: cfg.port,
            interval: Duration::from_secs(cfg.interval.saturating_mul(60)),
            dialer_proxy: cfg.dialer_proxy.clone(),
            write_to_system: cfg.write_to_system,
        });
    }

    async fn update_listeners(&self, cfg: &ConfigurationSnapshot, force: bool) {
        let reg = &self.registry;
        reg.listeners
            .patch_inbound_listeners(&cfg.listeners, reg.tunnel.clone(), true)
            .await;

        if !force {
            return;
        }

        let inbound = &cfg.general.inbound;
        reg.listeners.set_allow_lan(inbound.allow_lan);
        reg.auth.set_skip_prefixes(inbound.skip_auth_prefixes.clone());
        reg.listeners.set_bind_address(&inbound.bind_address);

        for spec in recreate_plan(inbound) {
            reg.listeners.recreate(spec, reg.tunnel.clone()).await;
        }
    }

    fn update_profile(&self, cfg: &ProfileConfig, proxies: &ProxyMap) {
        let profile = &self.registry.profile;
        profile.set_store_selected(cfg.store_selected);
        profile.set_store_fake_ip(cfg.store_fake_ip);
        if cfg.store_selected {
            self.patch_select_group(proxies);
        }
    }

    /// Re-apply remembered selections onto selector groups.
    fn patch_select_group(&self, proxies: &ProxyMap) {
        let mapping = self.registry.profile.selected_map();
        if mapping.is_empty() {
            return;
        }

        for (name, proxy) in proxies {
            let Some(selector) = proxy.as_selectable() else {
                continue;
            };
            if let Some(selected) = mapping.get(name) {
                selector.force_set(selected);
            }
        }
    }

    /// Live listener, auth and general state.
    pub fn general(&self) -> General {
        let reg = &self.registry;
        let current = self.current.load_full();
        let (ipv6, log_level) = match current.as_deref() {
            Some(cfg) => (cfg.general.ipv6, cfg.general.log_level),
            None => (reg.dialer.ipv6(), reg.logger.level()),
        };

        General {
            ports: reg.listeners.ports(),
            tun: reg.listeners.tun_config(),
            tuic_server: reg.listeners.tuic_config(),
            authentication: reg
                .auth
                .authenticator()
                .map(|a| a.users().to_vec())
                .unwrap_or_default(),
            skip_auth_prefixes: reg.auth.skip_prefixes(),
            allow_lan: reg.listeners.allow_lan(),
            bind_address: reg.listeners.bind_address(),
            mode: reg.tunnel.mode(),
            log_level,
            ipv6,
            geodata_loader: reg.dialer.geodata_loader().to_string(),
            interface_name: reg.dialer.interface(),
            sniffing: reg.tunnel.is_sniffing(),
            tcp_concurrent: reg.dialer.tcp_concurrent(),
        }
    }

    /// Stop serving and persist what must survive a restart.
    pub async fn shutdown(&self) {
        let _guard = self.lock.lock().await;
        let reg = &self.registry;

        reg.listeners.cleanup().await;
        reg.tproxy.cleanup().await;
        reg.dns_server.recreate("", None);
        reg.ntp.stop();

        if reg.profile.store_fake_ip() {
            reg.dns.store_fake_ip_state(&reg.profile);
        }
        if let Err(e) = reg.profile.save_to_file() {
            tracing::warn!(error = %e, "Failed to save profile cache");
        }

        tracing::warn!("tunnel-hub shutting down");
    }
}

fn update_experimental(cfg: &ExperimentalConfig) {
    if cfg.quic_go_disable_gso {
        std::env::set_var("QUIC_GO_DISABLE_GSO", "true");
    }
    if cfg.quic_go_disable_ecn {
        std::env::set_var("QUIC_GO_DISABLE_ECN", "true");
    }
}

// Task lists are collected before the first await so the apply future
// stays Send.
async fn load_proxy_providers(providers: &ProxyProviderMap) {
    let tasks: Vec<_> = providers
        .values()
        .cloned()
        .map(|pv| async move { load_provider(pv.as_ref()).await }.in_current_span())
        .collect();
    run_bounded(tasks, CONCURRENT_LOAD_LIMIT).await;
}

async fn load_rule_providers(providers: &RuleProviderMap) {
    let tasks: Vec<_> = providers
        .values()
        .cloned()
        .map(|pv| async move { load_provider(pv.as_ref()).await }.in_current_span())
        .collect();
    run_bounded(tasks, CONCURRENT_LOAD_LIMIT).await;
}

async fn init_compatible_providers(providers: &ProxyProviderMap) {
    let tasks: Vec<_> = providers
        .values()
        .filter(|pv| pv.vehicle_type() == VehicleType::Compatible)
        .cloned()
        .map(|pv| async move { init_compatible(pv.as_ref()).await }.in_current_span())
        .collect();
    run_bounded(tasks, CONCURRENT_LOAD_LIMIT).await;
}
