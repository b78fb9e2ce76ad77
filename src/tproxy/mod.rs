//! Transparent-proxy kernel rules.
//!
//! # Data Flow
//! ```text
//! Executor step: cleanup previous rules
//!     → preconditions (tun off, tproxy port, DNS enabled + listen address)
//!     → routing mark fallback
//!     → RuleInstaller::install
//! ```
//!
//! # Design Decisions
//! - Every failure after cleanup is fatal; the caller turns it into a process exit
//! - Preconditions are checked before any rule is written, so a failed pass leaves nothing installed

pub mod iptables;

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::component::dialer::DialerSettings;
use crate::config::schema::{DnsConfig, GeneralConfig, IpTablesConfig};

pub use iptables::IptablesInstaller;

/// Routing mark assigned when none is configured.
pub const DEFAULT_ROUTING_MARK: u32 = 2158;

#[derive(Debug, Error)]
pub enum TProxyError {
    #[error("when tun is enabled, iptables cannot be set automatically")]
    TunEnabled,
    #[error("tproxy-port must be greater than zero")]
    ZeroPort,
    #[error("DNS server must be enabled")]
    DnsDisabled,
    #[error("DNS listen address {0:?} is not a valid address:port")]
    InvalidDnsListen(String),
    #[error("{command}: {reason}")]
    Install { command: String, reason: String },
}

/// Rules to install for one apply pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TProxyRules {
    pub interface: String,
    pub bypass: Vec<String>,
    pub port: u16,
    pub dns_port: u16,
    pub routing_mark: u32,
    pub dns_redirect: bool,
}

/// OS-specific rule installer.
#[async_trait]
pub trait RuleInstaller: Send + Sync {
    fn supported(&self) -> bool {
        cfg!(target_os = "linux")
    }

    /// Remove whatever this process installed. No-op when nothing is installed.
    async fn cleanup(&self);

    async fn install(&self, rules: &TProxyRules) -> Result<(), TProxyError>;
}

/// Reinstall transparent-proxy rules for the new configuration.
pub async fn update_iptables(
    installer: &dyn RuleInstaller,
    cfg: &IpTablesConfig,
    general: &GeneralConfig,
    dns: &DnsConfig,
    dialer: &DialerSettings,
) -> Result<(), TProxyError> {
    installer.cleanup().await;

    if !installer.supported() || !cfg.enable {
        return Ok(());
    }

    if general.inbound.tun.enable {
        return Err(TProxyError::TunEnabled);
    }

    let port = general.inbound.tproxy_port;
    if port == 0 {
        return Err(TProxyError::ZeroPort);
    }

    if !dns.enable {
        return Err(TProxyError::DnsDisabled);
    }

    let dns_addr: SocketAddr = dns
        .listen
        .parse()
        .map_err(|_| TProxyError::InvalidDnsListen(dns.listen.clone()))?;

    let interface = if cfg.inbound_interface.is_empty() {
        "lo".to_string()
    } else {
        cfg.inbound_interface.clone()
    };

    if dialer.routing_mark() == 0 {
        dialer.set_routing_mark(DEFAULT_ROUTING_MARK);
    }

    let rules = TProxyRules {
        interface,
        bypass: cfg.bypass.clone(),
        port,
        dns_port: dns_addr.port(),
        routing_mark: dialer.routing_mark(),
        dns_redirect: cfg.dns_redirect,
    };
    installer.install(&rules).await?;

    tracing::info!("[IPTABLES] Setting iptables completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        cleanups: Mutex<usize>,
        installed: Mutex<Vec<TProxyRules>>,
    }

    #[async_trait]
    impl RuleInstaller for Recording {
        fn supported(&self) -> bool {
            true
        }

        async fn cleanup(&self) {
            *self.cleanups.lock() += 1;
        }

        async fn install(&self, rules: &TProxyRules) -> Result<(), TProxyError> {
            self.installed.lock().push(rules.clone());
            Ok(())
        }
    }

    fn configs() -> (IpTablesConfig, GeneralConfig, DnsConfig) {
        let iptables = IpTablesConfig {
            enable: true,
            ..Default::default()
        };
        let mut general = GeneralConfig::default();
        general.inbound.tproxy_port = 7895;
        let dns = DnsConfig {
            enable: true,
            listen: "0.0.0.0:1053".into(),
            ..Default::default()
        };
        (iptables, general, dns)
    }

    #[tokio::test]
    async fn test_install_assigns_fallback_mark() {
        let installer = Recording::default();
        let dialer = DialerSettings::new();
        let (iptables, general, dns) = configs();

        update_iptables(&installer, &iptables, &general, &dns, &dialer)
            .await
            .unwrap();

        assert_eq!(dialer.routing_mark(), DEFAULT_ROUTING_MARK);
        let installed = installer.installed.lock();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].port, 7895);
        assert_eq!(installed[0].dns_port, 1053);
        assert_eq!(installed[0].interface, "lo");
    }

    #[tokio::test]
    async fn test_preconditions_fail_after_cleanup() {
        let dialer = DialerSettings::new();

        let (iptables, mut general, dns) = configs();
        general.inbound.tun.enable = true;
        let installer = Recording::default();
        let err = update_iptables(&installer, &iptables, &general, &dns, &dialer).await;
        assert!(matches!(err, Err(TProxyError::TunEnabled)));
        assert_eq!(*installer.cleanups.lock(), 1);
        assert!(installer.installed.lock().is_empty());

        let (iptables, mut general, dns) = configs();
        general.inbound.tproxy_port = 0;
        let err = update_iptables(&installer, &iptables, &general, &dns, &dialer).await;
        assert!(matches!(err, Err(TProxyError::ZeroPort)));

        let (iptables, general, mut dns) = configs();
        dns.enable = false;
        let err = update_iptables(&installer, &iptables, &general, &dns, &dialer).await;
        assert!(matches!(err, Err(TProxyError::DnsDisabled)));

        let (iptables, general, mut dns) = configs();
        dns.listen = "localhost".into();
        let err = update_iptables(&installer, &iptables, &general, &dns, &dialer).await;
        assert!(matches!(err, Err(TProxyError::InvalidDnsListen(_))));

        assert!(installer.installed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_only_cleans_up() {
        let installer = Recording::default();
        let (mut iptables, general, dns) = configs();
        iptables.enable = false;
        update_iptables(&installer, &iptables, &general, &dns, &DialerSettings::new())
            .await
            .unwrap();
        assert_eq!(*installer.cleanups.lock(), 1);
        assert!(installer.installed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_configured_mark_is_kept() {
        let installer = Recording::default();
        let dialer = DialerSettings::new();
        dialer.set_routing_mark(6666);
        let (iptables, general, dns) = configs();
        update_iptables(&installer, &iptables, &general, &dns, &dialer)
            .await
            .unwrap();
        assert_eq!(installer.installed.lock()[0].routing_mark, 6666);
    }
}
