//! Configuration schema definitions.
//!
//! This module defines the complete on-disk configuration structure.
//! All types derive Serde traits for deserialization from TOML, with kebab-case keys.

use std::collections::HashMap;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::adapter::AdapterType;
use crate::observability::logging::LogLevel;
use crate::provider::{RuleBehavior, VehicleType};
use crate::tunnel::{FindProcessMode, Mode};

/// Root of a configuration file.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct RawConfig {
    /// Top-level general settings.
    #[serde(flatten)]
    pub general: GeneralConfig,

    pub dns: DnsConfig,
    pub ntp: NtpConfig,
    pub tls: TlsConfig,
    pub iptables: IpTablesConfig,
    pub sniffer: SnifferConfig,
    pub profile: ProfileConfig,
    pub experimental: ExperimentalConfig,

    /// Static port forwards.
    pub tunnels: Vec<TunnelConfig>,

    /// Named inbound listeners.
    pub listeners: Vec<InboundListenerConfig>,

    /// `user:password` pairs for local inbounds.
    pub authentication: Vec<String>,

    /// Static host table.
    pub hosts: HashMap<String, HostEntry>,

    pub proxies: Vec<OutboundConfig>,
    pub proxy_groups: Vec<GroupConfig>,
    pub proxy_providers: HashMap<String, ProxyProviderConfig>,
    pub rule_providers: HashMap<String, RuleProviderConfig>,
    pub rules: Vec<String>,
    pub sub_rules: HashMap<String, Vec<String>>,
}

/// General settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GeneralConfig {
    #[serde(flatten)]
    pub inbound: InboundConfig,

    pub mode: Mode,
    pub log_level: LogLevel,
    pub ipv6: bool,
    pub find_process_mode: FindProcessMode,
    pub tcp_concurrent: bool,
    pub unified_delay: bool,

    /// Outbound interface binding; empty means unbound.
    pub interface_name: String,

    /// SO_MARK for outbound sockets; 0 means unset.
    pub routing_mark: u32,

    /// `standard` or `memconservative`.
    pub geodata_loader: String,

    /// Prometheus exporter bind address.
    pub metrics_address: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            inbound: InboundConfig::default(),
            mode: Mode::Rule,
            log_level: LogLevel::Info,
            ipv6: true,
            find_process_mode: FindProcessMode::Strict,
            tcp_concurrent: false,
            unified_delay: false,
            interface_name: String::new(),
            routing_mark: 0,
            geodata_loader: "memconservative".to_string(),
            metrics_address: None,
        }
    }
}

/// Protocol listener settings. Port 0 disables a listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InboundConfig {
    pub port: u16,
    pub socks_port: u16,
    pub redir_port: u16,
    pub tproxy_port: u16,
    pub mixed_port: u16,

    /// `ss://method:password@host:port`; empty disables.
    #[serde(rename = "ss-config")]
    pub shadowsocks_config: String,

    /// `vmess://uuid@host:port`; empty disables.
    pub vmess_config: String,

    pub tuic_server: TuicServer,
    pub tun: TunConfig,
    pub ebpf: EbpfConfig,

    pub allow_lan: bool,

    /// `*` binds every interface when LAN access is allowed.
    pub bind_address: String,

    pub skip_auth_prefixes: Vec<IpNet>,
    pub inbound_tfo: bool,
    pub inbound_mptcp: bool,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            port: 0,
            socks_port: 0,
            redir_port: 0,
            tproxy_port: 0,
            mixed_port: 0,
            shadowsocks_config: String::new(),
            vmess_config: String::new(),
            tuic_server: TuicServer::default(),
            tun: TunConfig::default(),
            ebpf: EbpfConfig::default(),
            allow_lan: false,
            bind_address: "*".to_string(),
            skip_auth_prefixes: vec![
                "127.0.0.1/32".parse().expect("static prefix"),
                "::1/128".parse().expect("static prefix"),
            ],
            inbound_tfo: false,
            inbound_mptcp: false,
        }
    }
}

/// TUIC server listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct TuicServer {
    pub enable: bool,
    pub listen: String,
    pub token: Vec<String>,
    pub users: HashMap<String, String>,
    pub certificate: String,
    pub private_key: String,
    pub alpn: Vec<String>,
}

/// Tun device settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TunConfig {
    pub enable: bool,
    pub device: String,
    pub stack: String,
    pub dns_hijack: Vec<String>,
    pub auto_route: bool,
    pub auto_detect_interface: bool,
    pub mtu: u32,

    /// Interfaces whose traffic is redirected into the tun device.
    pub redirect_to_tun: Vec<String>,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            enable: false,
            device: String::new(),
            stack: "system".to_string(),
            dns_hijack: vec!["0.0.0.0:53".to_string()],
            auto_route: true,
            auto_detect_interface: true,
            mtu: 9000,
            redirect_to_tun: Vec::new(),
        }
    }
}

/// eBPF redirection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct EbpfConfig {
    /// Interfaces handled by the auto-redir listener.
    pub auto_redir: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EnhancedMode {
    #[default]
    Normal,
    FakeIp,
    RedirHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheAlgorithm {
    #[default]
    Lru,
    Arc,
}

/// DNS subsystem settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DnsConfig {
    pub enable: bool,

    /// UDP listen address, e.g. `127.0.0.1:1053`.
    pub listen: String,

    pub ipv6: bool,

    /// Milliseconds to wait for AAAA after A has answered.
    pub ipv6_timeout: u64,

    pub enhanced_mode: EnhancedMode,
    pub fake_ip_range: Ipv4Net,
    pub fake_ip_filter: Vec<String>,
    pub use_hosts: bool,

    pub nameserver: Vec<String>,
    pub fallback: Vec<String>,
    pub default_nameserver: Vec<String>,

    /// Nameservers used to resolve proxy server hostnames.
    pub proxy_server_nameserver: Vec<String>,

    /// Domain pattern (or `rule-set:<name>`) → nameservers.
    pub nameserver_policy: HashMap<String, Vec<String>>,

    pub fallback_filter: FallbackFilterConfig,
    pub cache_algorithm: CacheAlgorithm,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            listen: String::new(),
            ipv6: false,
            ipv6_timeout: 100,
            enhanced_mode: EnhancedMode::Normal,
            fake_ip_range: "198.18.0.1/16".parse().expect("static range"),
            fake_ip_filter: Vec::new(),
            use_hosts: true,
            nameserver: Vec::new(),
            fallback: Vec::new(),
            default_nameserver: Vec::new(),
            proxy_server_nameserver: Vec::new(),
            nameserver_policy: HashMap::new(),
            fallback_filter: FallbackFilterConfig::default(),
            cache_algorithm: CacheAlgorithm::Lru,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FallbackFilterConfig {
    pub geoip: bool,
    pub geoip_code: String,
    pub ipcidr: Vec<IpNet>,
    pub domain: Vec<String>,
    pub geosite: Vec<String>,
}

impl Default for FallbackFilterConfig {
    fn default() -> Self {
        Self {
            geoip: true,
            geoip_code: "CN".to_string(),
            ipcidr: Vec::new(),
            domain: Vec::new(),
            geosite: Vec::new(),
        }
    }
}

/// NTP client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NtpConfig {
    pub enable: bool,
    pub server: String,
    pub port: u16,
    /// Sync interval in minutes.
    pub interval: u64,
    pub dialer_proxy: String,
    pub write_to_system: bool,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            server: "time.apple.com".to_string(),
            port: 123,
            interval: 30,
            dialer_proxy: String::new(),
            write_to_system: false,
        }
    }
}

/// Extra trust anchors.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct TlsConfig {
    /// PEM encoded certificates.
    pub custom_certificates: Vec<String>,
}

/// Transparent-proxy kernel rule settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IpTablesConfig {
    pub enable: bool,
    pub inbound_interface: String,
    pub bypass: Vec<String>,
    pub dns_redirect: bool,
}

impl Default for IpTablesConfig {
    fn default() -> Self {
        Self {
            enable: false,
            inbound_interface: "lo".to_string(),
            bypass: Vec::new(),
            dns_redirect: true,
        }
    }
}

/// A sniffer port entry: `443` or `"8000-9000"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortEntry {
    Single(u16),
    Range(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct SniffConfig {
    pub ports: Vec<PortEntry>,
    pub override_destination: Option<bool>,
}

/// Protocol sniffing settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SnifferConfig {
    pub enable: bool,
    pub force_dns_mapping: bool,
    pub parse_pure_ip: bool,
    pub override_destination: bool,

    /// Sniffer kind (`HTTP`, `TLS`, `QUIC`) → ports.
    pub sniff: HashMap<String, SniffConfig>,

    pub force_domain: Vec<String>,
    pub skip_domain: Vec<String>,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            enable: false,
            force_dns_mapping: true,
            parse_pure_ip: true,
            override_destination: true,
            sniff: HashMap::new(),
            force_domain: Vec::new(),
            skip_domain: Vec::new(),
        }
    }
}

/// Profile persistence settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProfileConfig {
    pub store_selected: bool,
    pub store_fake_ip: bool,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            store_selected: true,
            store_fake_ip: false,
        }
    }
}

/// Toggles for the QUIC transport library.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExperimentalConfig {
    pub quic_go_disable_gso: bool,
    pub quic_go_disable_ecn: bool,
}

/// Static port forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelConfig {
    #[serde(default = "default_tunnel_network")]
    pub network: Vec<String>,
    pub address: String,
    pub target: String,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_tunnel_network() -> Vec<String> {
    vec!["tcp".to_string()]
}

/// Named inbound listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InboundListenerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    pub port: u16,
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

/// Static host entry: one address/alias or a list of addresses.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HostEntry {
    One(String),
    Many(Vec<String>),
}

/// Outbound node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutboundConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AdapterType,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Proxy group.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AdapterType,
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default, rename = "use")]
    pub use_providers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProviderHealthCheck {
    pub enable: bool,
    pub timeout_ms: u64,
}

impl Default for ProviderHealthCheck {
    fn default() -> Self {
        Self {
            enable: true,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyProviderConfig {
    #[serde(rename = "type")]
    pub vehicle: VehicleType,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Inline members of a compatible provider.
    #[serde(default)]
    pub proxies: Vec<OutboundConfig>,
    #[serde(default)]
    pub health_check: ProviderHealthCheck,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuleProviderConfig {
    #[serde(rename = "type")]
    pub vehicle: VehicleType,
    #[serde(default)]
    pub behavior: RuleBehavior,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg: RawConfig = toml::from_str("mixed-port = 7890").unwrap();
        assert_eq!(cfg.general.inbound.mixed_port, 7890);
        assert_eq!(cfg.general.mode, Mode::Rule);
        assert!(cfg.general.ipv6);
        assert!(!cfg.dns.enable);
        assert_eq!(cfg.dns.fake_ip_range.to_string(), "198.18.0.1/16");
        assert!(cfg.profile.store_selected);
    }

    #[test]
    fn test_sections_deserialize() {
        let cfg: RawConfig = toml::from_str(
            r#"
            mode = "global"
            log-level = "warning"
            ss-config = "ss://aes-128-gcm:pw@127.0.0.1:8388"
            rules = ["MATCH,DIRECT"]

            [tun]
            enable = true
            redirect-to-tun = ["eth1"]

            [dns]
            enable = true
            listen = "127.0.0.1:1053"
            enhanced-mode = "fake-ip"
            fake-ip-range = "198.18.0.1/16"

            [[proxies]]
            name = "NodeA"
            type = "ss"
            server = "1.2.3.4"
            port = 443

            [[proxy-groups]]
            name = "Auto"
            type = "select"
            proxies = ["NodeA", "DIRECT"]

            [proxy-providers.remote]
            type = "http"
            url = "http://example.com/p.toml"
            path = "providers/remote.toml"

            [sniffer.sniff.TLS]
            ports = [443, "8443-8444"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.general.mode, Mode::Global);
        assert_eq!(cfg.general.log_level, LogLevel::Warning);
        assert!(cfg.general.inbound.tun.enable);
        assert_eq!(cfg.general.inbound.tun.redirect_to_tun, vec!["eth1".to_string()]);
        assert_eq!(cfg.dns.enhanced_mode, EnhancedMode::FakeIp);
        assert_eq!(cfg.proxies[0].kind, AdapterType::Shadowsocks);
        assert_eq!(cfg.proxy_groups[0].kind, AdapterType::Selector);
        assert_eq!(cfg.proxy_providers["remote"].vehicle, VehicleType::Http);
        assert_eq!(
            cfg.sniffer.sniff["TLS"].ports,
            vec![PortEntry::Single(443), PortEntry::Range("8443-8444".into())]
        );
    }
}
