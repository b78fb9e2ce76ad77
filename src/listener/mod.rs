//! Inbound listener management.
//!
//! # Data Flow
//! ```text
//! Executor (force recreate)
//!     → recreate_plan(inbound config)   fixed role order
//!     → InboundManager::recreate(spec)  stop role, bind new
//!     → set.rs accept loop → Dispatcher::handle_tcp
//! ```
//!
//! # Design Decisions
//! - One listener per role; recreating a role replaces it, never adds a second one
//! - Named listeners are patched on every apply, protocol roles only on force

pub mod inner;
pub mod set;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::schema::{
    EbpfConfig, InboundConfig, InboundListenerConfig, TuicServer, TunConfig, TunnelConfig,
};
use crate::tunnel::Dispatcher;

pub use inner::InnerEntry;
pub use set::ListenerSet;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid listener config {config:?}: {reason}")]
    InvalidConfig { config: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerRole {
    Http,
    Socks,
    Redir,
    AutoRedir,
    TProxy,
    Mixed,
    Shadowsocks,
    Vmess,
    Tuic,
}

impl ListenerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerRole::Http => "http",
            ListenerRole::Socks => "socks",
            ListenerRole::Redir => "redir",
            ListenerRole::AutoRedir => "auto-redir",
            ListenerRole::TProxy => "tproxy",
            ListenerRole::Mixed => "mixed",
            ListenerRole::Shadowsocks => "shadowsocks",
            ListenerRole::Vmess => "vmess",
            ListenerRole::Tuic => "tuic",
        }
    }
}

impl fmt::Display for ListenerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired state of one protocol role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerSpec {
    Http(u16),
    Socks(u16),
    Redir(u16),
    AutoRedir(EbpfConfig),
    TProxy(u16),
    Mixed(u16),
    Shadowsocks(String),
    Vmess(String),
    Tuic(TuicServer),
}

impl ListenerSpec {
    pub fn role(&self) -> ListenerRole {
        match self {
            ListenerSpec::Http(_) => ListenerRole::Http,
            ListenerSpec::Socks(_) => ListenerRole::Socks,
            ListenerSpec::Redir(_) => ListenerRole::Redir,
            ListenerSpec::AutoRedir(_) => ListenerRole::AutoRedir,
            ListenerSpec::TProxy(_) => ListenerRole::TProxy,
            ListenerSpec::Mixed(_) => ListenerRole::Mixed,
            ListenerSpec::Shadowsocks(_) => ListenerRole::Shadowsocks,
            ListenerSpec::Vmess(_) => ListenerRole::Vmess,
            ListenerSpec::Tuic(_) => ListenerRole::Tuic,
        }
    }
}

/// Protocol listeners in the order they are recreated.
pub fn recreate_plan(inbound: &InboundConfig) -> Vec<ListenerSpec> {
    let mut plan = vec![
        ListenerSpec::Http(inbound.port),
        ListenerSpec::Socks(inbound.socks_port),
        ListenerSpec::Redir(inbound.redir_port),
    ];
    if !cfg!(target_os = "android") {
        plan.push(ListenerSpec::AutoRedir(inbound.ebpf.clone()));
    }
    plan.extend([
        ListenerSpec::TProxy(inbound.tproxy_port),
        ListenerSpec::Mixed(inbound.mixed_port),
        ListenerSpec::Shadowsocks(inbound.shadowsocks_config.clone()),
        ListenerSpec::Vmess(inbound.vmess_config.clone()),
        ListenerSpec::Tuic(inbound.tuic_server.clone()),
    ]);
    plan
}

/// Live listener ports and socket specs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Ports {
    pub port: u16,
    pub socks_port: u16,
    pub redir_port: u16,
    pub tproxy_port: u16,
    pub mixed_port: u16,
    pub shadowsocks_config: String,
    pub vmess_config: String,
}

/// Listener management used by the executor.
#[async_trait]
pub trait InboundManager: Send + Sync {
    /// Bring named listeners in line with `listeners`. Stale ones are stopped when `cleanup_stale`.
    async fn patch_inbound_listeners(
        &self,
        listeners: &HashMap<String, InboundListenerConfig>,
        tunnel: Arc<dyn Dispatcher>,
        cleanup_stale: bool,
    );

    fn set_allow_lan(&self, allow: bool);
    fn set_bind_address(&self, addr: &str);
    fn allow_lan(&self) -> bool;
    fn bind_address(&self) -> String;

    /// Stop the listener currently holding `spec`'s role, then start `spec`.
    async fn recreate(&self, spec: ListenerSpec, tunnel: Arc<dyn Dispatcher>);

    async fn recreate_tun(&self, cfg: &TunConfig, tunnel: Arc<dyn Dispatcher>);
    async fn recreate_redir_to_tun(&self, interfaces: &[String]);
    async fn patch_tunnels(&self, tunnels: &[TunnelConfig], tunnel: Arc<dyn Dispatcher>);

    fn ports(&self) -> Ports;
    fn tun_config(&self) -> TunConfig;
    fn tuic_config(&self) -> TuicServer;

    /// Stop everything.
    async fn cleanup(&self);
}

/// Listen address for a role port, honouring allow-lan and bind-address.
pub fn gen_addr(bind_address: &str, port: u16, allow_lan: bool) -> String {
    if !allow_lan {
        return format!("127.0.0.1:{}", port);
    }
    match bind_address {
        "*" | "" => format!("0.0.0.0:{}", port),
        host if host.contains(':') && !host.starts_with('[') => format!("[{}]:{}", host, port),
        host => format!("{}:{}", host, port),
    }
}
