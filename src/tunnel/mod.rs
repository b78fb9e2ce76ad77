//! Dispatch engine interface.
//!
//! # Data Flow
//! ```text
//! listener accept loop / inner loopback
//!     → Dispatcher::handle_tcp (admission gate)
//!     → queued for the forwarding engine
//!
//! Executor apply pass:
//!     on_suspend → update_* → on_inner_loading → on_running
//! ```
//!
//! # Design Decisions
//! - The executor only drives the admission state machine and publishes new state;
//!   it never looks at connections
//! - `Dispatcher` is the seam: the bundled `Tunnel` is one implementation, tests wrap it

pub mod state;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::adapter::ProxyMap;
use crate::component::sniffer::SnifferDispatcher;
use crate::provider::{ProxyProviderMap, RuleProviderMap};
use crate::rules::Rule;

pub use state::Tunnel;

/// Traffic routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Global,
    #[default]
    Rule,
    Direct,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Global => write!(f, "global"),
            Mode::Rule => write!(f, "rule"),
            Mode::Direct => write!(f, "direct"),
        }
    }
}

/// Process-name matching mode used by process rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FindProcessMode {
    Always,
    #[default]
    Strict,
    Off,
}

/// Admission state of the dispatch engine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Suspend = 0,
    InnerLoading = 1,
    Running = 2,
}

impl From<u8> for TunnelStatus {
    fn from(val: u8) -> Self {
        match val {
            1 => TunnelStatus::InnerLoading,
            2 => TunnelStatus::Running,
            _ => TunnelStatus::Suspend,
        }
    }
}

/// Where a connection entered the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InboundKind {
    Http,
    Socks,
    Redir,
    TProxy,
    Mixed,
    Shadowsocks,
    Vmess,
    Tunnel,
    Inner,
    Listener(String),
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundKind::Http => write!(f, "http"),
            InboundKind::Socks => write!(f, "socks"),
            InboundKind::Redir => write!(f, "redir"),
            InboundKind::TProxy => write!(f, "tproxy"),
            InboundKind::Mixed => write!(f, "mixed"),
            InboundKind::Shadowsocks => write!(f, "shadowsocks"),
            InboundKind::Vmess => write!(f, "vmess"),
            InboundKind::Tunnel => write!(f, "tunnel"),
            InboundKind::Inner => write!(f, "inner"),
            InboundKind::Listener(name) => write!(f, "listener:{}", name),
        }
    }
}

/// Byte stream handed over by an inbound.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A connection waiting to be dispatched.
pub struct InboundConnection {
    pub stream: Box<dyn AsyncStream>,
    pub source: Option<SocketAddr>,
    pub inbound: InboundKind,
    /// Fixed destination, set by static tunnels and the inner entry point.
    pub target: Option<String>,
    /// Outbound requested by a static tunnel.
    pub proxy: Option<String>,
}

impl fmt::Debug for InboundConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundConnection")
            .field("source", &self.source)
            .field("inbound", &self.inbound)
            .field("target", &self.target)
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// Operations the executor and the listeners need from the dispatch engine.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn on_suspend(&self);
    fn on_inner_loading(&self);
    fn on_running(&self);
    fn status(&self) -> TunnelStatus;

    fn update_proxies(&self, proxies: ProxyMap, providers: ProxyProviderMap);
    fn update_rules(
        &self,
        rules: Vec<Rule>,
        sub_rules: HashMap<String, Vec<Rule>>,
        providers: RuleProviderMap,
    );
    fn update_sniffer(&self, dispatcher: Option<Arc<SnifferDispatcher>>);

    fn set_mode(&self, mode: Mode);
    fn mode(&self) -> Mode;
    fn set_find_process_mode(&self, mode: FindProcessMode);
    fn is_sniffing(&self) -> bool;

    /// Admit a connection. Waits while the engine is not accepting this kind of traffic.
    async fn handle_tcp(&self, conn: InboundConnection);
}
