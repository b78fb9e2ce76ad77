//! Outbound proxy adapters.
//!
//! # Responsibilities
//! - Represent configured outbound nodes and proxy groups
//! - Expose the selector capability used to restore remembered selections
//!
//! # Design Decisions
//! - Adapters are shared as `Arc<dyn Proxy>`; group state uses interior mutability
//! - Only `select` groups are selectable; `url-test` and `fallback` pick members themselves

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::schema::OutboundConfig;

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";

/// Name → adapter map published to the dispatch engine.
pub type ProxyMap = HashMap<String, Arc<dyn Proxy>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterType {
    Direct,
    Reject,
    Http,
    Socks5,
    #[serde(rename = "ss")]
    Shadowsocks,
    Vmess,
    Trojan,
    Tuic,
    #[serde(rename = "select")]
    Selector,
    UrlTest,
    Fallback,
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterType::Direct => "Direct",
            AdapterType::Reject => "Reject",
            AdapterType::Http => "Http",
            AdapterType::Socks5 => "Socks5",
            AdapterType::Shadowsocks => "Shadowsocks",
            AdapterType::Vmess => "Vmess",
            AdapterType::Trojan => "Trojan",
            AdapterType::Tuic => "Tuic",
            AdapterType::Selector => "Selector",
            AdapterType::UrlTest => "URLTest",
            AdapterType::Fallback => "Fallback",
        };
        f.write_str(name)
    }
}

impl AdapterType {
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            AdapterType::Selector | AdapterType::UrlTest | AdapterType::Fallback
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("proxy {proxy} not found in group {group}")]
    NotMember { group: String, proxy: String },
}

/// A group whose active member can be chosen from outside.
pub trait SelectAble: Send + Sync {
    fn selected(&self) -> String;
    fn set(&self, name: &str) -> Result<(), AdapterError>;
    /// Select without checking membership; used when restoring persisted choices.
    fn force_set(&self, name: &str);
}

pub trait Proxy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn adapter_type(&self) -> AdapterType;

    /// `host:port` of the remote server, if the adapter dials one.
    fn server(&self) -> Option<String> {
        None
    }

    fn as_selectable(&self) -> Option<&dyn SelectAble> {
        None
    }
}

/// A single outbound node.
#[derive(Debug, Clone)]
pub struct Outbound {
    name: String,
    kind: AdapterType,
    server: Option<String>,
}

impl Outbound {
    pub fn new(name: impl Into<String>, kind: AdapterType, server: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            server,
        }
    }

    pub fn direct() -> Self {
        Self::new(DIRECT, AdapterType::Direct, None)
    }

    pub fn reject() -> Self {
        Self::new(REJECT, AdapterType::Reject, None)
    }
}

impl From<&OutboundConfig> for Outbound {
    fn from(cfg: &OutboundConfig) -> Self {
        let server = match (&cfg.server, cfg.port) {
            (Some(host), Some(port)) if host.contains(':') => Some(format!("[{}]:{}", host, port)),
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            (Some(host), None) => Some(host.clone()),
            (None, _) => None,
        };
        Self::new(cfg.name.clone(), cfg.kind, server)
    }
}

impl Proxy for Outbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        self.kind
    }

    fn server(&self) -> Option<String> {
        self.server.clone()
    }
}

/// Manually switched group.
#[derive(Debug)]
pub struct Selector {
    name: String,
    members: Vec<String>,
    selected: RwLock<String>,
}

impl Selector {
    pub fn new(name: impl Into<String>, members: Vec<String>) -> Self {
        let first = members.first().cloned().unwrap_or_else(|| DIRECT.to_string());
        Self {
            name: name.into(),
            members,
            selected: RwLock::new(first),
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}

impl SelectAble for Selector {
    fn selected(&self) -> String {
        self.selected.read().clone()
    }

    fn set(&self, name: &str) -> Result<(), AdapterError> {
        if !self.members.iter().any(|m| m == name) {
            return Err(AdapterError::NotMember {
                group: self.name.clone(),
                proxy: name.to_string(),
            });
        }
        *self.selected.write() = name.to_string();
        Ok(())
    }

    fn force_set(&self, name: &str) {
        *self.selected.write() = name.to_string();
    }
}

impl Proxy for Selector {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Selector
    }

    fn as_selectable(&self) -> Option<&dyn SelectAble> {
        Some(self)
    }
}

/// Automatically switched group (`url-test` / `fallback`).
#[derive(Debug)]
pub struct AutoGroup {
    name: String,
    kind: AdapterType,
    members: Vec<String>,
}

impl AutoGroup {
    pub fn new(name: impl Into<String>, kind: AdapterType, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            members,
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}

impl Proxy for AutoGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        self.kind
    }
}
