//! Protocol sniffing settings.
//!
//! The dispatch engine consults the installed [`SnifferDispatcher`] to decide
//! whether to peek at a connection's first bytes (HTTP Host, TLS SNI, QUIC)
//! before routing. Sniffing itself is done by the engine.

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;

use thiserror::Error;

use crate::config::schema::{PortEntry, SnifferConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnifferError {
    #[error("unknown sniffer {0}")]
    UnknownSniffer(String),
    #[error("invalid port range {0:?}")]
    InvalidPort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnifferKind {
    Http,
    Tls,
    Quic,
}

impl SnifferKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Some(SnifferKind::Http),
            "TLS" => Some(SnifferKind::Tls),
            "QUIC" => Some(SnifferKind::Quic),
            _ => None,
        }
    }
}

impl fmt::Display for SnifferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnifferKind::Http => write!(f, "HTTP"),
            SnifferKind::Tls => write!(f, "TLS"),
            SnifferKind::Quic => write!(f, "QUIC"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SniffSetting {
    pub ports: Vec<RangeInclusive<u16>>,
    pub override_destination: bool,
}

#[derive(Debug)]
pub struct SnifferDispatcher {
    enabled: bool,
    sniffers: HashMap<SnifferKind, SniffSetting>,
    force_domain: Vec<String>,
    skip_domain: Vec<String>,
    force_dns_mapping: bool,
    parse_pure_ip: bool,
}

fn parse_port(entry: &PortEntry) -> Result<RangeInclusive<u16>, SnifferError> {
    match entry {
        PortEntry::Single(p) => Ok(*p..=*p),
        PortEntry::Range(s) => {
            let invalid = || SnifferError::InvalidPort(s.clone());
            match s.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u16 = lo.trim().parse().map_err(|_| invalid())?;
                    let hi: u16 = hi.trim().parse().map_err(|_| invalid())?;
                    if lo > hi {
                        return Err(invalid());
                    }
                    Ok(lo..=hi)
                }
                None => {
                    let p: u16 = s.trim().parse().map_err(|_| invalid())?;
                    Ok(p..=p)
                }
            }
        }
    }
}

impl SnifferDispatcher {
    pub fn new(cfg: &SnifferConfig) -> Result<Self, SnifferError> {
        let mut sniffers = HashMap::with_capacity(cfg.sniff.len());
        for (name, setting) in &cfg.sniff {
            let kind =
                SnifferKind::parse(name).ok_or_else(|| SnifferError::UnknownSniffer(name.clone()))?;
            let ports = setting
                .ports
                .iter()
                .map(parse_port)
                .collect::<Result<Vec<_>, _>>()?;
            sniffers.insert(
                kind,
                SniffSetting {
                    ports,
                    override_destination: setting
                        .override_destination
                        .unwrap_or(cfg.override_destination),
                },
            );
        }

        Ok(Self {
            enabled: true,
            sniffers,
            force_domain: cfg.force_domain.clone(),
            skip_domain: cfg.skip_domain.clone(),
            force_dns_mapping: cfg.force_dns_mapping,
            parse_pure_ip: cfg.parse_pure_ip,
        })
    }

    /// A dispatcher that never sniffs.
    pub fn closed() -> Self {
        Self {
            enabled: false,
            sniffers: HashMap::new(),
            force_domain: Vec::new(),
            skip_domain: Vec::new(),
            force_dns_mapping: false,
            parse_pure_ip: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Sniffers configured for a destination port.
    pub fn sniffers_for(&self, port: u16) -> Vec<SnifferKind> {
        if !self.enabled {
            return Vec::new();
        }
        let mut kinds: Vec<_> = self
            .sniffers
            .iter()
            .filter(|(_, s)| s.ports.iter().any(|r| r.contains(&port)))
            .map(|(k, _)| *k)
            .collect();
        kinds.sort_by_key(|k| *k as u8);
        kinds
    }

    pub fn setting(&self, kind: SnifferKind) -> Option<&SniffSetting> {
        self.sniffers.get(&kind)
    }

    pub fn force_domain(&self) -> &[String] {
        &self.force_domain
    }

    pub fn skip_domain(&self) -> &[String] {
        &self.skip_domain
    }

    pub fn force_dns_mapping(&self) -> bool {
        self.force_dns_mapping
    }

    pub fn parse_pure_ip(&self) -> bool {
        self.parse_pure_ip
    }
}
