//! Outbound dialer settings.
//!
//! Plain atomics read by the forwarding engine on every dial; written only
//! from the apply pass.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

/// How geodata databases are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeodataLoader {
    Standard,
    #[default]
    MemConservative,
}

impl GeodataLoader {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Some(GeodataLoader::Standard),
            "memconservative" => Some(GeodataLoader::MemConservative),
            _ => None,
        }
    }
}

impl fmt::Display for GeodataLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeodataLoader::Standard => write!(f, "standard"),
            GeodataLoader::MemConservative => write!(f, "memconservative"),
        }
    }
}

#[derive(Default)]
pub struct DialerSettings {
    tcp_concurrent: AtomicBool,
    inbound_tfo: AtomicBool,
    inbound_mptcp: AtomicBool,
    unified_delay: AtomicBool,
    disable_ipv6: AtomicBool,
    routing_mark: AtomicU32,
    interface: RwLock<String>,
    geodata_loader: RwLock<GeodataLoader>,
    /// Bumped on every flush; cached interface lookups older than this are stale.
    iface_generation: AtomicU64,
}

impl DialerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tcp_concurrent(&self, on: bool) {
        self.tcp_concurrent.store(on, Ordering::Relaxed);
    }

    pub fn tcp_concurrent(&self) -> bool {
        self.tcp_concurrent.load(Ordering::Relaxed)
    }

    pub fn set_inbound_tfo(&self, on: bool) {
        self.inbound_tfo.store(on, Ordering::Relaxed);
    }

    pub fn inbound_tfo(&self) -> bool {
        self.inbound_tfo.load(Ordering::Relaxed)
    }

    pub fn set_inbound_mptcp(&self, on: bool) {
        self.inbound_mptcp.store(on, Ordering::Relaxed);
    }

    pub fn inbound_mptcp(&self) -> bool {
        self.inbound_mptcp.load(Ordering::Relaxed)
    }

    pub fn set_unified_delay(&self, on: bool) {
        self.unified_delay.store(on, Ordering::Relaxed);
    }

    pub fn unified_delay(&self) -> bool {
        self.unified_delay.load(Ordering::Relaxed)
    }

    pub fn set_ipv6(&self, enabled: bool) {
        self.disable_ipv6.store(!enabled, Ordering::Relaxed);
    }

    pub fn ipv6(&self) -> bool {
        !self.disable_ipv6.load(Ordering::Relaxed)
    }

    pub fn set_routing_mark(&self, mark: u32) {
        self.routing_mark.store(mark, Ordering::Relaxed);
    }

    pub fn routing_mark(&self) -> u32 {
        self.routing_mark.load(Ordering::Relaxed)
    }

    pub fn set_interface(&self, name: &str) {
        *self.interface.write() = name.to_string();
    }

    pub fn interface(&self) -> String {
        self.interface.read().clone()
    }

    /// Unknown loader names fall back to the default and are logged.
    pub fn set_geodata_loader(&self, name: &str) {
        let loader = GeodataLoader::parse(name).unwrap_or_else(|| {
            tracing::warn!(loader = %name, "Unknown geodata loader, using memconservative");
            GeodataLoader::default()
        });
        *self.geodata_loader.write() = loader;
    }

    pub fn geodata_loader(&self) -> GeodataLoader {
        *self.geodata_loader.read()
    }

    pub fn flush_interface_cache(&self) {
        self.iface_generation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn interface_generation(&self) -> u64 {
        self.iface_generation.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let d = DialerSettings::new();
        assert!(d.ipv6());
        assert_eq!(d.routing_mark(), 0);
        assert_eq!(d.geodata_loader(), GeodataLoader::MemConservative);
    }

    #[test]
    fn test_setters() {
        let d = DialerSettings::new();
        d.set_ipv6(false);
        d.set_routing_mark(255);
        d.set_interface("eth0");
        d.set_geodata_loader("standard");
        d.flush_interface_cache();

        assert!(!d.ipv6());
        assert_eq!(d.routing_mark(), 255);
        assert_eq!(d.interface(), "eth0");
        assert_eq!(d.geodata_loader(), GeodataLoader::Standard);
        assert_eq!(d.interface_generation(), 1);

        d.set_geodata_loader("bogus");
        assert_eq!(d.geodata_loader(), GeodataLoader::MemConservative);
    }
}
