//! Fake-IP pool and host mapper.
//!
//! # Responsibilities
//! - Hand out synthetic IPv4 addresses for domains in `fake-ip` mode
//! - Map addresses back to the domain they were handed out for
//! - Carry mappings over to a new instance on reconfiguration
//!
//! # Design Decisions
//! - The first host of the range is the gateway; allocation starts at the second
//! - Network and broadcast addresses are never handed out
//! - When the pool is exhausted the least recently used mapping is recycled

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;

use ipnet::Ipv4Net;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

use crate::component::profile::FakeIpState;
use crate::config::schema::EnhancedMode;

/// Capacity of the reverse mapping cache used outside fake-ip mode.
const MAPPING_CACHE_SIZE: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FakeIpError {
    #[error("fake-ip range {0} has no allocatable address")]
    RangeTooSmall(Ipv4Net),
}

#[derive(Debug)]
pub struct FakeIpPool {
    range: Ipv4Net,
    gateway: Ipv4Addr,
    /// First allocatable address as an integer.
    first: u32,
    capacity: u32,
    /// Offset of the next never-used address.
    cursor: u32,
    by_host: LruCache<String, Ipv4Addr>,
    by_ip: std::collections::HashMap<Ipv4Addr, String>,
}

impl FakeIpPool {
    pub fn new(range: Ipv4Net) -> Result<Self, FakeIpError> {
        let network = u32::from(range.network());
        let broadcast = u32::from(range.broadcast());
        // network, gateway and broadcast are reserved
        let capacity = broadcast.saturating_sub(network).saturating_sub(2);
        let lru_cap =
            NonZeroUsize::new(capacity as usize).ok_or(FakeIpError::RangeTooSmall(range))?;
        Ok(Self {
            range,
            gateway: Ipv4Addr::from(network + 1),
            first: network + 2,
            capacity,
            cursor: 0,
            by_host: LruCache::new(lru_cap),
            by_ip: std::collections::HashMap::new(),
        })
    }

    pub fn range(&self) -> Ipv4Net {
        self.range
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }

    fn allocatable(&self, ip: Ipv4Addr) -> bool {
        let n = u32::from(ip);
        n >= self.first && n < self.first + self.capacity
    }

    /// Fake address for `host`, allocating one if needed.
    pub fn lookup(&mut self, host: &str) -> Ipv4Addr {
        if let Some(ip) = self.by_host.get(host) {
            return *ip;
        }

        let ip = if self.cursor < self.capacity {
            let ip = Ipv4Addr::from(self.first + self.cursor);
            self.cursor += 1;
            ip
        } else {
            // Exhausted: reuse the least recently used address.
            match self.by_host.pop_lru() {
                Some((old_host, ip)) => {
                    self.by_ip.remove(&ip);
                    tracing::debug!(host = %old_host, ip = %ip, "[DNS] fake-ip recycled");
                    ip
                }
                None => Ipv4Addr::from(self.first),
            }
        };

        self.insert(host.to_string(), ip);
        ip
    }

    fn insert(&mut self, host: String, ip: Ipv4Addr) {
        if let Some(prev) = self.by_ip.remove(&ip) {
            self.by_host.pop(&prev);
        }
        if let Some((_, evicted)) = self.by_host.push(host.clone(), ip) {
            if evicted != ip {
                self.by_ip.remove(&evicted);
            }
        }
        self.by_ip.insert(ip, host);

        let offset = u32::from(ip) - self.first;
        if offset >= self.cursor {
            self.cursor = offset + 1;
        }
    }

    /// Domain a fake address was handed out for. Refreshes the mapping.
    pub fn find_host(&mut self, ip: Ipv4Addr) -> Option<String> {
        let host = self.by_ip.get(&ip)?.clone();
        self.by_host.get(&host);
        Some(host)
    }

    pub fn exists(&self, ip: Ipv4Addr) -> bool {
        self.by_ip.contains_key(&ip)
    }

    /// Mappings, least recently used first.
    pub fn mappings(&self) -> Vec<(String, Ipv4Addr)> {
        let mut out: Vec<_> = self.by_host.iter().map(|(h, ip)| (h.clone(), *ip)).collect();
        out.reverse();
        out
    }

    /// Copy every mapping of `old` that fits this pool's range.
    pub fn clone_from_pool(&mut self, old: &FakeIpPool) {
        for (host, ip) in old.mappings() {
            if self.allocatable(ip) {
                self.insert(host, ip);
            }
        }
    }

    pub fn store(&self) -> FakeIpState {
        FakeIpState {
            range: self.range.to_string(),
            mappings: self.mappings(),
        }
    }

    /// Restore a stored state taken from the same range. Returns whether it was applied.
    pub fn restore(&mut self, state: &FakeIpState) -> bool {
        if state.range != self.range.to_string() {
            return false;
        }
        for (host, ip) in &state.mappings {
            if self.allocatable(*ip) {
                self.insert(host.clone(), *ip);
            }
        }
        true
    }
}

fn filtered(filter: &[String], host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    filter.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        if let Some(suffix) = pattern.strip_prefix("+.") {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            host.split_once('.').is_some_and(|(_, parent)| parent == suffix)
        } else {
            host == pattern
        }
    })
}

/// Enhanced-mode machinery installed as the process host mapper.
pub struct Enhancer {
    mode: EnhancedMode,
    fake_pool: Option<Mutex<FakeIpPool>>,
    fake_ip_filter: Vec<String>,
    mapping: Mutex<LruCache<IpAddr, String>>,
}

impl Enhancer {
    pub fn new(
        mode: EnhancedMode,
        range: Ipv4Net,
        fake_ip_filter: Vec<String>,
    ) -> Result<Self, FakeIpError> {
        let fake_pool = match mode {
            EnhancedMode::FakeIp => Some(Mutex::new(FakeIpPool::new(range)?)),
            _ => None,
        };
        let cap = NonZeroUsize::new(MAPPING_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            mode,
            fake_pool,
            fake_ip_filter,
            mapping: Mutex::new(LruCache::new(cap)),
        })
    }

    pub fn mode(&self) -> EnhancedMode {
        self.mode
    }

    pub fn fake_ip_enabled(&self) -> bool {
        self.fake_pool.is_some()
    }

    pub fn mapping_enabled(&self) -> bool {
        self.mode != EnhancedMode::Normal
    }

    /// Fake address for `host`, or `None` when fake-ip is off or the host is filtered.
    pub fn fake_ip_for(&self, host: &str) -> Option<Ipv4Addr> {
        let pool = self.fake_pool.as_ref()?;
        if filtered(&self.fake_ip_filter, host) {
            return None;
        }
        Some(pool.lock().lookup(host.trim_end_matches('.')))
    }

    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        match (ip, &self.fake_pool) {
            (IpAddr::V4(v4), Some(pool)) => {
                let pool = pool.lock();
                pool.range().contains(&v4) && v4 != pool.gateway()
            }
            _ => false,
        }
    }

    pub fn is_existed_fake_ip(&self, ip: IpAddr) -> bool {
        match (ip, &self.fake_pool) {
            (IpAddr::V4(v4), Some(pool)) => pool.lock().exists(v4),
            _ => false,
        }
    }

    pub fn find_host_by_ip(&self, ip: IpAddr) -> Option<String> {
        if let (IpAddr::V4(v4), Some(pool)) = (ip, &self.fake_pool) {
            if let Some(host) = pool.lock().find_host(v4) {
                return Some(host);
            }
        }
        self.mapping.lock().get(&ip).cloned()
    }

    /// Remember a real answer so connections to `ip` can be attributed to `host`.
    pub fn insert_host_by_ip(&self, ip: IpAddr, host: &str) {
        if self.mapping_enabled() {
            self.mapping.lock().put(ip, host.to_string());
        }
    }

    /// Carry over the caches of the instance being replaced.
    pub fn patch_from(&self, old: &Enhancer) {
        {
            let old_mapping = old.mapping.lock();
            let mut mapping = self.mapping.lock();
            for (ip, host) in old_mapping.iter().collect::<Vec<_>>().into_iter().rev() {
                mapping.put(*ip, host.clone());
            }
        }

        if let (Some(new_pool), Some(old_pool)) = (&self.fake_pool, &old.fake_pool) {
            let old_pool = old_pool.lock();
            new_pool.lock().clone_from_pool(&old_pool);
        }
    }

    pub fn store_state(&self) -> Option<FakeIpState> {
        self.fake_pool.as_ref().map(|p| p.lock().store())
    }

    pub fn restore_state(&self, state: &FakeIpState) -> bool {
        match &self.fake_pool {
            Some(pool) => pool.lock().restore(state),
            None => false,
        }
    }
}
