//! TCP listener set with backpressure.
//!
//! # Responsibilities
//! - Hold at most one listener per protocol role
//! - Accept connections and hand them to the dispatch engine
//! - Enforce a pending-connection limit via semaphore
//! - Patch named listeners and static tunnels against their desired set

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::schema::{InboundListenerConfig, TuicServer, TunConfig, TunnelConfig};
use crate::listener::{gen_addr, InboundManager, ListenerError, ListenerRole, ListenerSpec, Ports};
use crate::observability::metrics;
use crate::tunnel::{Dispatcher, InboundConnection, InboundKind};

/// Connections accepted but not yet handed over to the dispatch engine.
const MAX_PENDING: usize = 1024;

struct Running {
    addr: SocketAddr,
    /// Original socket spec for ss/vmess roles.
    config: String,
    task: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Where accepted connections go.
struct Route {
    kind: InboundKind,
    target: Option<String>,
    proxy: Option<String>,
}

pub struct ListenerSet {
    roles: Mutex<HashMap<ListenerRole, Running>>,
    named: Mutex<HashMap<String, (InboundListenerConfig, Running)>>,
    tunnels: Mutex<HashMap<TunnelConfig, Running>>,
    allow_lan: AtomicBool,
    bind_address: RwLock<String>,
    auto_redir: RwLock<Vec<String>>,
    redir_to_tun: RwLock<Vec<String>>,
    tun: RwLock<TunConfig>,
    tuic: RwLock<TuicServer>,
    pending: Arc<Semaphore>,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self {
            roles: Mutex::new(HashMap::new()),
            named: Mutex::new(HashMap::new()),
            tunnels: Mutex::new(HashMap::new()),
            allow_lan: AtomicBool::new(false),
            bind_address: RwLock::new("*".to_string()),
            auto_redir: RwLock::new(Vec::new()),
            redir_to_tun: RwLock::new(Vec::new()),
            tun: RwLock::new(TunConfig::default()),
            tuic: RwLock::new(TuicServer::default()),
            pending: Arc::new(Semaphore::new(MAX_PENDING)),
        }
    }
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound address of the listener holding `role`.
    pub fn local_addr(&self, role: ListenerRole) -> Option<SocketAddr> {
        self.roles.lock().get(&role).map(|r| r.addr)
    }

    pub fn auto_redir_interfaces(&self) -> Vec<String> {
        self.auto_redir.read().clone()
    }

    pub fn redir_to_tun_interfaces(&self) -> Vec<String> {
        self.redir_to_tun.read().clone()
    }

    pub fn named_listeners(&self) -> Vec<String> {
        let mut names: Vec<_> = self.named.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().len()
    }

    async fn start(
        &self,
        addr: &str,
        config: String,
        route: Route,
        tunnel: Arc<dyn Dispatcher>,
    ) -> Result<Running, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        tracing::info!(address = %local, inbound = %route.kind, "Listener bound");

        let task = tokio::spawn(accept_loop(listener, route, tunnel, self.pending.clone()));
        Ok(Running {
            addr: local,
            config,
            task,
        })
    }

    async fn recreate_port(
        &self,
        role: ListenerRole,
        kind: InboundKind,
        port: u16,
        tunnel: Arc<dyn Dispatcher>,
    ) {
        if port == 0 {
            return;
        }
        let addr = gen_addr(&self.bind_address.read(), port, self.allow_lan());
        let route = Route {
            kind,
            target: None,
            proxy: None,
        };
        match self.start(&addr, String::new(), route, tunnel).await {
            Ok(running) => {
                self.roles.lock().insert(role, running);
            }
            Err(e) => tracing::error!(role = %role, error = %e, "Start server error"),
        }
    }

    async fn recreate_socket_spec(
        &self,
        role: ListenerRole,
        kind: InboundKind,
        config: String,
        tunnel: Arc<dyn Dispatcher>,
    ) {
        if config.is_empty() {
            return;
        }
        let addr = match socket_spec_addr(&config, role.as_str()) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(role = %role, error = %e, "Start server error");
                return;
            }
        };
        let route = Route {
            kind,
            target: None,
            proxy: None,
        };
        match self.start(&addr, config, route, tunnel).await {
            Ok(running) => {
                self.roles.lock().insert(role, running);
            }
            Err(e) => tracing::error!(role = %role, error = %e, "Start server error"),
        }
    }
}

/// `ss://cipher:password@host:port` and `vmess://uuid@host:port` listen address.
fn socket_spec_addr(config: &str, scheme: &str) -> Result<String, ListenerError> {
    let invalid = |reason: &str| ListenerError::InvalidConfig {
        config: config.to_string(),
        reason: reason.to_string(),
    };
    let expected = match scheme {
        "shadowsocks" => "ss",
        other => other,
    };
    let url = url::Url::parse(config).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != expected {
        return Err(invalid("unexpected scheme"));
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url.port().ok_or_else(|| invalid("missing port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(gen_addr(host, port, true))
}

fn is_supported_kind(kind: &str) -> bool {
    matches!(kind, "http" | "socks" | "socks5" | "mixed" | "redir" | "tproxy")
}

async fn accept_loop(
    listener: TcpListener,
    route: Route,
    tunnel: Arc<dyn Dispatcher>,
    pending: Arc<Semaphore>,
) {
    loop {
        // Acquire permit first (backpressure)
        let Ok(permit) = pending.clone().acquire_owned().await else {
            return;
        };

        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(inbound = %route.kind, error = %e, "Failed to accept connection");
                continue;
            }
        };

        tracing::debug!(peer_addr = %peer, inbound = %route.kind, "Connection accepted");

        let conn = InboundConnection {
            stream: Box::new(stream),
            source: Some(peer),
            inbound: route.kind.clone(),
            target: route.target.clone(),
            proxy: route.proxy.clone(),
        };
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            tunnel.handle_tcp(conn).await;
        });
    }
}

#[async_trait]
impl InboundManager for ListenerSet {
    async fn patch_inbound_listeners(
        &self,
        listeners: &HashMap<String, InboundListenerConfig>,
        tunnel: Arc<dyn Dispatcher>,
        cleanup_stale: bool,
    ) {
        let mut stopped = Vec::new();
        let mut wanted = Vec::new();
        {
            let mut named = self.named.lock();
            for (name, cfg) in listeners {
                if named.get(name).is_some_and(|(cur, _)| cur == cfg) {
                    continue;
                }
                if let Some((_, old)) = named.remove(name) {
                    stopped.push(old);
                }
                wanted.push(cfg.clone());
            }
            if cleanup_stale {
                let stale: Vec<String> = named
                    .keys()
                    .filter(|name| !listeners.contains_key(*name))
                    .cloned()
                    .collect();
                for name in stale {
                    if let Some((_, old)) = named.remove(&name) {
                        tracing::info!(listener = %name, "Listener removed");
                        stopped.push(old);
                    }
                }
            }
        }

        for old in stopped {
            old.stop().await;
        }

        for cfg in wanted {
            if !is_supported_kind(&cfg.kind) {
                tracing::error!(listener = %cfg.name, kind = %cfg.kind, "Unsupported listener type");
                continue;
            }
            let addr = gen_addr(&cfg.listen, cfg.port, true);
            let route = Route {
                kind: InboundKind::Listener(cfg.name.clone()),
                target: None,
                proxy: None,
            };
            match self.start(&addr, String::new(), route, tunnel.clone()).await {
                Ok(running) => {
                    self.named.lock().insert(cfg.name.clone(), (cfg, running));
                }
                Err(e) => tracing::error!(listener = %cfg.name, error = %e, "Start listener error"),
            }
        }
    }

    fn set_allow_lan(&self, allow: bool) {
        self.allow_lan.store(allow, Ordering::SeqCst);
    }

    fn set_bind_address(&self, addr: &str) {
        *self.bind_address.write() = addr.to_string();
    }

    fn allow_lan(&self) -> bool {
        self.allow_lan.load(Ordering::SeqCst)
    }

    fn bind_address(&self) -> String {
        self.bind_address.read().clone()
    }

    async fn recreate(&self, spec: ListenerSpec, tunnel: Arc<dyn Dispatcher>) {
        let role = spec.role();
        metrics::record_listener_recreate(role.as_str());

        let old = self.roles.lock().remove(&role);
        if let Some(old) = old {
            tracing::debug!(role = %role, address = %old.addr, "Stopping listener");
            old.stop().await;
        }

        match spec {
            ListenerSpec::Http(port) => {
                self.recreate_port(role, InboundKind::Http, port, tunnel).await
            }
            ListenerSpec::Socks(port) => {
                self.recreate_port(role, InboundKind::Socks, port, tunnel).await
            }
            ListenerSpec::Redir(port) => {
                self.recreate_port(role, InboundKind::Redir, port, tunnel).await
            }
            ListenerSpec::TProxy(port) => {
                self.recreate_port(role, InboundKind::TProxy, port, tunnel).await
            }
            ListenerSpec::Mixed(port) => {
                self.recreate_port(role, InboundKind::Mixed, port, tunnel).await
            }
            ListenerSpec::Shadowsocks(config) => {
                self.recreate_socket_spec(role, InboundKind::Shadowsocks, config, tunnel)
                    .await
            }
            ListenerSpec::Vmess(config) => {
                self.recreate_socket_spec(role, InboundKind::Vmess, config, tunnel)
                    .await
            }
            ListenerSpec::AutoRedir(ebpf) => {
                if !ebpf.auto_redir.is_empty() {
                    tracing::info!(interfaces = ?ebpf.auto_redir, "Auto-redir interfaces configured");
                }
                *self.auto_redir.write() = ebpf.auto_redir;
            }
            ListenerSpec::Tuic(cfg) => {
                if cfg.enable {
                    tracing::info!(listen = %cfg.listen, "TUIC server configured");
                }
                *self.tuic.write() = cfg;
            }
        }
    }

    async fn recreate_tun(&self, cfg: &TunConfig, _tunnel: Arc<dyn Dispatcher>) {
        let was_enabled = self.tun.read().enable;
        if cfg.enable {
            tracing::info!(device = %cfg.device, stack = %cfg.stack, "[TUN] device configured");
        } else if was_enabled {
            tracing::info!("[TUN] device stopped");
        }
        *self.tun.write() = cfg.clone();
    }

    async fn recreate_redir_to_tun(&self, interfaces: &[String]) {
        if !interfaces.is_empty() {
            tracing::info!(interfaces = ?interfaces, "[TUN] redirect-to-tun configured");
        }
        *self.redir_to_tun.write() = interfaces.to_vec();
    }

    async fn patch_tunnels(&self, tunnels: &[TunnelConfig], tunnel: Arc<dyn Dispatcher>) {
        let desired: HashSet<&TunnelConfig> = tunnels
            .iter()
            .filter(|t| t.network.iter().any(|n| n == "tcp"))
            .collect();

        let stale: Vec<Running> = {
            let mut running = self.tunnels.lock();
            let gone: Vec<TunnelConfig> = running
                .keys()
                .filter(|t| !desired.contains(t))
                .cloned()
                .collect();
            gone.iter().filter_map(|t| running.remove(t)).collect()
        };
        for old in stale {
            tracing::info!(address = %old.addr, "Tunnel removed");
            old.stop().await;
        }

        for t in tunnels {
            if t.network.iter().any(|n| n == "udp") {
                tracing::debug!(address = %t.address, target = %t.target, "UDP tunnel forwarding is not handled here");
            }
            if !desired.contains(t) || self.tunnels.lock().contains_key(t) {
                continue;
            }
            let route = Route {
                kind: InboundKind::Tunnel,
                target: Some(t.target.clone()),
                proxy: t.proxy.clone(),
            };
            match self.start(&t.address, String::new(), route, tunnel.clone()).await {
                Ok(running) => {
                    self.tunnels.lock().insert(t.clone(), running);
                }
                Err(e) => tracing::error!(address = %t.address, error = %e, "Start tunnel error"),
            }
        }
    }

    fn ports(&self) -> Ports {
        let roles = self.roles.lock();
        let port = |role: ListenerRole| roles.get(&role).map(|r| r.addr.port()).unwrap_or(0);
        let config = |role: ListenerRole| {
            roles
                .get(&role)
                .map(|r| r.config.clone())
                .unwrap_or_default()
        };
        Ports {
            port: port(ListenerRole::Http),
            socks_port: port(ListenerRole::Socks),
            redir_port: port(ListenerRole::Redir),
            tproxy_port: port(ListenerRole::TProxy),
            mixed_port: port(ListenerRole::Mixed),
            shadowsocks_config: config(ListenerRole::Shadowsocks),
            vmess_config: config(ListenerRole::Vmess),
        }
    }

    fn tun_config(&self) -> TunConfig {
        self.tun.read().clone()
    }

    fn tuic_config(&self) -> TuicServer {
        self.tuic.read().clone()
    }

    async fn cleanup(&self) {
        let mut stopped: Vec<Running> = self.roles.lock().drain().map(|(_, r)| r).collect();
        stopped.extend(self.named.lock().drain().map(|(_, (_, r))| r));
        stopped.extend(self.tunnels.lock().drain().map(|(_, r)| r));
        for running in stopped {
            running.stop().await;
        }
        self.auto_redir.write().clear();
        self.redir_to_tun.write().clear();
        *self.tun.write() = TunConfig::default();
        *self.tuic.write() = TuicServer::default();
        tracing::info!("All listeners stopped");
    }
}
