//! Recording doubles for the executor's collaborators.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tunnel_hub::adapter::ProxyMap;
use tunnel_hub::component::ntp::{NtpControl, NtpSettings};
use tunnel_hub::component::sniffer::SnifferDispatcher;
use tunnel_hub::config::schema::{InboundListenerConfig, TuicServer, TunConfig, TunnelConfig};
use tunnel_hub::config::{parse_with_bytes, ConfigurationSnapshot};
use tunnel_hub::dns::{DnsServerControl, LocalServer};
use tunnel_hub::executor::{Executor, SubsystemRegistry};
use tunnel_hub::listener::{InboundManager, ListenerSpec, Ports};
use tunnel_hub::provider::{
    Provider, ProviderError, ProviderType, ProxyProvider, RuleBehavior, RuleProvider, VehicleType,
};
use tunnel_hub::rules::Rule;
use tunnel_hub::tproxy::{RuleInstaller, TProxyError, TProxyRules};
use tunnel_hub::tunnel::{
    Dispatcher, FindProcessMode, InboundConnection, Mode, Tunnel, TunnelStatus,
};

/// Ordered record of collaborator calls, shared between doubles.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Real tunnel that records its lifecycle transitions.
pub struct RecordingDispatcher {
    pub tunnel: Tunnel,
    events: Events,
}

impl RecordingDispatcher {
    pub fn new(events: Events) -> Arc<Self> {
        let (tunnel, _rx) = Tunnel::new(16);
        Arc::new(Self { tunnel, events })
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    fn on_suspend(&self) {
        self.events.push("suspend");
        self.tunnel.on_suspend();
    }

    fn on_inner_loading(&self) {
        self.events.push("inner-loading");
        self.tunnel.on_inner_loading();
    }

    fn on_running(&self) {
        self.events.push("running");
        self.tunnel.on_running();
    }

    fn status(&self) -> TunnelStatus {
        self.tunnel.status()
    }

    fn update_proxies(&self, proxies: ProxyMap, providers: tunnel_hub::provider::ProxyProviderMap) {
        self.events.push("proxies");
        self.tunnel.update_proxies(proxies, providers);
    }

    fn update_rules(
        &self,
        rules: Vec<Rule>,
        sub_rules: HashMap<String, Vec<Rule>>,
        providers: tunnel_hub::provider::RuleProviderMap,
    ) {
        self.events.push("rules");
        self.tunnel.update_rules(rules, sub_rules, providers);
    }

    fn update_sniffer(&self, dispatcher: Option<Arc<SnifferDispatcher>>) {
        self.tunnel.update_sniffer(dispatcher);
    }

    fn set_mode(&self, mode: Mode) {
        self.tunnel.set_mode(mode);
    }

    fn mode(&self) -> Mode {
        self.tunnel.mode()
    }

    fn set_find_process_mode(&self, mode: FindProcessMode) {
        self.tunnel.set_find_process_mode(mode);
    }

    fn is_sniffing(&self) -> bool {
        self.tunnel.is_sniffing()
    }

    async fn handle_tcp(&self, conn: InboundConnection) {
        self.tunnel.handle_tcp(conn).await;
    }
}

/// Listener manager that binds nothing.
#[derive(Default)]
pub struct RecordingListeners {
    events: Events,
    allow_lan: AtomicBool,
    bind_address: Mutex<String>,
    ports: Mutex<Ports>,
    recreated: Mutex<Vec<ListenerSpec>>,
}

impl RecordingListeners {
    pub fn new(events: Events) -> Arc<Self> {
        Arc::new(Self {
            events,
            ..Default::default()
        })
    }

    pub fn recreated(&self) -> Vec<ListenerSpec> {
        self.recreated.lock().clone()
    }
}

#[async_trait]
impl InboundManager for RecordingListeners {
    async fn patch_inbound_listeners(
        &self,
        _listeners: &HashMap<String, InboundListenerConfig>,
        _tunnel: Arc<dyn Dispatcher>,
        cleanup_stale: bool,
    ) {
        assert!(cleanup_stale);
        self.events.push("patch-listeners");
    }

    fn set_allow_lan(&self, allow: bool) {
        self.allow_lan.store(allow, Ordering::SeqCst);
    }

    fn set_bind_address(&self, addr: &str) {
        *self.bind_address.lock() = addr.to_string();
    }

    fn allow_lan(&self) -> bool {
        self.allow_lan.load(Ordering::SeqCst)
    }

    fn bind_address(&self) -> String {
        self.bind_address.lock().clone()
    }

    async fn recreate(&self, spec: ListenerSpec, _tunnel: Arc<dyn Dispatcher>) {
        self.events.push(format!("recreate:{}", spec.role()));
        {
            let mut ports = self.ports.lock();
            match &spec {
                ListenerSpec::Http(p) => ports.port = *p,
                ListenerSpec::Socks(p) => ports.socks_port = *p,
                ListenerSpec::Redir(p) => ports.redir_port = *p,
                ListenerSpec::TProxy(p) => ports.tproxy_port = *p,
                ListenerSpec::Mixed(p) => ports.mixed_port = *p,
                ListenerSpec::Shadowsocks(s) => ports.shadowsocks_config = s.clone(),
                ListenerSpec::Vmess(s) => ports.vmess_config = s.clone(),
                ListenerSpec::AutoRedir(_) | ListenerSpec::Tuic(_) => {}
            }
        }
        self.recreated.lock().push(spec);
    }

    async fn recreate_tun(&self, _cfg: &TunConfig, _tunnel: Arc<dyn Dispatcher>) {
        self.events.push("tun");
    }

    async fn recreate_redir_to_tun(&self, _interfaces: &[String]) {
        self.events.push("redir-to-tun");
    }

    async fn patch_tunnels(&self, _tunnels: &[TunnelConfig], _tunnel: Arc<dyn Dispatcher>) {
        self.events.push("tunnels");
    }

    fn ports(&self) -> Ports {
        self.ports.lock().clone()
    }

    fn tun_config(&self) -> TunConfig {
        TunConfig::default()
    }

    fn tuic_config(&self) -> TuicServer {
        TuicServer::default()
    }

    async fn cleanup(&self) {
        self.events.push("listeners-cleanup");
    }
}

/// Rule installer that only records what it was asked to do.
pub struct RecordingInstaller {
    events: Events,
    installed: Mutex<Vec<TProxyRules>>,
}

impl RecordingInstaller {
    pub fn new(events: Events) -> Arc<Self> {
        Arc::new(Self {
            events,
            installed: Mutex::new(Vec::new()),
        })
    }

    /// Rules currently in place.
    pub fn installed(&self) -> Vec<TProxyRules> {
        self.installed.lock().clone()
    }
}

#[async_trait]
impl RuleInstaller for RecordingInstaller {
    fn supported(&self) -> bool {
        true
    }

    async fn cleanup(&self) {
        self.events.push("iptables-cleanup");
        self.installed.lock().clear();
    }

    async fn install(&self, rules: &TProxyRules) -> Result<(), TProxyError> {
        self.events.push("iptables-install");
        self.installed.lock().push(rules.clone());
        Ok(())
    }
}

/// DNS listening service that never binds.
#[derive(Default)]
pub struct NullDnsServer;

impl DnsServerControl for NullDnsServer {
    fn recreate(&self, _listen: &str, _handler: Option<Arc<LocalServer>>) {}

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}

/// NTP service that records recreate and stop calls.
pub struct RecordingNtp {
    events: Events,
    running: AtomicBool,
    last: Mutex<Option<NtpSettings>>,
}

impl RecordingNtp {
    pub fn new(events: Events) -> Arc<Self> {
        Arc::new(Self {
            events,
            running: AtomicBool::new(false),
            last: Mutex::new(None),
        })
    }

    pub fn last_settings(&self) -> Option<NtpSettings> {
        self.last.lock().clone()
    }
}

impl NtpControl for RecordingNtp {
    fn recreate(&self, settings: NtpSettings) {
        self.events.push("ntp-recreate");
        *self.last.lock() = Some(settings);
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.events.push("ntp-stop");
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Tracks how many provider tasks run at once.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Provider whose initialisation sleeps and optionally fails.
pub struct ScriptedProvider {
    name: String,
    kind: ProviderType,
    vehicle: VehicleType,
    delay: Duration,
    fail: bool,
    gauge: Arc<Gauge>,
    events: Events,
    pub initialised: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(
        name: &str,
        kind: ProviderType,
        vehicle: VehicleType,
        gauge: Arc<Gauge>,
        events: Events,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            vehicle,
            delay: Duration::from_millis(20),
            fail: false,
            gauge,
            events,
            initialised: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn initial_count(&self) -> usize {
        self.initialised.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        self.kind
    }

    fn vehicle_type(&self) -> VehicleType {
        self.vehicle
    }

    async fn initial(&self) -> Result<(), ProviderError> {
        self.gauge.enter();
        tokio::time::sleep(self.delay).await;
        self.gauge.exit();

        self.initialised.fetch_add(1, Ordering::SeqCst);
        self.events.push(format!("initial:{}", self.name));
        if self.fail {
            return Err(ProviderError::Empty);
        }
        Ok(())
    }
}

impl ProxyProvider for ScriptedProvider {
    fn proxies(&self) -> Vec<Arc<dyn tunnel_hub::adapter::Proxy>> {
        Vec::new()
    }
}

impl RuleProvider for ScriptedProvider {
    fn behavior(&self) -> RuleBehavior {
        RuleBehavior::Domain
    }

    fn count(&self) -> usize {
        0
    }
}

/// Executor wired to recording doubles.
pub struct Harness {
    pub executor: Arc<Executor>,
    pub events: Events,
    pub tunnel: Arc<RecordingDispatcher>,
    pub listeners: Arc<RecordingListeners>,
    pub installer: Arc<RecordingInstaller>,
    pub ntp: Arc<RecordingNtp>,
}

impl Harness {
    pub fn new() -> Self {
        let events = Events::default();
        let tunnel = RecordingDispatcher::new(events.clone());
        let listeners = RecordingListeners::new(events.clone());
        let installer = RecordingInstaller::new(events.clone());
        let ntp = RecordingNtp::new(events.clone());

        let registry = SubsystemRegistry::new(tunnel.clone())
            .with_listeners(listeners.clone())
            .with_tproxy(installer.clone())
            .with_ntp(ntp.clone())
            .with_dns_server(Arc::new(NullDnsServer));

        Self {
            executor: Arc::new(Executor::new(registry)),
            events,
            tunnel,
            listeners,
            installer,
            ntp,
        }
    }
}

pub fn snapshot(toml: &str) -> ConfigurationSnapshot {
    parse_with_bytes(toml.as_bytes(), Path::new(".")).unwrap()
}
