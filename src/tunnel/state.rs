//! Bundled dispatch engine state.
//!
//! # Responsibilities
//! - Hold the published proxies, rules, providers and sniffer
//! - Implement the Suspend → InnerLoading → Running admission machine
//! - Queue admitted connections for the forwarding engine
//!
//! # Design Decisions
//! - Published state lives behind `ArcSwap`, readers never block an apply pass
//! - Status is a `watch` channel so waiting connections wake on every transition

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use crate::adapter::ProxyMap;
use crate::component::sniffer::SnifferDispatcher;
use crate::provider::{ProxyProviderMap, RuleProviderMap};
use crate::rules::Rule;
use crate::tunnel::{Dispatcher, FindProcessMode, InboundConnection, InboundKind, Mode, TunnelStatus};

/// Rule set published by the last apply pass.
#[derive(Default)]
pub struct RuleTable {
    pub rules: Vec<Rule>,
    pub sub_rules: HashMap<String, Vec<Rule>>,
    pub providers: RuleProviderMap,
}

/// Proxy set published by the last apply pass.
#[derive(Default)]
pub struct ProxyTable {
    pub proxies: ProxyMap,
    pub providers: ProxyProviderMap,
}

pub struct Tunnel {
    status: watch::Sender<TunnelStatus>,
    proxies: ArcSwap<ProxyTable>,
    rules: ArcSwap<RuleTable>,
    sniffer: ArcSwapOption<SnifferDispatcher>,
    mode: RwLock<Mode>,
    find_process_mode: RwLock<FindProcessMode>,
    queue: mpsc::Sender<InboundConnection>,
}

impl Tunnel {
    /// Create a suspended tunnel and the receiver the forwarding engine drains.
    pub fn new(queue_capacity: usize) -> (Self, mpsc::Receiver<InboundConnection>) {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let (status, _) = watch::channel(TunnelStatus::Suspend);
        let tunnel = Self {
            status,
            proxies: ArcSwap::from_pointee(ProxyTable::default()),
            rules: ArcSwap::from_pointee(RuleTable::default()),
            sniffer: ArcSwapOption::empty(),
            mode: RwLock::new(Mode::default()),
            find_process_mode: RwLock::new(FindProcessMode::default()),
            queue,
        };
        (tunnel, rx)
    }

    pub fn proxies(&self) -> Arc<ProxyTable> {
        self.proxies.load_full()
    }

    pub fn rules(&self) -> Arc<RuleTable> {
        self.rules.load_full()
    }

    pub fn sniffer(&self) -> Option<Arc<SnifferDispatcher>> {
        self.sniffer.load_full()
    }

    fn transition(&self, next: TunnelStatus) {
        let prev = self.status.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "Tunnel status changed");
        }
    }
}

fn admits(status: TunnelStatus, inbound: &InboundKind) -> bool {
    match status {
        TunnelStatus::Running => true,
        TunnelStatus::InnerLoading => *inbound == InboundKind::Inner,
        TunnelStatus::Suspend => false,
    }
}

#[async_trait]
impl Dispatcher for Tunnel {
    fn on_suspend(&self) {
        self.transition(TunnelStatus::Suspend);
    }

    fn on_inner_loading(&self) {
        self.transition(TunnelStatus::InnerLoading);
    }

    fn on_running(&self) {
        self.transition(TunnelStatus::Running);
    }

    fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }

    fn update_proxies(&self, proxies: ProxyMap, providers: ProxyProviderMap) {
        self.proxies.store(Arc::new(ProxyTable { proxies, providers }));
    }

    fn update_rules(
        &self,
        rules: Vec<Rule>,
        sub_rules: HashMap<String, Vec<Rule>>,
        providers: RuleProviderMap,
    ) {
        self.rules.store(Arc::new(RuleTable {
            rules,
            sub_rules,
            providers,
        }));
    }

    fn update_sniffer(&self, dispatcher: Option<Arc<SnifferDispatcher>>) {
        self.sniffer.store(dispatcher);
    }

    fn set_mode(&self, mode: Mode) {
        let mut current = self.mode.write();
        if *current != mode {
            tracing::info!(mode = %mode, "Proxy mode changed");
        }
        *current = mode;
    }

    fn mode(&self) -> Mode {
        *self.mode.read()
    }

    fn set_find_process_mode(&self, mode: FindProcessMode) {
        *self.find_process_mode.write() = mode;
    }

    fn is_sniffing(&self) -> bool {
        self.sniffer
            .load()
            .as_ref()
            .map(|s| s.is_enabled())
            .unwrap_or(false)
    }

    async fn handle_tcp(&self, conn: InboundConnection) {
        let mut rx = self.status.subscribe();
        loop {
            if admits(*rx.borrow_and_update(), &conn.inbound) {
                break;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }

        if self.queue.send(conn).await.is_err() {
            tracing::debug!("Dispatch queue closed, dropping connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn inbound(kind: InboundKind) -> InboundConnection {
        let (a, _b) = tokio::io::duplex(64);
        InboundConnection {
            stream: Box::new(a),
            source: None,
            inbound: kind,
            target: None,
            proxy: None,
        }
    }

    #[tokio::test]
    async fn test_suspended_tunnel_holds_connections() {
        let (tunnel, mut rx) = Tunnel::new(4);
        let tunnel = Arc::new(tunnel);

        let t = tunnel.clone();
        tokio::spawn(async move { t.handle_tcp(inbound(InboundKind::Http)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        tunnel.on_running();
        let conn = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.inbound, InboundKind::Http);
    }

    #[tokio::test]
    async fn test_inner_loading_admits_inner_only() {
        let (tunnel, mut rx) = Tunnel::new(4);
        let tunnel = Arc::new(tunnel);
        tunnel.on_inner_loading();

        let t = tunnel.clone();
        tokio::spawn(async move { t.handle_tcp(inbound(InboundKind::Socks)).await });
        let t = tunnel.clone();
        tokio::spawn(async move { t.handle_tcp(inbound(InboundKind::Inner)).await });

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.inbound, InboundKind::Inner);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        tunnel.on_running();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.inbound, InboundKind::Socks);
    }

    #[test]
    fn test_mode_and_status() {
        let (tunnel, _rx) = Tunnel::new(1);
        assert_eq!(tunnel.status(), TunnelStatus::Suspend);
        tunnel.set_mode(Mode::Global);
        assert_eq!(tunnel.mode(), Mode::Global);
        assert!(!tunnel.is_sniffing());
        assert_eq!(TunnelStatus::from(2), TunnelStatus::Running);
    }
}
