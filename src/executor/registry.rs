//! Subsystem handles the executor writes during an apply pass.
//!
//! Every handle is read freely by the forwarding side; only the executor,
//! under its apply lock, replaces what the handles point at.

use std::sync::Arc;

use crate::component::auth::AuthStore;
use crate::component::ca::TrustStore;
use crate::component::dialer::DialerSettings;
use crate::component::ntp::{NtpControl, NtpService};
use crate::component::profile::CacheFile;
use crate::dns::{DnsServer, DnsServerControl, DnsSlots};
use crate::listener::inner::InnerEntry;
use crate::listener::set::ListenerSet;
use crate::listener::InboundManager;
use crate::observability::logging::{LogLevelControl, StaticLevel};
use crate::tproxy::{IptablesInstaller, RuleInstaller};
use crate::tunnel::Dispatcher;

pub struct SubsystemRegistry {
    pub tunnel: Arc<dyn Dispatcher>,
    pub listeners: Arc<dyn InboundManager>,
    pub inner: Arc<InnerEntry>,
    pub dns: Arc<DnsSlots>,
    pub dns_server: Arc<dyn DnsServerControl>,
    pub trust: Arc<TrustStore>,
    pub auth: Arc<AuthStore>,
    pub dialer: Arc<DialerSettings>,
    pub tproxy: Arc<dyn RuleInstaller>,
    pub ntp: Arc<dyn NtpControl>,
    pub profile: Arc<CacheFile>,
    pub logger: Arc<dyn LogLevelControl>,
}

impl SubsystemRegistry {
    /// Registry with the bundled implementation of every collaborator.
    pub fn new(tunnel: Arc<dyn Dispatcher>) -> Self {
        Self {
            tunnel,
            listeners: Arc::new(ListenerSet::new()),
            inner: Arc::new(InnerEntry::new()),
            dns: Arc::new(DnsSlots::new()),
            dns_server: Arc::new(DnsServer::new()),
            trust: Arc::new(TrustStore::new()),
            auth: Arc::new(AuthStore::new()),
            dialer: Arc::new(DialerSettings::new()),
            tproxy: Arc::new(IptablesInstaller::new()),
            ntp: Arc::new(NtpService::new()),
            profile: Arc::new(CacheFile::new(None)),
            logger: Arc::new(StaticLevel::default()),
        }
    }

    pub fn with_listeners(mut self, listeners: Arc<dyn InboundManager>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_dns_server(mut self, server: Arc<dyn DnsServerControl>) -> Self {
        self.dns_server = server;
        self
    }

    pub fn with_tproxy(mut self, installer: Arc<dyn RuleInstaller>) -> Self {
        self.tproxy = installer;
        self
    }

    pub fn with_ntp(mut self, ntp: Arc<dyn NtpControl>) -> Self {
        self.ntp = ntp;
        self
    }

    pub fn with_profile(mut self, profile: Arc<CacheFile>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn LogLevelControl>) -> Self {
        self.logger = logger;
        self
    }
}
