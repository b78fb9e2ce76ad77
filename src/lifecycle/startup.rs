//! Startup orchestration.
//!
//! # Responsibilities
//! - Load the profile cache from the home directory
//! - Build the subsystem registry around a fresh tunnel
//! - Install the metrics exporter when configured
//!
//! # Design Decisions
//! - A corrupt profile cache is logged and replaced, never fatal
//! - Nothing binds until the first apply pass

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::component::profile::CacheFile;
use crate::config::schema::GeneralConfig;
use crate::executor::{Executor, SubsystemRegistry};
use crate::observability::logging::LogLevelControl;
use crate::observability::metrics::init_metrics;
use crate::tunnel::{InboundConnection, Tunnel};

/// Admitted connections buffered for the forwarding engine.
pub const CONNECTION_QUEUE: usize = 1024;

pub const PROFILE_CACHE_FILE: &str = "cache.json";

pub struct Startup {
    pub executor: Arc<Executor>,
    /// Connections admitted by the tunnel.
    pub connections: mpsc::Receiver<InboundConnection>,
}

impl Startup {
    pub fn build(home: &Path, logger: Arc<dyn LogLevelControl>) -> Self {
        let profile = load_profile(home);
        let (tunnel, connections) = Tunnel::new(CONNECTION_QUEUE);

        let registry = SubsystemRegistry::new(Arc::new(tunnel))
            .with_profile(Arc::new(profile))
            .with_logger(logger);

        Self {
            executor: Arc::new(Executor::new(registry)),
            connections,
        }
    }
}

fn load_profile(home: &Path) -> CacheFile {
    let path = home.join(PROFILE_CACHE_FILE);
    match CacheFile::load_from_file(&path) {
        Ok(cache) => cache,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Profile cache unreadable, starting empty");
            CacheFile::new(Some(path))
        }
    }
}

/// Install the Prometheus exporter if `metrics-address` is set.
pub fn start_metrics(general: &GeneralConfig) {
    let Some(addr) = general.metrics_address.as_deref() else {
        return;
    };
    match addr.parse::<SocketAddr>() {
        Ok(addr) => init_metrics(addr),
        Err(e) => tracing::warn!(address = %addr, error = %e, "Invalid metrics address"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::logging::StaticLevel;
    use crate::tunnel::TunnelStatus;

    #[test]
    fn test_corrupt_cache_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROFILE_CACHE_FILE), b"{not json").unwrap();

        let profile = load_profile(dir.path());
        assert!(profile.selected_map().is_empty());
    }

    #[test]
    fn test_loads_cached_selection() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheFile::new(Some(dir.path().join(PROFILE_CACHE_FILE)));
        cache.set_selected("Auto", "NodeA");

        let profile = load_profile(dir.path());
        assert_eq!(profile.selected_map().get("Auto").map(String::as_str), Some("NodeA"));
    }

    #[tokio::test]
    async fn test_build_starts_suspended() {
        let dir = tempfile::tempdir().unwrap();
        let startup = Startup::build(dir.path(), Arc::new(StaticLevel::default()));
        assert_eq!(
            startup.executor.registry().tunnel.status(),
            TunnelStatus::Suspend
        );
        assert!(startup.executor.current().is_none());
    }
}
