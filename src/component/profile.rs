//! Profile cache file.
//!
//! # Responsibilities
//! - Remember the member selected in each `select` group
//! - Keep the fake-IP pool state across restarts
//!
//! # Design Decisions
//! - One JSON file under the home directory, loaded at startup and
//!   written on every selection change and at shutdown
//! - A missing or unreadable file starts an empty cache

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Fake-IP pool contents, oldest mapping first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeIpState {
    pub range: String,
    pub mappings: Vec<(String, Ipv4Addr)>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheData {
    #[serde(default)]
    selected: HashMap<String, String>,
    #[serde(default)]
    fake_ip: Option<FakeIpState>,
}

pub struct CacheFile {
    path: Option<PathBuf>,
    selected: DashMap<String, String>,
    fake_ip: RwLock<Option<FakeIpState>>,
    store_selected: AtomicBool,
    store_fake_ip: AtomicBool,
}

impl CacheFile {
    /// In-memory cache that is never persisted.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            selected: DashMap::new(),
            fake_ip: RwLock::new(None),
            store_selected: AtomicBool::new(true),
            store_fake_ip: AtomicBool::new(false),
        }
    }

    /// Load from file if it exists.
    pub fn load_from_file(path: &Path) -> std::io::Result<Self> {
        let cache = Self::new(Some(path.to_path_buf()));
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let data: CacheData = serde_json::from_reader(reader)?;
            for (group, proxy) in data.selected {
                cache.selected.insert(group, proxy);
            }
            *cache.fake_ip.write() = data.fake_ip;
            tracing::info!(
                path = %path.display(),
                selected = cache.selected.len(),
                "Loaded profile cache"
            );
        }
        Ok(cache)
    }

    /// Save to file. A cache without a path is a no-op.
    pub fn save_to_file(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = CacheData {
            selected: self.selected_map(),
            fake_ip: self.fake_ip.read().clone(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &data)?;
        tracing::debug!(path = %path.display(), "Saved profile cache");
        Ok(())
    }

    pub fn set_store_selected(&self, on: bool) {
        self.store_selected.store(on, Ordering::Relaxed);
    }

    pub fn store_selected(&self) -> bool {
        self.store_selected.load(Ordering::Relaxed)
    }

    pub fn set_store_fake_ip(&self, on: bool) {
        self.store_fake_ip.store(on, Ordering::Relaxed);
    }

    pub fn store_fake_ip(&self) -> bool {
        self.store_fake_ip.load(Ordering::Relaxed)
    }

    /// Group name → selected member.
    pub fn selected_map(&self) -> HashMap<String, String> {
        self.selected
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Record a user selection. Ignored while selection persistence is off.
    pub fn set_selected(&self, group: &str, proxy: &str) {
        if !self.store_selected() {
            return;
        }
        self.selected.insert(group.to_string(), proxy.to_string());
        if let Err(e) = self.save_to_file() {
            tracing::warn!(error = %e, "Failed to persist selection");
        }
    }

    pub fn fake_ip_state(&self) -> Option<FakeIpState> {
        self.fake_ip.read().clone()
    }

    pub fn set_fake_ip_state(&self, state: Option<FakeIpState>) {
        *self.fake_ip.write() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selected_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = CacheFile::new(Some(path.clone()));
        cache.set_selected("Auto", "NodeA");
        cache.set_fake_ip_state(Some(FakeIpState {
            range: "198.18.0.1/16".into(),
            mappings: vec![("example.com".into(), Ipv4Addr::new(198, 18, 0, 2))],
        }));
        cache.save_to_file().unwrap();

        let loaded = CacheFile::load_from_file(&path).unwrap();
        assert_eq!(loaded.selected_map().get("Auto").map(String::as_str), Some("NodeA"));
        assert_eq!(loaded.fake_ip_state().unwrap().mappings.len(), 1);
    }

    #[test]
    fn test_store_selected_off_ignores_selection() {
        let cache = CacheFile::new(None);
        cache.set_store_selected(false);
        cache.set_selected("Auto", "NodeA");
        assert!(cache.selected_map().is_empty());
    }

    #[test]
    fn test_missing_file_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheFile::load_from_file(&dir.path().join("none.json")).unwrap();
        assert!(cache.selected_map().is_empty());
        assert!(cache.fake_ip_state().is_none());
    }
}
