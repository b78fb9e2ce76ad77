//! Hot reload: rebuilds a snapshot whenever the configuration file changes.
//!
//! A file that fails to parse or validate is logged and dropped; the running
//! configuration stays in place until a later edit fixes it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load;
use crate::config::snapshot::ConfigurationSnapshot;

/// Used by the polling backend only.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub type SnapshotSender = mpsc::UnboundedSender<ConfigurationSnapshot>;

/// Outcome of handling one change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reload {
    Sent,
    Rejected,
    /// The snapshot was built but the receiving end is gone.
    Unwatched,
}

pub struct ConfigWatcher {
    path: PathBuf,
    home: PathBuf,
    tx: SnapshotSender,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiving end for rebuilt snapshots.
    pub fn new(
        path: &Path,
        home: &Path,
    ) -> (Self, mpsc::UnboundedReceiver<ConfigurationSnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            home: home.to_path_buf(),
            tx,
        };
        (watcher, rx)
    }

    /// Start watching. Notifications stop when the returned handle is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, home, tx } = self;
        let watched = path.clone();

        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) if touches_content(&event.kind) => {
                reload(&path, &home, &tx);
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, path = %path.display(), "Config watch failed"),
        };

        let mut watcher =
            RecommendedWatcher::new(handler, Config::default().with_poll_interval(POLL_INTERVAL))?;
        watcher.watch(&watched, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %watched.display(), "Watching configuration file");
        Ok(watcher)
    }
}

fn touches_content(kind: &EventKind) -> bool {
    kind.is_modify() || kind.is_create()
}

/// Rebuild the snapshot from `path` and hand it to the apply loop.
pub fn reload(path: &Path, home: &Path, tx: &SnapshotSender) -> Reload {
    tracing::info!(path = %path.display(), "Configuration changed on disk");

    let snapshot = match load(path, home) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!(error = %e, "Rejected changed configuration, keeping the applied one");
            return Reload::Rejected;
        }
    };

    if tx.send(snapshot).is_err() {
        tracing::warn!(path = %path.display(), "Reloaded configuration dropped, no apply loop is listening");
        return Reload::Unwatched;
    }
    Reload::Sent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_modified_file_produces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mixed-port = 7890\n").unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(&path, dir.path());
        let _guard = watcher.run().unwrap();

        std::fs::write(&path, "mixed-port = 7891\n").unwrap();
        let snapshot = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.general.inbound.mixed_port, 7891);
    }

    #[test]
    fn test_reload_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let (tx, mut rx) = mpsc::unbounded_channel();

        std::fs::write(&path, "mixed-port = 7890\n").unwrap();
        assert_eq!(reload(&path, dir.path(), &tx), Reload::Sent);
        assert_eq!(rx.try_recv().unwrap().general.inbound.mixed_port, 7890);

        std::fs::write(&path, "rules = [\"MATCH,Nowhere\"]\n").unwrap();
        assert_eq!(reload(&path, dir.path(), &tx), Reload::Rejected);
        assert!(rx.try_recv().is_err());

        drop(rx);
        std::fs::write(&path, "mixed-port = 7892\n").unwrap();
        assert_eq!(reload(&path, dir.path(), &tx), Reload::Unwatched);
    }
}
