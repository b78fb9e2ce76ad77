//! In-process loopback entry point.
//!
//! Internally generated connections (provider downloads through a proxy,
//! health checks) enter the dispatch engine here. They are admitted while
//! the engine is still loading, before regular inbound traffic.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::DuplexStream;

use crate::tunnel::{Dispatcher, InboundConnection, InboundKind};

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InnerError {
    #[error("inner entry point is not installed")]
    NotInstalled,
}

#[derive(Default)]
pub struct InnerEntry {
    tunnel: RwLock<Option<Arc<dyn Dispatcher>>>,
}

impl InnerEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, tunnel: Arc<dyn Dispatcher>) {
        *self.tunnel.write() = Some(tunnel);
    }

    pub fn is_installed(&self) -> bool {
        self.tunnel.read().is_some()
    }

    /// Open a connection to `target` through the dispatch engine.
    pub fn connect(&self, target: &str) -> Result<DuplexStream, InnerError> {
        let tunnel = self.tunnel.read().clone().ok_or(InnerError::NotInstalled)?;
        let (client, server) = tokio::io::duplex(BUFFER_SIZE);
        let conn = InboundConnection {
            stream: Box::new(server),
            source: None,
            inbound: InboundKind::Inner,
            target: Some(target.to_string()),
            proxy: None,
        };
        tokio::spawn(async move { tunnel.handle_tcp(conn).await });
        Ok(client)
    }
}
