//! Proxy and rule providers.
//!
//! # Data Flow
//! ```text
//! configuration
//!     → vehicle.rs (file / http payload source)
//!     → fetched.rs (managed providers parse the payload on initial())
//!     → compatible.rs (inline providers, health check on initial())
//!     → loader.rs (per-provider initialisation with non-fatal logging)
//! ```
//!
//! # Design Decisions
//! - A provider's vehicle type is fixed at construction
//! - `initial()` failures never propagate past the loader; the provider stays empty

pub mod compatible;
pub mod fetched;
pub mod healthcheck;
pub mod loader;
pub mod vehicle;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapter::Proxy;

pub use compatible::CompatibleProvider;
pub use fetched::{FetchedProxyProvider, FetchedRuleProvider};
pub use vehicle::Vehicle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderType {
    Proxy,
    Rule,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::Proxy => write!(f, "Proxy"),
            ProviderType::Rule => write!(f, "Rule"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    File,
    Http,
    Compatible,
}

impl VehicleType {
    /// Managed vehicles are fetched and initialised by the executor.
    pub fn is_managed(&self) -> bool {
        !matches!(self, VehicleType::Compatible)
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VehicleType::File => write!(f, "File"),
            VehicleType::Http => write!(f, "HTTP"),
            VehicleType::Compatible => write!(f, "Compatible"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleBehavior {
    #[default]
    Domain,
    IpCidr,
    Classical,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("parse payload: {0}")]
    Parse(String),
    #[error("provider payload is empty")]
    Empty,
    #[error("no proxy in provider is reachable")]
    Unreachable,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn provider_type(&self) -> ProviderType;
    fn vehicle_type(&self) -> VehicleType;
    async fn initial(&self) -> Result<(), ProviderError>;
}

pub trait ProxyProvider: Provider {
    fn proxies(&self) -> Vec<Arc<dyn Proxy>>;
}

pub trait RuleProvider: Provider {
    fn behavior(&self) -> RuleBehavior;
    fn count(&self) -> usize;
}

pub type ProxyProviderMap = HashMap<String, Arc<dyn ProxyProvider>>;
pub type RuleProviderMap = HashMap<String, Arc<dyn RuleProvider>>;
