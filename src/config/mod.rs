//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (read & deserialize)
//!     → validation.rs (semantic checks)
//!     → snapshot.rs (ConfigurationSnapshot: adapters, providers, rules, hosts built)
//!     → handed to Executor::apply
//!
//! On reload signal:
//!     watcher.rs detects change (or SIGHUP)
//!     → loader.rs loads new snapshot
//!     → Executor::apply reconciles the running system
//! ```
//!
//! # Design Decisions
//! - A snapshot is immutable once built; changes require a full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod snapshot;
pub mod validation;
pub mod watcher;

pub use loader::{parse, parse_with_bytes, parse_with_path, ConfigError};
pub use schema::RawConfig;
pub use snapshot::ConfigurationSnapshot;
