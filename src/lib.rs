//! Configuration-application engine for a proxy/tunnel hub.

pub mod adapter;
pub mod component;
pub mod config;
pub mod dns;
pub mod executor;
pub mod lifecycle;
pub mod listener;
pub mod observability;
pub mod provider;
pub mod rules;
pub mod tproxy;
pub mod tunnel;

pub use config::ConfigurationSnapshot;
pub use executor::{ApplyError, Executor, SubsystemRegistry};
pub use lifecycle::Shutdown;
