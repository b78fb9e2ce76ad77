//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the logging subsystem once per process
//! - Change the log level at runtime when a new configuration is applied
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - The `EnvFilter` sits behind a reload layer; `RUST_LOG` wins at startup
//! - `silent` maps to the `off` directive

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configured log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Silent,
}

impl LogLevel {
    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Silent => "off",
        }
    }

    pub fn filter(&self) -> EnvFilter {
        EnvFilter::new(self.directive())
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        };
        f.write_str(s)
    }
}

/// Runtime log level control used by the executor.
pub trait LogLevelControl: Send + Sync {
    fn set_level(&self, level: LogLevel);
    fn level(&self) -> LogLevel;
}

/// Handle to the installed subscriber's filter.
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    level: parking_lot::RwLock<LogLevel>,
}

impl LogLevelControl for LogHandle {
    fn set_level(&self, level: LogLevel) {
        let mut current = self.level.write();
        if *current == level {
            return;
        }
        if let Err(e) = self.handle.reload(level.filter()) {
            tracing::warn!(error = %e, "Failed to reload log filter");
            return;
        }
        *current = level;
    }

    fn level(&self) -> LogLevel {
        *self.level.read()
    }
}

/// Install the global subscriber. Must be called once, before anything logs.
pub fn init_logging(level: LogLevel) -> LogHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.filter());
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    LogHandle {
        handle,
        level: parking_lot::RwLock::new(level),
    }
}

/// Level control for embedders and tests that install no subscriber.
#[derive(Default)]
pub struct StaticLevel(parking_lot::RwLock<LogLevel>);

impl LogLevelControl for StaticLevel {
    fn set_level(&self, level: LogLevel) {
        *self.0.write() = level;
    }

    fn level(&self) -> LogLevel {
        *self.0.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_names() {
        let lvl: LogLevel = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(lvl, LogLevel::Warning);
        assert_eq!(lvl.directive(), "warn");
        assert_eq!(LogLevel::Silent.directive(), "off");
        assert_eq!(LogLevel::Warning.to_string(), "warning");
    }

    #[test]
    fn test_static_level() {
        let l = StaticLevel::default();
        assert_eq!(l.level(), LogLevel::Info);
        l.set_level(LogLevel::Debug);
        assert_eq!(l.level(), LogLevel::Debug);
    }
}
