//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::RawConfig;
use crate::config::snapshot::ConfigurationSnapshot;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {} not found", .0.display())]
    NotFound(PathBuf),
    #[error("configuration file {} is empty", .0.display())]
    Empty(PathBuf),
    #[error("read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
    #[error("build: {0}")]
    Build(String),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `$HOME/.config/tunnel-hub`, or the working directory when `HOME` is unset.
pub fn default_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".config").join("tunnel-hub"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Load the configuration at the default location.
pub fn parse() -> Result<ConfigurationSnapshot, ConfigError> {
    let home = default_home();
    load(&home.join("config.toml"), &home)
}

/// Load `path`, resolving provider paths against the file's directory.
pub fn parse_with_path(path: &Path) -> Result<ConfigurationSnapshot, ConfigError> {
    let home = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    load(path, home)
}

/// Load `path`, resolving provider paths against `home`.
pub fn load(path: &Path, home: &Path) -> Result<ConfigurationSnapshot, ConfigError> {
    let buf = fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    if buf.is_empty() {
        return Err(ConfigError::Empty(path.to_path_buf()));
    }
    parse_with_bytes(&buf, home)
}

/// Parse, validate and build a snapshot from raw TOML.
pub fn parse_with_bytes(buf: &[u8], home: &Path) -> Result<ConfigurationSnapshot, ConfigError> {
    let text = std::str::from_utf8(buf).map_err(|e| ConfigError::Build(e.to_string()))?;
    let raw: RawConfig = toml::from_str(text)?;

    validate_config(&raw).map_err(ConfigError::Validation)?;

    ConfigurationSnapshot::build(raw, home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(parse_with_path(&missing), Err(ConfigError::NotFound(_))));

        let empty = dir.path().join("empty.toml");
        std::fs::write(&empty, b"").unwrap();
        let Err(err) = parse_with_path(&empty) else {
            panic!("empty file parsed");
        };
        assert!(err.to_string().ends_with("is empty"));
    }

    #[test]
    fn test_parse_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mixed-port = 7890\nrules = [\"MATCH,DIRECT\"]\n").unwrap();

        let snapshot = parse_with_path(&path).unwrap();
        assert_eq!(snapshot.general.inbound.mixed_port, 7890);
        assert_eq!(snapshot.rules.len(), 1);
    }

    #[test]
    fn test_validation_errors_surface() {
        match parse_with_bytes(b"rules = [\"MATCH,Nowhere\"]", Path::new(".")) {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 1),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("unknown rule target accepted"),
        }
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(
            parse_with_bytes(b"mixed-port = ", Path::new(".")),
            Err(ConfigError::Parse(_))
        ));
    }
}
